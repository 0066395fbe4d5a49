use serde::Serialize;
use std::{fmt, net::IpAddr};
use thiserror::Error;

use crate::settings::ClientId;

/// How far an operation got before it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Persist,
    Allocate,
    Render,
    Validate,
    Start,
    Firewall,
    Teardown,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Persist => "persist",
            Stage::Allocate => "allocate",
            Stage::Render => "render",
            Stage::Validate => "validate",
            Stage::Start => "start",
            Stage::Firewall => "firewall",
            Stage::Teardown => "teardown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("client {client} already exists")]
    AlreadyExists { client: ClientId },

    #[error("address {address} already belongs to client {owner}")]
    AddressInUse { address: IpAddr, owner: ClientId },

    #[error("client {client} not found")]
    NotFound { client: ClientId },

    #[error("invalid settings for {scope}: {reason}")]
    InvalidSettings { scope: String, reason: String },

    #[error("resolver config for {client} rejected: {output}")]
    ConfigInvalid { client: ClientId, output: String },

    #[error("resolver for {client} failed to start: {reason}")]
    StartFailed { client: ClientId, reason: String, log_tail: String },

    #[error("firewall rules for {client} failed to install: {reason}")]
    FirewallInstallFailed { client: ClientId, reason: String },

    #[error("{stage} failed for {scope}: {source:#}")]
    Storage { scope: String, stage: Stage, source: anyhow::Error },

    #[error("{} client(s) could not be restarted: {}", .failed.len(), summarize(.failed))]
    Cascade { failed: Vec<(ClientId, String)> },
}

fn summarize(failed: &[(ClientId, String)]) -> String {
    failed
        .iter()
        .map(|(id, why)| format!("{id}: {why}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl EngineError {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            EngineError::AlreadyExists { .. }
            | EngineError::AddressInUse { .. }
            | EngineError::NotFound { .. }
            | EngineError::InvalidSettings { .. }
            | EngineError::Cascade { .. } => None,
            EngineError::ConfigInvalid { .. } => Some(Stage::Validate),
            EngineError::StartFailed { .. } => Some(Stage::Start),
            EngineError::FirewallInstallFailed { .. } => Some(Stage::Firewall),
            EngineError::Storage { stage, .. } => Some(*stage),
        }
    }

    pub fn client(&self) -> Option<&ClientId> {
        match self {
            EngineError::AlreadyExists { client }
            | EngineError::NotFound { client }
            | EngineError::ConfigInvalid { client, .. }
            | EngineError::StartFailed { client, .. }
            | EngineError::FirewallInstallFailed { client, .. } => Some(client),
            EngineError::AddressInUse { owner, .. } => Some(owner),
            EngineError::InvalidSettings { .. } | EngineError::Storage { .. } | EngineError::Cascade { .. } => None,
        }
    }

    pub(crate) fn storage(scope: impl fmt::Display, stage: Stage, source: anyhow::Error) -> Self {
        EngineError::Storage { scope: scope.to_string(), stage, source }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
