//! Per-client DNS overrides for a hotspot: one dnsmasq per client, fed by
//! `nat PREROUTING` redirects for that client's address.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod iptables;
pub mod logging;
pub mod ports;
pub mod programs;
pub mod settings;
pub mod shell;
pub mod system;

pub use engine::{ClientStatus, DnsOverrideEngine, Health, TeardownReport};
pub use error::{EngineError, Stage};
pub use settings::{ClientAllocation, ClientId, ClientSettings, GlobalSettings};
