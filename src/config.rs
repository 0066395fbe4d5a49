use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::settings::ClientId;

pub const DEFAULT_BASE_DIR: &str = "/data/local/tmp/hotspot-dnsd";
pub const DEFAULT_BASE_PORT: u16 = 10530;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Root for settings, generated resolver configs, logs and pid files.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub resolver: ResolverConfig,

    #[serde(default)]
    pub firewall: FirewallConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            log: LogConfig::default(),
            resolver: ResolverConfig::default(),
            firewall: FirewallConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// If set, logs will also be appended here.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_log_level(), file: None }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    /// dnsmasq binary (path or name looked up in PATH).
    #[serde(default = "default_resolver_binary")]
    pub binary: String,

    /// First per-client listening port.
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Ports never handed out to a client (portal web server, API, ...).
    #[serde(default)]
    pub reserved_ports: BTreeSet<u16>,

    /// Liveness poll after spawn: attempts x interval bounds the start wait.
    #[serde(default = "default_start_poll_attempts")]
    pub start_poll_attempts: u32,
    #[serde(default = "default_start_poll_interval_ms")]
    pub start_poll_interval_ms: u64,

    /// Time between SIGTERM and SIGKILL on stop.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            binary: default_resolver_binary(),
            base_port: default_base_port(),
            reserved_ports: BTreeSet::new(),
            start_poll_attempts: default_start_poll_attempts(),
            start_poll_interval_ms: default_start_poll_interval_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl ResolverConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.start_poll_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FirewallConfig {
    #[serde(default = "default_iptables")]
    pub iptables: String,

    #[serde(default = "default_ip6tables")]
    pub ip6tables: String,

    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Also send the client's web traffic to a captive portal.
    #[serde(default)]
    pub portal: Option<PortalConfig>,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            iptables: default_iptables(),
            ip6tables: default_ip6tables(),
            command_timeout_ms: default_command_timeout_ms(),
            portal: None,
        }
    }
}

impl FirewallConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct PortalConfig {
    pub http_port: u16,
    pub https_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Health check interval for `watch` (ms).
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { tick_ms: default_tick_ms() }
    }
}

fn default_base_dir() -> PathBuf { PathBuf::from(DEFAULT_BASE_DIR) }
fn default_log_level() -> String { "info".to_string() }
fn default_resolver_binary() -> String { "dnsmasq".to_string() }
fn default_base_port() -> u16 { DEFAULT_BASE_PORT }
fn default_start_poll_attempts() -> u32 { 20 }
fn default_start_poll_interval_ms() -> u64 { 150 }
fn default_stop_grace_ms() -> u64 { 1500 }
fn default_command_timeout_ms() -> u64 { 5000 }
fn default_iptables() -> String { "iptables".to_string() }
fn default_ip6tables() -> String { "ip6tables".to_string() }
fn default_tick_ms() -> u64 { 5000 }

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let s = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        let cfg: Config = serde_json::from_str(&s).with_context(|| format!("parse json {}", path.display()))?;
        if cfg.base_dir.as_os_str().is_empty() {
            anyhow::bail!("config {}: base_dir must not be empty", path.display());
        }
        Ok(cfg)
    }

    /// Defaults rooted somewhere else; handy for tests and ad-hoc runs.
    pub fn with_base_dir<P: Into<PathBuf>>(base_dir: P) -> Self {
        Self { base_dir: base_dir.into(), ..Default::default() }
    }

    pub fn paths(&self) -> Paths {
        Paths::new(self.base_dir.clone())
    }
}

/// On-disk layout under `base_dir`.
///
/// ```text
/// global.json
/// clients/<id>/settings.json
/// clients/<id>/allocation.json
/// clients/<id>/dnsmasq.conf
/// log/dnsmasq-<id>.log
/// log/activity.log
/// run/dnsmasq-<id>.pid
/// ```
#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn global_settings(&self) -> PathBuf {
        self.root.join("global.json")
    }

    pub fn clients_dir(&self) -> PathBuf {
        self.root.join("clients")
    }

    pub fn client_dir(&self, id: &ClientId) -> PathBuf {
        self.clients_dir().join(id.as_str())
    }

    pub fn client_settings(&self, id: &ClientId) -> PathBuf {
        self.client_dir(id).join("settings.json")
    }

    pub fn allocation(&self, id: &ClientId) -> PathBuf {
        self.client_dir(id).join("allocation.json")
    }

    pub fn resolver_conf(&self, id: &ClientId) -> PathBuf {
        self.client_dir(id).join("dnsmasq.conf")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn resolver_log(&self, id: &ClientId) -> PathBuf {
        self.log_dir().join(format!("dnsmasq-{id}.log"))
    }

    pub fn activity_log(&self) -> PathBuf {
        self.log_dir().join("activity.log")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join("run")
    }

    pub fn resolver_pid(&self, id: &ClientId) -> PathBuf {
        self.run_dir().join(format!("dnsmasq-{id}.pid"))
    }
}
