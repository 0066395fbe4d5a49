use log::{debug, info, warn};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;

use crate::{
    config::{Paths, ResolverConfig},
    settings::ClientId,
    system::{Signal, System},
};

const LOG_TAIL_BYTES: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// A resolver we started and saw come up. Lives only as long as this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverProcessHandle {
    pub client_id: ClientId,
    pub pid: u32,
    pub config_path: PathBuf,
    pub port: u16,
}

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("config rejected by resolver: {output}")]
    ConfigInvalid { output: String },

    #[error("{reason}")]
    StartFailed { reason: String, log_tail: String },
}

/// Starts, stops and tracks one dnsmasq per client.
pub struct ResolverManager {
    sys: Arc<dyn System>,
    cfg: ResolverConfig,
    paths: Paths,
    handles: HashMap<ClientId, ResolverProcessHandle>,
}

impl ResolverManager {
    pub fn new(sys: Arc<dyn System>, cfg: ResolverConfig, paths: Paths) -> Self {
        Self { sys, cfg, paths, handles: HashMap::new() }
    }

    pub fn handle(&self, id: &ClientId) -> Option<&ResolverProcessHandle> {
        self.handles.get(id)
    }

    pub fn state(&self, id: &ClientId) -> ResolverState {
        match self.handles.get(id) {
            Some(h) if self.sys.pid_alive(h.pid) => ResolverState::Running,
            _ => ResolverState::Stopped,
        }
    }

    /// Check a config file with `dnsmasq --test` without starting anything.
    pub fn validate(&self, config_path: &Path) -> Result<(), ResolverError> {
        let args = vec!["--test".to_string(), format!("--conf-file={}", config_path.display())];
        match self.sys.exec(&self.cfg.binary, &args, self.cfg.command_timeout()) {
            Ok((0, _)) => Ok(()),
            Ok((code, out)) => Err(ResolverError::ConfigInvalid {
                output: format!("exit {code}: {}", out.trim()),
            }),
            Err(e) => Err(ResolverError::ConfigInvalid { output: format!("{e:#}") }),
        }
    }

    /// Validate, replace any resolver already running for `id`, spawn, and
    /// wait (bounded) until it is listening on `port`.
    pub fn start(&mut self, id: &ClientId, config_path: &Path, port: u16) -> Result<u32, ResolverError> {
        self.validate(config_path)?;
        self.stop(id, Some(port));
        self.launch(id, config_path, port)
    }

    /// Stop then start. The config is checked before the running resolver is
    /// touched, so a rejected config leaves it serving.
    pub fn restart(&mut self, id: &ClientId, config_path: &Path, port: u16) -> Result<u32, ResolverError> {
        self.validate(config_path)?;
        self.stop(id, Some(port));
        self.launch(id, config_path, port)
    }

    /// Spawn and poll. Expects a validated config and no resolver for `id`.
    fn launch(&mut self, id: &ClientId, config_path: &Path, port: u16) -> Result<u32, ResolverError> {
        transition(id, ResolverState::Stopped, ResolverState::Starting);

        let pid_file = self.paths.resolver_pid(id);
        let _ = fs::remove_file(&pid_file);
        // dnsmasq does not create the pid file's directory.
        if let Err(e) = fs::create_dir_all(self.paths.run_dir()) {
            warn!("mkdir {}: {e}", self.paths.run_dir().display());
        }
        let log = self.paths.resolver_log(id);

        let args = vec![
            "--keep-in-foreground".to_string(),
            format!("--conf-file={}", config_path.display()),
            format!("--pid-file={}", pid_file.display()),
            format!("--port={port}"),
        ];
        let pid = self
            .sys
            .spawn_detached(&self.cfg.binary, &args, &log)
            .map_err(|e| ResolverError::StartFailed { reason: format!("spawn failed: {e:#}"), log_tail: String::new() })?;
        debug!("spawned resolver for {id} pid={pid} port={port}");

        for attempt in 1..=self.cfg.start_poll_attempts.max(1) {
            self.sys.sleep(self.cfg.poll_interval());
            if !self.sys.pid_alive(pid) {
                transition(id, ResolverState::Starting, ResolverState::Stopped);
                return Err(ResolverError::StartFailed {
                    reason: format!("resolver pid {pid} exited during startup"),
                    log_tail: log_tail(&log),
                });
            }
            if self.sys.port_bound(port) {
                debug!("resolver for {id} listening after {attempt} poll(s)");
                self.handles.insert(
                    id.clone(),
                    ResolverProcessHandle { client_id: id.clone(), pid, config_path: config_path.to_path_buf(), port },
                );
                transition(id, ResolverState::Starting, ResolverState::Running);
                info!("resolver for {id} running pid={pid} port={port}");
                return Ok(pid);
            }
        }

        // Alive but never bound: do not leave it behind.
        self.terminate(pid);
        transition(id, ResolverState::Starting, ResolverState::Stopped);
        Err(ResolverError::StartFailed {
            reason: format!(
                "resolver pid {pid} not listening on port {port} after {} checks",
                self.cfg.start_poll_attempts
            ),
            log_tail: log_tail(&log),
        })
    }

    /// Stop the resolver for `id`. Never fails: a missing process is fine.
    ///
    /// Without an in-memory handle (e.g. after our own restart) the pid file
    /// is tried, then a process whose command line carries `--port=<port>`.
    pub fn stop(&mut self, id: &ClientId, port: Option<u16>) {
        let pids = match self.handles.remove(id) {
            Some(h) => vec![h.pid],
            None => self.locate(id, port),
        };

        if !pids.is_empty() {
            transition(id, ResolverState::Running, ResolverState::Stopping);
            for pid in pids {
                self.terminate(pid);
            }
            transition(id, ResolverState::Stopping, ResolverState::Stopped);
        } else {
            debug!("no resolver process found for {id}");
        }

        let _ = fs::remove_file(self.paths.resolver_pid(id));
    }

    /// Live pids that belong to `id`'s resolver, found without a handle.
    pub fn locate(&self, id: &ClientId, port: Option<u16>) -> Vec<u32> {
        if let Some(h) = self.handles.get(id) {
            if self.sys.pid_alive(h.pid) {
                return vec![h.pid];
            }
        }

        let pid_file = self.paths.resolver_pid(id);
        if let Ok(s) = fs::read_to_string(&pid_file) {
            if let Ok(pid) = s.trim().parse::<u32>() {
                if self.sys.pid_alive(pid) {
                    return vec![pid];
                }
            }
        }

        let Some(port) = port else {
            return vec![];
        };
        let bin = Path::new(&self.cfg.binary)
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or(self.cfg.binary.as_str())
            .to_string();
        let port_arg = format!("--port={port}");
        self.sys.pids_matching(&[bin.as_str(), port_arg.as_str()])
    }

    /// SIGTERM, wait up to the grace period, then SIGKILL.
    fn terminate(&self, pid: u32) {
        if let Err(e) = self.sys.signal(pid, Signal::Term) {
            debug!("SIGTERM {pid}: {e:#}");
        }

        let step = self.cfg.poll_interval();
        let steps = (self.cfg.stop_grace().as_millis() / step.as_millis().max(1)).max(1);
        for _ in 0..steps {
            if !self.sys.pid_alive(pid) {
                return;
            }
            self.sys.sleep(step);
        }

        if self.sys.pid_alive(pid) {
            if let Err(e) = self.sys.signal(pid, Signal::Kill) {
                debug!("SIGKILL {pid}: {e:#}");
            }
            self.sys.sleep(step);
            if self.sys.pid_alive(pid) {
                warn!("resolver pid {pid} survived SIGKILL");
            }
        }
    }
}

fn transition(id: &ClientId, from: ResolverState, to: ResolverState) {
    debug!("resolver {id}: {from:?} -> {to:?}");
}

/// Last few lines of a resolver log, for error messages.
fn log_tail(path: &Path) -> String {
    let data = match fs::read(path) {
        Ok(d) => d,
        Err(_) => return String::new(),
    };
    let start = data.len().saturating_sub(LOG_TAIL_BYTES);
    let s = String::from_utf8_lossy(&data[start..]);
    let lines: Vec<&str> = s.lines().collect();
    lines[lines.len().saturating_sub(20)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_tail_keeps_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("r.log");
        let body: String = (0..50).map(|i| format!("l{i}\n")).collect();
        fs::write(&p, body).unwrap();
        let tail = log_tail(&p);
        assert_eq!(tail.lines().count(), 20);
        assert!(tail.ends_with("l49"));
        assert!(tail.starts_with("l30"));
    }

    #[test]
    fn log_tail_of_missing_file_is_empty() {
        assert_eq!(log_tail(Path::new("/nonexistent/dnsd.log")), "");
    }
}
