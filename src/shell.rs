use anyhow::{anyhow, Result};
use log::debug;
use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    Stdout,
    Stderr,
    Both,
    None,
}

fn preferred_tmp_dir() -> PathBuf {
    let p = PathBuf::from("/data/local/tmp");
    if p.is_dir() {
        return p;
    }
    std::env::temp_dir()
}

fn unique_tmp_prefix(cmd: &str) -> String {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_nanos();
    let pid = std::process::id();
    let safe = cmd.replace('/', "_");
    format!("dnsd_{safe}_{pid}_{ts}")
}

fn drain(path: Option<&Path>, out: &mut String) {
    if let Some(p) = path {
        if let Ok(buf) = fs::read(p) {
            out.push_str(&String::from_utf8_lossy(&buf));
        }
        let _ = fs::remove_file(p);
    }
}

/// Run a command (argument vector, never a shell line) with a timeout.
///
/// Output goes through temp files so a chatty child cannot fill a pipe and
/// deadlock us. On timeout the child is killed and an error is returned that
/// carries whatever output was captured.
pub fn run_timeout(cmd: &str, args: &[String], capture: Capture, timeout: Duration) -> Result<(i32, String)> {
    debug!("exec(timeout={:?}): {} {}", timeout, cmd, args.join(" "));

    let tmp_dir = preferred_tmp_dir();
    let prefix = unique_tmp_prefix(cmd);

    let stdout_path = matches!(capture, Capture::Stdout | Capture::Both)
        .then(|| tmp_dir.join(format!("{prefix}.out")));
    let stderr_path = matches!(capture, Capture::Stderr | Capture::Both)
        .then(|| tmp_dir.join(format!("{prefix}.err")));

    let mut c = Command::new(cmd);
    c.args(args).stdin(Stdio::null());

    match &stdout_path {
        Some(p) => {
            let f = fs::File::create(p).map_err(|e| anyhow!("failed to create stdout temp file {p:?}: {e}"))?;
            c.stdout(Stdio::from(f));
        }
        None => {
            c.stdout(Stdio::null());
        }
    }
    match &stderr_path {
        Some(p) => {
            let f = fs::File::create(p).map_err(|e| anyhow!("failed to create stderr temp file {p:?}: {e}"))?;
            c.stderr(Stdio::from(f));
        }
        None => {
            c.stderr(Stdio::null());
        }
    }

    let mut child = match c.spawn() {
        Ok(ch) => ch,
        Err(e) => {
            let mut scratch = String::new();
            drain(stdout_path.as_deref(), &mut scratch);
            drain(stderr_path.as_deref(), &mut scratch);
            return Err(anyhow!("failed to spawn {cmd}: {e}"));
        }
    };
    let start = Instant::now();

    loop {
        if let Some(st) = child.try_wait().map_err(|e| anyhow!("failed to wait {cmd}: {e}"))? {
            let code = st.code().unwrap_or(-1);
            let mut s = String::new();
            drain(stdout_path.as_deref(), &mut s);
            drain(stderr_path.as_deref(), &mut s);
            debug!("exit={code} output_len={}", s.len());
            return Ok((code, s));
        }

        if start.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();

            let mut s = String::new();
            drain(stdout_path.as_deref(), &mut s);
            drain(stderr_path.as_deref(), &mut s);
            return Err(anyhow!(
                "command timeout after {:?}: {cmd} {}\n{}",
                timeout,
                args.join(" "),
                s
            ));
        }

        thread::sleep(Duration::from_millis(50));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn captures_stdout_and_exit_code() {
        let (code, out) = run_timeout("sh", &argv(&["-c", "echo hello; exit 3"]), Capture::Stdout, Duration::from_secs(5)).unwrap();
        assert_eq!(code, 3);
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn arguments_are_not_shell_interpreted() {
        let (code, out) = run_timeout("echo", &argv(&["$(id)", "; rm -rf /"]), Capture::Stdout, Duration::from_secs(5)).unwrap();
        assert_eq!(code, 0);
        assert_eq!(out.trim(), "$(id) ; rm -rf /");
    }

    #[test]
    fn timeout_kills_child() {
        let err = run_timeout("sleep", &argv(&["5"]), Capture::None, Duration::from_millis(200)).unwrap_err();
        assert!(format!("{err:#}").contains("command timeout"));
    }

    #[test]
    fn both_streams_are_captured() {
        let (code, out) = run_timeout("sh", &argv(&["-c", "echo out; echo boom >&2; exit 1"]), Capture::Both, Duration::from_secs(5)).unwrap();
        assert_eq!(code, 1);
        assert!(out.contains("out"));
        assert!(out.contains("boom"));
    }
}
