use anyhow::{anyhow, Context, Result};
use log::debug;
use std::{
    fs,
    os::unix::process::CommandExt,
    path::Path,
    process::{Command, Stdio},
    time::Duration,
};

use crate::shell::{self, Capture};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    fn raw(self) -> libc::c_int {
        match self {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// Every side effect the engine has on the host goes through here: external
/// commands, resolver processes, and `/proc` lookups.
pub trait System: Send + Sync {
    /// Run `cmd` with an argument vector, returning exit code and combined output.
    fn exec(&self, cmd: &str, args: &[String], timeout: Duration) -> Result<(i32, String)>;

    /// Start a long-running process in its own session with stdout/stderr
    /// appended to `log`. Returns the pid.
    fn spawn_detached(&self, cmd: &str, args: &[String], log: &Path) -> Result<u32>;

    fn pid_alive(&self, pid: u32) -> bool;

    fn signal(&self, pid: u32, sig: Signal) -> Result<()>;

    /// Pids whose argv contains every one of `needles` as a whole argument
    /// (or as the file name of one, so `dnsmasq` matches `/system/bin/dnsmasq`).
    fn pids_matching(&self, needles: &[&str]) -> Vec<u32>;

    /// Whether something is listening on `port` (UDP or TCP, v4 or v6).
    fn port_bound(&self, port: u16) -> bool;

    fn sleep(&self, d: Duration);
}

/// The real host: `std::process`, `libc::kill` and procfs.
#[derive(Debug, Default, Clone)]
pub struct HostSystem;

impl System for HostSystem {
    fn exec(&self, cmd: &str, args: &[String], timeout: Duration) -> Result<(i32, String)> {
        shell::run_timeout(cmd, args, Capture::Both, timeout)
    }

    fn spawn_detached(&self, cmd: &str, args: &[String], log: &Path) -> Result<u32> {
        if let Some(parent) = log.parent() {
            fs::create_dir_all(parent).with_context(|| format!("mkdir {}", parent.display()))?;
        }
        let out = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log)
            .with_context(|| format!("open {}", log.display()))?;
        let err = out.try_clone().with_context(|| format!("dup {}", log.display()))?;

        let mut c = Command::new(cmd);
        c.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(out))
            .stderr(Stdio::from(err));

        // Own session: the resolver must outlive us and not get our signals.
        unsafe {
            c.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut child = c.spawn().with_context(|| format!("spawn {cmd}"))?;
        let pid = child.id();

        // Reap it when it exits so it never lingers as a zombie while we run.
        std::thread::spawn(move || {
            let _ = child.wait();
        });

        Ok(pid)
    }

    fn pid_alive(&self, pid: u32) -> bool {
        if pid <= 1 {
            return false;
        }
        match fs::read_to_string(format!("/proc/{pid}/stat")) {
            // state is the first field after the parenthesised comm
            Ok(stat) => match stat.rfind(')').and_then(|i| stat[i + 1..].split_whitespace().next()) {
                Some(state) => state != "Z" && state != "X",
                None => true,
            },
            Err(_) => unsafe { libc::kill(pid as libc::pid_t, 0) == 0 },
        }
    }

    fn signal(&self, pid: u32, sig: Signal) -> Result<()> {
        let rc = unsafe { libc::kill(pid as libc::pid_t, sig.raw()) };
        if rc != 0 {
            return Err(anyhow!("kill({pid}, {sig:?}) failed: {}", std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn pids_matching(&self, needles: &[&str]) -> Vec<u32> {
        let me = std::process::id();
        let rd = match fs::read_dir("/proc") {
            Ok(rd) => rd,
            Err(_) => return vec![],
        };
        let mut out: Vec<u32> = rd
            .flatten()
            .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse::<u32>().ok()))
            .filter(|&pid| pid > 1 && pid != me)
            .filter(|&pid| {
                let argv = read_argv(pid);
                !argv.is_empty() && needles.iter().all(|n| argv_has(&argv, n))
            })
            .collect();
        out.sort_unstable();
        out
    }

    fn port_bound(&self, port: u16) -> bool {
        for (table, listen_only) in [
            ("/proc/net/udp", false),
            ("/proc/net/udp6", false),
            ("/proc/net/tcp", true),
            ("/proc/net/tcp6", true),
        ] {
            if let Ok(s) = fs::read_to_string(table) {
                if proc_net_has_port(&s, port, listen_only) {
                    return true;
                }
            }
        }
        false
    }

    fn sleep(&self, d: Duration) {
        std::thread::sleep(d);
    }
}

fn read_argv(pid: u32) -> Vec<String> {
    match fs::read(format!("/proc/{pid}/cmdline")) {
        Ok(b) => b
            .split(|c| *c == 0)
            .filter(|a| !a.is_empty())
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect(),
        Err(_) => vec![],
    }
}

fn argv_has(argv: &[String], needle: &str) -> bool {
    argv.iter()
        .any(|a| a == needle || Path::new(a).file_name().and_then(|f| f.to_str()) == Some(needle))
}

/// Parse a `/proc/net/{tcp,udp}` table and look for a local socket on `port`.
/// TCP sockets only count in LISTEN state (`0A`).
fn proc_net_has_port(table: &str, port: u16, listen_only: bool) -> bool {
    for line in table.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 4 {
            continue;
        }
        let local_port = cols[1]
            .rsplit(':')
            .next()
            .and_then(|h| u16::from_str_radix(h, 16).ok());
        if local_port != Some(port) {
            continue;
        }
        if listen_only && cols[3] != "0A" {
            continue;
        }
        debug!("port {port} bound: {}", line.trim());
        return true;
    }
    false
}
