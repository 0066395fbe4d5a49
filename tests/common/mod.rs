#![allow(dead_code)]

use anyhow::Result;
use std::{
    collections::BTreeMap,
    fs,
    net::IpAddr,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use hotspot_dnsd::{
    config::Config,
    system::{Signal, System},
    ClientId, DnsOverrideEngine,
};

/// In-memory host: an iptables rule list, a process table and the ports
/// those processes listen on.
#[derive(Default)]
pub struct FakeSystem {
    state: Mutex<FakeState>,
}

#[derive(Default)]
pub struct FakeState {
    /// `<binary> <rule spec>`, head of chain first.
    pub rules: Vec<String>,
    pub procs: BTreeMap<u32, Vec<String>>,
    pub next_pid: u32,
    pub spawns: usize,
    pub execs: Vec<String>,

    /// `dnsmasq --test` exits 1.
    pub reject_config: bool,
    /// Spawned resolvers die right away.
    pub fail_start: bool,
    /// `-I` fails for rules whose spec contains this.
    pub fail_insert: Option<String>,
    /// Spawned resolvers stay alive but never listen.
    pub never_binds: bool,
}

impl FakeSystem {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn rules(&self) -> Vec<String> {
        self.state().rules.clone()
    }

    pub fn rules_for(&self, addr: &str) -> Vec<String> {
        let needle = format!("-s {addr} ");
        self.rules().into_iter().filter(|r| r.contains(&needle)).collect()
    }

    /// `(pid, port)` of every live resolver.
    pub fn resolvers(&self) -> Vec<(u32, u16)> {
        self.state()
            .procs
            .iter()
            .filter_map(|(pid, argv)| port_arg(argv).map(|p| (*pid, p)))
            .collect()
    }

    pub fn resolvers_on(&self, port: u16) -> Vec<u32> {
        self.resolvers().into_iter().filter(|(_, p)| *p == port).map(|(pid, _)| pid).collect()
    }

    /// Simulate a resolver crash.
    pub fn kill(&self, pid: u32) {
        self.state().procs.remove(&pid);
    }
}

fn port_arg(argv: &[String]) -> Option<u16> {
    argv.iter().find_map(|a| a.strip_prefix("--port=")).and_then(|p| p.parse().ok())
}

impl System for FakeSystem {
    fn exec(&self, cmd: &str, args: &[String], _timeout: Duration) -> Result<(i32, String)> {
        let mut st = self.state();
        st.execs.push(format!("{cmd} {}", args.join(" ")));

        if args.iter().any(|a| a == "--test") {
            return Ok(if st.reject_config {
                (1, "dnsmasq: bad option at line 3".to_string())
            } else {
                (0, "dnsmasq: syntax check OK.".to_string())
            });
        }

        // iptables -t nat <op> PREROUTING [1] <spec...>
        let op = args.get(2).map(String::as_str).unwrap_or_default();
        if op == "-S" {
            let prefix = format!("{cmd} ");
            let listing: Vec<String> = st
                .rules
                .iter()
                .filter_map(|r| r.strip_prefix(&prefix))
                .map(|spec| format!("-A PREROUTING {spec}"))
                .collect();
            return Ok((0, format!("-P PREROUTING ACCEPT\n{}", listing.join("\n"))));
        }
        let spec_at = if op == "-I" { 5 } else { 4 };
        let rule = format!("{cmd} {}", args.get(spec_at..).unwrap_or_default().join(" "));
        match op {
            "-I" => {
                if st.fail_insert.as_ref().is_some_and(|f| rule.contains(f.as_str())) {
                    return Ok((1, "iptables: No chain/target/match by that name.".into()));
                }
                st.rules.insert(0, rule);
                Ok((0, String::new()))
            }
            "-D" => match st.rules.iter().position(|r| *r == rule) {
                Some(i) => {
                    st.rules.remove(i);
                    Ok((0, String::new()))
                }
                None => Ok((1, "iptables: Bad rule (does a matching rule exist in that chain?).".into())),
            },
            "-C" => Ok((if st.rules.contains(&rule) { 0 } else { 1 }, String::new())),
            _ => Ok((2, format!("unsupported: {op}"))),
        }
    }

    fn spawn_detached(&self, cmd: &str, args: &[String], log: &Path) -> Result<u32> {
        let mut st = self.state();
        st.next_pid += 1;
        let pid = 1000 + st.next_pid;
        st.spawns += 1;

        if st.fail_start {
            if let Some(parent) = log.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(log, "dnsmasq: failed to create listening socket: Address already in use\n")?;
            return Ok(pid);
        }

        let mut argv = vec![cmd.to_string()];
        argv.extend(args.iter().cloned());
        st.procs.insert(pid, argv);
        Ok(pid)
    }

    fn pid_alive(&self, pid: u32) -> bool {
        self.state().procs.contains_key(&pid)
    }

    fn signal(&self, pid: u32, _sig: Signal) -> Result<()> {
        self.state().procs.remove(&pid);
        Ok(())
    }

    fn pids_matching(&self, needles: &[&str]) -> Vec<u32> {
        let st = self.state();
        st.procs
            .iter()
            .filter(|(_, argv)| {
                needles.iter().all(|n| {
                    argv.iter().any(|a| a == n || Path::new(a).file_name().is_some_and(|f| f == *n))
                })
            })
            .map(|(pid, _)| *pid)
            .collect()
    }

    fn port_bound(&self, port: u16) -> bool {
        let st = self.state();
        !st.never_binds && st.procs.values().any(|argv| port_arg(argv) == Some(port))
    }

    fn sleep(&self, _d: Duration) {}
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub cfg: Config,
    pub fake: Arc<FakeSystem>,
    pub engine: DnsOverrideEngine,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::with_base_dir(dir.path());
        adjust(&mut cfg);
        let fake = FakeSystem::new();
        let engine = DnsOverrideEngine::new(&cfg, fake.clone());
        Self { dir, cfg, fake, engine }
    }

    /// A second engine over the same directory and host, as after a restart.
    pub fn reopen(&self) -> DnsOverrideEngine {
        DnsOverrideEngine::new(&self.cfg, self.fake.clone())
    }

    pub fn conf(&self, id: &ClientId) -> String {
        self.engine.store().read_resolver_conf(id).unwrap_or_default()
    }
}

pub fn id(s: &str) -> ClientId {
    ClientId::new(s).unwrap()
}

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}
