use log::{debug, info, warn};
use std::{fmt, net::IpAddr, sync::Arc, time::Duration};
use thiserror::Error;

use crate::{
    config::{FirewallConfig, PortalConfig},
    system::System,
};

const TABLE: &str = "nat";
const CHAIN: &str = "PREROUTING";
const DNS_PORT: u16 = 53;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Udp,
    Tcp,
}

impl Proto {
    fn as_str(self) -> &'static str {
        match self {
            Proto::Udp => "udp",
            Proto::Tcp => "tcp",
        }
    }
}

/// `-s <source> -p <proto> --dport <dport> -j REDIRECT --to-ports <to_port>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectRule {
    pub source: IpAddr,
    pub proto: Proto,
    pub dport: u16,
    pub to_port: u16,
}

impl RedirectRule {
    fn spec(&self) -> Vec<String> {
        vec![
            "-s".into(),
            self.source.to_string(),
            "-p".into(),
            self.proto.as_str().into(),
            "--dport".into(),
            self.dport.to_string(),
            "-j".into(),
            "REDIRECT".into(),
            "--to-ports".into(),
            self.to_port.to_string(),
        ]
    }
}

impl fmt::Display for RedirectRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{} -> {}", self.source, self.proto.as_str(), self.dport, self.to_port)
    }
}

#[derive(Debug, Error)]
#[error("insert {rule} failed: {output}")]
pub struct InstallError {
    pub rule: RedirectRule,
    pub output: String,
}

/// Owns the per-client REDIRECT rules in `nat PREROUTING`.
pub struct FirewallManager {
    sys: Arc<dyn System>,
    iptables: String,
    ip6tables: String,
    timeout: Duration,
    portal: Option<PortalConfig>,
}

impl FirewallManager {
    pub fn new(sys: Arc<dyn System>, cfg: &FirewallConfig) -> Self {
        Self {
            sys,
            iptables: cfg.iptables.clone(),
            ip6tables: cfg.ip6tables.clone(),
            timeout: cfg.command_timeout(),
            portal: cfg.portal,
        }
    }

    /// DNS over UDP and TCP to the resolver port, plus web traffic to the
    /// portal when one is configured.
    pub fn rules_for(&self, source: IpAddr, port: u16) -> Vec<RedirectRule> {
        let mut rules = vec![
            RedirectRule { source, proto: Proto::Udp, dport: DNS_PORT, to_port: port },
            RedirectRule { source, proto: Proto::Tcp, dport: DNS_PORT, to_port: port },
        ];
        if let Some(p) = self.portal {
            rules.push(RedirectRule { source, proto: Proto::Tcp, dport: 80, to_port: p.http_port });
            rules.push(RedirectRule { source, proto: Proto::Tcp, dport: 443, to_port: p.https_port });
        }
        rules
    }

    /// Remove every redirect we own for `source` (any target port), then
    /// insert each rule at the head of the chain. If one insert fails the
    /// ones already inserted are taken out again, so either all rules are
    /// present or none are.
    pub fn install(&self, source: IpAddr, port: u16) -> Result<(), InstallError> {
        let rules = self.rules_for(source, port);

        self.sweep_source(source);
        for rule in &rules {
            let _ = self.delete_all(rule);
        }

        let mut inserted: Vec<RedirectRule> = Vec::new();
        for rule in &rules {
            let mut args = vec!["-t".to_string(), TABLE.into(), "-I".into(), CHAIN.into(), "1".into()];
            args.extend(rule.spec());

            let failure = match self.sys.exec(self.binary_for(rule.source), &args, self.timeout) {
                Ok((0, _)) => None,
                Ok((code, out)) => Some(format!("exit {code}: {}", out.trim())),
                Err(e) => Some(format!("{e:#}")),
            };

            if let Some(output) = failure {
                for done in &inserted {
                    let _ = self.delete_all(done);
                }
                return Err(InstallError { rule: *rule, output });
            }
            inserted.push(*rule);
        }

        info!("redirect installed for {source} -> port {port} ({} rules)", inserted.len());
        Ok(())
    }

    /// Best-effort removal. Absent rules are not an error; anything else
    /// comes back as a warning string for the caller to report.
    pub fn remove(&self, source: IpAddr, port: u16) -> Vec<String> {
        let mut warnings = Vec::new();
        for rule in self.rules_for(source, port) {
            if let Err(msg) = self.delete_all(&rule) {
                warn!("{msg}");
                warnings.push(msg);
            }
        }
        warnings
    }

    /// Whether every rule for this client is present (`iptables -C`).
    pub fn is_installed(&self, source: IpAddr, port: u16) -> bool {
        self.rules_for(source, port).iter().all(|r| self.rule_exists(r))
    }

    /// Delete REDIRECTs left for `source` on our destination ports, whatever
    /// port they point at (e.g. from an allocation that no longer exists).
    /// Listing failures are only logged; the exact deletes still run.
    fn sweep_source(&self, source: IpAddr) -> usize {
        let bin = self.binary_for(source);
        let list = vec!["-t".to_string(), TABLE.into(), "-S".into(), CHAIN.into()];
        let out = match self.sys.exec(bin, &list, self.timeout) {
            Ok((0, out)) => out,
            Ok((code, out)) => {
                debug!("{bin} -S {CHAIN} exit {code}: {}", out.trim());
                return 0;
            }
            Err(e) => {
                debug!("{bin} -S {CHAIN}: {e:#}");
                return 0;
            }
        };

        let dports: Vec<String> = self.rules_for(source, 0).iter().map(|r| r.dport.to_string()).collect();
        let mut removed = 0;
        for line in out.lines() {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if !is_stale_redirect(&tokens, source, &dports) {
                continue;
            }
            let mut args = vec!["-t".to_string(), TABLE.into(), "-D".into()];
            args.extend(tokens[1..].iter().map(|t| t.to_string()));
            match self.sys.exec(bin, &args, self.timeout) {
                Ok((0, _)) => removed += 1,
                Ok((code, out)) => warn!("stale redirect not removed (exit {code}): {line}: {}", out.trim()),
                Err(e) => warn!("stale redirect not removed: {line}: {e:#}"),
            }
        }
        if removed > 0 {
            info!("removed {removed} stale redirect(s) for {source}");
        }
        removed
    }

    fn rule_exists(&self, rule: &RedirectRule) -> bool {
        let mut args = vec!["-t".to_string(), TABLE.into(), "-C".into(), CHAIN.into()];
        args.extend(rule.spec());
        matches!(self.sys.exec(self.binary_for(rule.source), &args, self.timeout), Ok((0, _)))
    }

    /// `-D` until iptables says the rule is gone. Only a failure to run
    /// iptables at all is reported.
    fn delete_all(&self, rule: &RedirectRule) -> Result<usize, String> {
        let mut args = vec!["-t".to_string(), TABLE.into(), "-D".into(), CHAIN.into()];
        args.extend(rule.spec());

        let mut removed = 0usize;
        // Bounded: a duplicate left by someone else should not spin forever.
        for _ in 0..16 {
            match self.sys.exec(self.binary_for(rule.source), &args, self.timeout) {
                Ok((0, _)) => removed += 1,
                Ok(_) => break,
                Err(e) => return Err(format!("delete {rule} failed: {e:#}")),
            }
        }
        if removed > 0 {
            debug!("removed {removed} copy(ies) of {rule}");
        }
        Ok(removed)
    }

    fn binary_for(&self, source: IpAddr) -> &str {
        match source {
            IpAddr::V4(_) => self.iptables.as_str(),
            IpAddr::V6(_) => self.ip6tables.as_str(),
        }
    }
}

/// `-A PREROUTING -s <source>[/32|/128] ... --dport <ours> -j REDIRECT ...`
fn is_stale_redirect(tokens: &[&str], source: IpAddr, dports: &[String]) -> bool {
    if tokens.len() < 2 || tokens[0] != "-A" || tokens[1] != CHAIN {
        return false;
    }
    let value_of = |flag: &str| tokens.windows(2).find(|w| w[0] == flag).map(|w| w[1]);

    let host = source.to_string();
    let host_prefix = match source {
        IpAddr::V4(_) => format!("{host}/32"),
        IpAddr::V6(_) => format!("{host}/128"),
    };
    let source_matches = value_of("-s").is_some_and(|s| s == host || s == host_prefix);
    let is_redirect = value_of("-j") == Some("REDIRECT");
    let dport_ours = value_of("--dport").is_some_and(|d| dports.iter().any(|p| p == d));

    source_matches && is_redirect && dport_ours
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(s: &str) -> Vec<&str> {
        s.split_whitespace().collect()
    }

    #[test]
    fn stale_redirect_matching() {
        let src: IpAddr = "192.168.43.50".parse().unwrap();
        let ports = vec!["53".to_string()];

        let old = "-A PREROUTING -s 192.168.43.50/32 -p udp -m udp --dport 53 -j REDIRECT --to-ports 10529";
        assert!(is_stale_redirect(&toks(old), src, &ports));

        let other_host = "-A PREROUTING -s 192.168.43.5/32 -p udp -m udp --dport 53 -j REDIRECT --to-ports 10529";
        assert!(!is_stale_redirect(&toks(other_host), src, &ports));

        let ssh = "-A PREROUTING -s 192.168.43.50/32 -p tcp -m tcp --dport 22 -j REDIRECT --to-ports 2222";
        assert!(!is_stale_redirect(&toks(ssh), src, &ports));

        let dnat = "-A PREROUTING -s 192.168.43.50/32 -p udp -m udp --dport 53 -j DNAT --to-destination 10.0.0.1";
        assert!(!is_stale_redirect(&toks(dnat), src, &ports));

        assert!(!is_stale_redirect(&toks("-P PREROUTING ACCEPT"), src, &ports));
    }

    #[test]
    fn rule_spec_is_an_argument_vector() {
        let r = RedirectRule { source: "192.168.43.50".parse().unwrap(), proto: Proto::Udp, dport: 53, to_port: 10530 };
        assert_eq!(
            r.spec().join(" "),
            "-s 192.168.43.50 -p udp --dport 53 -j REDIRECT --to-ports 10530"
        );
    }
}
