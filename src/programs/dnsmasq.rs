//! dnsmasq configuration for one client's resolver.

use std::{collections::BTreeMap, fmt, net::IpAddr, path::PathBuf};

use crate::settings::{ClientSettings, GlobalSettings};

/// Per-client files the resolver is told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverFiles {
    pub log_facility: PathBuf,
    pub pid_file: PathBuf,
}

/// What the resolver will do with a query for a given name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    /// Answer with a fixed address.
    Address(IpAddr),
    /// Forward to an upstream server.
    Forward(IpAddr),
}

/// A rendered dnsmasq config. `Display` produces the file contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsmasqConfig {
    pub port: u16,
    pub upstream: Option<IpAddr>,
    pub catch_all: Option<IpAddr>,
    pub domains: BTreeMap<String, IpAddr>,
    pub files: Option<ResolverFiles>,
}

/// Build the config for a client.
///
/// Blanket rule, first match wins: the client's own override, then the
/// global override, then forwarding to the global default resolver. Custom
/// domains are layered on top of whichever applies.
pub fn render(client: &ClientSettings, global: &GlobalSettings, port: u16, files: Option<ResolverFiles>) -> DnsmasqConfig {
    let client_override = client.override_address.filter(|_| client.override_enabled);
    let global_override = global.override_address.filter(|_| global.override_enabled);

    let (upstream, catch_all) = match client_override.or(global_override) {
        Some(addr) => (None, Some(addr)),
        None => (Some(global.default_resolver), None),
    };

    DnsmasqConfig {
        port,
        upstream,
        catch_all,
        domains: client
            .custom_domains
            .iter()
            .map(|(d, a)| (normalize_domain(d), *a))
            .collect(),
        files,
    }
}

fn normalize_domain(d: &str) -> String {
    d.trim().trim_end_matches('.').to_ascii_lowercase()
}

impl DnsmasqConfig {
    /// Resolve `domain` the way dnsmasq would with this config: the longest
    /// matching `address=/domain/` entry (domain or any subdomain), then the
    /// catch-all, then the upstream.
    pub fn answer_for(&self, domain: &str) -> Option<Answer> {
        let q = normalize_domain(domain);
        let specific = self
            .domains
            .iter()
            .filter(|(d, _)| q == **d || q.ends_with(&format!(".{d}")))
            .max_by_key(|(d, _)| d.len())
            .map(|(_, a)| Answer::Address(*a));

        specific
            .or(self.catch_all.map(Answer::Address))
            .or(self.upstream.map(Answer::Forward))
    }

    pub fn to_document(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DnsmasqConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "port={}", self.port)?;
        writeln!(f, "no-resolv")?;
        if let Some(up) = self.upstream {
            writeln!(f, "server={up}")?;
        }
        if let Some(addr) = self.catch_all {
            writeln!(f, "address=//{addr}")?;
        }
        for (domain, addr) in &self.domains {
            writeln!(f, "address=/{domain}/{addr}")?;
        }
        if let Some(files) = &self.files {
            writeln!(f, "log-facility={}", files.log_facility.display())?;
            writeln!(f, "pid-file={}", files.pid_file.display())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn client(enabled: bool, addr: Option<&str>, domains: &[(&str, &str)]) -> ClientSettings {
        ClientSettings {
            override_enabled: enabled,
            override_address: addr.map(ip),
            custom_domains: domains.iter().map(|(d, a)| (d.to_string(), ip(a))).collect(),
        }
    }

    fn global(enabled: bool, addr: Option<&str>) -> GlobalSettings {
        GlobalSettings { default_resolver: ip("1.1.1.1"), override_enabled: enabled, override_address: addr.map(ip) }
    }

    #[test]
    fn defaults_forward_upstream() {
        let cfg = render(&ClientSettings::default(), &GlobalSettings::default(), 10530, None);
        let doc = cfg.to_document();
        assert_eq!(doc, "port=10530\nno-resolv\nserver=1.1.1.1\n");
        assert!(!doc.contains("address="));
        assert_eq!(cfg.answer_for("example.com"), Some(Answer::Forward(ip("1.1.1.1"))));
    }

    #[test]
    fn client_override_beats_global_and_custom_domain_beats_both() {
        let c = client(true, Some("10.0.0.1"), &[("foo.example", "10.0.0.3")]);
        let g = global(true, Some("10.0.0.2"));
        let cfg = render(&c, &g, 10530, None);

        assert_eq!(cfg.answer_for("foo.example"), Some(Answer::Address(ip("10.0.0.3"))));
        assert_eq!(cfg.answer_for("www.foo.example"), Some(Answer::Address(ip("10.0.0.3"))));
        assert_eq!(cfg.answer_for("bar.example"), Some(Answer::Address(ip("10.0.0.1"))));
        assert_eq!(cfg.answer_for("notfoo.example"), Some(Answer::Address(ip("10.0.0.1"))));
        assert!(cfg.upstream.is_none());
    }

    #[test]
    fn global_override_applies_when_client_has_none() {
        let cfg = render(&ClientSettings::default(), &global(true, Some("10.0.0.9")), 10531, None);
        let doc = cfg.to_document();
        assert!(doc.contains("address=//10.0.0.9\n"));
        assert!(!doc.contains("server="));
    }

    #[test]
    fn disabled_client_override_is_ignored() {
        let c = client(false, Some("10.0.0.1"), &[]);
        let cfg = render(&c, &global(false, None), 10530, None);
        assert_eq!(cfg.catch_all, None);
        assert_eq!(cfg.upstream, Some(ip("1.1.1.1")));
    }

    #[test]
    fn custom_domains_layer_over_upstream() {
        let c = client(false, None, &[("Ads.Example.", "0.0.0.0")]);
        let cfg = render(&c, &global(false, None), 10530, None);
        let doc = cfg.to_document();
        assert!(doc.contains("server=1.1.1.1\n"));
        assert!(doc.contains("address=/ads.example/0.0.0.0\n"));
        assert_eq!(cfg.answer_for("ads.example"), Some(Answer::Address(ip("0.0.0.0"))));
        assert_eq!(cfg.answer_for("news.example"), Some(Answer::Forward(ip("1.1.1.1"))));
    }

    #[test]
    fn longest_custom_match_wins() {
        let c = client(false, None, &[("example", "10.0.0.1"), ("a.example", "10.0.0.2")]);
        let cfg = render(&c, &global(false, None), 10530, None);
        assert_eq!(cfg.answer_for("x.a.example"), Some(Answer::Address(ip("10.0.0.2"))));
        assert_eq!(cfg.answer_for("b.example"), Some(Answer::Address(ip("10.0.0.1"))));
    }

    #[test]
    fn file_directives_come_last() {
        let files = ResolverFiles { log_facility: "/x/log/dnsmasq-c1.log".into(), pid_file: "/x/run/dnsmasq-c1.pid".into() };
        let doc = render(&ClientSettings::default(), &GlobalSettings::default(), 10530, Some(files)).to_document();
        let lines: Vec<&str> = doc.lines().collect();
        assert_eq!(lines[lines.len() - 2], "log-facility=/x/log/dnsmasq-c1.log");
        assert_eq!(lines[lines.len() - 1], "pid-file=/x/run/dnsmasq-c1.pid");
    }

    #[test]
    fn render_is_deterministic() {
        let c = client(false, None, &[("b.example", "10.0.0.2"), ("a.example", "10.0.0.1")]);
        let a = render(&c, &GlobalSettings::default(), 10530, None).to_document();
        let b = render(&c.clone(), &GlobalSettings::default(), 10530, None).to_document();
        assert_eq!(a, b);
        assert!(a.find("a.example").unwrap() < a.find("b.example").unwrap());
    }
}
