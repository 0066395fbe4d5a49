use anyhow::{anyhow, bail, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::{net::IpAddr, path::PathBuf};

use crate::settings::{ClientSettings, GlobalSettings};

#[derive(Clone, Debug, Parser)]
#[command(
    name = "hotspot-dnsd",
    about = "Per-client DNS overrides for hotspot clients (dnsmasq + iptables)",
    after_help = r#"LAYOUT
  <base_dir>/global.json                   global settings
  <base_dir>/clients/<id>/settings.json    per-client settings
  <base_dir>/clients/<id>/allocation.json  address + resolver port
  <base_dir>/clients/<id>/dnsmasq.conf     generated resolver config
  <base_dir>/log/activity.log              short lifecycle log (capped)

EXAMPLES
  hotspot-dnsd create 192.168.43.50
  hotspot-dnsd update 192_168_43_50 --override 10.0.0.1 --domain example.com=10.0.0.2
  hotspot-dnsd global --default-resolver 9.9.9.9
  hotspot-dnsd watch

NOTES
  * Root is required (iptables, binding resolver ports).
  * Each client gets its own dnsmasq on a port from base_port upwards.
"#,
    arg_required_else_help = true
)]
pub struct Args {
    /// JSON config file. Built-in defaults when omitted.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Provision a client: settings, port, resolver and redirect rules.
    Create {
        address: IpAddr,
        /// Client id; derived from the address when omitted.
        #[arg(long)]
        id: Option<String>,
    },
    /// Change a client's overrides and restart its resolver.
    Update {
        id: String,
        #[command(flatten)]
        overrides: OverrideArgs,
        /// Pin a domain: `name=address`. Repeatable.
        #[arg(long = "domain", value_parser = parse_domain_pair)]
        domains: Vec<(String, IpAddr)>,
        /// Drop all pinned domains before applying `--domain`.
        #[arg(long, default_value_t = false)]
        clear_domains: bool,
    },
    /// Change global settings; every client's resolver is restarted.
    Global {
        #[arg(long)]
        default_resolver: Option<IpAddr>,
        #[command(flatten)]
        overrides: OverrideArgs,
    },
    /// Tear a client down. Unknown ids are not an error.
    Delete { id: String },
    /// Status of every client (JSON).
    List,
    /// Status of one client (JSON).
    Status { id: String },
    /// Bring every recorded client back up, e.g. after boot.
    Restore,
    /// Restore, then keep restarting resolvers that die.
    Watch,
}

#[derive(Clone, Debug, ClapArgs)]
pub struct OverrideArgs {
    /// Answer every query with this address.
    #[arg(long = "override", conflicts_with = "no_override")]
    pub override_address: Option<IpAddr>,
    /// Turn the blanket override off (keeps pinned domains).
    #[arg(long, default_value_t = false)]
    pub no_override: bool,
}

impl OverrideArgs {
    fn apply(&self, enabled: &mut bool, address: &mut Option<IpAddr>) {
        if let Some(a) = self.override_address {
            *enabled = true;
            *address = Some(a);
        }
        if self.no_override {
            *enabled = false;
        }
    }
}

/// `example.com=10.0.0.2`
pub fn parse_domain_pair(s: &str) -> Result<(String, IpAddr)> {
    let (name, addr) = s.split_once('=').ok_or_else(|| anyhow!("expected name=address, got {s:?}"))?;
    let name = name.trim().trim_end_matches('.').to_ascii_lowercase();
    if name.is_empty() {
        bail!("empty domain in {s:?}");
    }
    let addr: IpAddr = addr.trim().parse().map_err(|_| anyhow!("bad address in {s:?}"))?;
    Ok((name, addr))
}

/// Apply `update` flags on top of the current settings.
pub fn merge_client(
    mut current: ClientSettings,
    overrides: &OverrideArgs,
    domains: &[(String, IpAddr)],
    clear_domains: bool,
) -> ClientSettings {
    overrides.apply(&mut current.override_enabled, &mut current.override_address);
    if clear_domains {
        current.custom_domains.clear();
    }
    for (name, addr) in domains {
        current.custom_domains.insert(name.clone(), *addr);
    }
    current
}

/// Apply `global` flags on top of the current settings.
pub fn merge_global(mut current: GlobalSettings, default_resolver: Option<IpAddr>, overrides: &OverrideArgs) -> GlobalSettings {
    if let Some(r) = default_resolver {
        current.default_resolver = r;
    }
    overrides.apply(&mut current.override_enabled, &mut current.override_address);
    current
}
