use log::{debug, info, warn};
use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    config::{Config, Paths},
    error::{EngineError, Result, Stage},
    iptables::FirewallManager,
    logging,
    ports::PortAllocator,
    programs::{
        dnsmasq::{self, ResolverFiles},
        resolver::{ResolverError, ResolverManager, ResolverState},
    },
    settings::{ClientAllocation, ClientId, ClientSettings, GlobalSettings, SettingsStore},
    system::System,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    /// Resolver live and redirect rules present.
    Active,
    /// Recorded, but the resolver or the rules are missing.
    Degraded,
    /// Neither resolver nor rules; nothing has been brought up yet.
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub id: ClientId,
    pub address: IpAddr,
    pub port: u16,
    pub settings: ClientSettings,
    pub resolver_pid: Option<u32>,
    pub firewall_installed: bool,
    pub health: Health,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Outcome of a teardown. Always produced; cleanup trouble ends up in
/// `warnings` instead of an error.
#[derive(Debug, Clone, Serialize)]
pub struct TeardownReport {
    pub client: ClientId,
    pub existed: bool,
    pub warnings: Vec<String>,
}

/// Per-client DNS override: settings, port, dnsmasq instance and redirect
/// rules, kept consistent with each other.
///
/// Not internally synchronized. Calls for one engine must be serialized by
/// the owner (wrap it in a `Mutex` when shared between threads).
pub struct DnsOverrideEngine {
    paths: Paths,
    store: SettingsStore,
    ports: PortAllocator,
    resolvers: ResolverManager,
    firewall: FirewallManager,
    degraded: BTreeMap<ClientId, String>,
}

impl DnsOverrideEngine {
    pub fn new(cfg: &Config, sys: Arc<dyn System>) -> Self {
        let paths = cfg.paths();
        Self {
            store: SettingsStore::new(paths.clone()),
            ports: PortAllocator::new(cfg.resolver.base_port, cfg.resolver.reserved_ports.clone()),
            resolvers: ResolverManager::new(sys.clone(), cfg.resolver.clone(), paths.clone()),
            firewall: FirewallManager::new(sys, &cfg.firewall),
            paths,
            degraded: BTreeMap::new(),
        }
    }

    pub fn store(&self) -> &SettingsStore {
        &self.store
    }

    pub fn resolvers(&self) -> &ResolverManager {
        &self.resolvers
    }

    pub fn global_settings(&self) -> GlobalSettings {
        self.store.get_global()
    }

    pub fn client_settings(&self, id: &ClientId) -> Result<ClientSettings> {
        self.require(id)?;
        Ok(self.store.get_client(id))
    }

    /// Provision a client: settings, port, config, resolver, redirect rules.
    /// Anything that fails after the settings are written is undone.
    pub fn create_client(&mut self, id: &ClientId, address: IpAddr) -> Result<ClientAllocation> {
        if self.allocation(id)?.is_some() {
            return Err(EngineError::AlreadyExists { client: id.clone() });
        }
        let live = self
            .store
            .list_allocations()
            .map_err(|e| EngineError::storage(id, Stage::Allocate, e))?;
        if let Some((owner, _)) = live.iter().find(|(_, a)| a.client_address == address) {
            return Err(EngineError::AddressInUse { address, owner: owner.clone() });
        }

        let settings = self.store.get_client(id);
        self.store
            .set_client(id, &settings)
            .map_err(|e| EngineError::storage(id, Stage::Persist, e))?;

        let used: BTreeSet<u16> = live.iter().map(|(_, a)| a.assigned_port).collect();
        match self.provision(id, address, &settings, &used) {
            Ok(alloc) => {
                logging::activity_info(&format!(
                    "client {id} ({address}) created, resolver port {}",
                    alloc.assigned_port
                ));
                Ok(alloc)
            }
            Err(e) => {
                logging::activity_error(&format!("client {id} ({address}) not created: {e}"));
                self.rollback(id);
                Err(e)
            }
        }
    }

    fn provision(
        &mut self,
        id: &ClientId,
        address: IpAddr,
        settings: &ClientSettings,
        used: &BTreeSet<u16>,
    ) -> Result<ClientAllocation> {
        let port = self
            .ports
            .allocate(used)
            .map_err(|e| EngineError::storage(id, Stage::Allocate, e))?;
        let alloc = ClientAllocation { client_address: address, assigned_port: port };
        self.store
            .put_allocation(id, &alloc)
            .map_err(|e| EngineError::storage(id, Stage::Allocate, e))?;

        let global = self.store.get_global();
        let conf = self.render_to_disk(id, settings, &global, port)?;

        self.resolvers
            .start(id, &conf, port)
            .map_err(|e| resolver_error(id, e))?;

        self.firewall
            .install(address, port)
            .map_err(|e| EngineError::FirewallInstallFailed { client: id.clone(), reason: e.to_string() })?;

        Ok(alloc)
    }

    fn rollback(&mut self, id: &ClientId) {
        let port = self.store.get_allocation(id).ok().flatten().map(|a| a.assigned_port);
        self.resolvers.stop(id, port);
        if let Err(e) = self.store.delete_allocation(id) {
            logging::activity_warn(&format!("rollback of {id}: allocation not removed: {e:#}"));
        }
        if let Err(e) = self.store.delete_client(id) {
            logging::activity_warn(&format!("rollback of {id}: settings not removed: {e:#}"));
        }
        self.degraded.remove(id);
    }

    /// Replace a client's settings and restart its resolver with them. The
    /// redirect rules stay as they are since the port does not change.
    pub fn update_settings(&mut self, id: &ClientId, new: ClientSettings) -> Result<()> {
        let alloc = self.require(id)?;
        new.validate().map_err(|e| EngineError::InvalidSettings { scope: id.to_string(), reason: format!("{e:#}") })?;

        let previous = self.store.get_client(id);
        self.store
            .set_client(id, &new)
            .map_err(|e| EngineError::storage(id, Stage::Persist, e))?;

        let global = self.store.get_global();
        let conf = self.render_to_disk(id, &new, &global, alloc.assigned_port)?;

        match self.restart_client(id, &alloc, &conf) {
            Err(e @ EngineError::ConfigInvalid { .. }) => {
                // The old resolver is still running on the old config; keep
                // the records matching it.
                if let Err(re) = self.store.set_client(id, &previous) {
                    warn!("could not restore previous settings for {id}: {re:#}");
                }
                if let Err(re) = self.render_to_disk(id, &previous, &global, alloc.assigned_port) {
                    warn!("could not restore previous resolver config for {id}: {re}");
                }
                Err(e)
            }
            Err(e) => Err(e),
            Ok(()) => {
                logging::activity_info(&format!("client {id} settings updated"));
                Ok(())
            }
        }
    }

    /// Replace the global settings and restart every client's resolver.
    /// Clients that fail to restart are reported together at the end; the
    /// others are still updated.
    pub fn update_global(&mut self, new: GlobalSettings) -> Result<()> {
        new.validate()
            .map_err(|e| EngineError::InvalidSettings { scope: "global".into(), reason: format!("{e:#}") })?;
        let previous = self.store.get_global();
        self.store
            .set_global(&new)
            .map_err(|e| EngineError::storage("global", Stage::Persist, e))?;

        let allocs = self
            .store
            .list_allocations()
            .map_err(|e| EngineError::storage("global", Stage::Allocate, e))?;

        let mut failed = Vec::new();
        for (id, alloc) in allocs {
            let settings = self.store.get_client(&id);
            let res = self
                .render_to_disk(&id, &settings, &new, alloc.assigned_port)
                .and_then(|conf| self.restart_client(&id, &alloc, &conf));
            if let Err(e) = res {
                if matches!(e, EngineError::ConfigInvalid { .. }) {
                    // Old resolver still serves the old config; keep the file matching it.
                    if let Err(re) = self.render_to_disk(&id, &settings, &previous, alloc.assigned_port) {
                        warn!("could not restore previous resolver config for {id}: {re}");
                    }
                }
                failed.push((id, e.to_string()));
            }
        }

        logging::activity_info("global DNS settings updated");
        if failed.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Cascade { failed })
        }
    }

    /// Tear a client down: rules, resolver, settings, allocation. Each step
    /// runs even if an earlier one had trouble. Unknown ids are fine.
    pub fn delete_client(&mut self, id: &ClientId) -> TeardownReport {
        let mut warnings = Vec::new();

        let alloc = match self.store.get_allocation(id) {
            Ok(a) => a,
            Err(e) => {
                warnings.push(format!("allocation unreadable: {e:#}"));
                None
            }
        };
        let existed = alloc.is_some() || self.store.has_client(id);

        if let Some(a) = alloc {
            warnings.extend(self.firewall.remove(a.client_address, a.assigned_port));
        }
        self.resolvers.stop(id, alloc.map(|a| a.assigned_port));

        if let Err(e) = self.store.delete_client(id) {
            warnings.push(format!("settings not removed: {e:#}"));
        }
        if let Err(e) = self.store.delete_allocation(id) {
            warnings.push(format!("allocation not removed: {e:#}"));
        }
        self.degraded.remove(id);

        for w in &warnings {
            logging::activity_warn(&format!("client {id} teardown: {w}"));
        }
        if existed {
            logging::activity_info(&format!("client {id} removed"));
        } else {
            debug!("delete of unknown client {id}: nothing to do");
        }

        TeardownReport { client: id.clone(), existed, warnings }
    }

    pub fn status(&self, id: &ClientId) -> Result<ClientStatus> {
        let alloc = self.require(id)?;
        let resolver_pid = self.resolvers.locate(id, Some(alloc.assigned_port)).first().copied();
        let firewall_installed = self.firewall.is_installed(alloc.client_address, alloc.assigned_port);
        let last_error = self.degraded.get(id).cloned();

        let health = match (resolver_pid.is_some(), firewall_installed) {
            _ if last_error.is_some() => Health::Degraded,
            (true, true) => Health::Active,
            (false, false) => Health::Stopped,
            _ => Health::Degraded,
        };

        Ok(ClientStatus {
            id: id.clone(),
            address: alloc.client_address,
            port: alloc.assigned_port,
            settings: self.store.get_client(id),
            resolver_pid,
            firewall_installed,
            health,
            last_error,
        })
    }

    pub fn list(&self) -> Result<Vec<ClientStatus>> {
        let allocs = self
            .store
            .list_allocations()
            .map_err(|e| EngineError::storage("clients", Stage::Allocate, e))?;
        allocs.iter().map(|(id, _)| self.status(id)).collect()
    }

    /// Bring every recorded client back up (after a reboot or our own
    /// restart). One client failing does not stop the others.
    pub fn restore_all(&mut self) -> Vec<(ClientId, EngineError)> {
        let allocs = match self.store.list_allocations() {
            Ok(a) => a,
            Err(e) => {
                logging::activity_error(&format!("restore: cannot list clients: {e:#}"));
                return vec![];
            }
        };

        let mut failed = Vec::new();
        for (id, alloc) in allocs {
            if let Err(e) = self.bring_up(&id, &alloc) {
                failed.push((id, e));
            }
        }
        info!("restore finished, {} client(s) failed", failed.len());
        failed
    }

    /// Restart resolvers that are no longer running and put back redirect
    /// rules that are missing. Returns how many clients were repaired.
    pub fn heal(&mut self) -> usize {
        let allocs = match self.store.list_allocations() {
            Ok(a) => a,
            Err(e) => {
                warn!("heal: cannot list clients: {e:#}");
                return 0;
            }
        };

        let mut healed = 0;
        for (id, alloc) in allocs {
            let repaired = if self.resolvers.state(&id) != ResolverState::Running {
                logging::activity_warn(&format!("client {id}: resolver not running, restarting"));
                self.bring_up(&id, &alloc).is_ok()
            } else if self.degraded.contains_key(&id)
                || !self.firewall.is_installed(alloc.client_address, alloc.assigned_port)
            {
                logging::activity_warn(&format!("client {id}: redirect rules missing, reinstalling"));
                self.reinstall_rules(&id, &alloc).is_ok()
            } else {
                continue;
            };
            if repaired {
                healed += 1;
            }
        }
        healed
    }

    /// Rules only; the resolver is left running as it is.
    fn reinstall_rules(&mut self, id: &ClientId, alloc: &ClientAllocation) -> Result<()> {
        match self.firewall.install(alloc.client_address, alloc.assigned_port) {
            Ok(()) => {
                self.degraded.remove(id);
                Ok(())
            }
            Err(e) => {
                let err = EngineError::FirewallInstallFailed { client: id.clone(), reason: e.to_string() };
                self.mark_degraded(id, &err);
                Err(err)
            }
        }
    }

    fn bring_up(&mut self, id: &ClientId, alloc: &ClientAllocation) -> Result<()> {
        let settings = self.store.get_client(id);
        let global = self.store.get_global();
        let res = self.render_to_disk(id, &settings, &global, alloc.assigned_port).and_then(|conf| {
            self.resolvers
                .start(id, &conf, alloc.assigned_port)
                .map_err(|e| resolver_error(id, e))?;
            self.firewall
                .install(alloc.client_address, alloc.assigned_port)
                .map_err(|e| EngineError::FirewallInstallFailed { client: id.clone(), reason: e.to_string() })
        });

        match res {
            Ok(()) => {
                self.degraded.remove(id);
                Ok(())
            }
            Err(e) => {
                self.mark_degraded(id, &e);
                Err(e)
            }
        }
    }

    /// Restart with an already rendered config. A resolver that will not come
    /// back leaves the client degraded with its redirect pulled, so it falls
    /// back to ordinary DNS instead of a dead port.
    fn restart_client(&mut self, id: &ClientId, alloc: &ClientAllocation, conf: &Path) -> Result<()> {
        let port = alloc.assigned_port;
        match self.resolvers.restart(id, conf, port) {
            Ok(_) => {}
            Err(e @ ResolverError::ConfigInvalid { .. }) => return Err(resolver_error(id, e)),
            Err(e) => {
                let err = resolver_error(id, e);
                for w in self.firewall.remove(alloc.client_address, port) {
                    logging::activity_warn(&format!("client {id}: {w}"));
                }
                self.mark_degraded(id, &err);
                return Err(err);
            }
        }

        if !self.firewall.is_installed(alloc.client_address, port) {
            return self.reinstall_rules(id, alloc);
        }
        self.degraded.remove(id);
        Ok(())
    }

    fn render_to_disk(&self, id: &ClientId, settings: &ClientSettings, global: &GlobalSettings, port: u16) -> Result<PathBuf> {
        let files = ResolverFiles { log_facility: self.paths.resolver_log(id), pid_file: self.paths.resolver_pid(id) };
        let doc = dnsmasq::render(settings, global, port, Some(files)).to_document();
        self.store
            .write_resolver_conf(id, &doc)
            .map_err(|e| EngineError::storage(id, Stage::Render, e))?;
        Ok(self.paths.resolver_conf(id))
    }

    fn allocation(&self, id: &ClientId) -> Result<Option<ClientAllocation>> {
        self.store
            .get_allocation(id)
            .map_err(|e| EngineError::storage(id, Stage::Allocate, e))
    }

    fn require(&self, id: &ClientId) -> Result<ClientAllocation> {
        self.allocation(id)?
            .ok_or_else(|| EngineError::NotFound { client: id.clone() })
    }

    fn mark_degraded(&mut self, id: &ClientId, err: &EngineError) {
        logging::activity_error(&format!("client {id} degraded: {err}"));
        self.degraded.insert(id.clone(), err.to_string());
    }
}

fn resolver_error(id: &ClientId, e: ResolverError) -> EngineError {
    match e {
        ResolverError::ConfigInvalid { output } => EngineError::ConfigInvalid { client: id.clone(), output },
        ResolverError::StartFailed { reason, log_tail } => {
            EngineError::StartFailed { client: id.clone(), reason, log_tail }
        }
    }
}
