use anyhow::{anyhow, bail, Context, Result};
use log::{debug, warn};
use regex::Regex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt, fs,
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr},
    path::Path,
    sync::OnceLock,
};

use crate::config::Paths;

/// Identifier of a hotspot client. Used verbatim in file names and process
/// command lines, so the alphabet is restricted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientId(String);

impl ClientId {
    pub fn new(raw: &str) -> Result<Self> {
        let ok_char = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.');
        if raw.is_empty() || raw.len() > 64 {
            bail!("client id must be 1..=64 characters: {raw:?}");
        }
        if raw.starts_with('.') || !raw.chars().all(ok_char) {
            bail!("client id may only contain [A-Za-z0-9._-] and must not start with '.': {raw:?}");
        }
        Ok(Self(raw.to_string()))
    }

    /// `192.168.43.50` -> `192_168_43_50`, `fe80::1` -> `fe80__1`.
    pub fn from_address(addr: IpAddr) -> Self {
        Self(addr.to_string().replace(['.', ':'], "_"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ClientId {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        Self::new(&s)
    }
}

impl From<ClientId> for String {
    fn from(id: ClientId) -> Self {
        id.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSettings {
    /// Upstream used when nothing overrides a query.
    #[serde(default = "default_resolver")]
    pub default_resolver: IpAddr,
    #[serde(default)]
    pub override_enabled: bool,
    #[serde(default)]
    pub override_address: Option<IpAddr>,
}

fn default_resolver() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self { default_resolver: default_resolver(), override_enabled: false, override_address: None }
    }
}

impl GlobalSettings {
    pub fn validate(&self) -> Result<()> {
        if self.override_enabled && self.override_address.is_none() {
            bail!("global override enabled without an override address");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default)]
    pub override_enabled: bool,
    #[serde(default)]
    pub override_address: Option<IpAddr>,
    /// domain -> address; always layered over the blanket rule.
    #[serde(default)]
    pub custom_domains: BTreeMap<String, IpAddr>,
}

impl ClientSettings {
    pub fn validate(&self) -> Result<()> {
        if self.override_enabled && self.override_address.is_none() {
            bail!("override enabled without an override address");
        }
        for domain in self.custom_domains.keys() {
            if !is_valid_domain(domain) {
                bail!("invalid domain name: {domain:?}");
            }
        }
        Ok(())
    }
}

fn is_valid_domain(d: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^(?:[A-Za-z0-9_](?:[A-Za-z0-9_-]{0,61}[A-Za-z0-9])?\.)*[A-Za-z0-9_](?:[A-Za-z0-9_-]{0,61}[A-Za-z0-9])?$").ok()
    });
    d.len() <= 253 && re.as_ref().is_some_and(|re| re.is_match(d))
}

/// Where a client's resolver lives. Written once at provisioning time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAllocation {
    pub client_address: IpAddr,
    pub assigned_port: u16,
}

/// Durable JSON records under the base directory: one global document, and
/// per client a settings document plus an allocation document.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    paths: Paths,
}

impl SettingsStore {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    /// Persisted global settings, or defaults written on first access.
    /// Unreadable data is replaced by defaults.
    pub fn get_global(&self) -> GlobalSettings {
        let path = self.paths.global_settings();
        match read_json::<GlobalSettings>(&path) {
            Ok(Some(g)) => return g,
            Ok(None) => debug!("no global settings at {}, writing defaults", path.display()),
            Err(e) => warn!("global settings unreadable ({e:#}); resetting to defaults"),
        }
        let g = GlobalSettings::default();
        if let Err(e) = write_json_pretty(&path, &g) {
            warn!("failed to persist default global settings: {e:#}");
        }
        g
    }

    pub fn set_global(&self, settings: &GlobalSettings) -> Result<()> {
        write_json_pretty(&self.paths.global_settings(), settings)
    }

    /// Persisted client settings, or an unpersisted all-disabled default.
    pub fn get_client(&self, id: &ClientId) -> ClientSettings {
        match read_json::<ClientSettings>(&self.paths.client_settings(id)) {
            Ok(Some(s)) => s,
            Ok(None) => ClientSettings::default(),
            Err(e) => {
                warn!("settings for {id} unreadable ({e:#}); using defaults");
                ClientSettings::default()
            }
        }
    }

    pub fn has_client(&self, id: &ClientId) -> bool {
        self.paths.client_settings(id).is_file()
    }

    pub fn set_client(&self, id: &ClientId, settings: &ClientSettings) -> Result<()> {
        write_json_pretty(&self.paths.client_settings(id), settings)
    }

    /// Idempotent.
    pub fn delete_client(&self, id: &ClientId) -> Result<()> {
        remove_if_exists(&self.paths.client_settings(id))?;
        self.prune_client_dir(id);
        Ok(())
    }

    pub fn get_allocation(&self, id: &ClientId) -> Result<Option<ClientAllocation>> {
        read_json(&self.paths.allocation(id))
    }

    pub fn put_allocation(&self, id: &ClientId, alloc: &ClientAllocation) -> Result<()> {
        write_json_pretty(&self.paths.allocation(id), alloc)
    }

    /// Removes the allocation and the generated resolver config. Idempotent.
    pub fn delete_allocation(&self, id: &ClientId) -> Result<()> {
        remove_if_exists(&self.paths.allocation(id))?;
        remove_if_exists(&self.paths.resolver_conf(id))?;
        self.prune_client_dir(id);
        Ok(())
    }

    /// All readable allocations, sorted by client id.
    pub fn list_allocations(&self) -> Result<Vec<(ClientId, ClientAllocation)>> {
        let dir = self.paths.clients_dir();
        let rd = match fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(anyhow!("read_dir {}: {e}", dir.display())),
        };

        let mut out = Vec::new();
        for ent in rd.flatten() {
            if !ent.path().is_dir() {
                continue;
            }
            let Some(id) = ent.file_name().to_str().and_then(|s| ClientId::new(s).ok()) else {
                continue;
            };
            match self.get_allocation(&id) {
                Ok(Some(a)) => out.push((id, a)),
                Ok(None) => {}
                Err(e) => warn!("skipping client {id}: {e:#}"),
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    pub fn write_resolver_conf(&self, id: &ClientId, document: &str) -> Result<()> {
        write_atomic(&self.paths.resolver_conf(id), document.as_bytes())
    }

    pub fn read_resolver_conf(&self, id: &ClientId) -> Option<String> {
        fs::read_to_string(self.paths.resolver_conf(id)).ok()
    }

    fn prune_client_dir(&self, id: &ClientId) {
        // Only succeeds once the directory is empty.
        let _ = fs::remove_dir(self.paths.client_dir(id));
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let txt = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(anyhow!("read failed {}: {e}", path.display())),
    };
    let v = serde_json::from_str(&txt).with_context(|| format!("bad JSON {}", path.display()))?;
    Ok(Some(v))
}

fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let txt = serde_json::to_string_pretty(value)?;
    write_atomic(path, txt.as_bytes())
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("mkdir {}", parent.display()))?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data).map_err(|e| anyhow!("write failed {}: {e}", tmp.display()))?;
    fs::rename(&tmp, path).map_err(|e| anyhow!("rename failed {} -> {}: {e}", tmp.display(), path.display()))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow!("remove {}: {e}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SettingsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(Paths::new(dir.path().to_path_buf()));
        (dir, store)
    }

    fn id(s: &str) -> ClientId {
        ClientId::new(s).unwrap()
    }

    #[test]
    fn client_id_rejects_path_tricks() {
        assert!(ClientId::new("../etc").is_err());
        assert!(ClientId::new("a/b").is_err());
        assert!(ClientId::new("").is_err());
        assert!(ClientId::new(".hidden").is_err());
        assert!(ClientId::new("a b").is_err());
        assert!(ClientId::new("phone-1").is_ok());
    }

    #[test]
    fn client_id_from_address() {
        let v4: IpAddr = "192.168.43.50".parse().unwrap();
        assert_eq!(ClientId::from_address(v4).as_str(), "192_168_43_50");
        let v6: IpAddr = "fe80::1".parse().unwrap();
        assert_eq!(ClientId::from_address(v6).as_str(), "fe80__1");
    }

    #[test]
    fn global_defaults_are_written_on_first_access() {
        let (dir, store) = store();
        let g = store.get_global();
        assert_eq!(g, GlobalSettings::default());
        assert_eq!(g.default_resolver.to_string(), "1.1.1.1");
        assert!(dir.path().join("global.json").is_file());
    }

    #[test]
    fn corrupt_global_is_reset_to_defaults() {
        let (dir, store) = store();
        fs::write(dir.path().join("global.json"), "{not json").unwrap();
        assert_eq!(store.get_global(), GlobalSettings::default());
        let raw = fs::read_to_string(dir.path().join("global.json")).unwrap();
        assert!(serde_json::from_str::<GlobalSettings>(&raw).is_ok());
    }

    #[test]
    fn global_round_trip() {
        let (_dir, store) = store();
        let g = GlobalSettings {
            default_resolver: "8.8.8.8".parse().unwrap(),
            override_enabled: true,
            override_address: Some("10.0.0.9".parse().unwrap()),
        };
        store.set_global(&g).unwrap();
        assert_eq!(store.get_global(), g);
    }

    #[test]
    fn missing_client_yields_unpersisted_default() {
        let (_dir, store) = store();
        let c = id("c1");
        assert_eq!(store.get_client(&c), ClientSettings::default());
        assert!(!store.has_client(&c));
    }

    #[test]
    fn delete_client_is_idempotent_and_prunes_dir() {
        let (dir, store) = store();
        let c = id("c1");
        store.set_client(&c, &ClientSettings::default()).unwrap();
        assert!(store.has_client(&c));
        store.delete_client(&c).unwrap();
        store.delete_client(&c).unwrap();
        assert!(!store.has_client(&c));
        assert!(!dir.path().join("clients/c1").exists());
    }

    #[test]
    fn list_allocations_skips_garbage() {
        let (dir, store) = store();
        let a = ClientAllocation { client_address: "192.168.43.50".parse().unwrap(), assigned_port: 10530 };
        store.put_allocation(&id("b"), &a).unwrap();
        store
            .put_allocation(&id("a"), &ClientAllocation { assigned_port: 10531, ..a })
            .unwrap();
        fs::create_dir_all(dir.path().join("clients/broken")).unwrap();
        fs::write(dir.path().join("clients/broken/allocation.json"), "[]").unwrap();
        fs::create_dir_all(dir.path().join("clients/empty")).unwrap();

        let all = store.list_allocations().unwrap();
        let ids: Vec<&str> = all.iter().map(|(i, _)| i.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn client_settings_validation() {
        let mut s = ClientSettings::default();
        assert!(s.validate().is_ok());

        s.override_enabled = true;
        assert!(s.validate().is_err());
        s.override_address = Some("10.0.0.1".parse().unwrap());
        assert!(s.validate().is_ok());

        s.custom_domains.insert("foo.example".into(), "10.0.0.2".parse().unwrap());
        assert!(s.validate().is_ok());
        s.custom_domains.insert("evil/\nserver=6.6.6.6".into(), "10.0.0.2".parse().unwrap());
        assert!(s.validate().is_err());
    }

    #[test]
    fn settings_json_uses_plain_strings() {
        let mut s = ClientSettings::default();
        s.custom_domains.insert("foo.example".into(), "10.0.0.2".parse().unwrap());
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["custom_domains"]["foo.example"], "10.0.0.2");
    }
}
