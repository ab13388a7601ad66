//! netplan backend, layered over systemd-networkd. The interface model
//! goes into priority-20 netplan drop-ins; per-interface behavior netplan
//! cannot express (DNS default route, DHCP route suppression) goes into
//! priority-10 networkd override directories attached to the units
//! `netplan generate` emits.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
};

use agent_core::{
    backend::{content_has_marker, MARKER_COMMENT},
    os::OsRelease,
    prelude::*,
    Register,
};
use config::AgentConfig;
use networkd::render::NetworkUnit;

mod doc;

use doc::{Document, Ethernet, Match, Overrides, Vlan};

const NAME: &str = "netplan";
/// netplan drop-in priority
const PRIORITY: u32 = 20;
/// networkd override priority, below the generated units
const OVERRIDE_PRIORITY: u32 = 10;

/// netplan backend
pub struct Netplan {
    cfg: Arc<AgentConfig>,
    // key prefix for our ethernet entries; "a" on Debian 12 so our ids
    // cannot collide with the distro's default regex match
    prefix: RwLock<String>,
}

impl std::fmt::Debug for Netplan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Netplan").finish()
    }
}

impl Register for Netplan {
    fn register(self, engine: &mut agent_core::Engine) {
        engine.backend(self);
    }
}

impl Netplan {
    /// new backend over the configured drop-in directories
    pub fn new(cfg: Arc<AgentConfig>) -> Self {
        Self {
            cfg,
            prefix: RwLock::new(String::new()),
        }
    }

    fn drop_in(&self, suffix: &str) -> PathBuf {
        self.cfg
            .paths
            .netplan_dir
            .join(format!("{PRIORITY}-google-guest-agent-{suffix}.yaml"))
    }

    fn override_dir(&self, iface: &str) -> PathBuf {
        self.cfg
            .paths
            .netplan_networkd_dir
            .join(format!("{OVERRIDE_PRIORITY}-netplan-{iface}.network.d"))
    }

    fn eth_key(&self, iface: &str) -> String {
        format!("{}{}", self.prefix.read().unwrap(), iface)
    }

    /// Serialize with the marker comment up front, deep-comparing against
    /// whatever is on disk first. Identical content is left untouched so
    /// reloads only fire on real changes.
    fn write_doc_if_changed(&self, path: &Path, doc: &Document) -> Result<bool> {
        if let Ok(existing) = fs::read_to_string(path) {
            if serde_yaml::from_str::<Document>(&existing).ok().as_ref() == Some(doc) {
                return Ok(false);
            }
        }
        let body = serde_yaml::to_string(doc)
            .map_err(|err| Error::op(NAME, "render", anyhow::Error::new(err)))?;
        fs::write(path, format!("{MARKER_COMMENT}\n{body}"))
            .map_err(|err| Error::op(NAME, "write", anyhow::Error::new(err)))?;
        Ok(true)
    }

    fn write_override_if_changed(&self, iface: &str, unit: &NetworkUnit) -> Result<bool> {
        let dir = self.override_dir(iface);
        let path = dir.join("override.conf");
        let content = unit.render(false);
        if fs::read_to_string(&path).ok().as_deref() == Some(content.as_str()) {
            return Ok(false);
        }
        fs::create_dir_all(&dir)
            .and_then(|_| fs::write(&path, content))
            .map_err(|err| Error::op(NAME, "write", anyhow::Error::new(err)))?;
        Ok(true)
    }

    /// The override is always a directory; remove it wholesale once its
    /// override.conf is confirmed ours.
    fn remove_override(&self, iface: &str) {
        let dir = self.override_dir(iface);
        let Ok(content) = fs::read_to_string(dir.join("override.conf")) else {
            return;
        };
        if !content_has_marker(&content) {
            return;
        }
        if let Err(err) = fs::remove_dir_all(&dir) {
            warn!(?err, dir = %dir.display(), "failed removing override dir");
        }
    }

    fn remove_drop_in(&self, suffix: &str) {
        let path = self.drop_in(suffix);
        let Ok(content) = fs::read_to_string(&path) else {
            return;
        };
        if !content_has_marker(&content) {
            return;
        }
        if let Err(err) = fs::remove_file(&path) {
            warn!(?err, path = %path.display(), "failed removing drop-in");
        }
    }

    /// VLAN names in the vlan drop-in currently on disk
    fn on_disk_vlans(&self) -> BTreeSet<String> {
        fs::read_to_string(self.drop_in("vlan"))
            .ok()
            .and_then(|raw| serde_yaml::from_str::<Document>(&raw).ok())
            .map(|doc| doc.network.vlans.into_keys().collect())
            .unwrap_or_default()
    }

    async fn reload(&self) {
        if let Err(err) = exec::run_ok("netplan", &["generate"]).await {
            warn!(?err, "netplan generate failed");
        }
        if let Err(err) = exec::run_ok("networkctl", &["reload"]).await {
            warn!(?err, "networkctl reload failed");
        }
    }
}

#[async_trait]
impl Backend for Netplan {
    fn name(&self) -> &'static str {
        NAME
    }

    fn configure(&self, cfg: &AgentConfig) {
        if OsRelease::load(&cfg.paths.os_release).is_debian12() {
            *self.prefix.write().unwrap() = "a".into();
        }
    }

    async fn is_managing(&self, _iface: &str) -> Result<bool> {
        Ok(exec::lookup_path("netplan").is_some())
    }

    #[instrument(level = "debug", skip_all)]
    async fn setup_ethernet(&self, nics: &Interfaces) -> Result<()> {
        let mut doc = Document::new();
        let mut changed = false;
        for eth in nics.valid_ethernet() {
            doc.network.ethernets.insert(
                self.eth_key(&eth.name),
                Ethernet {
                    matcher: Match {
                        name: eth.name.clone(),
                    },
                    mtu: Some(eth.spec.mtu),
                    dhcp4: true,
                    dhcp4_overrides: eth
                        .is_primary
                        .then_some(Overrides { use_domains: true }),
                    dhcp6: eth.spec.ipv6_enabled().then_some(true),
                },
            );
            let unit = NetworkUnit::ethernet(eth, vec![]);
            changed |= self.write_override_if_changed(&eth.name, &unit)?;
        }
        if !doc.network.ethernets.is_empty() {
            changed |= self.write_doc_if_changed(&self.drop_in("ethernet"), &doc)?;
        }
        if changed {
            self.reload().await;
        }
        Ok(())
    }

    #[instrument(level = "debug", skip_all)]
    async fn setup_vlan(&self, nics: &Interfaces) -> Result<()> {
        let mut doc = Document::new();
        for vlan in nics.vlans.values() {
            let spec = &vlan.spec;
            let static_addrs: Vec<String> = spec
                .ip
                .iter()
                .chain(spec.ipv6.iter())
                .cloned()
                .collect();
            doc.network.vlans.insert(
                vlan.interface_name(),
                Vlan {
                    id: spec.vlan_id,
                    link: self.eth_key(&vlan.parent_name),
                    macaddress: Some(spec.mac.clone()),
                    mtu: Some(spec.mtu),
                    dhcp4: static_addrs.is_empty().then_some(true),
                    dhcp6: (static_addrs.is_empty() && spec.ipv6_enabled()).then_some(true),
                    addresses: static_addrs,
                },
            );
        }

        // anything on disk but not in the descriptor is an orphan
        let current: BTreeSet<String> = doc.network.vlans.keys().cloned().collect();
        let orphans: Vec<String> = self
            .on_disk_vlans()
            .into_iter()
            .filter(|name| !current.contains(name))
            .collect();
        for name in &orphans {
            self.remove_override(name);
        }

        let mut changed = !orphans.is_empty();
        if doc.network.vlans.is_empty() {
            let path = self.drop_in("vlan");
            if path.exists() {
                self.remove_drop_in("vlan");
                changed = true;
            }
        } else {
            changed |= self.write_doc_if_changed(&self.drop_in("vlan"), &doc)?;
            for vlan in nics.vlans.values() {
                let unit = NetworkUnit::vlan(vlan);
                changed |= self.write_override_if_changed(&vlan.interface_name(), &unit)?;
            }
        }

        if !orphans.is_empty() {
            let mut args = vec!["delete"];
            args.extend(orphans.iter().map(|n| n.as_str()));
            if let Err(err) = exec::run_ok("networkctl", &args).await {
                warn!(?err, ?orphans, "networkctl delete failed");
            }
        }
        if changed {
            self.reload().await;
        }
        Ok(())
    }

    async fn rollback(&self, nics: &Interfaces) -> Result<()> {
        for name in self.on_disk_vlans() {
            self.remove_override(&name);
        }
        for vlan in nics.vlans.values() {
            self.remove_override(&vlan.interface_name());
        }
        for eth in nics.valid_ethernet() {
            self.remove_override(&eth.name);
        }
        self.remove_drop_in("ethernet");
        self.remove_drop_in("vlan");
        self.reload().await;
        Ok(())
    }

    async fn rollback_nics(&self, nics: &Interfaces) -> Result<()> {
        for eth in nics.valid_ethernet() {
            self.remove_override(&eth.name);
        }
        self.remove_drop_in("ethernet");
        self.reload().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::metadata::{EthernetSpec, VlanSpec};
    use std::collections::BTreeMap;

    fn eth(name: &str, mac: &str, mtu: u32, dhcpv6: &str, primary: bool) -> EthernetInterface {
        EthernetInterface {
            spec: EthernetSpec {
                mac: mac.into(),
                mtu,
                dhcpv6_refresh: (!dhcpv6.is_empty()).then(|| dhcpv6.into()),
                ip: None,
                gateway: None,
            },
            name: name.into(),
            is_primary: primary,
            is_valid: true,
        }
    }

    fn vlan(parent: &str, id: u16, mac: &str) -> VlanInterface {
        VlanInterface {
            spec: VlanSpec {
                mac: mac.into(),
                parent_index: 0,
                vlan_id: id,
                mtu: 1500,
                ip: None,
                gateway: None,
                ipv6: vec![],
                gateway_ipv6: None,
                dhcpv6_refresh: None,
            },
            parent_name: parent.into(),
        }
    }

    struct Env {
        _tmp: tempfile::TempDir,
        netplan_dir: PathBuf,
        networkd_dir: PathBuf,
        backend: Netplan,
    }

    fn env() -> Env {
        let tmp = tempfile::tempdir().unwrap();
        let netplan_dir = tmp.path().join("netplan");
        let networkd_dir = tmp.path().join("systemd-network");
        fs::create_dir_all(&netplan_dir).unwrap();
        fs::create_dir_all(&networkd_dir).unwrap();
        let mut cfg = AgentConfig::default();
        cfg.paths.netplan_dir = netplan_dir.clone();
        cfg.paths.netplan_networkd_dir = networkd_dir.clone();
        cfg.paths.os_release = tmp.path().join("os-release");
        Env {
            backend: Netplan::new(Arc::new(cfg)),
            netplan_dir,
            networkd_dir,
            _tmp: tmp,
        }
    }

    fn single_nic() -> Interfaces {
        Interfaces {
            ethernet: vec![eth("eth0", "00:11:22:33:44:55", 1460, "", true)],
            vlans: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn renders_ethernet_drop_in_and_override() {
        let env = env();
        env.backend.setup_ethernet(&single_nic()).await.unwrap();

        let yaml_path = env.netplan_dir.join("20-google-guest-agent-ethernet.yaml");
        let raw = fs::read_to_string(&yaml_path).unwrap();
        assert!(raw.starts_with(MARKER_COMMENT));
        let doc: Document = serde_yaml::from_str(&raw).unwrap();
        let entry = &doc.network.ethernets["eth0"];
        assert_eq!(entry.matcher.name, "eth0");
        assert!(entry.dhcp4);
        assert_eq!(entry.dhcp6, None);
        assert_eq!(entry.mtu, Some(1460));
        assert_eq!(
            entry.dhcp4_overrides,
            Some(Overrides { use_domains: true })
        );

        let override_conf = fs::read_to_string(
            env.networkd_dir
                .join("10-netplan-eth0.network.d")
                .join("override.conf"),
        )
        .unwrap();
        assert!(override_conf.contains("DHCP=ipv4"));
        assert!(override_conf.contains("DNSDefaultRoute=true"));
        assert!(!override_conf.contains("[Match]"));
    }

    #[tokio::test]
    async fn unchanged_content_is_not_rewritten() {
        let env = env();
        let nics = single_nic();
        env.backend.setup_ethernet(&nics).await.unwrap();
        let yaml_path = env.netplan_dir.join("20-google-guest-agent-ethernet.yaml");
        let before = fs::metadata(&yaml_path).unwrap().modified().unwrap();
        env.backend.setup_ethernet(&nics).await.unwrap();
        assert_eq!(fs::metadata(&yaml_path).unwrap().modified().unwrap(), before);
    }

    #[tokio::test]
    async fn debian12_prefixes_ethernet_keys() {
        let env = env();
        fs::write(
            &env.backend.cfg.paths.os_release,
            "ID=debian\nVERSION_ID=\"12\"\n",
        )
        .unwrap();
        env.backend.configure(&env.backend.cfg);
        env.backend.setup_ethernet(&single_nic()).await.unwrap();

        let raw = fs::read_to_string(env.netplan_dir.join("20-google-guest-agent-ethernet.yaml"))
            .unwrap();
        let doc: Document = serde_yaml::from_str(&raw).unwrap();
        assert!(doc.network.ethernets.contains_key("aeth0"));
        // still matches the real interface by name
        assert_eq!(doc.network.ethernets["aeth0"].matcher.name, "eth0");
    }

    #[tokio::test]
    async fn vlan_add_and_remove() {
        let env = env();
        let mut nics = single_nic();
        nics.vlans.insert((0, 5), vlan("eth0", 5, "aa:bb:cc:dd:ee:ff"));
        env.backend.setup_vlan(&nics).await.unwrap();

        let vlan_yaml = env.netplan_dir.join("20-google-guest-agent-vlan.yaml");
        let doc: Document =
            serde_yaml::from_str(&fs::read_to_string(&vlan_yaml).unwrap()).unwrap();
        let entry = &doc.network.vlans["gcp.eth0.5"];
        assert_eq!(entry.id, 5);
        assert_eq!(entry.link, "eth0");
        assert_eq!(entry.macaddress.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        let override_dir = env.networkd_dir.join("10-netplan-gcp.eth0.5.network.d");
        assert!(override_dir.join("override.conf").exists());

        // descriptor drops the vlan
        nics.vlans.clear();
        env.backend.setup_vlan(&nics).await.unwrap();
        assert!(!vlan_yaml.exists());
        assert!(!override_dir.exists());
    }

    #[tokio::test]
    async fn rollback_spares_user_files() {
        let env = env();
        env.backend.setup_ethernet(&single_nic()).await.unwrap();

        // user file without marker at one of our paths
        let user_yaml = env.netplan_dir.join("20-google-guest-agent-vlan.yaml");
        fs::write(&user_yaml, "network:\n  version: 2\n").unwrap();
        let user_dir = env.networkd_dir.join("10-netplan-eth7.network.d");
        fs::create_dir_all(&user_dir).unwrap();
        fs::write(user_dir.join("override.conf"), "[Network]\nDHCP=no\n").unwrap();

        env.backend.rollback(&single_nic()).await.unwrap();
        assert!(!env
            .netplan_dir
            .join("20-google-guest-agent-ethernet.yaml")
            .exists());
        assert!(!env
            .networkd_dir
            .join("10-netplan-eth0.network.d")
            .exists());
        assert!(user_yaml.exists());
        assert!(user_dir.exists());
    }
}
