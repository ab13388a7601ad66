//! NetworkManager backend. One keyfile connection profile per interface
//! under `system-connections`, mode 0600, activated through `nmcli`.
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
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use agent_core::{
    backend::{content_has_marker, is_agent_vlan_name, MARKER_KEY, MARKER_SECTION},
    prelude::*,
    Register,
};
use config::AgentConfig;
use configparser::ini::Ini;

const NAME: &str = "network-manager";
const FILE_PREFIX: &str = "google-guest-agent-";
const KEYFILE_MODE: u32 = 0o600;
/// NM_VLAN_FLAG_REORDER_HEADERS
const VLAN_FLAGS: u32 = 1;

/// NetworkManager backend
pub struct NetworkManager {
    cfg: Arc<AgentConfig>,
}

impl std::fmt::Debug for NetworkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkManager").finish()
    }
}

impl Register for NetworkManager {
    fn register(self, engine: &mut agent_core::Engine) {
        engine.backend(self);
    }
}

fn connection_id(iface: &str) -> String {
    format!("{FILE_PREFIX}{iface}")
}

impl NetworkManager {
    /// new backend over the configured system-connections directory
    pub fn new(cfg: Arc<AgentConfig>) -> Self {
        Self { cfg }
    }

    fn dir(&self) -> &Path {
        &self.cfg.paths.network_manager_dir
    }

    fn keyfile_path(&self, iface: &str) -> PathBuf {
        self.dir().join(format!("{FILE_PREFIX}{iface}.nmconnection"))
    }

    /// interface name for an agent keyfile, if the file is one
    fn artifact_iface(fname: &str) -> Option<&str> {
        let iface = fname
            .strip_prefix(FILE_PREFIX)?
            .strip_suffix(".nmconnection")?;
        (!iface.is_empty()).then_some(iface)
    }

    fn render_ethernet(&self, eth: &EthernetInterface) -> String {
        let mut ini = Ini::new_cs();
        let set = |ini: &mut Ini, sec: &str, key: &str, val: String| {
            ini.set(sec, key, Some(val));
        };
        set(&mut ini, "connection", "id", connection_id(&eth.name));
        set(&mut ini, "connection", "interface-name", eth.name.clone());
        set(&mut ini, "connection", "type", "802-3-ethernet".into());
        set(&mut ini, "802-3-ethernet", "mtu", eth.spec.mtu.to_string());
        set(&mut ini, "ipv4", "method", "auto".into());
        if !eth.is_primary {
            set(&mut ini, "ipv4", "never-default", "true".into());
            set(&mut ini, "ipv4", "ignore-auto-dns", "true".into());
        }
        set(
            &mut ini,
            "ipv6",
            "method",
            if eth.spec.ipv6_enabled() {
                "auto".into()
            } else {
                "disabled".into()
            },
        );
        set(&mut ini, MARKER_SECTION, MARKER_KEY, "true".into());
        ini.writes()
    }

    fn render_vlan(&self, vlan: &VlanInterface) -> String {
        let name = vlan.interface_name();
        let spec = &vlan.spec;
        let mut ini = Ini::new_cs();
        let set = |ini: &mut Ini, sec: &str, key: &str, val: String| {
            ini.set(sec, key, Some(val));
        };
        set(&mut ini, "connection", "id", connection_id(&name));
        set(&mut ini, "connection", "interface-name", name.clone());
        set(&mut ini, "connection", "type", "vlan".into());
        set(&mut ini, "vlan", "parent", vlan.parent_name.clone());
        set(&mut ini, "vlan", "id", spec.vlan_id.to_string());
        set(&mut ini, "vlan", "flags", VLAN_FLAGS.to_string());
        set(&mut ini, "802-3-ethernet", "mtu", spec.mtu.to_string());
        // never inherit the parent MAC
        set(
            &mut ini,
            "802-3-ethernet",
            "cloned-mac-address",
            spec.mac.clone(),
        );
        match &spec.ip {
            Some(ip) => {
                set(&mut ini, "ipv4", "method", "manual".into());
                let addr = match &spec.gateway {
                    Some(gw) => format!("{ip},{gw}"),
                    None => ip.clone(),
                };
                set(&mut ini, "ipv4", "address1", addr);
            }
            None => set(&mut ini, "ipv4", "method", "auto".into()),
        }
        if !spec.ipv6.is_empty() {
            set(&mut ini, "ipv6", "method", "manual".into());
            for (i, addr) in spec.ipv6.iter().enumerate() {
                let addr = match (&spec.gateway_ipv6, i) {
                    (Some(gw), 0) => format!("{addr},{gw}"),
                    _ => addr.clone(),
                };
                set(&mut ini, "ipv6", &format!("address{}", i + 1), addr);
            }
        } else {
            set(
                &mut ini,
                "ipv6",
                "method",
                if spec.ipv6_enabled() {
                    "auto".into()
                } else {
                    "disabled".into()
                },
            );
        }
        set(&mut ini, MARKER_SECTION, MARKER_KEY, "true".into());
        ini.writes()
    }

    /// structural comparison so formatting drift doesn't force reloads
    fn keyfile_equal(existing: &str, fresh: &str) -> bool {
        let mut a = Ini::new_cs();
        let mut b = Ini::new_cs();
        match (a.read(existing.to_owned()), b.read(fresh.to_owned())) {
            (Ok(ma), Ok(mb)) => ma == mb,
            _ => false,
        }
    }

    fn write_if_changed(&self, path: &Path, content: &str) -> Result<bool> {
        if let Ok(existing) = fs::read_to_string(path) {
            if Self::keyfile_equal(&existing, content) {
                return Ok(false);
            }
        }
        fs::write(path, content)
            .and_then(|_| fs::set_permissions(path, fs::Permissions::from_mode(KEYFILE_MODE)))
            .map_err(|err| Error::op(NAME, "write", anyhow::Error::new(err)))?;
        Ok(true)
    }

    async fn reload_and_activate(&self, changed: &[String]) {
        if changed.is_empty() {
            return;
        }
        if let Err(err) = exec::run_ok("nmcli", &["conn", "reload"]).await {
            warn!(?err, "nmcli conn reload failed");
            return;
        }
        for iface in changed {
            let id = connection_id(iface);
            if let Err(err) = exec::run_ok("nmcli", &["conn", "up", "id", &id]).await {
                warn!(?err, id, "nmcli conn up failed");
            }
        }
    }

    /// remove marker-tagged keyfiles; returns the interfaces whose profile
    /// went away
    fn remove_artifacts(&self, vlans_too: bool) -> Vec<String> {
        let mut removed = Vec::new();
        let Ok(entries) = fs::read_dir(self.dir()) else {
            return removed;
        };
        for entry in entries.flatten() {
            let fname = entry.file_name();
            let fname = fname.to_string_lossy();
            let Some(iface) = Self::artifact_iface(&fname) else {
                continue;
            };
            if is_agent_vlan_name(iface) && !vlans_too {
                continue;
            }
            let path = entry.path();
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            if !content_has_marker(&content) {
                continue;
            }
            if let Err(err) = fs::remove_file(&path) {
                warn!(?err, path = %path.display(), "failed removing keyfile");
            } else {
                removed.push(iface.to_owned());
            }
        }
        removed
    }
}

#[async_trait]
impl Backend for NetworkManager {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn is_managing(&self, iface: &str) -> Result<bool> {
        if exec::lookup_path("nmcli").is_none() {
            return Ok(false);
        }
        match exec::run("systemctl", &["is-active", "NetworkManager.service"]).await {
            Ok(out) if out.success() => {}
            _ => return Ok(false),
        }
        let out = match exec::run("nmcli", &["-t", "-f", "DEVICE,STATE", "dev", "status"]).await {
            Ok(out) if out.success() => out,
            _ => return Ok(false),
        };
        Ok(out.stdout.lines().any(|line| {
            matches!(line.split_once(':'), Some((dev, state))
                if dev == iface && state.starts_with("connected"))
        }))
    }

    #[instrument(level = "debug", skip_all)]
    async fn setup_ethernet(&self, nics: &Interfaces) -> Result<()> {
        let mut changed = Vec::new();
        for eth in nics.valid_ethernet() {
            let content = self.render_ethernet(eth);
            if self.write_if_changed(&self.keyfile_path(&eth.name), &content)? {
                changed.push(eth.name.clone());
            }
        }
        self.reload_and_activate(&changed).await;
        Ok(())
    }

    #[instrument(level = "debug", skip_all)]
    async fn setup_vlan(&self, nics: &Interfaces) -> Result<()> {
        let current: BTreeSet<String> =
            nics.vlans.values().map(|v| v.interface_name()).collect();

        // orphaned vlan profiles: profile file goes, then the link itself
        let mut orphaned = Vec::new();
        if let Ok(entries) = fs::read_dir(self.dir()) {
            for entry in entries.flatten() {
                let fname = entry.file_name();
                let fname = fname.to_string_lossy();
                let Some(iface) = Self::artifact_iface(&fname) else {
                    continue;
                };
                if !is_agent_vlan_name(iface) || current.contains(iface) {
                    continue;
                }
                let path = entry.path();
                let Ok(content) = fs::read_to_string(&path) else {
                    continue;
                };
                if content_has_marker(&content) && fs::remove_file(&path).is_ok() {
                    orphaned.push(iface.to_owned());
                }
            }
        }

        let mut changed = Vec::new();
        for vlan in nics.vlans.values() {
            let name = vlan.interface_name();
            let content = self.render_vlan(vlan);
            if self.write_if_changed(&self.keyfile_path(&name), &content)? {
                changed.push(name);
            }
        }

        if !orphaned.is_empty() {
            if let Err(err) = exec::run_ok("nmcli", &["conn", "reload"]).await {
                warn!(?err, "nmcli conn reload failed");
            }
            for iface in &orphaned {
                if let Err(err) = exec::run_ok("nmcli", &["device", "delete", iface]).await {
                    warn!(?err, iface, "nmcli device delete failed");
                }
            }
        }
        self.reload_and_activate(&changed).await;
        Ok(())
    }

    async fn rollback(&self, nics: &Interfaces) -> Result<()> {
        let removed = self.remove_artifacts(true);
        if removed.is_empty() {
            return Ok(());
        }
        if let Err(err) = exec::run_ok("nmcli", &["conn", "reload"]).await {
            warn!(?err, "nmcli conn reload failed");
        }
        // losing the primary profile would leave the NIC unconfigured;
        // force NetworkManager to re-create a default one
        if let Some(primary) = nics.primary() {
            if removed.contains(&primary.name) {
                if let Err(err) =
                    exec::run_ok("nmcli", &["device", "connect", &primary.name]).await
                {
                    warn!(?err, iface = %primary.name, "nmcli device connect failed");
                }
            }
        }
        Ok(())
    }

    async fn rollback_nics(&self, nics: &Interfaces) -> Result<()> {
        let removed = self.remove_artifacts(false);
        if removed.is_empty() {
            return Ok(());
        }
        if let Err(err) = exec::run_ok("nmcli", &["conn", "reload"]).await {
            warn!(?err, "nmcli conn reload failed");
        }
        if let Some(primary) = nics.primary() {
            if removed.contains(&primary.name) {
                if let Err(err) =
                    exec::run_ok("nmcli", &["device", "connect", &primary.name]).await
                {
                    warn!(?err, iface = %primary.name, "nmcli device connect failed");
                }
            }
        }
        Ok(())
    }
}
