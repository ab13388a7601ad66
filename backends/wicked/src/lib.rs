//! wicked backend (SUSE). Renders `ifcfg-<name>` files with the marker
//! comment as the first line and reloads with `wicked ifreload`.
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
};

use agent_core::{
    backend::{is_agent_vlan_name, MARKER_COMMENT},
    prelude::*,
    Register,
};
use config::AgentConfig;

const NAME: &str = "wicked";
/// ethernet route priority base, +100 per interface
const ETHERNET_ROUTE_PRIORITY: u32 = 10100;
/// VLAN route priority base, +100 per interface
const VLAN_ROUTE_PRIORITY: u32 = 20200;
const PRIORITY_STEP: u32 = 100;

/// wicked backend
pub struct Wicked {
    cfg: Arc<AgentConfig>,
}

impl std::fmt::Debug for Wicked {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wicked").finish()
    }
}

impl Register for Wicked {
    fn register(self, engine: &mut agent_core::Engine) {
        engine.backend(self);
    }
}

impl Wicked {
    /// new backend over the configured sysconfig directory
    pub fn new(cfg: Arc<AgentConfig>) -> Self {
        Self { cfg }
    }

    fn dir(&self) -> &Path {
        &self.cfg.paths.wicked_dir
    }

    fn ifcfg_path(&self, iface: &str) -> PathBuf {
        self.dir().join(format!("ifcfg-{iface}"))
    }

    fn render_ethernet(eth: &EthernetInterface, index: usize) -> String {
        let mut lines = vec![
            MARKER_COMMENT.to_owned(),
            "STARTMODE=hotplug".to_owned(),
            format!(
                "BOOTPROTO={}",
                if eth.spec.ipv6_enabled() { "dhcp" } else { "dhcp4" }
            ),
            format!(
                "DHCLIENT_SET_DEFAULT_ROUTE={}",
                if eth.is_primary { "yes" } else { "no" }
            ),
            format!(
                "DHCLIENT_ROUTE_PRIORITY={}",
                ETHERNET_ROUTE_PRIORITY + PRIORITY_STEP * index as u32
            ),
            format!("MTU={}", eth.spec.mtu),
        ];
        if !eth.is_primary {
            lines.push("DHCLIENT_MODIFY_RESOLV_CONF=no".to_owned());
        }
        lines.join("\n") + "\n"
    }

    fn render_vlan(vlan: &VlanInterface, index: usize) -> String {
        let spec = &vlan.spec;
        let static_config = spec.ip.is_some() || !spec.ipv6.is_empty();
        let mut lines = vec![
            MARKER_COMMENT.to_owned(),
            "STARTMODE=hotplug".to_owned(),
            format!(
                "BOOTPROTO={}",
                if static_config {
                    "static"
                } else if spec.ipv6_enabled() {
                    "dhcp"
                } else {
                    "dhcp4"
                }
            ),
            format!("ETHERDEVICE={}", vlan.parent_name),
            format!("VLAN_ID={}", spec.vlan_id),
            // explicit MAC, never inherited from the parent
            format!("LLADDR={}", spec.mac),
            format!("MTU={}", spec.mtu),
            "DHCLIENT_SET_DEFAULT_ROUTE=no".to_owned(),
            format!(
                "DHCLIENT_ROUTE_PRIORITY={}",
                VLAN_ROUTE_PRIORITY + PRIORITY_STEP * index as u32
            ),
        ];
        if let Some(ip) = &spec.ip {
            lines.push(format!("IPADDR={ip}"));
            if let Some(gw) = &spec.gateway {
                lines.push(format!("GATEWAY={gw}"));
            }
        }
        for (i, addr) in spec.ipv6.iter().enumerate() {
            lines.push(format!("IPADDR_{}={}", i + 1, addr));
        }
        lines.join("\n") + "\n"
    }

    fn write_if_changed(&self, iface: &str, content: &str) -> Result<bool> {
        let path = self.ifcfg_path(iface);
        if fs::read_to_string(&path).ok().as_deref() == Some(content) {
            return Ok(false);
        }
        fs::write(&path, content)
            .map_err(|err| Error::op(NAME, "write", anyhow::Error::new(err)))?;
        Ok(true)
    }

    /// ifcfg file is ours iff the marker comment is its first line
    fn owns_file(path: &Path) -> bool {
        fs::read_to_string(path)
            .map(|content| content.lines().next() == Some(MARKER_COMMENT))
            .unwrap_or(false)
    }

    /// remove marker-tagged ifcfg files, returning the interface names
    fn remove_artifacts(&self, vlans_too: bool) -> Vec<String> {
        let mut removed = Vec::new();
        let Ok(entries) = fs::read_dir(self.dir()) else {
            return removed;
        };
        for entry in entries.flatten() {
            let fname = entry.file_name();
            let Some(iface) = fname.to_string_lossy().strip_prefix("ifcfg-").map(String::from)
            else {
                continue;
            };
            if is_agent_vlan_name(&iface) && !vlans_too {
                continue;
            }
            let path = entry.path();
            if !Self::owns_file(&path) {
                continue;
            }
            if let Err(err) = fs::remove_file(&path) {
                warn!(?err, path = %path.display(), "failed removing ifcfg file");
            } else {
                removed.push(iface);
            }
        }
        removed
    }

    async fn ifreload(&self, ifaces: &[String]) {
        if ifaces.is_empty() {
            return;
        }
        let mut args = vec!["ifreload"];
        args.extend(ifaces.iter().map(|s| s.as_str()));
        if let Err(err) = exec::run_ok("wicked", &args).await {
            warn!(?err, ?ifaces, "wicked ifreload failed");
        }
    }
}

#[async_trait]
impl Backend for Wicked {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn is_managing(&self, iface: &str) -> Result<bool> {
        if exec::lookup_path("wicked").is_none() {
            return Ok(false);
        }
        if let Ok(out) = exec::run("systemctl", &["status", "network.service"]).await {
            if out.stdout.contains("wicked.service") {
                return Ok(true);
            }
        }
        match exec::run("wicked", &["ifstatus", iface, "--brief"]).await {
            Ok(out) => Ok(out.stdout.contains("up") || out.stdout.contains("setup-in-progress")),
            Err(_) => Ok(false),
        }
    }

    #[instrument(level = "debug", skip_all)]
    async fn setup_ethernet(&self, nics: &Interfaces) -> Result<()> {
        let mut changed = Vec::new();
        for (index, eth) in nics.valid_ethernet().enumerate() {
            let content = Self::render_ethernet(eth, index);
            if self.write_if_changed(&eth.name, &content)? {
                changed.push(eth.name.clone());
            }
        }
        self.ifreload(&changed).await;
        Ok(())
    }

    #[instrument(level = "debug", skip_all)]
    async fn setup_vlan(&self, nics: &Interfaces) -> Result<()> {
        let current: BTreeSet<String> =
            nics.vlans.values().map(|v| v.interface_name()).collect();

        let mut touched = Vec::new();
        // orphaned vlan configs first
        if let Ok(entries) = fs::read_dir(self.dir()) {
            for entry in entries.flatten() {
                let fname = entry.file_name();
                let Some(iface) =
                    fname.to_string_lossy().strip_prefix("ifcfg-").map(String::from)
                else {
                    continue;
                };
                if !is_agent_vlan_name(&iface) || current.contains(&iface) {
                    continue;
                }
                if Self::owns_file(&entry.path()) && fs::remove_file(entry.path()).is_ok() {
                    touched.push(iface);
                }
            }
        }

        for (index, vlan) in nics.vlans.values().enumerate() {
            let name = vlan.interface_name();
            let content = Self::render_vlan(vlan, index);
            if self.write_if_changed(&name, &content)? {
                touched.push(name);
            }
        }
        self.ifreload(&touched).await;
        Ok(())
    }

    async fn rollback(&self, _nics: &Interfaces) -> Result<()> {
        let removed = self.remove_artifacts(true);
        self.ifreload(&removed).await;
        Ok(())
    }

    async fn rollback_nics(&self, _nics: &Interfaces) -> Result<()> {
        let removed = self.remove_artifacts(false);
        self.ifreload(&removed).await;
        Ok(())
    }
}
