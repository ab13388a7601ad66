//! systemd-networkd backend. Renders one `.network` unit per interface
//! (plus a `.netdev` per agent VLAN) under the systemd search path and
//! reloads with `networkctl`.
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
    backend::{content_has_marker, is_agent_vlan_name},
    prelude::*,
    Register,
};
use config::AgentConfig;

pub mod render;

use render::{render_netdev, NetworkUnit};

const NAME: &str = "systemd-networkd";
/// unit file priority prefix
const PRIORITY: u32 = 1;
/// oldest networkd with a stable `--json=short` status surface
const MIN_VERSION: u32 = 253;
const FILE_SUFFIX: &str = "-google-guest-agent";

/// keys `networkctl status --json=short` may report state under
const STATUS_KEYS: &[&str] = &["AdministrativeState", "OperationalState", "State"];

/// systemd-networkd backend
pub struct Networkd {
    cfg: Arc<AgentConfig>,
}

impl std::fmt::Debug for Networkd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Networkd").finish()
    }
}

impl Register for Networkd {
    fn register(self, engine: &mut agent_core::Engine) {
        engine.backend(self);
    }
}

impl Networkd {
    /// new backend over the configured unit directory
    pub fn new(cfg: Arc<AgentConfig>) -> Self {
        Self { cfg }
    }

    fn dir(&self) -> &Path {
        &self.cfg.paths.networkd_dir
    }

    fn network_path(&self, iface: &str) -> PathBuf {
        self.dir()
            .join(format!("{PRIORITY}-{iface}{FILE_SUFFIX}.network"))
    }

    fn netdev_path(&self, iface: &str) -> PathBuf {
        self.dir()
            .join(format!("{PRIORITY}-{iface}{FILE_SUFFIX}.netdev"))
    }

    /// parse `networkctl --version`; first line looks like
    /// `systemd 253 (253.6-1)`
    async fn version(&self) -> Result<u32> {
        let out = exec::run("networkctl", &["--version"])
            .await
            .map_err(Error::BackendProbe)?;
        let first = out.stdout.lines().next().unwrap_or_default();
        first
            .split_whitespace()
            .nth(1)
            .and_then(|tok| tok.parse::<u32>().ok())
            .ok_or_else(|| {
                Error::BackendProbe(anyhow::anyhow!(
                    "unparseable networkctl version output: {first:?}"
                ))
            })
    }

    async fn iface_configured(&self, iface: &str) -> bool {
        let out = match exec::run("networkctl", &["status", iface, "--json=short"]).await {
            Ok(out) if out.success() => out,
            _ => return false,
        };
        let Ok(status) = serde_json::from_str::<serde_json::Value>(&out.stdout) else {
            return false;
        };
        STATUS_KEYS
            .iter()
            .any(|key| status.get(key).and_then(|v| v.as_str()) == Some("configured"))
    }

    async fn reload(&self) {
        if let Err(err) = exec::run_ok("networkctl", &["reload"]).await {
            warn!(?err, "networkctl reload failed");
        }
    }

    /// write `content` unless the file already holds it
    fn write_if_changed(&self, path: &Path, content: &str) -> Result<bool> {
        if fs::read_to_string(path).ok().as_deref() == Some(content) {
            return Ok(false);
        }
        fs::write(path, content)
            .map_err(|err| Error::op(NAME, "write", anyhow::Error::new(err)))?;
        Ok(true)
    }

    /// the interface an agent artifact file belongs to, if it is one
    fn artifact_iface(fname: &str) -> Option<&str> {
        let stem = fname
            .strip_suffix(".network")
            .or_else(|| fname.strip_suffix(".netdev"))?;
        let stem = stem.strip_suffix(FILE_SUFFIX)?;
        let (_prio, iface) = stem.split_once('-')?;
        (!iface.is_empty()).then_some(iface)
    }

    /// delete marker-tagged unit files; `vlans_too=false` leaves VLAN
    /// artifacts alone. Returns agent VLAN links whose netdev was removed.
    fn remove_artifacts(&self, vlans_too: bool) -> Vec<String> {
        let mut removed_links = BTreeSet::new();
        let Ok(entries) = fs::read_dir(self.dir()) else {
            return vec![];
        };
        for entry in entries.flatten() {
            let fname = entry.file_name();
            let fname = fname.to_string_lossy();
            let Some(iface) = Self::artifact_iface(&fname) else {
                continue;
            };
            let is_vlan = is_agent_vlan_name(iface);
            if is_vlan && !vlans_too {
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
                warn!(?err, path = %path.display(), "failed removing unit file");
            } else if is_vlan {
                removed_links.insert(iface.to_owned());
            }
        }
        removed_links.into_iter().collect()
    }

    async fn delete_links(&self, links: &[String]) {
        if links.is_empty() {
            return;
        }
        let mut args = vec!["delete"];
        args.extend(links.iter().map(|l| l.as_str()));
        if let Err(err) = exec::run_ok("networkctl", &args).await {
            warn!(?err, ?links, "networkctl delete failed");
        }
    }
}

#[async_trait]
impl Backend for Networkd {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn is_managing(&self, iface: &str) -> Result<bool> {
        if exec::lookup_path("networkctl").is_none() {
            return Ok(false);
        }
        if self.version().await? < MIN_VERSION {
            return Ok(false);
        }
        match exec::run("systemctl", &["is-active", "systemd-networkd.service"]).await {
            Ok(out) if out.success() => {}
            _ => return Ok(false),
        }
        Ok(self.iface_configured(iface).await)
    }

    #[instrument(level = "debug", skip_all)]
    async fn setup_ethernet(&self, nics: &Interfaces) -> Result<()> {
        let vlan_enabled = self.cfg.network_interfaces.vlan_setup_enabled;
        let mut changed = false;
        for eth in nics.valid_ethernet() {
            let children = if vlan_enabled {
                nics.vlans
                    .values()
                    .filter(|v| v.parent_name == eth.name)
                    .map(|v| v.interface_name())
                    .collect()
            } else {
                vec![]
            };
            let unit = NetworkUnit::ethernet(eth, children);
            let path = self.network_path(&eth.name);
            changed |= self.write_if_changed(&path, &unit.render(true))?;
        }
        if changed {
            self.reload().await;
        }
        Ok(())
    }

    #[instrument(level = "debug", skip_all)]
    async fn setup_vlan(&self, nics: &Interfaces) -> Result<()> {
        let current: BTreeSet<String> =
            nics.vlans.values().map(|v| v.interface_name()).collect();

        // drop artifacts for VLANs no longer in the descriptor
        let mut orphans = Vec::new();
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
                if !content_has_marker(&content) {
                    continue;
                }
                if fs::remove_file(&path).is_ok() && !orphans.contains(&iface.to_owned()) {
                    orphans.push(iface.to_owned());
                }
            }
        }

        let mut changed = !orphans.is_empty();
        for vlan in nics.vlans.values() {
            let name = vlan.interface_name();
            changed |= self.write_if_changed(&self.netdev_path(&name), &render_netdev(vlan))?;
            let unit = NetworkUnit::vlan(vlan);
            changed |= self.write_if_changed(&self.network_path(&name), &unit.render(true))?;
        }

        self.delete_links(&orphans).await;
        if changed {
            self.reload().await;
        }
        Ok(())
    }

    async fn rollback(&self, _nics: &Interfaces) -> Result<()> {
        let links = self.remove_artifacts(true);
        self.delete_links(&links).await;
        self.reload().await;
        Ok(())
    }

    async fn rollback_nics(&self, _nics: &Interfaces) -> Result<()> {
        self.remove_artifacts(false);
        self.reload().await;
        Ok(())
    }
}
