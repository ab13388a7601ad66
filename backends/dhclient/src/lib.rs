//! dhclient backend, the fallback when no higher-level manager claims the
//! host. Runs one DHCP client process per interface per address family,
//! tracked through pid files under the run directory, and drives VLAN
//! links directly with `ip(8)`.
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
    time::Duration,
};

use agent_core::{backend::is_agent_vlan_name, prelude::*, tokio::time, Register};
use config::AgentConfig;

const NAME: &str = "dhclient";
const FILE_STEM: &str = "dhclient.google-guest-agent";

/// how long to wait for the primary link-local address to leave tentative
const TENTATIVE_WAIT: Duration = Duration::from_secs(5);
const TENTATIVE_POLL: Duration = Duration::from_millis(500);

/// address family a client process serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

impl Family {
    /// file-name segment, `-4` or `-6`
    fn segment(self) -> &'static str {
        match self {
            Family::V4 => "-4",
            Family::V6 => "-6",
        }
    }
}

/// dhclient backend
pub struct Dhclient {
    cfg: Arc<AgentConfig>,
}

impl std::fmt::Debug for Dhclient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dhclient").finish()
    }
}

impl Register for Dhclient {
    fn register(self, engine: &mut agent_core::Engine) {
        engine.backend(self);
    }
}

impl Dhclient {
    /// new backend over the configured run directory
    pub fn new(cfg: Arc<AgentConfig>) -> Self {
        Self { cfg }
    }

    fn dir(&self) -> &Path {
        &self.cfg.paths.dhclient_dir
    }

    fn pid_path(&self, iface: &str, family: Family) -> PathBuf {
        self.dir()
            .join(format!("{FILE_STEM}.{iface}.{}.pid", family.segment()))
    }

    fn lease_path(&self, iface: &str, family: Family) -> PathBuf {
        self.dir()
            .join(format!("{FILE_STEM}.{iface}.{}.lease", family.segment()))
    }

    /// pid of a live client process for this interface/family, if any.
    /// Liveness is the pid file plus a `/proc/<pid>` check; stale files
    /// count as "not running".
    fn running_pid(&self, iface: &str, family: Family) -> Option<i32> {
        let raw = fs::read_to_string(self.pid_path(iface, family)).ok()?;
        let pid: i32 = raw.trim().parse().ok()?;
        Path::new("/proc").join(pid.to_string()).exists().then_some(pid)
    }

    /// Partition NICs into (needs v4 lease, needs v6 lease, v6 release)
    fn partition<'a>(
        &self,
        nics: &'a Interfaces,
    ) -> (
        Vec<&'a EthernetInterface>,
        Vec<&'a EthernetInterface>,
        Vec<&'a EthernetInterface>,
    ) {
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        let mut release = Vec::new();
        for eth in nics.valid_ethernet() {
            if self.running_pid(&eth.name, Family::V4).is_none() {
                v4.push(eth);
            }
            let has_v6 = self.running_pid(&eth.name, Family::V6).is_some();
            if eth.spec.ipv6_enabled() && !has_v6 {
                v6.push(eth);
            } else if !eth.spec.ipv6_enabled() && has_v6 {
                release.push(eth);
            }
        }
        (v4, v6, release)
    }

    async fn request_lease(&self, iface: &str, family: Family) {
        let pid = self.pid_path(iface, family);
        let lease = self.lease_path(iface, family);
        let mut args: Vec<String> = Vec::new();
        if family == Family::V6 {
            args.push("-6".into());
        }
        args.extend([
            "-pf".into(),
            pid.display().to_string(),
            "-lf".into(),
            lease.display().to_string(),
            iface.to_owned(),
        ]);
        if let Err(err) = exec::run_ok("dhclient", &args).await {
            warn!(?err, iface, ?family, "dhclient request failed");
        }
    }

    async fn release_lease(&self, iface: &str, family: Family) {
        let pid = self.pid_path(iface, family);
        let lease = self.lease_path(iface, family);
        let mut args: Vec<String> = Vec::new();
        if family == Family::V6 {
            args.push("-6".into());
        }
        args.extend([
            "-r".into(),
            "-pf".into(),
            pid.display().to_string(),
            "-lf".into(),
            lease.display().to_string(),
            iface.to_owned(),
        ]);
        if let Err(err) = exec::run_ok("dhclient", &args).await {
            warn!(?err, iface, ?family, "dhclient release failed");
        }
        for stale in [pid, lease] {
            let _ = fs::remove_file(stale);
        }
    }

    /// Wait for the link-local SLAAC address to finish duplicate address
    /// detection; DHCPv6 solicits sent from a tentative address are dropped.
    async fn wait_tentative(&self, iface: &str) {
        let deadline = time::Instant::now() + TENTATIVE_WAIT;
        loop {
            match exec::run(
                "ip",
                &["-6", "addr", "show", "dev", iface, "scope", "link", "tentative"],
            )
            .await
            {
                Ok(out) if out.success() && out.stdout.trim().is_empty() => return,
                _ => {}
            }
            if time::Instant::now() >= deadline {
                warn!(iface, "link-local address still tentative, proceeding anyway");
                return;
            }
            time::sleep(TENTATIVE_POLL).await;
        }
    }

    async fn enable_ipv6_route_info(&self, iface: &str) {
        let key = format!("net.ipv6.conf.{iface}.accept_ra_rt_info_max_plen=128");
        if let Err(err) = exec::run_ok("sysctl", &["-w", &key]).await {
            warn!(?err, iface, "sysctl failed");
        }
    }

    async fn link_exists(&self, name: &str) -> bool {
        matches!(exec::run("ip", &["link", "show", name]).await, Ok(out) if out.success())
    }

    /// names of live links created by the agent
    async fn agent_links(&self) -> Vec<String> {
        let Ok(out) = exec::run("ip", &["-o", "link", "show"]).await else {
            return vec![];
        };
        out.stdout
            .lines()
            .filter_map(|line| {
                // "3: gcp.eth0.5@eth0: <BROADCAST,..." -> gcp.eth0.5
                let name = line.split(':').nth(1)?.trim();
                let name = name.split('@').next()?;
                is_agent_vlan_name(name).then(|| name.to_owned())
            })
            .collect()
    }

    async fn create_vlan_link(&self, vlan: &VlanInterface) {
        let name = vlan.interface_name();
        let spec = &vlan.spec;
        if !self.link_exists(&name).await {
            let id = spec.vlan_id.to_string();
            let args = [
                "link", "add", "link", &vlan.parent_name, "name", &name, "type", "vlan", "id",
                &id,
            ];
            if let Err(err) = exec::run_ok("ip", &args).await {
                warn!(?err, name, "vlan link add failed");
                return;
            }
        }
        let mtu = spec.mtu.to_string();
        let link_settings: [&[&str]; 3] = [
            &["link", "set", "dev", &name, "address", &spec.mac],
            &["link", "set", "dev", &name, "mtu", &mtu],
            &["link", "set", "dev", &name, "up"],
        ];
        for args in link_settings {
            if let Err(err) = exec::run_ok("ip", args).await {
                warn!(?err, name, ?args, "vlan link setup failed");
            }
        }
        if let Some(ip) = &spec.ip {
            if let Err(err) = exec::run_ok("ip", &["addr", "add", ip, "dev", &name]).await {
                debug!(?err, name, "ipv4 address add skipped");
            }
            if let Some(gw) = &spec.gateway {
                if let Err(err) =
                    exec::run_ok("ip", &["route", "add", "default", "via", gw, "dev", &name]).await
                {
                    debug!(?err, name, "ipv4 route add skipped");
                }
            }
        }
        for addr in &spec.ipv6 {
            if let Err(err) = exec::run_ok("ip", &["-6", "addr", "add", addr, "dev", &name]).await
            {
                debug!(?err, name, "ipv6 address add skipped");
            }
        }
        if let Some(gw) = &spec.gateway_ipv6 {
            if let Err(err) = exec::run_ok(
                "ip",
                &["-6", "route", "add", "default", "via", gw, "dev", &name],
            )
            .await
            {
                debug!(?err, name, "ipv6 route add skipped");
            }
        }
    }

    async fn delete_link(&self, name: &str) {
        // never delete links we did not name
        if !is_agent_vlan_name(name) {
            return;
        }
        if let Err(err) = exec::run_ok("ip", &["link", "del", name]).await {
            warn!(?err, name, "vlan link delete failed");
        }
    }
}

#[async_trait]
impl Backend for Dhclient {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn is_managing(&self, _iface: &str) -> Result<bool> {
        Ok(exec::lookup_path("dhclient").is_some())
    }

    #[instrument(level = "debug", skip_all)]
    async fn setup_ethernet(&self, nics: &Interfaces) -> Result<()> {
        let custom = &self.cfg.network_interfaces.dhcp_command;
        if !custom.is_empty() {
            let parts: Vec<&str> = custom.split_whitespace().collect();
            let Some((cmd, args)) = parts.split_first() else {
                return Ok(());
            };
            return exec::run_ok(cmd, args)
                .await
                .map(|_| ())
                .map_err(|err| Error::op(NAME, "dhcp_command", err));
        }

        let (v4, v6, release) = self.partition(nics);
        if !v6.is_empty() {
            if let Some(primary) = nics.primary() {
                self.wait_tentative(&primary.name).await;
            }
        }
        for eth in release {
            self.release_lease(&eth.name, Family::V6).await;
        }
        for eth in v4 {
            self.request_lease(&eth.name, Family::V4).await;
        }
        for eth in v6 {
            self.enable_ipv6_route_info(&eth.name).await;
            self.request_lease(&eth.name, Family::V6).await;
        }
        Ok(())
    }

    #[instrument(level = "debug", skip_all)]
    async fn setup_vlan(&self, nics: &Interfaces) -> Result<()> {
        let current: BTreeSet<String> =
            nics.vlans.values().map(|v| v.interface_name()).collect();
        for link in self.agent_links().await {
            if !current.contains(&link) {
                self.delete_link(&link).await;
            }
        }
        for vlan in nics.vlans.values() {
            self.create_vlan_link(vlan).await;
        }
        Ok(())
    }

    async fn rollback(&self, nics: &Interfaces) -> Result<()> {
        self.rollback_nics(nics).await?;
        for vlan in nics.vlans.values() {
            self.delete_link(&vlan.interface_name()).await;
        }
        for link in self.agent_links().await {
            self.delete_link(&link).await;
        }
        Ok(())
    }

    async fn rollback_nics(&self, nics: &Interfaces) -> Result<()> {
        for eth in nics.valid_ethernet() {
            for family in [Family::V4, Family::V6] {
                if self.running_pid(&eth.name, family).is_some() {
                    self.release_lease(&eth.name, family).await;
                }
            }
        }
        Ok(())
    }
}
