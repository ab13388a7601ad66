//! # Engine
//!
//! Consumes descriptor events from the metadata watcher, detects the
//! backend currently managing the host's networking, and drives that
//! backend's rendering plus rollback of whatever the others left behind.
use std::{fs, sync::Arc, time::Duration};

use config::AgentConfig;
use metadata::NetworkDescriptor;
use pnet::datalink::NetworkInterface;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod state;

use crate::{
    backend::Backend,
    error::{Error, Result},
    metrics, os,
    resolve::{self, Interfaces},
};
use state::AppliedState;

/// MTU assumed for interfaces we only know from the local NIC table
const FALLBACK_MTU: u32 = 1460;

/// Delay before the post-reconciliation diagnostics log
const DIAG_DELAY: Duration = Duration::from_secs(2);

/// Default netplan config shipped on Debian 12 images. Restored when the
/// user deletes it by accident, since the distro won't put it back.
const DEBIAN12_DEFAULT_NETPLAN: &str = "\
network:
  version: 2
  ethernets:
    all-en:
      match:
        name: en*
      dhcp4: true
      dhcp4-overrides:
        use-domains: true
      dhcp6: true
      dhcp6-overrides:
        use-domains: true
";

/// Holds the ordered backend list and the applied-state snapshot, and runs
/// reconciliations one descriptor at a time.
pub struct Engine {
    cfg: Arc<AgentConfig>,
    backends: Vec<Arc<dyn Backend>>,
    state: AppliedState,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("backends", &self.backends.iter().map(|b| b.name()).collect::<Vec<_>>())
            .field("state", &self.state)
            .finish()
    }
}

impl Engine {
    /// Make a new engine with an empty backend list
    pub fn new(cfg: Arc<AgentConfig>) -> Engine {
        Engine {
            cfg,
            backends: Vec::new(),
            state: AppliedState::default(),
        }
    }

    /// Append a backend to the detection order
    pub fn backend<B, U>(&mut self, backend: U) -> &mut Self
    where
        U: Into<Arc<B>>,
        B: Backend,
    {
        self.backends.push(backend.into());
        self
    }

    /// the registered backends in detection order
    pub fn backends(&self) -> &[Arc<dyn Backend>] {
        &self.backends
    }

    /// Walk the registry in order; the first backend that claims `iface`
    /// wins. Probe errors abort detection and surface to the caller.
    pub async fn detect(&self, iface: &str) -> Result<Arc<dyn Backend>> {
        for backend in &self.backends {
            if backend.is_managing(iface).await? {
                debug!(backend = backend.name(), iface, "backend detected");
                metrics::BACKEND_DETECTED
                    .with_label_values(&[backend.name()])
                    .inc();
                return Ok(Arc::clone(backend));
            }
        }
        Err(Error::NoBackendDetected(iface.to_owned()))
    }

    /// One reconciliation against the live host NIC table
    pub async fn setup_interfaces(&mut self, descriptor: &NetworkDescriptor) -> Result<()> {
        let nics = resolve::local_interfaces();
        self.setup_interfaces_with(descriptor, &nics).await
    }

    /// One reconciliation against a caller-supplied NIC table
    pub async fn setup_interfaces_with(
        &mut self,
        descriptor: &NetworkDescriptor,
        nics: &[NetworkInterface],
    ) -> Result<()> {
        if self.state.matches(descriptor) {
            debug!("descriptor unchanged, nothing to do");
            metrics::RECONCILE_NOOPS.inc();
            return Ok(());
        }
        if !self.cfg.network_interfaces.setup {
            debug!("interface setup disabled by config");
            return Ok(());
        }

        let resolved = resolve::resolve_with(descriptor, nics)?;
        if resolved.ethernet.is_empty() {
            return Err(Error::MalformedDescriptor(
                "descriptor carries no ethernet interfaces".into(),
            ));
        }
        let primary = resolved
            .primary()
            .ok_or_else(|| {
                Error::NoBackendDetected(format!(
                    "primary mac {} has no local interface",
                    resolved.ethernet[0].spec.mac
                ))
            })?
            .name
            .clone();

        let active = self.detect(&primary).await?;
        info!(backend = active.name(), primary, "reconciling interfaces");

        self.rollback_leftovers(active.name(), &resolved).await;

        let manage_primary = self.cfg.network_interfaces.manage_primary_nic;
        let render_set = if manage_primary {
            resolved.clone()
        } else {
            resolved.without_primary()
        };

        active.configure(&self.cfg);
        active.setup_ethernet(&render_set).await?;
        if self.cfg.network_interfaces.vlan_setup_enabled {
            active.setup_vlan(&render_set).await?;
        }

        // give the backend's reload a moment to converge before dumping state
        tokio::spawn(async move {
            time::sleep(DIAG_DELAY).await;
            log_interface_state();
        });

        self.state.record(descriptor.clone());
        metrics::RECONCILE_RUNS.inc();
        Ok(())
    }

    /// Step 5: clean up after backends that are no longer active.
    /// Everything here is best-effort; failures are logged and ignored.
    async fn rollback_leftovers(&self, active: &str, resolved: &Interfaces) {
        let net_cfg = &self.cfg.network_interfaces;
        if net_cfg.restore_debian12_netplan_config {
            let os = os::OsRelease::load(&self.cfg.paths.os_release);
            let default_file = &self.cfg.paths.netplan_default_file;
            if os.is_debian12() && !default_file.exists() {
                info!(path = %default_file.display(), "restoring default netplan config");
                if let Err(err) = fs::write(default_file, DEBIAN12_DEFAULT_NETPLAN) {
                    warn!(?err, "failed to restore default netplan config");
                }
            }
        }

        if !net_cfg.manage_primary_nic {
            let primary_set = resolved.primary_only();
            for backend in &self.backends {
                if backend.name() == active {
                    continue;
                }
                if let Err(err) = backend.rollback_nics(&primary_set).await {
                    metrics::ROLLBACK_ERRORS.inc();
                    warn!(backend = backend.name(), ?err, "leftover rollback failed");
                }
            }
        }
    }

    /// Drive reconciliations from watcher events until cancellation.
    ///
    /// Waits for the single-shot ready signal before consuming any
    /// long-poll event, and coalesces bursts down to the most recent
    /// descriptor.
    pub async fn run(
        mut self,
        mut events: metadata::Events,
        token: CancellationToken,
    ) -> Result<()> {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            ready = events.ready.wait_for(|ready| *ready) => {
                if ready.is_err() {
                    // watcher died before producing anything
                    return Ok(());
                }
            }
        }
        debug!("metadata watcher ready, consuming descriptor events");

        loop {
            let next = tokio::select! {
                _ = token.cancelled() => break,
                next = events.descriptors.recv() => next,
            };
            let Some(mut event) = next else { break };
            // coalesce: only the most recent descriptor matters
            while let Ok(newer) = events.descriptors.try_recv() {
                event = newer;
            }
            metrics::DESCRIPTOR_EVENTS.inc();
            match event {
                Ok(descriptor) => {
                    if let Err(err) = self.setup_interfaces(&descriptor).await {
                        metrics::RECONCILE_ERRORS.inc();
                        error!(?err, "reconciliation failed, waiting for next event");
                    }
                }
                Err(err) => {
                    warn!(%err, "metadata watcher error, skipping this tick");
                }
            }
        }
        Ok(())
    }
}

/// Catastrophic-failure path: enumerate every local NIC with a MAC and ask
/// every known backend to roll back, in order, best-effort.
pub async fn fallback_to_default(backends: &[Arc<dyn Backend>]) {
    let nics = resolve::local_interfaces();
    let ethernet = nics
        .iter()
        .filter(|nic| nic.mac.is_some() && !nic.is_loopback())
        .enumerate()
        .map(|(i, nic)| crate::resolve::EthernetInterface {
            spec: metadata::EthernetSpec {
                mac: nic.mac.map(|m| m.to_string()).unwrap_or_default(),
                mtu: FALLBACK_MTU,
                dhcpv6_refresh: None,
                ip: None,
                gateway: None,
            },
            name: nic.name.clone(),
            is_primary: i == 0,
            is_valid: true,
        })
        .collect();
    let interfaces = Interfaces {
        ethernet,
        vlans: Default::default(),
    };
    warn!("falling back to default network configuration");
    for backend in backends {
        if let Err(err) = backend.rollback(&interfaces).await {
            metrics::ROLLBACK_ERRORS.inc();
            warn!(backend = backend.name(), ?err, "fallback rollback failed");
        }
    }
}

fn log_interface_state() {
    for nic in resolve::local_interfaces() {
        debug!(
            name = %nic.name,
            mac = ?nic.mac,
            ips = ?nic.ips,
            up = nic.is_up(),
            "interface state"
        );
    }
    trace_metrics();
}

fn trace_metrics() {
    let snapshot = metrics::snapshot();
    if !snapshot.is_empty() {
        tracing::trace!(%snapshot, "metrics");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::async_trait;
    use crate::resolve::tests::{eth_spec, nic, vlan_spec};
    use std::collections::BTreeMap;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    };

    struct FakeBackend {
        name: &'static str,
        managing: bool,
        probe_error: bool,
        fail_setup: AtomicBool,
        calls: Mutex<Vec<String>>,
    }

    impl FakeBackend {
        fn new(name: &'static str, managing: bool) -> Self {
            Self {
                name,
                managing,
                probe_error: false,
                fail_setup: AtomicBool::new(false),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn is_managing(&self, _iface: &str) -> Result<bool> {
            if self.probe_error {
                return Err(Error::BackendProbe(anyhow::anyhow!("bad probe output")));
            }
            Ok(self.managing)
        }
        async fn setup_ethernet(&self, nics: &Interfaces) -> Result<()> {
            self.record(format!("setup_ethernet:{}", nics.ethernet.len()));
            if self.fail_setup.load(Ordering::SeqCst) {
                return Err(Error::op(self.name, "setup_ethernet", anyhow::anyhow!("boom")));
            }
            Ok(())
        }
        async fn setup_vlan(&self, nics: &Interfaces) -> Result<()> {
            self.record(format!("setup_vlan:{}", nics.vlans.len()));
            Ok(())
        }
        async fn rollback(&self, _nics: &Interfaces) -> Result<()> {
            self.record("rollback");
            Ok(())
        }
        async fn rollback_nics(&self, nics: &Interfaces) -> Result<()> {
            self.record(format!("rollback_nics:{}", nics.ethernet.len()));
            Ok(())
        }
    }

    fn test_config() -> AgentConfig {
        let mut cfg = AgentConfig::default();
        cfg.network_interfaces.manage_primary_nic = true;
        cfg.network_interfaces.vlan_setup_enabled = true;
        cfg.network_interfaces.restore_debian12_netplan_config = false;
        cfg
    }

    fn descriptor_one_nic() -> NetworkDescriptor {
        NetworkDescriptor {
            ethernet: vec![eth_spec("00:11:22:33:44:55", 1460, "")],
            vlans: BTreeMap::new(),
        }
    }

    fn host_nics() -> Vec<NetworkInterface> {
        vec![nic("eth0", "00:11:22:33:44:55")]
    }

    #[tokio::test]
    async fn detection_first_match_wins() {
        let mut engine = Engine::new(Arc::new(test_config()));
        let a = Arc::new(FakeBackend::new("a", false));
        let b = Arc::new(FakeBackend::new("b", true));
        let c = Arc::new(FakeBackend::new("c", true));
        engine.backend::<FakeBackend, _>(Arc::clone(&a));
        engine.backend::<FakeBackend, _>(Arc::clone(&b));
        engine.backend::<FakeBackend, _>(Arc::clone(&c));
        let active = engine.detect("eth0").await.unwrap();
        assert_eq!(active.name(), "b");
    }

    #[tokio::test]
    async fn detection_no_backend() {
        let mut engine = Engine::new(Arc::new(test_config()));
        engine.backend(FakeBackend::new("a", false));
        let err = engine.detect("eth0").await.err().expect("expected error");
        assert!(matches!(err, Error::NoBackendDetected(name) if name == "eth0"));
    }

    #[tokio::test]
    async fn probe_error_propagates() {
        let mut engine = Engine::new(Arc::new(test_config()));
        let mut bad = FakeBackend::new("bad", true);
        bad.probe_error = true;
        engine.backend(bad);
        engine.backend(FakeBackend::new("good", true));
        let err = engine.detect("eth0").await.err().expect("expected error");
        assert!(matches!(err, Error::BackendProbe(_)));
    }

    #[tokio::test]
    async fn second_identical_descriptor_is_a_noop() {
        let mut engine = Engine::new(Arc::new(test_config()));
        let active = Arc::new(FakeBackend::new("active", true));
        engine.backend::<FakeBackend, _>(Arc::clone(&active));

        let desc = descriptor_one_nic();
        engine.setup_interfaces_with(&desc, &host_nics()).await.unwrap();
        let after_first = active.calls().len();
        assert!(after_first > 0);

        engine.setup_interfaces_with(&desc, &host_nics()).await.unwrap();
        assert_eq!(active.calls().len(), after_first);
    }

    #[tokio::test]
    async fn failed_setup_leaves_applied_state_untouched() {
        let mut engine = Engine::new(Arc::new(test_config()));
        let active = Arc::new(FakeBackend::new("active", true));
        active.fail_setup.store(true, Ordering::SeqCst);
        engine.backend::<FakeBackend, _>(Arc::clone(&active));

        let desc = descriptor_one_nic();
        assert!(engine
            .setup_interfaces_with(&desc, &host_nics())
            .await
            .is_err());
        assert!(!engine.state.is_applied());

        // next event retries the same descriptor instead of short-circuiting
        active.fail_setup.store(false, Ordering::SeqCst);
        engine.setup_interfaces_with(&desc, &host_nics()).await.unwrap();
        assert!(engine.state.is_applied());
        assert_eq!(
            active
                .calls()
                .iter()
                .filter(|c| c.starts_with("setup_ethernet"))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn malformed_descriptor_touches_nothing() {
        let mut engine = Engine::new(Arc::new(test_config()));
        let active = Arc::new(FakeBackend::new("active", true));
        engine.backend::<FakeBackend, _>(Arc::clone(&active));

        let mut desc = descriptor_one_nic();
        desc.vlans
            .entry(3)
            .or_default()
            .insert(5, vlan_spec("aa:bb:cc:dd:ee:ff", 3, 5, 1500));
        let err = engine
            .setup_interfaces_with(&desc, &host_nics())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedDescriptor(_)));
        assert!(active.calls().is_empty());
        assert!(!engine.state.is_applied());
    }

    #[tokio::test]
    async fn master_switch_disables_everything() {
        let mut cfg = test_config();
        cfg.network_interfaces.setup = false;
        let mut engine = Engine::new(Arc::new(cfg));
        let active = Arc::new(FakeBackend::new("active", true));
        engine.backend::<FakeBackend, _>(Arc::clone(&active));

        engine
            .setup_interfaces_with(&descriptor_one_nic(), &host_nics())
            .await
            .unwrap();
        assert!(active.calls().is_empty());
        assert!(!engine.state.is_applied());
    }

    #[tokio::test]
    async fn unmanaged_primary_is_excluded_and_leftovers_rolled_back() {
        let mut cfg = test_config();
        cfg.network_interfaces.manage_primary_nic = false;
        let mut engine = Engine::new(Arc::new(cfg));
        let inactive = Arc::new(FakeBackend::new("inactive", false));
        let active = Arc::new(FakeBackend::new("active", true));
        engine.backend::<FakeBackend, _>(Arc::clone(&inactive));
        engine.backend::<FakeBackend, _>(Arc::clone(&active));

        let desc = NetworkDescriptor {
            ethernet: vec![
                eth_spec("00:11:22:33:44:55", 1460, ""),
                eth_spec("00:11:22:33:44:66", 1500, ""),
            ],
            vlans: BTreeMap::new(),
        };
        let nics = vec![
            nic("eth0", "00:11:22:33:44:55"),
            nic("eth1", "00:11:22:33:44:66"),
        ];
        engine.setup_interfaces_with(&desc, &nics).await.unwrap();

        // inactive backend got a one-element primary rollback, no setup
        assert_eq!(inactive.calls(), vec!["rollback_nics:1"]);
        // active backend rendered only the secondary
        assert!(active.calls().contains(&"setup_ethernet:1".to_string()));
        // active backend was not rolled back
        assert!(!active.calls().iter().any(|c| c.starts_with("rollback")));
    }

    #[tokio::test]
    async fn vlan_setup_gated_by_config() {
        let mut cfg = test_config();
        cfg.network_interfaces.vlan_setup_enabled = false;
        let mut engine = Engine::new(Arc::new(cfg));
        let active = Arc::new(FakeBackend::new("active", true));
        engine.backend::<FakeBackend, _>(Arc::clone(&active));

        engine
            .setup_interfaces_with(&descriptor_one_nic(), &host_nics())
            .await
            .unwrap();
        assert!(!active.calls().iter().any(|c| c.starts_with("setup_vlan")));
    }

    #[tokio::test]
    async fn debian12_default_netplan_restored() {
        let dir = tempfile::tempdir().unwrap();
        let os_release = dir.path().join("os-release");
        std::fs::write(&os_release, "ID=debian\nVERSION_ID=\"12\"\n").unwrap();
        let default_file = dir.path().join("90-default.yaml");

        let mut cfg = test_config();
        cfg.network_interfaces.restore_debian12_netplan_config = true;
        cfg.paths.os_release = os_release;
        cfg.paths.netplan_default_file = default_file.clone();

        let mut engine = Engine::new(Arc::new(cfg));
        let active = Arc::new(FakeBackend::new("active", true));
        engine.backend::<FakeBackend, _>(Arc::clone(&active));

        engine
            .setup_interfaces_with(&descriptor_one_nic(), &host_nics())
            .await
            .unwrap();
        let restored = std::fs::read_to_string(&default_file).unwrap();
        assert!(restored.contains("dhcp4: true"));

        // second run leaves a user-modified file alone
        std::fs::write(&default_file, "user edit").unwrap();
        let desc2 = NetworkDescriptor {
            ethernet: vec![eth_spec("00:11:22:33:44:55", 1500, "")],
            vlans: BTreeMap::new(),
        };
        engine.setup_interfaces_with(&desc2, &host_nics()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&default_file).unwrap(), "user edit");
    }
}
