//! Periodic link-state diagnostics. The reconciliation engine logs a
//! snapshot two seconds after every apply; this job repeats that on a
//! timer so long-lived quiet systems still leave a trail.
use std::{sync::Arc, time::Duration};

use agent_core::{
    async_trait, metrics,
    resolve,
    sched::{Interval, Job},
    tracing::{debug, trace},
};
use config::AgentConfig;
use tokio_util::sync::CancellationToken;

pub(crate) struct LinkStateJob {
    period: Duration,
}

impl LinkStateJob {
    pub(crate) fn new(cfg: Arc<AgentConfig>) -> Self {
        Self {
            period: Duration::from_secs(cfg.diagnostics.link_state_interval_secs),
        }
    }
}

#[async_trait]
impl Job for LinkStateJob {
    fn id(&self) -> &'static str {
        "link-state-log"
    }

    fn interval(&self) -> Interval {
        Interval {
            period: self.period,
            starting_now: false,
        }
    }

    fn should_enable(&self, cfg: &AgentConfig) -> bool {
        cfg.diagnostics.link_state_log
    }

    async fn run(&self, _token: &CancellationToken) -> (bool, Option<anyhow::Error>) {
        for nic in resolve::local_interfaces() {
            debug!(
                name = %nic.name,
                mac = ?nic.mac,
                ips = ?nic.ips,
                up = nic.is_up(),
                "link state"
            );
        }
        let snapshot = metrics::snapshot();
        if !snapshot.is_empty() {
            trace!(%snapshot, "metrics");
        }
        (true, None)
    }
}
