//! Cron-style scheduler for non-networking periodic jobs. Reconciliation is
//! event-driven and never goes through here.
//!
//! One tokio task per job id; the same id never overlaps itself, distinct
//! ids run independently. The scheduler is a process-wide singleton.
use std::{collections::HashMap, sync::Mutex, time::Duration};

use async_trait::async_trait;
use config::AgentConfig;
use lazy_static::lazy_static;
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use std::sync::Arc;

/// How often a job ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    /// period between ticks
    pub period: Duration,
    /// run the first tick immediately instead of at `now + period`
    pub starting_now: bool,
}

/// A periodic housekeeping job
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// unique id; a second schedule call with the same id is rejected
    fn id(&self) -> &'static str;
    /// tick interval
    fn interval(&self) -> Interval;
    /// consulted once at schedule time
    fn should_enable(&self, cfg: &AgentConfig) -> bool;
    /// one tick. Returning `false` unschedules the job; an error is logged
    /// and does not unschedule by itself.
    async fn run(&self, token: &CancellationToken) -> (bool, Option<anyhow::Error>);
}

struct Scheduled {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Process-wide job scheduler, initialized lazily on first [`Scheduler::get`]
#[derive(Default)]
pub struct Scheduler {
    jobs: Mutex<HashMap<&'static str, Scheduled>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish()
    }
}

lazy_static! {
    static ref SCHEDULER: Scheduler = Scheduler::default();
}

impl Scheduler {
    /// the process-wide scheduler
    pub fn get() -> &'static Scheduler {
        &SCHEDULER
    }

    /// Start ticking `job` if its config gate allows it and the id is not
    /// already scheduled. Returns whether the job was scheduled.
    pub fn schedule(
        &'static self,
        cfg: &AgentConfig,
        job: Arc<dyn Job>,
        parent: &CancellationToken,
    ) -> bool {
        if !job.should_enable(cfg) {
            debug!(id = job.id(), "job disabled by config");
            return false;
        }
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(job.id()) {
            warn!(id = job.id(), "job already scheduled");
            return false;
        }
        let id = job.id();
        let token = parent.child_token();
        let handle = tokio::spawn(tick_loop(self, job, token.clone()));
        jobs.insert(id, Scheduled { token, handle });
        debug!(id, "job scheduled");
        true
    }

    /// is `id` currently scheduled
    pub fn is_scheduled(&self, id: &str) -> bool {
        self.jobs.lock().unwrap().contains_key(id)
    }

    /// Cancel a job. The current tick, if running, finishes first.
    pub fn unschedule(&self, id: &str) {
        if let Some(job) = self.jobs.lock().unwrap().remove(id) {
            job.token.cancel();
        }
    }

    /// Cancel all jobs and wait for their tick loops to exit
    pub async fn shutdown(&self) {
        let drained: Vec<Scheduled> = {
            let mut jobs = self.jobs.lock().unwrap();
            jobs.drain().map(|(_, v)| v).collect()
        };
        for job in &drained {
            job.token.cancel();
        }
        for job in drained {
            if let Err(err) = job.handle.await {
                warn!(?err, "job task panicked");
            }
        }
    }

    fn remove_entry(&self, id: &str) {
        self.jobs.lock().unwrap().remove(id);
    }
}

async fn tick_loop(sched: &'static Scheduler, job: Arc<dyn Job>, token: CancellationToken) {
    let Interval {
        period,
        starting_now,
    } = job.interval();
    let start = if starting_now {
        time::Instant::now()
    } else {
        time::Instant::now() + period
    };
    let mut ticker = time::interval_at(start, period);
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!(id = job.id(), "job stopping");
                return;
            }
            _ = ticker.tick() => {
                let (keep_going, err) = job.run(&token).await;
                if let Some(err) = err {
                    warn!(id = job.id(), ?err, "job tick failed");
                }
                if !keep_going {
                    debug!(id = job.id(), "job asked to be unscheduled");
                    sched.remove_entry(job.id());
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountJob {
        id: &'static str,
        max: usize,
        runs: AtomicUsize,
        enabled: bool,
    }

    #[async_trait]
    impl Job for CountJob {
        fn id(&self) -> &'static str {
            self.id
        }
        fn interval(&self) -> Interval {
            Interval {
                period: Duration::from_millis(5),
                starting_now: true,
            }
        }
        fn should_enable(&self, _cfg: &AgentConfig) -> bool {
            self.enabled
        }
        async fn run(&self, _token: &CancellationToken) -> (bool, Option<anyhow::Error>) {
            let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            (n < self.max, None)
        }
    }

    #[tokio::test]
    async fn job_unschedules_itself() {
        let cfg = AgentConfig::default();
        let job = Arc::new(CountJob {
            id: "count-a",
            max: 3,
            runs: AtomicUsize::new(0),
            enabled: true,
        });
        let token = CancellationToken::new();
        assert!(Scheduler::get().schedule(&cfg, job.clone(), &token));
        // same id is rejected while scheduled
        assert!(!Scheduler::get().schedule(&cfg, job.clone(), &token));

        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 3);
        assert!(!Scheduler::get().is_scheduled("count-a"));
        token.cancel();
    }

    #[tokio::test]
    async fn disabled_job_is_not_scheduled() {
        let cfg = AgentConfig::default();
        let job = Arc::new(CountJob {
            id: "count-b",
            max: 100,
            runs: AtomicUsize::new(0),
            enabled: false,
        });
        let token = CancellationToken::new();
        assert!(!Scheduler::get().schedule(&cfg, job, &token));
        assert!(!Scheduler::get().is_scheduled("count-b"));
    }

    #[tokio::test]
    async fn unschedule_stops_ticks() {
        let cfg = AgentConfig::default();
        let job = Arc::new(CountJob {
            id: "count-c",
            max: usize::MAX,
            runs: AtomicUsize::new(0),
            enabled: true,
        });
        let token = CancellationToken::new();
        assert!(Scheduler::get().schedule(&cfg, job.clone(), &token));
        time::sleep(Duration::from_millis(20)).await;
        Scheduler::get().unschedule("count-c");
        time::sleep(Duration::from_millis(10)).await;
        let after = job.runs.load(Ordering::SeqCst);
        time::sleep(Duration::from_millis(30)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), after);
    }
}
