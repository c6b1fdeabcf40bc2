//! Periodic background jobs.
//!
//! Jobs are registered through the [`Scheduler`] trait rather than spawned
//! directly, so tests can drive them deterministically.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::PoolConfig;
use crate::models::cloud_task::ReclaimScope;

use super::reclaimer::OrphanReclaimer;
use super::sweeper::EvictionSweeper;
use super::workspace_locks::WorkspaceLocks;

/// A repeatable unit of background work.
pub type Job = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Wrap an async closure as a [`Job`].
#[must_use]
pub fn job<F, Fut>(f: F) -> Job
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || -> Pin<Box<dyn Future<Output = ()> + Send>> { Box::pin(f()) })
}

/// Runs jobs on fixed intervals.
pub trait Scheduler: Send + Sync {
    /// Run `job` every `period` until shutdown. Runs of one job never overlap.
    fn every(&self, name: &'static str, period: Duration, job: Job) -> JoinHandle<()>;
}

/// [`Scheduler`] backed by tokio intervals, stopped by a cancellation token.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    cancel: CancellationToken,
}

impl TokioScheduler {
    /// Create a scheduler whose jobs stop when `cancel` fires.
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }
}

impl Scheduler for TokioScheduler {
    fn every(&self, name: &'static str, period: Duration, job: Job) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!(job = name, "scheduled job shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        debug!(job = name, "scheduled job running");
                        job().await;
                    }
                }
            }
        })
    }
}

/// Register the sweep and reclaim jobs at their configured intervals.
#[must_use]
pub fn spawn_maintenance(
    scheduler: &dyn Scheduler,
    sweeper: Arc<EvictionSweeper>,
    reclaimer: Arc<OrphanReclaimer>,
    locks: Arc<WorkspaceLocks>,
    config: &PoolConfig,
) -> Vec<JoinHandle<()>> {
    let sweep = job(move || {
        let sweeper = Arc::clone(&sweeper);
        let locks = Arc::clone(&locks);
        async move {
            sweeper.sweep().await;
            let pruned = locks.prune();
            if pruned > 0 {
                debug!(pruned, "idle workspace locks pruned");
            }
        }
    });

    let reclaim = job(move || {
        let reclaimer = Arc::clone(&reclaimer);
        async move {
            reclaimer.reclaim(&ReclaimScope::All).await;
        }
    });

    vec![
        scheduler.every(
            "sweep",
            Duration::from_secs(config.sweep_interval_seconds),
            sweep,
        ),
        scheduler.every(
            "reclaim",
            Duration::from_secs(config.reclaim_interval_seconds),
            reclaim,
        ),
    ]
}
