use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::services::queue::{QueueError, QueueMessage, WorkQueue};
use crate::services::store::{JobStore, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("failed to list pending jobs: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to re-enqueue job: {0}")]
    Queue(#[from] QueueError),
}

/// Re-enqueues jobs stuck in `Pending`, covering enqueue failures at intake
/// and messages lost by the broker. A re-enqueued job's `updated_at` is
/// bumped so it waits another `stale_after` before the next attempt. Extra
/// messages for jobs that are merely slow are harmless: the worker skips
/// anything already terminal.
pub struct Reconciler {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    stale_after: Duration,
    batch_limit: usize,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        stale_after: Duration,
        batch_limit: usize,
    ) -> Self {
        Self {
            store,
            queue,
            stale_after,
            batch_limit,
        }
    }

    /// Returns how many jobs were re-enqueued.
    pub async fn sweep_once(&self) -> Result<usize, ReconcileError> {
        let stale_after = chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(stale_after)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let stale = self.store.list_stale_pending(cutoff, self.batch_limit).await?;
        let mut requeued = Vec::with_capacity(stale.len());
        let mut enqueue_error = None;
        for job in &stale {
            match self.queue.enqueue(&QueueMessage::for_job(job.id)).await {
                Ok(()) => {
                    tracing::info!(job_id = %job.id, created_at = %job.created_at, "Re-enqueued stale pending job");
                    requeued.push(job.id);
                }
                Err(e) => {
                    enqueue_error = Some(e);
                    break;
                }
            }
        }

        // Restarts the staleness clock so the next sweep skips these jobs
        if !requeued.is_empty() {
            if let Err(e) = self.store.touch_pending(&requeued, Utc::now()).await {
                tracing::warn!(
                    count = requeued.len(),
                    error = %e,
                    "Could not record re-enqueue, jobs may be requeued again"
                );
            }
        }

        metrics::counter!("prediction_jobs_reconciled_total").increment(requeued.len() as u64);
        match enqueue_error {
            Some(e) => Err(e.into()),
            None => Ok(requeued.len()),
        }
    }

    /// Sweep every `interval` until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(0) => tracing::debug!("No stale pending jobs"),
                        Ok(count) => tracing::info!(count, "Reconciliation sweep re-enqueued jobs"),
                        Err(e) => tracing::error!(error = %e, "Reconciliation sweep failed"),
                    }
                }
            }
        }

        tracing::info!("Reconciler stopped");
    }
}
