use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::sleep;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::models::job::Job;
use crate::models::prediction::Features;
use crate::services::predictor::{PredictionError, Predictor};
use crate::services::queue::{Delivery, QueueError, WorkQueue};
use crate::services::store::JobStore;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Messages requested per receive
    pub batch_size: usize,
    pub batch_window: Duration,
    /// Lease length of received messages; batches slower than this risk
    /// being redelivered while still running
    pub visibility_timeout: Duration,
    /// Immediate retries for ids that fail to persist
    pub persist_retries: u32,
    pub persist_retry_backoff: Duration,
    /// Pause after a systemic error before the next receive
    pub error_backoff: Duration,
    /// Write `InProgress` before predicting
    pub mark_in_progress: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_window: Duration::from_secs(2),
            visibility_timeout: Duration::from_secs(30),
            persist_retries: 2,
            persist_retry_backoff: Duration::from_millis(50),
            error_backoff: Duration::from_secs(1),
            mark_in_progress: false,
        }
    }
}

impl From<&AppConfig> for WorkerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            batch_size: config.worker_batch_size,
            batch_window: config.batch_window(),
            visibility_timeout: config.visibility_timeout(),
            persist_retries: config.persist_retries,
            persist_retry_backoff: Duration::from_millis(config.persist_retry_backoff_ms),
            error_backoff: Duration::from_millis(config.error_backoff_ms),
            mark_in_progress: config.mark_in_progress,
        }
    }
}

/// What happened to one batch. Counts are per unique job unless noted.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    /// Messages received, duplicates included
    pub received: usize,
    pub unique_jobs: usize,
    pub completed: usize,
    pub failed: usize,
    /// Already `Done`/`Failed` on arrival
    pub skipped_terminal: usize,
    /// Referenced by the queue but absent from the store
    pub missing: usize,
    /// Could not be read from the store
    pub unprocessed: usize,
    /// Processed but not durably written
    pub unpersisted: usize,
    /// Messages acknowledged, duplicates included
    pub acknowledged: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("job store unavailable: none of {0} jobs could be read")]
    StoreUnavailable(usize),
}

/// Drains queue batches, resolves their jobs and persists the outcomes.
///
/// A message is acknowledged only once its job is durably terminal. Anything
/// else (missing record, failed read, failed write) stays leased and comes
/// back after the visibility timeout.
pub struct BatchWorker {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    predictor: Arc<dyn Predictor>,
    config: WorkerConfig,
}

impl BatchWorker {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        predictor: Arc<dyn Predictor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            predictor,
            config,
        }
    }

    /// Receive one batch and process it. An empty receive yields an empty report.
    /// Also refreshes the queue depth gauge.
    pub async fn run_once(&self) -> Result<BatchReport, WorkerError> {
        let deliveries = self
            .queue
            .receive_batch(self.config.batch_size, self.config.batch_window)
            .await?;

        match self.queue.depth().await {
            Ok(depth) => metrics::gauge!("prediction_queue_depth").set(depth as f64),
            Err(e) => tracing::debug!(error = %e, "Could not read queue depth"),
        }

        self.process_batch(deliveries).await
    }

    pub async fn process_batch(&self, deliveries: Vec<Delivery>) -> Result<BatchReport, WorkerError> {
        if deliveries.is_empty() {
            return Ok(BatchReport::default());
        }

        let started = Instant::now();
        let mut report = BatchReport {
            received: deliveries.len(),
            ..BatchReport::default()
        };

        let mut by_job: HashMap<Uuid, Vec<Delivery>> = HashMap::new();
        for delivery in deliveries {
            by_job.entry(delivery.job_id()).or_default().push(delivery);
        }
        report.unique_jobs = by_job.len();
        let ids: Vec<Uuid> = by_job.keys().copied().collect();

        tracing::debug!(
            received = report.received,
            unique_jobs = report.unique_jobs,
            "Processing batch"
        );

        let fetched = self.store.batch_get(&ids).await;
        if fetched.found.is_empty() && fetched.missing.is_empty() {
            return Err(WorkerError::StoreUnavailable(ids.len()));
        }

        for id in &fetched.missing {
            tracing::warn!(job_id = %id, "Queued job has no stored record, leaving message unacknowledged");
        }
        for id in &fetched.unprocessed {
            tracing::warn!(job_id = %id, "Job could not be read, will retry on redelivery");
        }
        report.missing = fetched.missing.len();
        report.unprocessed = fetched.unprocessed.len();

        let mut settled: Vec<Uuid> = Vec::new();
        let mut runnable: Vec<Job> = Vec::new();
        for (id, job) in fetched.found {
            if job.is_terminal() {
                tracing::debug!(job_id = %id, status = %job.status(), "Job already finalized, skipping");
                report.skipped_terminal += 1;
                settled.push(id);
            } else {
                runnable.push(job);
            }
        }

        if self.config.mark_in_progress && !runnable.is_empty() {
            runnable = self.mark_in_progress(runnable, &mut report).await;
        }

        let updates: Vec<Job> = runnable.iter().filter_map(|job| self.evaluate(job)).collect();
        let unpersisted = self.persist(&updates).await;

        for job in &updates {
            if unpersisted.contains(&job.id) {
                tracing::error!(job_id = %job.id, "Job result not persisted, leaving message for redelivery");
                report.unpersisted += 1;
                continue;
            }
            match job.state.result() {
                Some(_) => report.completed += 1,
                None => report.failed += 1,
            }
            settled.push(job.id);
        }

        let to_ack: Vec<Delivery> = settled
            .iter()
            .filter_map(|id| by_job.remove(id))
            .flatten()
            .collect();
        self.queue.ack(&to_ack).await?;
        report.acknowledged = to_ack.len();

        let elapsed = started.elapsed();
        metrics::histogram!("prediction_batch_seconds").record(elapsed.as_secs_f64());
        metrics::counter!("prediction_jobs_completed_total").increment(report.completed as u64);
        metrics::counter!("prediction_jobs_failed_total").increment(report.failed as u64);
        metrics::counter!("prediction_jobs_unpersisted_total").increment(report.unpersisted as u64);

        if elapsed >= self.config.visibility_timeout {
            tracing::warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                visibility_timeout_ms = self.config.visibility_timeout.as_millis() as u64,
                "Batch outlived the visibility timeout, messages may be redelivered"
            );
        }

        Ok(report)
    }

    /// Compute the terminal record for a non-terminal job.
    fn evaluate(&self, job: &Job) -> Option<Job> {
        let outcome = Features::from_payload(&job.params)
            .map_err(|e| format!("invalid params: {e}"))
            .and_then(|features| {
                self.predictor
                    .predict(&features)
                    .and_then(|price| {
                        if price.is_finite() {
                            Ok(price)
                        } else {
                            Err(PredictionError::NonFinite(price))
                        }
                    })
                    .map_err(|e| format!("prediction failed: {e}"))
            });

        let next = match outcome {
            Ok(result) => job.complete(result),
            Err(error) => {
                tracing::warn!(job_id = %job.id, error = %error, "Prediction failed");
                job.fail(error)
            }
        };

        match next {
            Ok(job) => Some(job),
            Err(e) => {
                tracing::error!(error = %e, "Unexpected transition from terminal state");
                None
            }
        }
    }

    /// Persist `InProgress` markers; jobs whose marker cannot be written sit
    /// out this round.
    async fn mark_in_progress(&self, jobs: Vec<Job>, report: &mut BatchReport) -> Vec<Job> {
        let marked: Vec<Job> = jobs
            .iter()
            .filter_map(|job| job.mark_in_progress().ok())
            .collect();
        let failed = self.persist(&marked).await;
        report.unpersisted += failed.len();

        marked
            .into_iter()
            .filter(|job| !failed.contains(&job.id))
            .collect()
    }

    /// `batch_put` with bounded immediate retries of the failed subset.
    /// Returns the ids that never made it.
    async fn persist(&self, jobs: &[Job]) -> HashSet<Uuid> {
        if jobs.is_empty() {
            return HashSet::new();
        }

        let mut remaining: Vec<Job> = jobs.to_vec();
        let mut attempt = 0;
        loop {
            let failed = self.store.batch_put(&remaining).await;
            if failed.is_empty() || attempt >= self.config.persist_retries {
                return failed;
            }

            attempt += 1;
            tracing::warn!(failed = failed.len(), attempt, "Retrying failed job writes");
            remaining.retain(|job| failed.contains(&job.id));
            sleep(self.config.persist_retry_backoff * attempt).await;
        }
    }

    /// Process batches until `shutdown` flips to true or its sender is dropped.
    /// A batch in flight at shutdown is abandoned without acknowledgement.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            batch_size = self.config.batch_size,
            batch_window_ms = self.config.batch_window.as_millis() as u64,
            "Batch worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                result = self.run_once() => match result {
                    Ok(report) if report.received > 0 => {
                        tracing::info!(
                            received = report.received,
                            completed = report.completed,
                            failed = report.failed,
                            skipped = report.skipped_terminal,
                            missing = report.missing,
                            unpersisted = report.unpersisted,
                            acknowledged = report.acknowledged,
                            "Batch processed"
                        );
                    }
                    Ok(_) => tracing::trace!("No messages available"),
                    Err(e) => {
                        tracing::error!(error = %e, "Batch attempt failed, will retry");
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = sleep(self.config.error_backoff) => {}
                        }
                    }
                }
            }
        }

        tracing::info!("Batch worker stopped");
    }
}
