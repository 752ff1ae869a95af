use std::sync::Arc;
use uuid::Uuid;

use crate::models::job::Job;
use crate::models::prediction::{Features, ValidationError};
use crate::services::queue::{QueueError, QueueMessage, WorkQueue};
use crate::services::store::{JobStore, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to persist job: {0}")]
    Storage(#[from] StorageError),

    /// The job record exists as `Pending` but no message references it; only
    /// the reconciliation sweep will pick it up.
    #[error("job {job_id} persisted but could not be enqueued: {source}")]
    Enqueue {
        job_id: Uuid,
        #[source]
        source: QueueError,
    },
}

/// Accepts prediction requests: persists a `Pending` job, then enqueues a
/// reference to it. Never waits for processing.
pub struct IntakeService {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
}

impl IntakeService {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn WorkQueue>) -> Self {
        Self { store, queue }
    }

    pub async fn submit(&self, payload: serde_json::Value) -> Result<Uuid, IntakeError> {
        let features = Features::from_payload(&payload)?;

        // Store the normalized form so the worker never sees client extras.
        let params = serde_json::to_value(&features).map_err(ValidationError::from)?;
        let job = Job::new_pending(params);

        self.store.put(&job).await?;

        if let Err(source) = self.queue.enqueue(&QueueMessage::for_job(job.id)).await {
            tracing::error!(
                job_id = %job.id,
                error = %source,
                "Job persisted as Pending but enqueue failed"
            );
            metrics::counter!("prediction_jobs_enqueue_failed_total").increment(1);
            return Err(IntakeError::Enqueue {
                job_id: job.id,
                source,
            });
        }

        metrics::counter!("prediction_jobs_submitted_total").increment(1);
        tracing::info!(job_id = %job.id, "Prediction job submitted");
        Ok(job.id)
    }
}
