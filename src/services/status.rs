use std::sync::Arc;
use uuid::Uuid;

use crate::models::job::Job;
use crate::services::store::{JobStore, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("failed to read job: {0}")]
    Storage(#[from] StorageError),
}

/// Read-only view of job progress for polling clients.
pub struct StatusService {
    store: Arc<dyn JobStore>,
}

impl StatusService {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn get_status(&self, id: Uuid) -> Result<Job, StatusError> {
        self.store.get(id).await?.ok_or(StatusError::NotFound(id))
    }
}
