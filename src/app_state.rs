use std::sync::Arc;

use crate::services::{
    intake::IntakeService,
    queue::WorkQueue,
    status::StatusService,
    store::JobStore,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub intake: Arc<IntakeService>,
    pub status: Arc<StatusService>,
}

impl AppState {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn WorkQueue>) -> Self {
        Self {
            intake: Arc::new(IntakeService::new(store.clone(), queue.clone())),
            status: Arc::new(StatusService::new(store.clone())),
            store,
            queue,
        }
    }
}
