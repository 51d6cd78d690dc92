use std::sync::Arc;

use crate::services::{
    pipeline::PipelineOrchestrator, queue::MessageQueue, status::JobStateTracker,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub status: Arc<dyn JobStateTracker>,
    pub queue: Arc<dyn MessageQueue>,
    /// Jobs `/stats` aggregates over.
    pub stats_sample_limit: i64,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<PipelineOrchestrator>,
        queue: Arc<dyn MessageQueue>,
        stats_sample_limit: i64,
    ) -> Self {
        Self {
            status: orchestrator.status_tracker().clone(),
            orchestrator,
            queue,
            stats_sample_limit,
        }
    }
}
