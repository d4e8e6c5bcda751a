//! Shared application state threaded through every handler and
//! background task via `axum::extract::State`.

use std::sync::Arc;

use crate::artifact::ArtifactStore;
use crate::assignment::AssignmentService;
use crate::config::Config;
use crate::queue::QueueManager;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub queue: Arc<QueueManager>,
    pub assignment: Arc<AssignmentService>,
    pub config: Arc<Config>,
    pub stats_cache: Arc<crate::http::stats::StatsCache>,
}

impl AppState {
    pub fn new(
        store: Store,
        artifacts: Arc<dyn ArtifactStore>,
        queue: Arc<QueueManager>,
        config: Arc<Config>,
    ) -> Self {
        let assignment = Arc::new(AssignmentService::new(store.clone()));
        Self {
            store,
            artifacts,
            queue,
            assignment,
            config,
            stats_cache: Arc::new(crate::http::stats::StatsCache::new()),
        }
    }
}
