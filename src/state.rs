use crate::feed::engine::ComparisonEngine;
use crate::feed::types::ComparisonConfig;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct ComparisonStreamHandle {
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
}

pub struct AppState {
    pub started_at: Instant,
    pub engine: ComparisonEngine,
    pub comparison_stream: Mutex<Option<ComparisonStreamHandle>>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            engine: ComparisonEngine::new(ComparisonConfig::default()),
            comparison_stream: Mutex::new(None),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
