use crate::error::AppError;
use crate::feed::engine::ComparisonEngine;
use crate::feed::types::FeedSource;
use crate::state::AppState;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub fast_connected: bool,
    pub reference_connected: bool,
}

pub fn build_health_response(started_at: Instant, engine: &ComparisonEngine) -> HealthResponse {
    let fast_connected = engine.is_connected(FeedSource::Fast);
    let reference_connected = engine.is_connected(FeedSource::Reference);
    let status = if fast_connected && reference_connected {
        "ok"
    } else {
        "degraded"
    };

    HealthResponse {
        status,
        uptime_ms: started_at.elapsed().as_millis(),
        fast_connected,
        reference_connected,
    }
}

pub async fn health(state: &AppState) -> Result<HealthResponse, AppError> {
    Ok(build_health_response(state.started_at, &state.engine))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::engine::FeedEvent;
    use crate::feed::types::ComparisonConfig;

    #[test]
    fn reports_degraded_until_both_feeds_open() {
        let engine = ComparisonEngine::new(ComparisonConfig::default());
        let response = build_health_response(Instant::now(), &engine);
        assert_eq!(response.status, "degraded");
        assert!(!response.fast_connected);

        for source in FeedSource::ALL {
            engine.apply(FeedEvent::Opened { source }, 0);
        }
        let response = build_health_response(Instant::now(), &engine);
        assert_eq!(response.status, "ok");
        assert!(response.reference_connected);
        assert!(response.uptime_ms <= 1_000);
    }

    #[tokio::test]
    async fn health_reads_app_state() {
        let state = AppState::new();
        let response = health(&state).await.expect("health should respond");
        assert_eq!(response.status, "degraded");
    }
}
