use crate::error::AppError;
use crate::feed::engine::FeedEvent;
use crate::feed::pipeline::{now_unix_ms, run_comparison_stream};
use crate::feed::types::{
    ComparisonSession, ComparisonSnapshot, ComparisonStopResult, FeedSource, StartComparisonArgs,
};
use crate::state::{AppState, ComparisonStreamHandle};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Starts a fresh session, replacing any stream that is already running.
pub async fn start_comparison_stream(
    state: &AppState,
    args: Option<StartComparisonArgs>,
) -> Result<ComparisonSession, AppError> {
    let config = args.unwrap_or_default().normalize()?;

    let existing_handle = {
        let mut stream_slot = state.comparison_stream.lock().await;
        stream_slot.take()
    };
    if let Some(handle) = existing_handle {
        handle.cancellation_token.cancel();
        let _ = handle.join_handle.await;
    }

    state.engine.reset(config.clone());

    let cancellation_token = CancellationToken::new();
    let task_token = cancellation_token.clone();
    let runtime_config = config.clone();
    let engine = state.engine.clone();

    let join_handle = tokio::spawn(async move {
        run_comparison_stream(runtime_config, engine, task_token).await;
    });

    {
        let mut stream_slot = state.comparison_stream.lock().await;
        *stream_slot = Some(ComparisonStreamHandle {
            cancellation_token,
            join_handle,
        });
    }

    info!(
        fast = %config.fast_feed_url,
        reference = %config.reference_feed_url,
        "comparison stream started"
    );
    Ok(ComparisonSession::from_config(&config))
}

pub async fn stop_comparison_stream(state: &AppState) -> Result<ComparisonStopResult, AppError> {
    let existing_handle = {
        let mut stream_slot = state.comparison_stream.lock().await;
        stream_slot.take()
    };

    let Some(handle) = existing_handle else {
        mark_stopped(state);
        return Ok(ComparisonStopResult { stopped: false });
    };

    for source in FeedSource::ALL {
        state
            .engine
            .apply(FeedEvent::Closing { source }, now_unix_ms());
    }
    handle.cancellation_token.cancel();
    let joined = handle.join_handle.await;
    mark_stopped(state);
    joined?;

    info!("comparison stream stopped");
    Ok(ComparisonStopResult { stopped: true })
}

fn mark_stopped(state: &AppState) {
    for source in FeedSource::ALL {
        state
            .engine
            .apply(FeedEvent::Stopped { source }, now_unix_ms());
    }
}

pub async fn comparison_snapshot(state: &AppState) -> Result<ComparisonSnapshot, AppError> {
    Ok(state.engine.snapshot())
}
