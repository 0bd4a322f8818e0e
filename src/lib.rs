pub mod commands;
pub mod error;
pub mod feed;
pub mod state;

use commands::{
    comparison_stream::{comparison_snapshot, start_comparison_stream, stop_comparison_stream},
    health::health,
};
use error::AppError;
use feed::reconcile::{format_percent, format_ratio};
use feed::types::{ComparisonSnapshot, StartComparisonArgs};
use state::AppState;
use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::info;

/// Runs a session and logs a summary every `report_interval` until `shutdown` resolves.
pub async fn run<F>(
    args: StartComparisonArgs,
    report_interval: Duration,
    shutdown: F,
) -> Result<ComparisonSnapshot, AppError>
where
    F: Future<Output = ()>,
{
    let state = AppState::new();
    let session = start_comparison_stream(&state, Some(args)).await?;
    info!(
        race_target = session.race_target,
        history_capacity = session.history_capacity,
        synthesis = session.synthesis_mode.as_str(),
        "block race running"
    );

    let mut ticker = tokio::time::interval(report_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let snapshot = comparison_snapshot(&state).await?;
                let health = health(&state).await?;
                log_summary(&snapshot, health.status);
            }
        }
    }

    stop_comparison_stream(&state).await?;
    let snapshot = comparison_snapshot(&state).await?;
    log_summary(&snapshot, "stopped");
    Ok(snapshot)
}

fn log_summary(snapshot: &ComparisonSnapshot, status: &str) {
    let latest = |blocks: &[feed::types::CanonicalBlock]| blocks.first().map(|block| block.number);
    info!(
        status,
        fast_state = ?snapshot.fast.connection.state,
        reference_state = ?snapshot.reference.connection.state,
        fast_messages = snapshot.fast.message_count,
        reference_messages = snapshot.reference.message_count,
        fast_latest = ?latest(&snapshot.fast.blocks),
        reference_latest = ?latest(&snapshot.reference.blocks),
        compared = snapshot.stats.total,
        fast_faster = %format_percent(snapshot.stats.fast_faster_pct),
        reference_faster = %format_percent(snapshot.stats.reference_faster_pct),
        simultaneous = %format_percent(snapshot.stats.simultaneous_pct),
        throughput = %format_ratio(snapshot.throughput_ratio),
        race_winner = ?snapshot.race.winner,
        "race status"
    );

    for (source, connection) in [
        ("fast", &snapshot.fast.connection),
        ("reference", &snapshot.reference.connection),
    ] {
        if let (false, Some(last_error)) = (connection.connected, &connection.last_error) {
            info!(source, attempts = connection.attempts, %last_error, "feed disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_stops_on_shutdown_signal() {
        let args = StartComparisonArgs {
            fast_feed_url: Some("ws://127.0.0.1:9".to_string()),
            reference_feed_url: Some("ws://127.0.0.1:9".to_string()),
            max_reconnect_attempts: Some(0),
            ..Default::default()
        };

        let snapshot = run(
            args,
            Duration::from_millis(10),
            tokio::time::sleep(Duration::from_millis(50)),
        )
        .await
        .expect("run should stop cleanly");

        assert!(!snapshot.fast.connection.connected);
        assert!(!snapshot.reference.connection.connected);
        assert_eq!(snapshot.race.winner, None);
    }
}
