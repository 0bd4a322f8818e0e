use crate::feed::connection::run_feed_connection;
use crate::feed::engine::{ApplyOutcome, ComparisonEngine, FeedEffect, FeedEvent};
use crate::feed::types::{ComparisonConfig, FeedSource};
use crate::feed::wire::NoOpReason;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub const FEED_EVENT_QUEUE_CAPACITY: usize = 1_024;

/// Runs both feed connections and the single consumer until `cancel_token` fires.
pub async fn run_comparison_stream(
    config: ComparisonConfig,
    engine: ComparisonEngine,
    cancel_token: CancellationToken,
) {
    let (event_sender, event_receiver) = mpsc::channel(FEED_EVENT_QUEUE_CAPACITY);

    let consumer_handle = tokio::spawn(consume_feed_events(
        engine,
        event_receiver,
        cancel_token.clone(),
    ));

    let connection_handles: Vec<_> = FeedSource::ALL
        .into_iter()
        .map(|source| {
            tokio::spawn(run_feed_connection(
                source,
                config.clone(),
                event_sender.clone(),
                cancel_token.clone(),
            ))
        })
        .collect();
    drop(event_sender);

    for handle in connection_handles {
        if let Err(error) = handle.await {
            warn!(%error, "feed connection task failed");
        }
    }
    if let Err(error) = consumer_handle.await {
        warn!(%error, "feed consumer task failed");
    }
}

/// Applies events one at a time; nothing is applied once the session is cancelled.
pub async fn consume_feed_events(
    engine: ComparisonEngine,
    mut events: mpsc::Receiver<FeedEvent>,
    cancel_token: CancellationToken,
) {
    loop {
        let next_event = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            next_event = events.recv() => next_event,
        };
        let Some(event) = next_event else {
            break;
        };
        if cancel_token.is_cancelled() {
            break;
        }

        let outcome = engine.apply(event, now_unix_ms());
        log_outcome(&outcome);
    }
}

fn log_outcome(outcome: &ApplyOutcome) {
    let source = outcome.source;
    match &outcome.effect {
        FeedEffect::Connection(state) => debug!(%source, ?state, "connection state changed"),
        FeedEffect::Acknowledged { subscription } => {
            info!(%source, ?subscription, "subscription confirmed")
        }
        FeedEffect::Accepted {
            number,
            child_index,
            synthesized,
        } => debug!(%source, number, ?child_index, synthesized, "block recorded"),
        FeedEffect::Replaced {
            number,
            child_index,
        } => debug!(%source, number, ?child_index, "synthesized block superseded"),
        FeedEffect::Duplicate {
            number,
            child_index,
        } => trace!(%source, number, ?child_index, "duplicate block skipped"),
        FeedEffect::Ignored(NoOpReason::RpcError(message)) => {
            warn!(%source, %message, "feed returned rpc error")
        }
        FeedEffect::Ignored(reason) => trace!(%source, ?reason, "frame ignored"),
    }

    if let Some(winner) = outcome.race_decided {
        info!(?winner, "race decided");
    }
}

pub fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message;

    #[tokio::test]
    async fn consumer_applies_events_in_order() {
        let engine = ComparisonEngine::new(ComparisonConfig::default());
        let (sender, receiver) = mpsc::channel(8);
        let cancel_token = CancellationToken::new();
        let consumer = tokio::spawn(consume_feed_events(
            engine.clone(),
            receiver,
            cancel_token.clone(),
        ));

        let source = FeedSource::Reference;
        sender
            .send(FeedEvent::Opened { source })
            .await
            .expect("send opened");
        sender
            .send(FeedEvent::Frame {
                source,
                payload: r#"{"result":"0x1"}"#.to_string(),
            })
            .await
            .expect("send ack");
        sender
            .send(FeedEvent::Frame {
                source,
                payload: r#"{"params":{"result":{"number":"0xa"}}}"#.to_string(),
            })
            .await
            .expect("send block");
        drop(sender);
        consumer.await.expect("consumer should finish");

        let snapshot = engine.snapshot();
        assert!(snapshot.reference.connection.connected);
        assert_eq!(snapshot.reference.message_count, 2);
        assert_eq!(snapshot.reference.total_blocks, 1);
        assert_eq!(snapshot.reference.blocks[0].number, 10);
    }

    #[tokio::test]
    async fn consumer_stops_applying_after_cancel() {
        let engine = ComparisonEngine::new(ComparisonConfig::default());
        let (sender, receiver) = mpsc::channel(8);
        let cancel_token = CancellationToken::new();
        cancel_token.cancel();

        sender
            .send(FeedEvent::Frame {
                source: FeedSource::Fast,
                payload: String::new(),
            })
            .await
            .expect("send frame");
        consume_feed_events(engine.clone(), receiver, cancel_token).await;

        assert_eq!(engine.snapshot().fast.message_count, 0);
    }

    #[tokio::test]
    async fn stream_races_two_local_feeds() {
        let fast_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fast");
        let reference_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind reference");
        let fast_address = fast_listener.local_addr().expect("fast address");
        let reference_address = reference_listener.local_addr().expect("reference address");

        let fast_server = tokio::spawn(async move {
            let (tcp, _) = fast_listener.accept().await.expect("fast client");
            let mut websocket = accept_async(tcp).await.expect("fast handshake");
            for index in 0..3 {
                let payload = format!(r#"{{"index":{index},"metadata":{{"block_number":100}}}}"#);
                websocket
                    .send(Message::Text(payload))
                    .await
                    .expect("fast frame");
            }
            while let Some(Ok(_)) = websocket.next().await {}
        });

        let reference_server = tokio::spawn(async move {
            let (tcp, _) = reference_listener.accept().await.expect("reference client");
            let mut websocket = accept_async(tcp).await.expect("reference handshake");
            while let Some(Ok(message)) = websocket.next().await {
                if message.is_text() {
                    break;
                }
            }
            websocket
                .send(Message::Text(r#"{"result":"0xsub"}"#.to_string()))
                .await
                .expect("ack");
            websocket
                .send(Message::Text(
                    r#"{"params":{"result":{"number":"0x64"}}}"#.to_string(),
                ))
                .await
                .expect("block");
            while let Some(Ok(_)) = websocket.next().await {}
        });

        let config = ComparisonConfig {
            fast_feed_url: format!("ws://{fast_address}"),
            reference_feed_url: format!("ws://{reference_address}"),
            race_target: 3,
            subscribe_delay_ms: 10,
            ..ComparisonConfig::default()
        };
        let engine = ComparisonEngine::new(config.clone());
        let cancel_token = CancellationToken::new();
        let stream = tokio::spawn(run_comparison_stream(
            config,
            engine.clone(),
            cancel_token.clone(),
        ));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let snapshot = engine.snapshot();
            if snapshot.fast.total_blocks == 3 && snapshot.reference.total_blocks == 1 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "feeds did not deliver in time"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        cancel_token.cancel();
        stream.await.expect("stream should stop");
        fast_server.await.expect("fast server should stop");
        reference_server.await.expect("reference server should stop");

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.fast.message_count, 3);
        assert_eq!(snapshot.reference.message_count, 2);
        assert_eq!(snapshot.throughput_ratio, Some(3.0));
        assert_eq!(snapshot.stats.total, 1);
        assert_eq!(snapshot.race.winner, Some(crate::feed::types::RaceWinner::Fast));
        assert_eq!(snapshot.merged.len(), 1);
        assert_eq!(snapshot.merged[0].sources().len(), 2);
    }
}
