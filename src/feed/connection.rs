use crate::error::AppError;
use crate::feed::engine::FeedEvent;
use crate::feed::types::{ComparisonConfig, FeedSource};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub const SUBSCRIBE_NEW_HEADS_REQUEST: &str =
    r#"{"jsonrpc":"2.0","id":1,"method":"eth_subscribe","params":["newHeads"]}"#;

pub type FeedWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum SessionEnd {
    Disconnected,
    Cancelled,
    ChannelClosed,
}

pub async fn connect_feed_stream(url: &str) -> Result<FeedWsStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(64 << 20),
        max_frame_size: Some(16 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(url, Some(ws_config), false).await?;
    Ok(stream)
}

/// Lossy so that compressed or otherwise non-UTF-8 frames still reach the parser.
pub fn decode_binary_frame(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}

async fn emit(events: &mpsc::Sender<FeedEvent>, event: FeedEvent) -> bool {
    events.send(event).await.is_ok()
}

/// Keeps one feed connected until cancelled or out of reconnect budget.
///
/// The budget counts consecutive failed sessions and resets on every
/// successful open; `attempt` in the emitted events counts every reconnect.
pub async fn run_feed_connection(
    source: FeedSource,
    config: ComparisonConfig,
    events: mpsc::Sender<FeedEvent>,
    cancel_token: CancellationToken,
) {
    let url = config.feed_url(source).to_string();
    let retry_delay = Duration::from_millis(config.reconnect_interval_ms);
    let mut consecutive_failures = 0_u32;
    let mut reconnect_attempt = 0_u32;

    while !cancel_token.is_cancelled() {
        info!(%source, %url, attempt = reconnect_attempt, "connecting feed");
        if !emit(
            &events,
            FeedEvent::Connecting {
                source,
                attempt: reconnect_attempt,
            },
        )
        .await
        {
            return;
        }

        let connect_result = tokio::select! {
            _ = cancel_token.cancelled() => break,
            result = connect_feed_stream(&url) => result,
        };

        match connect_result {
            Ok(websocket_stream) => {
                consecutive_failures = 0;
                info!(%source, "feed connected");
                if !emit(&events, FeedEvent::Opened { source }).await {
                    return;
                }

                match drive_session(source, &config, websocket_stream, &events, &cancel_token)
                    .await
                {
                    SessionEnd::Disconnected => {}
                    SessionEnd::Cancelled => break,
                    SessionEnd::ChannelClosed => return,
                }
            }
            Err(error) => {
                warn!(%source, %error, "feed connect failed");
                if !emit(
                    &events,
                    FeedEvent::Errored {
                        source,
                        message: error.to_string(),
                    },
                )
                .await
                {
                    return;
                }
            }
        }

        if cancel_token.is_cancelled() {
            break;
        }

        if consecutive_failures >= config.max_reconnect_attempts {
            warn!(%source, attempts = reconnect_attempt, "feed reconnect budget exhausted");
            let _ = emit(
                &events,
                FeedEvent::RetriesExhausted {
                    source,
                    attempts: reconnect_attempt,
                },
            )
            .await;
            break;
        }

        consecutive_failures = consecutive_failures.saturating_add(1);
        reconnect_attempt = reconnect_attempt.saturating_add(1);
        if !emit(
            &events,
            FeedEvent::ReconnectScheduled {
                source,
                attempt: reconnect_attempt,
                delay_ms: config.reconnect_interval_ms,
            },
        )
        .await
        {
            return;
        }

        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = tokio::time::sleep(retry_delay) => {}
        }
    }

    debug!(%source, "feed connection stopped");
    let _ = emit(&events, FeedEvent::Stopped { source }).await;
}

async fn drive_session(
    source: FeedSource,
    config: &ComparisonConfig,
    websocket_stream: FeedWsStream,
    events: &mpsc::Sender<FeedEvent>,
    cancel_token: &CancellationToken,
) -> SessionEnd {
    let (mut sink, mut reader) = websocket_stream.split();

    // Sending right after the handshake was unreliable upstream; give it a moment.
    let subscribe_timer = tokio::time::sleep(Duration::from_millis(config.subscribe_delay_ms));
    tokio::pin!(subscribe_timer);
    let mut subscribe_pending = source.needs_subscription();

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return SessionEnd::Cancelled;
            }
            _ = &mut subscribe_timer, if subscribe_pending => {
                subscribe_pending = false;
                let event = match sink
                    .send(Message::Text(SUBSCRIBE_NEW_HEADS_REQUEST.to_string()))
                    .await
                {
                    Ok(()) => {
                        info!(%source, "sent newHeads subscription");
                        FeedEvent::SubscriptionSent { source }
                    }
                    Err(error) => {
                        warn!(%source, %error, "failed to send newHeads subscription");
                        FeedEvent::SubscriptionFailed {
                            source,
                            reason: error.to_string(),
                        }
                    }
                };
                if !emit(events, event).await {
                    return SessionEnd::ChannelClosed;
                }
            }
            next_message = reader.next() => {
                let Some(frame_result) = next_message else {
                    warn!(%source, "feed stream ended");
                    let closed = FeedEvent::Closed {
                        source,
                        code: None,
                        reason: "stream ended".to_string(),
                    };
                    return if emit(events, closed).await {
                        SessionEnd::Disconnected
                    } else {
                        SessionEnd::ChannelClosed
                    };
                };

                let event = match frame_result {
                    Ok(Message::Text(text_payload)) => FeedEvent::Frame {
                        source,
                        payload: text_payload,
                    },
                    Ok(Message::Binary(binary_payload)) => FeedEvent::Frame {
                        source,
                        payload: decode_binary_frame(&binary_payload),
                    },
                    Ok(Message::Close(close_frame)) => {
                        let (code, reason) = close_frame
                            .map(|frame| (Some(u16::from(frame.code)), frame.reason.into_owned()))
                            .unwrap_or((None, String::new()));
                        warn!(%source, ?code, %reason, "feed closed by peer");
                        let closed = FeedEvent::Closed { source, code, reason };
                        return if emit(events, closed).await {
                            SessionEnd::Disconnected
                        } else {
                            SessionEnd::ChannelClosed
                        };
                    }
                    Ok(_) => continue,
                    Err(error) => {
                        warn!(%source, %error, "feed frame error");
                        let errored = FeedEvent::Errored {
                            source,
                            message: error.to_string(),
                        };
                        return if emit(events, errored).await {
                            SessionEnd::Disconnected
                        } else {
                            SessionEnd::ChannelClosed
                        };
                    }
                };

                trace!(%source, "feed frame received");
                if !emit(events, event).await {
                    return SessionEnd::ChannelClosed;
                }
            }
        }
    }
}
