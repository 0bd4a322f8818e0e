use crate::feed::history::{BlockHistory, InsertOutcome};
use crate::feed::normalize::{normalize, synthesize};
use crate::feed::reconcile::{merged_view, throughput_ratio, timing_stats, BlockTimings, RaceTracker};
use crate::feed::types::{
    CanonicalBlock, ComparisonConfig, ComparisonSnapshot, ConnectionSnapshot, ConnectionState,
    FeedSnapshot, FeedSource, RaceWinner,
};
use crate::feed::wire::{parse_payload, NoOpReason, ParsedPayload};
use parking_lot::Mutex;
use std::sync::Arc;

/// Everything a connection task reports. Applied in arrival order by one reducer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    Connecting { source: FeedSource, attempt: u32 },
    Opened { source: FeedSource },
    Frame { source: FeedSource, payload: String },
    SubscriptionSent { source: FeedSource },
    SubscriptionFailed { source: FeedSource, reason: String },
    Closing { source: FeedSource },
    Closed { source: FeedSource, code: Option<u16>, reason: String },
    Errored { source: FeedSource, message: String },
    ReconnectScheduled { source: FeedSource, attempt: u32, delay_ms: u64 },
    RetriesExhausted { source: FeedSource, attempts: u32 },
    Stopped { source: FeedSource },
}

impl FeedEvent {
    pub fn source(&self) -> FeedSource {
        match self {
            Self::Connecting { source, .. }
            | Self::Opened { source }
            | Self::Frame { source, .. }
            | Self::SubscriptionSent { source }
            | Self::SubscriptionFailed { source, .. }
            | Self::Closing { source }
            | Self::Closed { source, .. }
            | Self::Errored { source, .. }
            | Self::ReconnectScheduled { source, .. }
            | Self::RetriesExhausted { source, .. }
            | Self::Stopped { source } => *source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEffect {
    Connection(ConnectionState),
    Acknowledged {
        subscription: Option<String>,
    },
    Accepted {
        number: u64,
        child_index: Option<u32>,
        synthesized: bool,
    },
    /// Decoded record that superseded a synthesized one with the same key.
    Replaced {
        number: u64,
        child_index: Option<u32>,
    },
    Duplicate {
        number: u64,
        child_index: Option<u32>,
    },
    Ignored(NoOpReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub source: FeedSource,
    pub effect: FeedEffect,
    pub race_decided: Option<RaceWinner>,
}

#[derive(Debug, Clone)]
struct FeedState {
    source: FeedSource,
    connection: ConnectionSnapshot,
    message_count: u64,
    history: BlockHistory,
}

impl FeedState {
    fn new(source: FeedSource, capacity: usize) -> Self {
        Self {
            source,
            connection: ConnectionSnapshot::default(),
            message_count: 0,
            history: BlockHistory::new(capacity),
        }
    }

    fn snapshot(&self) -> FeedSnapshot {
        FeedSnapshot {
            source: self.source,
            connection: self.connection.clone(),
            message_count: self.message_count,
            total_blocks: self.history.total_seen(),
            blocks: self.history.to_vec(),
        }
    }
}

/// The whole comparison session. Only mutated through [`ComparisonState::apply`].
#[derive(Debug, Clone)]
pub struct ComparisonState {
    config: ComparisonConfig,
    fast: FeedState,
    reference: FeedState,
    timings: BlockTimings,
    race: RaceTracker,
    synthesized_count: u64,
}

impl ComparisonState {
    pub fn new(config: ComparisonConfig) -> Self {
        Self {
            fast: FeedState::new(FeedSource::Fast, config.history_capacity),
            reference: FeedState::new(FeedSource::Reference, config.history_capacity),
            timings: BlockTimings::default(),
            race: RaceTracker::new(config.race_target),
            synthesized_count: 0,
            config,
        }
    }

    pub fn config(&self) -> &ComparisonConfig {
        &self.config
    }

    fn feed(&self, source: FeedSource) -> &FeedState {
        match source {
            FeedSource::Fast => &self.fast,
            FeedSource::Reference => &self.reference,
        }
    }

    fn feed_mut(&mut self, source: FeedSource) -> &mut FeedState {
        match source {
            FeedSource::Fast => &mut self.fast,
            FeedSource::Reference => &mut self.reference,
        }
    }

    pub fn message_count(&self, source: FeedSource) -> u64 {
        self.feed(source).message_count
    }

    pub fn connection(&self, source: FeedSource) -> &ConnectionSnapshot {
        &self.feed(source).connection
    }

    pub fn history(&self, source: FeedSource) -> &BlockHistory {
        &self.feed(source).history
    }

    pub fn timings(&self) -> &BlockTimings {
        &self.timings
    }

    pub fn race_winner(&self) -> Option<RaceWinner> {
        self.race.winner()
    }

    pub fn apply(&mut self, event: FeedEvent, now_ms: i64) -> ApplyOutcome {
        let source = event.source();
        if let FeedEvent::Frame { payload, .. } = event {
            return self.apply_frame(source, &payload, now_ms);
        }

        let connection = &mut self.feed_mut(source).connection;
        match event {
            FeedEvent::Connecting { attempt, .. } => {
                connection.state = ConnectionState::Connecting;
                connection.connected = false;
                connection.attempts = connection.attempts.max(attempt);
            }
            FeedEvent::Opened { .. } => {
                connection.state = ConnectionState::Open;
                connection.connected = true;
                connection.last_error = None;
            }
            FeedEvent::SubscriptionSent { .. } => {}
            FeedEvent::SubscriptionFailed { reason, .. } => {
                connection.last_error = Some(format!("failed to subscribe: {reason}"));
            }
            FeedEvent::Closing { .. } => {
                connection.state = ConnectionState::Closing;
                connection.connected = false;
            }
            FeedEvent::Closed { code, reason, .. } => {
                connection.state = ConnectionState::Closed;
                connection.connected = false;
                let code = code.map(|value| value.to_string()).unwrap_or_default();
                let detail = format!("{code} {reason}");
                connection.last_error = Some(
                    format!("connection closed: {}", detail.trim())
                        .trim_end()
                        .to_string(),
                );
            }
            FeedEvent::Errored { message, .. } => {
                connection.state = ConnectionState::Closed;
                connection.connected = false;
                connection.last_error = Some(format!("error: {message}"));
            }
            FeedEvent::ReconnectScheduled { attempt, .. } => {
                connection.attempts = connection.attempts.max(attempt);
            }
            FeedEvent::RetriesExhausted { attempts, .. } => {
                connection.state = ConnectionState::Closed;
                connection.connected = false;
                connection.last_error =
                    Some(format!("gave up after {attempts} reconnect attempts"));
            }
            FeedEvent::Stopped { .. } => {
                connection.state = ConnectionState::Closed;
                connection.connected = false;
            }
            FeedEvent::Frame { .. } => unreachable!("frames are handled above"),
        }

        ApplyOutcome {
            source,
            effect: FeedEffect::Connection(connection.state),
            race_decided: None,
        }
    }

    fn apply_frame(&mut self, source: FeedSource, payload: &str, now_ms: i64) -> ApplyOutcome {
        let feed = self.feed_mut(source);
        feed.message_count = feed.message_count.saturating_add(1);
        let race_decided =
            self.race
                .evaluate(self.fast.message_count, self.reference.message_count, now_ms);

        let effect = match parse_payload(payload) {
            ParsedPayload::Ack { subscription } => FeedEffect::Acknowledged { subscription },
            ParsedPayload::Block(fields) => {
                let floor_ms = self.feed(source).history.latest().map(|block| block.received_at);
                let block = normalize(source, fields, now_ms, floor_ms);
                self.accept(block, false)
            }
            ParsedPayload::NoOp(reason) => self.synthesize_or_ignore(source, reason, now_ms),
        };

        ApplyOutcome {
            source,
            effect,
            race_decided,
        }
    }

    fn synthesize_or_ignore(
        &mut self,
        source: FeedSource,
        reason: NoOpReason,
        now_ms: i64,
    ) -> FeedEffect {
        if source != FeedSource::Fast {
            return FeedEffect::Ignored(reason);
        }
        let Some(previous) = self.fast.history.latest() else {
            return FeedEffect::Ignored(reason);
        };

        let sequence = self.synthesized_count.saturating_add(1);
        match synthesize(previous, self.config.synthesis_mode, now_ms, sequence) {
            Some(block) => {
                self.synthesized_count = sequence;
                self.accept(block, true)
            }
            None => FeedEffect::Ignored(reason),
        }
    }

    fn accept(&mut self, block: CanonicalBlock, synthesized: bool) -> FeedEffect {
        let number = block.number;
        let child_index = block.child_index;
        let source = block.source;
        let received_at = block.received_at;

        match self.feed_mut(source).history.insert(block) {
            InsertOutcome::Inserted => {
                self.timings.record(number, source, received_at);
                FeedEffect::Accepted {
                    number,
                    child_index,
                    synthesized,
                }
            }
            InsertOutcome::Replaced => {
                self.timings.record(number, source, received_at);
                FeedEffect::Replaced {
                    number,
                    child_index,
                }
            }
            InsertOutcome::Duplicate => FeedEffect::Duplicate {
                number,
                child_index,
            },
        }
    }

    pub fn snapshot(&self) -> ComparisonSnapshot {
        let threshold_ms = self.config.timing_threshold_ms;
        ComparisonSnapshot {
            fast: self.fast.snapshot(),
            reference: self.reference.snapshot(),
            merged: merged_view(
                &self.fast.history,
                &self.reference.history,
                &self.timings,
                self.config.history_capacity,
                threshold_ms,
            ),
            timings: self.timings.entries().clone(),
            stats: timing_stats(&self.timings, threshold_ms),
            throughput_ratio: throughput_ratio(
                self.fast.history.total_seen(),
                self.reference.history.total_seen(),
            ),
            race: self.race.status(),
        }
    }
}

/// Shared handle to the session state; clones point at the same session.
#[derive(Debug, Clone)]
pub struct ComparisonEngine {
    state: Arc<Mutex<ComparisonState>>,
}

impl ComparisonEngine {
    pub fn new(config: ComparisonConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(ComparisonState::new(config))),
        }
    }

    pub fn reset(&self, config: ComparisonConfig) {
        *self.state.lock() = ComparisonState::new(config);
    }

    pub fn apply(&self, event: FeedEvent, now_ms: i64) -> ApplyOutcome {
        self.state.lock().apply(event, now_ms)
    }

    pub fn snapshot(&self) -> ComparisonSnapshot {
        self.state.lock().snapshot()
    }

    pub fn config(&self) -> ComparisonConfig {
        self.state.lock().config().clone()
    }

    pub fn is_connected(&self, source: FeedSource) -> bool {
        self.state.lock().connection(source).connected
    }
}
