use crate::error::AppError;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const DEFAULT_FAST_FEED_URL: &str = "wss://sepolia.flashblocks.base.org/ws";
pub const DEFAULT_REFERENCE_FEED_URL: &str = "wss://base-sepolia-rpc.publicnode.com";
pub const DEFAULT_HISTORY_CAPACITY: usize = 5;
pub const DEFAULT_RACE_TARGET: u64 = 420;
pub const DEFAULT_TIMING_THRESHOLD_MS: i64 = 50;
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 3_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_SUBSCRIBE_DELAY_MS: u64 = 500;
pub const DEFAULT_SYNTHESIS_MODE: SynthesisMode = SynthesisMode::SubBlock;
pub const MIN_HISTORY_CAPACITY: usize = 1;
pub const MAX_HISTORY_CAPACITY: usize = 100;
pub const MIN_RACE_TARGET: u64 = 1;
pub const MAX_RACE_TARGET: u64 = 1_000_000;
pub const MIN_TIMING_THRESHOLD_MS: i64 = 0;
pub const MAX_TIMING_THRESHOLD_MS: i64 = 5_000;
pub const MIN_RECONNECT_INTERVAL_MS: u64 = 100;
pub const MAX_RECONNECT_INTERVAL_MS: u64 = 60_000;
pub const MAX_RECONNECT_ATTEMPTS: u32 = 1_000;
pub const MAX_SUBSCRIBE_DELAY_MS: u64 = 10_000;

pub const UNKNOWN_HASH: &str = "unknown";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum FeedSource {
    Fast,
    Reference,
}

impl FeedSource {
    pub const ALL: [FeedSource; 2] = [FeedSource::Fast, FeedSource::Reference];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Reference => "reference",
        }
    }

    pub fn needs_subscription(self) -> bool {
        matches!(self, Self::Reference)
    }
}

impl fmt::Display for FeedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Numeric block field that the upstream may omit or send malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Quantity {
    Known(u64),
    #[default]
    Unknown,
}

impl From<Option<u64>> for Quantity {
    fn from(value: Option<u64>) -> Self {
        value.map_or(Self::Unknown, Self::Known)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(value) => write!(f, "{value}"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

impl Serialize for Quantity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Known(value) => serializer.serialize_u64(*value),
            Self::Unknown => serializer.serialize_str("unknown"),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalBlock {
    pub number: u64,
    pub hash: String,
    pub timestamp: u64,
    pub transaction_count: u64,
    pub gas_used: Quantity,
    pub base_fee_per_gas: Quantity,
    pub source: FeedSource,
    pub received_at: i64,
    pub child_index: Option<u32>,
    pub placeholder_tx: Option<String>,
    pub synthesized: bool,
}

impl CanonicalBlock {
    pub fn dedup_key(&self) -> (u64, u32) {
        (self.number, self.child_index.unwrap_or(0))
    }

}

/// How a fast-feed frame without a usable block number is turned into a record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisMode {
    /// Child of the previous block: same number, next child index.
    SubBlock,
    /// Previous block number plus one.
    NextBlock,
    Off,
}

impl SynthesisMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SubBlock => "sub_block",
            Self::NextBlock => "next_block",
            Self::Off => "off",
        }
    }

    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sub_block" | "sub-block" | "subblock" => Ok(Self::SubBlock),
            "next_block" | "next-block" | "nextblock" => Ok(Self::NextBlock),
            "off" | "none" => Ok(Self::Off),
            other => Err(AppError::InvalidArgument(format!(
                "unknown synthesis mode '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartComparisonArgs {
    pub fast_feed_url: Option<String>,
    pub reference_feed_url: Option<String>,
    pub history_capacity: Option<usize>,
    pub race_target: Option<u64>,
    pub timing_threshold_ms: Option<i64>,
    pub reconnect_interval_ms: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,
    pub subscribe_delay_ms: Option<u64>,
    pub synthesis_mode: Option<SynthesisMode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonConfig {
    pub fast_feed_url: String,
    pub reference_feed_url: String,
    pub history_capacity: usize,
    pub race_target: u64,
    pub timing_threshold_ms: i64,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub subscribe_delay_ms: u64,
    pub synthesis_mode: SynthesisMode,
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self {
            fast_feed_url: DEFAULT_FAST_FEED_URL.to_string(),
            reference_feed_url: DEFAULT_REFERENCE_FEED_URL.to_string(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            race_target: DEFAULT_RACE_TARGET,
            timing_threshold_ms: DEFAULT_TIMING_THRESHOLD_MS,
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            subscribe_delay_ms: DEFAULT_SUBSCRIBE_DELAY_MS,
            synthesis_mode: DEFAULT_SYNTHESIS_MODE,
        }
    }
}

impl ComparisonConfig {
    pub fn feed_url(&self, source: FeedSource) -> &str {
        match source {
            FeedSource::Fast => &self.fast_feed_url,
            FeedSource::Reference => &self.reference_feed_url,
        }
    }
}

fn normalize_feed_url(value: Option<String>, default: &str, field: &str) -> Result<String, AppError> {
    let url = value
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .unwrap_or_else(|| default.to_string());

    let lowered = url.to_ascii_lowercase();
    let host = lowered
        .strip_prefix("wss://")
        .or_else(|| lowered.strip_prefix("ws://"));
    match host {
        Some(rest) if !rest.is_empty() && !rest.starts_with('/') => Ok(url),
        _ => Err(AppError::InvalidArgument(format!(
            "{field} must be a ws:// or wss:// url with a host"
        ))),
    }
}

impl StartComparisonArgs {
    pub fn normalize(self) -> Result<ComparisonConfig, AppError> {
        let fast_feed_url =
            normalize_feed_url(self.fast_feed_url, DEFAULT_FAST_FEED_URL, "fastFeedUrl")?;
        let reference_feed_url = normalize_feed_url(
            self.reference_feed_url,
            DEFAULT_REFERENCE_FEED_URL,
            "referenceFeedUrl",
        )?;

        let history_capacity = self.history_capacity.unwrap_or(DEFAULT_HISTORY_CAPACITY);
        if !(MIN_HISTORY_CAPACITY..=MAX_HISTORY_CAPACITY).contains(&history_capacity) {
            return Err(AppError::InvalidArgument(format!(
                "historyCapacity must be between {MIN_HISTORY_CAPACITY} and {MAX_HISTORY_CAPACITY}"
            )));
        }

        let race_target = self.race_target.unwrap_or(DEFAULT_RACE_TARGET);
        if !(MIN_RACE_TARGET..=MAX_RACE_TARGET).contains(&race_target) {
            return Err(AppError::InvalidArgument(format!(
                "raceTarget must be between {MIN_RACE_TARGET} and {MAX_RACE_TARGET}"
            )));
        }

        let timing_threshold_ms = self
            .timing_threshold_ms
            .unwrap_or(DEFAULT_TIMING_THRESHOLD_MS);
        if !(MIN_TIMING_THRESHOLD_MS..=MAX_TIMING_THRESHOLD_MS).contains(&timing_threshold_ms) {
            return Err(AppError::InvalidArgument(format!(
                "timingThresholdMs must be between {MIN_TIMING_THRESHOLD_MS} and {MAX_TIMING_THRESHOLD_MS}"
            )));
        }

        let reconnect_interval_ms = self
            .reconnect_interval_ms
            .unwrap_or(DEFAULT_RECONNECT_INTERVAL_MS);
        if !(MIN_RECONNECT_INTERVAL_MS..=MAX_RECONNECT_INTERVAL_MS).contains(&reconnect_interval_ms)
        {
            return Err(AppError::InvalidArgument(format!(
                "reconnectIntervalMs must be between {MIN_RECONNECT_INTERVAL_MS} and {MAX_RECONNECT_INTERVAL_MS}"
            )));
        }

        let max_reconnect_attempts = self
            .max_reconnect_attempts
            .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS);
        if max_reconnect_attempts > MAX_RECONNECT_ATTEMPTS {
            return Err(AppError::InvalidArgument(format!(
                "maxReconnectAttempts must be at most {MAX_RECONNECT_ATTEMPTS}"
            )));
        }

        let subscribe_delay_ms = self.subscribe_delay_ms.unwrap_or(DEFAULT_SUBSCRIBE_DELAY_MS);
        if subscribe_delay_ms > MAX_SUBSCRIBE_DELAY_MS {
            return Err(AppError::InvalidArgument(format!(
                "subscribeDelayMs must be at most {MAX_SUBSCRIBE_DELAY_MS}"
            )));
        }

        Ok(ComparisonConfig {
            fast_feed_url,
            reference_feed_url,
            history_capacity,
            race_target,
            timing_threshold_ms,
            reconnect_interval_ms,
            max_reconnect_attempts,
            subscribe_delay_ms,
            synthesis_mode: self.synthesis_mode.unwrap_or(DEFAULT_SYNTHESIS_MODE),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonSession {
    pub running: bool,
    pub fast_feed_url: String,
    pub reference_feed_url: String,
    pub history_capacity: usize,
    pub race_target: u64,
    pub timing_threshold_ms: i64,
    pub synthesis_mode: SynthesisMode,
}

impl ComparisonSession {
    pub fn from_config(config: &ComparisonConfig) -> Self {
        Self {
            running: true,
            fast_feed_url: config.fast_feed_url.clone(),
            reference_feed_url: config.reference_feed_url.clone(),
            history_capacity: config.history_capacity,
            race_target: config.race_target,
            timing_threshold_ms: config.timing_threshold_ms,
            synthesis_mode: config.synthesis_mode,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonStopResult {
    pub stopped: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub connected: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Closed,
            connected: false,
            attempts: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedSnapshot {
    pub source: FeedSource,
    pub connection: ConnectionSnapshot,
    pub message_count: u64,
    pub total_blocks: u64,
    pub blocks: Vec<CanonicalBlock>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BlockTimingEntry {
    pub fast: Option<i64>,
    pub reference: Option<i64>,
}

impl BlockTimingEntry {
    /// Fast arrival minus reference arrival, once both feeds reported.
    pub fn delta_ms(&self) -> Option<i64> {
        match (self.fast, self.reference) {
            (Some(fast), Some(reference)) => Some(fast.saturating_sub(reference)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimingVerdict {
    FastFaster,
    ReferenceFaster,
    Simultaneous,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimingStats {
    pub total: u64,
    pub fast_faster: u64,
    pub reference_faster: u64,
    pub simultaneous: u64,
    pub fast_faster_pct: f64,
    pub reference_faster_pct: f64,
    pub simultaneous_pct: f64,
    pub average_delta_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MergedBlockView {
    pub number: u64,
    pub fast: Option<CanonicalBlock>,
    pub reference: Option<CanonicalBlock>,
    pub delta_ms: Option<i64>,
    pub verdict: Option<TimingVerdict>,
}

impl MergedBlockView {
    pub fn sources(&self) -> Vec<FeedSource> {
        let mut sources = Vec::with_capacity(2);
        if self.fast.is_some() {
            sources.push(FeedSource::Fast);
        }
        if self.reference.is_some() {
            sources.push(FeedSource::Reference);
        }
        sources
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RaceWinner {
    Fast,
    Reference,
    Tie,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RaceStatus {
    pub target: u64,
    pub winner: Option<RaceWinner>,
    pub decided_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonSnapshot {
    pub fast: FeedSnapshot,
    pub reference: FeedSnapshot,
    pub merged: Vec<MergedBlockView>,
    pub timings: BTreeMap<u64, BlockTimingEntry>,
    pub stats: TimingStats,
    pub throughput_ratio: Option<f64>,
    pub race: RaceStatus,
}
