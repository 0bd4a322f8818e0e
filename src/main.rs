use block_race_lib::error::AppError;
use block_race_lib::feed::types::{
    StartComparisonArgs, SynthesisMode, DEFAULT_FAST_FEED_URL, DEFAULT_HISTORY_CAPACITY,
    DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RACE_TARGET, DEFAULT_RECONNECT_INTERVAL_MS,
    DEFAULT_REFERENCE_FEED_URL, DEFAULT_SUBSCRIBE_DELAY_MS, DEFAULT_TIMING_THRESHOLD_MS,
};
use clap::{ArgAction, Parser};
use std::time::Duration;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

/// Races a sub-block feed against a newHeads feed and logs who delivers first.
#[derive(Parser, Debug, Clone)]
#[command(name = "block-race", version, about)]
struct Cli {
    /// Verbosity level (0-3)
    #[arg(long, short, action = ArgAction::Count)]
    v: u8,
    /// Fast (sub-block) feed websocket url.
    #[arg(long, default_value = DEFAULT_FAST_FEED_URL)]
    fast_url: String,
    /// Reference JSON-RPC websocket url.
    #[arg(long, default_value = DEFAULT_REFERENCE_FEED_URL)]
    reference_url: String,
    /// Blocks kept per feed.
    #[arg(long, default_value_t = DEFAULT_HISTORY_CAPACITY)]
    history_capacity: usize,
    /// Message count that wins the race.
    #[arg(long, default_value_t = DEFAULT_RACE_TARGET)]
    race_target: u64,
    /// Arrival difference treated as a tie.
    #[arg(long, default_value_t = DEFAULT_TIMING_THRESHOLD_MS)]
    threshold_ms: i64,
    #[arg(long, default_value_t = DEFAULT_RECONNECT_INTERVAL_MS)]
    reconnect_interval_ms: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_RECONNECT_ATTEMPTS)]
    max_reconnect_attempts: u32,
    /// Delay between open and the newHeads subscription.
    #[arg(long, default_value_t = DEFAULT_SUBSCRIBE_DELAY_MS)]
    subscribe_delay_ms: u64,
    /// What to do with fast frames that carry no block number: sub_block, next_block or off.
    #[arg(long, default_value = "sub_block", value_parser = parse_synthesis_mode)]
    synthesis: SynthesisMode,
    /// How often to log a race summary.
    #[arg(long, default_value_t = 1_000)]
    report_interval_ms: u64,
}

fn parse_synthesis_mode(value: &str) -> Result<SynthesisMode, AppError> {
    SynthesisMode::parse_str(value)
}

impl Cli {
    fn start_args(&self) -> StartComparisonArgs {
        StartComparisonArgs {
            fast_feed_url: Some(self.fast_url.clone()),
            reference_feed_url: Some(self.reference_url.clone()),
            history_capacity: Some(self.history_capacity),
            race_target: Some(self.race_target),
            timing_threshold_ms: Some(self.threshold_ms),
            reconnect_interval_ms: Some(self.reconnect_interval_ms),
            max_reconnect_attempts: Some(self.max_reconnect_attempts),
            subscribe_delay_ms: Some(self.subscribe_delay_ms),
            synthesis_mode: Some(self.synthesis),
        }
    }

    fn init_tracing(&self) {
        let level = match self.v {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        };
        let filter = EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env_lossy();
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();
    cli.init_tracing();

    let report_interval = Duration::from_millis(cli.report_interval_ms.max(100));
    let shutdown = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    block_race_lib::run(cli.start_args(), report_interval, shutdown).await?;
    Ok(())
}
