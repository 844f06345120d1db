use std::time::Duration;

use booksync::adapter::{bitfinex, bitmex};
use booksync::SyncConfig;
use clap::{Args, Parser, Subcommand, ValueEnum};

/// book-sync: keep live L2 order books in sync from REST snapshots and
/// WebSocket diffs.
#[derive(Parser, Debug)]
#[command(name = "book-sync", version)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true, env = "BOOKSYNC_LOG_LEVEL")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Track order books and print top of book as it changes
    Track(TrackArgs),

    /// Fetch one REST snapshot and print it
    Snapshot(SnapshotArgs),
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exchange {
    Bitfinex,
    Bitmex,
}

impl Exchange {
    pub fn default_rest_url(self) -> &'static str {
        match self {
            Exchange::Bitfinex => bitfinex::BITFINEX_REST_URL,
            Exchange::Bitmex => bitmex::BITMEX_REST_URL,
        }
    }

    pub fn default_ws_url(self) -> &'static str {
        match self {
            Exchange::Bitfinex => bitfinex::BITFINEX_WS_URL,
            Exchange::Bitmex => bitmex::BITMEX_WS_URL,
        }
    }
}

/// Exchange selection shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct ExchangeArgs {
    /// Exchange to connect to
    #[arg(long, value_enum, default_value = "bitfinex", env = "BOOKSYNC_EXCHANGE")]
    pub exchange: Exchange,

    /// Override the REST base URL
    #[arg(long, env = "BOOKSYNC_REST_URL")]
    pub rest_url: Option<String>,

    /// Override the WebSocket URL
    #[arg(long, env = "BOOKSYNC_WS_URL")]
    pub ws_url: Option<String>,
}

impl ExchangeArgs {
    pub fn rest_url(&self) -> &str {
        self.rest_url
            .as_deref()
            .unwrap_or(self.exchange.default_rest_url())
    }

    pub fn ws_url(&self) -> &str {
        self.ws_url
            .as_deref()
            .unwrap_or(self.exchange.default_ws_url())
    }
}

/// Arguments for the `track` subcommand.
#[derive(Parser, Debug)]
pub struct TrackArgs {
    #[command(flatten)]
    pub exchange: ExchangeArgs,

    /// Trading pairs (e.g. BTC-USD ETH-USD)
    #[arg(required = true, env = "BOOKSYNC_SYMBOLS", value_delimiter = ',')]
    pub symbols: Vec<String>,

    /// Output as JSON instead of TSV
    #[arg(long)]
    pub json: bool,

    /// Minimum interval between printed updates per symbol (ms)
    #[arg(long, default_value = "500")]
    pub print_interval_ms: u64,

    /// Rows requested per REST snapshot
    #[arg(long, default_value = "100", env = "BOOKSYNC_DEPTH")]
    pub depth: usize,

    /// Applied diffs kept per symbol for replay after a snapshot
    #[arg(long, default_value = "1000")]
    pub replay_window: usize,

    /// Diffs held per symbol before its tracker starts
    #[arg(long, default_value = "1000")]
    pub pending_buffer: usize,

    /// Seconds without a frame before pinging the server
    #[arg(long, default_value = "30")]
    pub ws_read_timeout_secs: u64,

    /// Seconds to wait for traffic after a ping
    #[arg(long, default_value = "10")]
    pub ws_pong_timeout_secs: u64,

    /// Fixed delay before reconnecting the stream (s)
    #[arg(long, default_value = "5")]
    pub reconnect_backoff_secs: u64,

    /// Interval between statistics log lines (s)
    #[arg(long, default_value = "60")]
    pub stats_interval_secs: u64,

    /// Forced re-snapshot cadence, aligned to wall-clock multiples (s)
    #[arg(long, default_value = "3600")]
    pub full_refresh_interval_secs: u64,

    /// REST request deadline (s)
    #[arg(long, default_value = "10")]
    pub rest_timeout_secs: u64,

    /// Pause between initial snapshot fetches (ms)
    #[arg(long, default_value = "1000")]
    pub snapshot_pacing_ms: u64,
}

impl TrackArgs {
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            snapshot_depth_limit: self.depth,
            replay_window_capacity: self.replay_window,
            pending_buffer_capacity: self.pending_buffer,
            ws_read_timeout: Duration::from_secs(self.ws_read_timeout_secs),
            ws_pong_timeout: Duration::from_secs(self.ws_pong_timeout_secs),
            reconnect_backoff: Duration::from_secs(self.reconnect_backoff_secs),
            stats_interval: Duration::from_secs(self.stats_interval_secs),
            full_refresh_interval: Duration::from_secs(self.full_refresh_interval_secs),
            rest_timeout: Duration::from_secs(self.rest_timeout_secs),
            snapshot_pacing: Duration::from_millis(self.snapshot_pacing_ms),
            ..SyncConfig::default()
        }
    }
}

/// Arguments for the `snapshot` subcommand.
#[derive(Parser, Debug)]
pub struct SnapshotArgs {
    #[command(flatten)]
    pub exchange: ExchangeArgs,

    /// Trading pair (e.g. BTC-USD)
    pub symbol: String,

    /// Rows requested
    #[arg(long, default_value = "25")]
    pub depth: usize,

    /// Output as JSON instead of TSV
    #[arg(long)]
    pub json: bool,

    /// REST request deadline (s)
    #[arg(long, default_value = "10")]
    pub rest_timeout_secs: u64,
}
