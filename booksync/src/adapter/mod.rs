//! Exchange-specific wire handling.
//!
//! One [`MarketDataAdapter`] per exchange, chosen at construction time. The
//! rest of the pipeline only sees normalized [`SnapshotMessage`]s and
//! [`BookMessage`]s.

pub mod bitfinex;
pub mod bitmex;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;
use crate::types::{BookMessage, SequenceId, SnapshotMessage};

pub use bitfinex::BitfinexAdapter;
pub use bitmex::BitmexAdapter;

/// A REST snapshot request: path relative to the REST base plus query pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub path: String,
    pub query: Vec<(String, String)>,
}

/// How the stream layer should treat one text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    /// Keep-alive; never forwarded.
    Heartbeat,
    /// Subscription acknowledged; `channel_id` is set for channel-numbered protocols.
    Subscribed {
        channel_id: Option<u64>,
        trading_pair: String,
    },
    /// Channel closed by an unsubscribe.
    Unsubscribed { channel_id: Option<u64> },
    /// Any other control/info event.
    Control,
    /// Exchange-reported error event.
    Error(String),
    /// Book data; `channel_id` is set when the symbol must be looked up.
    Data { channel_id: Option<u64> },
}

/// One data frame as received on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub text: String,
    /// Trading pair resolved from the connection's channel directory, if any.
    pub trading_pair: Option<String>,
    /// Receipt sequence stamped by the adapter's clock.
    pub received: SequenceId,
}

/// Exchange wire format for order-book snapshots and diffs.
pub trait MarketDataAdapter: Send + Sync + fmt::Debug {
    /// Short exchange name used in logs.
    fn name(&self) -> &'static str;

    /// `BTC-USD` -> exchange symbol.
    fn to_exchange_symbol(&self, trading_pair: &str) -> String;

    /// Exchange symbol -> `BTC-USD`, or `None` if it cannot be mapped.
    fn from_exchange_symbol(&self, exchange_symbol: &str) -> Option<String>;

    /// REST request for a depth snapshot of `trading_pair`.
    fn snapshot_request(&self, trading_pair: &str, depth_limit: usize) -> SnapshotRequest;

    /// Parse a REST snapshot body. `sequence` was stamped before the request
    /// was sent; adapters whose payload carries an exchange sequence use that
    /// instead.
    fn parse_snapshot(
        &self,
        trading_pair: &str,
        body: &[u8],
        sequence: SequenceId,
    ) -> Result<SnapshotMessage>;

    /// Text frames that subscribe `trading_pair` to the book channel.
    fn subscribe_frames(&self, trading_pair: &str) -> Vec<String>;

    /// Text frames that unsubscribe `trading_pair`.
    fn unsubscribe_frames(&self, trading_pair: &str, channel_id: Option<u64>) -> Vec<String>;

    /// Classify a text frame before it reaches the router.
    fn classify(&self, text: &str) -> FrameKind;

    /// Parse a data frame into zero or more book messages (stream snapshots
    /// or diffs).
    ///
    /// # Errors
    ///
    /// [`crate::SyncError::Malformed`] when the frame cannot be attributed to
    /// a symbol or its rows do not parse.
    fn parse_stream_message(&self, frame: &RawFrame) -> Result<Vec<BookMessage>>;

    /// Next receipt sequence.
    fn next_sequence(&self) -> SequenceId;
}

// ---------------------------------------------------------------------------
// SequenceClock
// ---------------------------------------------------------------------------

/// Strictly increasing receipt clock in microseconds since the Unix epoch.
///
/// Exchanges without a per-symbol sequence counter are ordered by local
/// receipt time. Each value is `max(now, previous + 1)`, so two frames never
/// share a sequence even if the wall clock stalls or steps back. Ordering is
/// then as good as arrival order on one connection, not exchange ordering.
#[derive(Debug, Default)]
pub struct SequenceClock {
    last: AtomicU64,
}

impl SequenceClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> SequenceId {
        let now = epoch_micros();
        let previous = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(previous + 1)
    }
}

/// Current Unix epoch in microseconds.
pub fn epoch_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Split `BTC-USD` style pairs.
pub(crate) fn split_pair(trading_pair: &str) -> Option<(&str, &str)> {
    let (base, quote) = trading_pair.split_once('-')?;
    if base.is_empty() || quote.is_empty() {
        return None;
    }
    Some((base, quote))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_clock_strictly_increases() {
        let clock = SequenceClock::new();
        let mut previous = clock.next();
        for _ in 0..10_000 {
            let next = clock.next();
            assert!(next > previous, "{next} should be > {previous}");
            previous = next;
        }
    }

    #[test]
    fn test_sequence_clock_tracks_wall_time() {
        let before = epoch_micros();
        let seq = SequenceClock::new().next();
        assert!(seq >= before);
    }

    #[test]
    fn test_split_pair() {
        assert_eq!(split_pair("BTC-USD"), Some(("BTC", "USD")));
        assert_eq!(split_pair("BTCUSD"), None);
        assert_eq!(split_pair("-USD"), None);
    }
}
