//! Routes parsed stream messages to per-symbol pipelines.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::adapter::{MarketDataAdapter, RawFrame};
use crate::registry::{self, ParkOutcome, SharedRegistry};
use crate::types::BookMessage;

/// Counters reset by [`RouterStats::take`] once per stats interval.
#[derive(Debug, Default)]
pub struct RouterStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    queued: AtomicU64,
    malformed: AtomicU64,
    evicted: AtomicU64,
}

/// Point-in-time copy of [`RouterStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterCounts {
    pub accepted: u64,
    pub rejected: u64,
    pub queued: u64,
    pub malformed: u64,
    pub evicted: u64,
}

impl RouterStats {
    pub fn snapshot(&self) -> RouterCounts {
        RouterCounts {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }

    /// Read and reset every counter.
    pub fn take(&self) -> RouterCounts {
        RouterCounts {
            accepted: self.accepted.swap(0, Ordering::Relaxed),
            rejected: self.rejected.swap(0, Ordering::Relaxed),
            queued: self.queued.swap(0, Ordering::Relaxed),
            malformed: self.malformed.swap(0, Ordering::Relaxed),
            evicted: self.evicted.swap(0, Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// What happened to one routed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Accepted,
    Rejected,
    Queued,
    /// No pipeline and the symbol is not wanted; counted as rejected.
    Unwanted,
    Malformed,
}

#[derive(Debug, Clone)]
pub struct DiffRouter {
    adapter: Arc<dyn MarketDataAdapter>,
    registry: SharedRegistry,
    stats: Arc<RouterStats>,
}

impl DiffRouter {
    pub fn new(
        adapter: Arc<dyn MarketDataAdapter>,
        registry: SharedRegistry,
        stats: Arc<RouterStats>,
    ) -> Self {
        Self {
            adapter,
            registry,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<RouterStats> {
        &self.stats
    }

    /// Parse one frame and dispatch every message it carries.
    pub fn route(&self, frame: &RawFrame) -> Vec<RouteOutcome> {
        match self.adapter.parse_stream_message(frame) {
            Ok(messages) => messages.into_iter().map(|m| self.dispatch(m)).collect(),
            Err(e) => {
                debug!(error = %e, "dropping malformed frame");
                RouterStats::bump(&self.stats.malformed);
                vec![RouteOutcome::Malformed]
            }
        }
    }

    /// Park, reject, or forward a single message.
    ///
    /// Messages for symbols without a pipeline are parked only while the
    /// symbol is wanted.
    ///
    /// Snapshots are never sequence-filtered: they replace the book
    /// unconditionally.
    pub fn dispatch(&self, message: BookMessage) -> RouteOutcome {
        let mut registry = registry::lock(&self.registry);
        let pipeline = match registry.get(message.trading_pair()) {
            Some(pipeline) => pipeline,
            None => {
                let symbol = message.trading_pair().to_string();
                return match registry.park(message) {
                    ParkOutcome::Unwanted => {
                        debug!(symbol = %symbol, "dropping message for untracked symbol");
                        RouterStats::bump(&self.stats.rejected);
                        RouteOutcome::Unwanted
                    }
                    outcome => {
                        if outcome == ParkOutcome::Evicted {
                            RouterStats::bump(&self.stats.evicted);
                        }
                        RouterStats::bump(&self.stats.queued);
                        RouteOutcome::Queued
                    }
                };
            }
        };

        if let BookMessage::Diff(diff) = &message {
            let last_applied = pipeline.last_applied();
            if diff.sequence <= last_applied {
                debug!(
                    symbol = %diff.trading_pair,
                    sequence = diff.sequence,
                    last_applied,
                    "rejecting stale diff"
                );
                RouterStats::bump(&self.stats.rejected);
                return RouteOutcome::Rejected;
            }
        }

        if pipeline.send(message) {
            RouterStats::bump(&self.stats.accepted);
            RouteOutcome::Accepted
        } else {
            // Tracker already exited; teardown is in progress.
            RouterStats::bump(&self.stats.rejected);
            RouteOutcome::Rejected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::BitfinexAdapter;
    use crate::registry::PipelineRegistry;
    use crate::types::{DiffMessage, PriceLevel, Side};
    use rust_decimal_macros::dec;
    use std::sync::atomic::Ordering;
    use tokio_util::sync::CancellationToken;

    fn router(capacity: usize) -> DiffRouter {
        let registry = PipelineRegistry::shared(capacity);
        let wanted = ["BTC-USD".to_string()].into_iter().collect();
        registry::lock(&registry).set_wanted(&wanted);
        DiffRouter::new(
            Arc::new(BitfinexAdapter::default()),
            registry,
            Arc::new(RouterStats::default()),
        )
    }

    fn diff(pair: &str, seq: u64) -> BookMessage {
        BookMessage::Diff(DiffMessage::single(
            pair,
            Side::Bid,
            PriceLevel::new(dec!(10), dec!(1)),
            seq,
        ))
    }

    #[test]
    fn test_unknown_symbol_is_queued() {
        let router = router(1000);
        // 1001 diffs into a 1000-slot buffer.
        for seq in 1..=1001 {
            assert_eq!(router.dispatch(diff("BTC-USD", seq)), RouteOutcome::Queued);
        }
        let counts = router.stats().snapshot();
        assert_eq!(counts.queued, 1001);
        assert_eq!(counts.evicted, 1);
        assert_eq!(registry::lock(&router.registry).parked("BTC-USD"), 1000);
    }

    #[test]
    fn test_stale_diff_is_rejected_and_newer_accepted() {
        let router = router(16);
        let root = CancellationToken::new();
        let mut seed = registry::lock(&router.registry)
            .create("BTC-USD", &root)
            .unwrap();
        seed.last_applied.store(100, Ordering::Release);

        assert_eq!(router.dispatch(diff("BTC-USD", 99)), RouteOutcome::Rejected);
        assert_eq!(router.dispatch(diff("BTC-USD", 100)), RouteOutcome::Rejected);
        assert_eq!(router.dispatch(diff("BTC-USD", 101)), RouteOutcome::Accepted);
        assert_eq!(seed.inbound.try_recv().unwrap().sequence(), 101);
        assert!(seed.inbound.try_recv().is_err());

        let counts = router.stats().take();
        assert_eq!((counts.accepted, counts.rejected), (1, 2));
        assert_eq!(router.stats().snapshot(), RouterCounts::default());
    }

    #[test]
    fn test_snapshot_bypasses_sequence_filter() {
        let router = router(16);
        let root = CancellationToken::new();
        let mut seed = registry::lock(&router.registry)
            .create("BTC-USD", &root)
            .unwrap();
        seed.last_applied.store(500, Ordering::Release);

        let snapshot = BookMessage::Snapshot(crate::types::SnapshotMessage {
            trading_pair: "BTC-USD".into(),
            bids: vec![],
            asks: vec![],
            sequence: 1,
        });
        assert_eq!(router.dispatch(snapshot), RouteOutcome::Accepted);
        assert!(matches!(
            seed.inbound.try_recv(),
            Ok(BookMessage::Snapshot(_))
        ));
    }

    #[test]
    fn test_unwanted_symbol_is_dropped() {
        let router = router(16);
        assert_eq!(router.dispatch(diff("DOGE-USD", 1)), RouteOutcome::Unwanted);
        let counts = router.stats().snapshot();
        assert_eq!((counts.queued, counts.rejected), (0, 1));
        assert_eq!(registry::lock(&router.registry).parked("DOGE-USD"), 0);
    }

    #[test]
    fn test_malformed_frame_is_counted() {
        let router = router(16);
        let frame = RawFrame {
            text: "[17,[1,2,3]]".into(),
            trading_pair: None,
            received: 1,
        };
        assert_eq!(router.route(&frame), vec![RouteOutcome::Malformed]);
        assert_eq!(router.stats().snapshot().malformed, 1);
    }

    #[test]
    fn test_parsed_frame_is_routed_by_symbol() {
        let router = router(16);
        let frame = RawFrame {
            text: "[17,[50000,2,0.5]]".into(),
            trading_pair: Some("BTC-USD".into()),
            received: 7,
        };
        assert_eq!(router.route(&frame), vec![RouteOutcome::Queued]);
        assert_eq!(registry::lock(&router.registry).parked("BTC-USD"), 1);
    }
}
