//! Active order book and its lock-free read handle.
//!
//! The tracker task owns the only mutable [`ActiveOrderBook`] for a symbol.
//! After each processed batch it publishes an immutable copy through a
//! `tokio::sync::watch` channel, so readers never observe a torn book.
//!
//! ```text
//!   tracker (single writer)
//!        |  apply_snapshot / apply_diff
//!        v
//!   ActiveOrderBook --clone--> Arc<ActiveOrderBook>
//!                                    |
//!                          watch::Sender (BookPublisher)
//!                                    |
//!                          OrderBookHandle::current()
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::watch;

use crate::error::{Result, SyncError};
use crate::types::{PriceLevel, SequenceId};

// ---------------------------------------------------------------------------
// BookSide
// ---------------------------------------------------------------------------

/// One side of the book, keyed by price.
///
/// Both sides are stored ascending; `is_ask` decides which end is best.
#[derive(Clone, Debug, PartialEq)]
pub struct BookSide {
    levels: BTreeMap<Decimal, Decimal>,
    /// `true` for the ask side (best = lowest), `false` for bids (best = highest).
    is_ask: bool,
}

impl BookSide {
    pub fn new(is_ask: bool) -> Self {
        Self {
            levels: BTreeMap::new(),
            is_ask,
        }
    }

    /// Upsert levels; `amount == 0` removes the price, a no-op if absent.
    pub fn apply_levels(&mut self, levels: &[PriceLevel]) {
        for level in levels {
            if level.is_delete() {
                self.levels.remove(&level.price);
            } else {
                self.levels.insert(level.price, level.amount);
            }
        }
    }

    /// Replace every level. Zero-amount rows are ignored.
    pub fn set_snapshot(&mut self, levels: &[PriceLevel]) {
        self.levels.clear();
        for level in levels {
            if !level.is_delete() {
                self.levels.insert(level.price, level.amount);
            }
        }
    }

    /// Top-of-book price, or `None` if the side is empty.
    pub fn best(&self) -> Option<Decimal> {
        self.best_level().map(|l| l.price)
    }

    /// Top-of-book level, or `None` if the side is empty.
    pub fn best_level(&self) -> Option<PriceLevel> {
        let entry = if self.is_ask {
            self.levels.iter().next()
        } else {
            self.levels.iter().next_back()
        };
        entry.map(|(p, a)| PriceLevel::new(*p, *a))
    }

    /// Levels from best to worst.
    pub fn iter_best_first(&self) -> Box<dyn Iterator<Item = (&Decimal, &Decimal)> + '_> {
        if self.is_ask {
            Box::new(self.levels.iter())
        } else {
            Box::new(self.levels.iter().rev())
        }
    }

    pub fn get(&self, price: &Decimal) -> Option<Decimal> {
        self.levels.get(price).copied()
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Clone of all levels (price -> amount), ascending.
    pub fn get_levels(&self) -> BTreeMap<Decimal, Decimal> {
        self.levels.clone()
    }
}

// ---------------------------------------------------------------------------
// ActiveOrderBook
// ---------------------------------------------------------------------------

/// In-memory limit order book for one trading pair.
///
/// `last_applied` never decreases through [`apply_diff`](Self::apply_diff);
/// only [`apply_snapshot`](Self::apply_snapshot) may move it backwards.
#[derive(Clone, Debug)]
pub struct ActiveOrderBook {
    trading_pair: String,
    bids: BookSide,
    asks: BookSide,
    last_applied: SequenceId,
    snapshot_applied: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ActiveOrderBook {
    pub fn new(trading_pair: &str) -> Self {
        let now = Utc::now();
        Self {
            trading_pair: trading_pair.to_string(),
            bids: BookSide::new(false),
            asks: BookSide::new(true),
            last_applied: 0,
            snapshot_applied: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace both sides unconditionally and jump to `sequence`, even when
    /// it is lower than the current `last_applied`.
    pub fn apply_snapshot(&mut self, bids: &[PriceLevel], asks: &[PriceLevel], sequence: SequenceId) {
        self.bids.set_snapshot(bids);
        self.asks.set_snapshot(asks);
        self.last_applied = sequence;
        self.snapshot_applied = true;
        self.updated_at = Utc::now();
    }

    /// Apply an incremental update.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::StaleMessage`] without touching either side when
    /// `sequence <= last_applied`.
    pub fn apply_diff(
        &mut self,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
        sequence: SequenceId,
    ) -> Result<()> {
        if sequence <= self.last_applied {
            return Err(SyncError::StaleMessage {
                sequence,
                last_applied: self.last_applied,
            });
        }
        self.bids.apply_levels(bids);
        self.asks.apply_levels(asks);
        self.last_applied = sequence;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn trading_pair(&self) -> &str {
        &self.trading_pair
    }

    pub fn last_applied(&self) -> SequenceId {
        self.last_applied
    }

    /// `true` once a snapshot has been applied.
    pub fn is_ready(&self) -> bool {
        self.snapshot_applied
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn bids(&self) -> &BookSide {
        &self.bids
    }

    pub fn asks(&self) -> &BookSide {
        &self.asks
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.best()
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.best()
    }

    /// Arithmetic mean of best bid and best ask.
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }

    /// Price reached when taking `volume` from the book.
    ///
    /// A buy walks the asks upward, a sell walks the bids downward. Returns
    /// the price of the level at which cumulative depth reaches `volume`, the
    /// deepest level's price if the side runs out first, and `None` for an
    /// empty side.
    pub fn get_price_for_volume(&self, is_buy: bool, volume: Decimal) -> Option<Decimal> {
        let side = if is_buy { &self.asks } else { &self.bids };
        let mut cumulative = Decimal::ZERO;
        let mut last_price = None;
        for (price, amount) in side.iter_best_first() {
            cumulative += *amount;
            last_price = Some(*price);
            if cumulative >= volume {
                break;
            }
        }
        last_price
    }
}

// ---------------------------------------------------------------------------
// Publishing and reading
// ---------------------------------------------------------------------------

/// Snapshot-fetch health of one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolHealth {
    /// No snapshot fetch has completed yet.
    Initializing,
    Healthy,
    /// Snapshot fetches keep failing; the book is served as-is.
    Unhealthy { consecutive_failures: u32 },
}

/// Writer end, shared by the tracker and its snapshot refresher.
#[derive(Debug)]
pub struct BookPublisher {
    book_tx: watch::Sender<Arc<ActiveOrderBook>>,
    health_tx: watch::Sender<SymbolHealth>,
}

impl BookPublisher {
    /// Publish an immutable copy of `book` to every reader.
    pub fn publish(&self, book: &ActiveOrderBook) {
        self.book_tx.send_replace(Arc::new(book.clone()));
    }

    pub fn set_health(&self, health: SymbolHealth) {
        self.health_tx.send_if_modified(|current| {
            if *current == health {
                false
            } else {
                *current = health;
                true
            }
        });
    }
}

/// Cheap, cloneable read access to one symbol's book.
///
/// Every read borrows the latest published copy; no lock is shared with the
/// tracker.
#[derive(Debug, Clone)]
pub struct OrderBookHandle {
    book_rx: watch::Receiver<Arc<ActiveOrderBook>>,
    health_rx: watch::Receiver<SymbolHealth>,
}

impl OrderBookHandle {
    /// The latest published book.
    pub fn current(&self) -> Arc<ActiveOrderBook> {
        Arc::clone(&self.book_rx.borrow())
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.book_rx.borrow().best_bid()
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.book_rx.borrow().best_ask()
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        self.book_rx.borrow().mid_price()
    }

    pub fn get_price_for_volume(&self, is_buy: bool, volume: Decimal) -> Option<Decimal> {
        self.book_rx.borrow().get_price_for_volume(is_buy, volume)
    }

    pub fn last_applied(&self) -> SequenceId {
        self.book_rx.borrow().last_applied()
    }

    pub fn is_ready(&self) -> bool {
        self.book_rx.borrow().is_ready()
    }

    pub fn health(&self) -> SymbolHealth {
        *self.health_rx.borrow()
    }

    /// Wait until the first snapshot has been applied.
    ///
    /// Returns `false` if the tracker went away first.
    pub async fn wait_ready(&mut self) -> bool {
        self.book_rx.wait_for(|book| book.is_ready()).await.is_ok()
    }

    /// Clone a `watch::Receiver` for async consumption of book updates.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ActiveOrderBook>> {
        self.book_rx.clone()
    }
}

/// Create the publisher/handle pair for a fresh, empty book.
pub fn book_channel(trading_pair: &str) -> (BookPublisher, OrderBookHandle) {
    let (book_tx, book_rx) = watch::channel(Arc::new(ActiveOrderBook::new(trading_pair)));
    let (health_tx, health_rx) = watch::channel(SymbolHealth::Initializing);
    (
        BookPublisher { book_tx, health_tx },
        OrderBookHandle { book_rx, health_rx },
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn lvl(price: Decimal, amount: Decimal) -> PriceLevel {
        PriceLevel::new(price, amount)
    }

    /// snapshot seq=100, bids={10.0:5}, asks={11.0:5}
    fn scenario_book() -> ActiveOrderBook {
        let mut book = ActiveOrderBook::new("BTC-USD");
        book.apply_snapshot(&[lvl(dec!(10.0), dec!(5))], &[lvl(dec!(11.0), dec!(5))], 100);
        book
    }

    // -- BookSide ---------------------------------------------------------

    #[test]
    fn test_ask_best_is_lowest_price() {
        let mut side = BookSide::new(true);
        side.apply_levels(&[
            lvl(dec!(105), dec!(1)),
            lvl(dec!(100), dec!(2)),
            lvl(dec!(110), dec!(3)),
        ]);
        assert_eq!(side.best(), Some(dec!(100)));
    }

    #[test]
    fn test_bid_best_is_highest_price() {
        let mut side = BookSide::new(false);
        side.apply_levels(&[
            lvl(dec!(95), dec!(1)),
            lvl(dec!(100), dec!(2)),
            lvl(dec!(90), dec!(3)),
        ]);
        assert_eq!(side.best(), Some(dec!(100)));
        let order: Vec<Decimal> = side.iter_best_first().map(|(p, _)| *p).collect();
        assert_eq!(order, vec![dec!(100), dec!(95), dec!(90)]);
    }

    #[test]
    fn test_apply_levels_updates_existing_level() {
        let mut side = BookSide::new(true);
        side.apply_levels(&[lvl(dec!(100), dec!(5))]);
        side.apply_levels(&[lvl(dec!(100.0), dec!(10))]);
        assert_eq!(side.get(&dec!(100)), Some(dec!(10)));
        assert_eq!(side.len(), 1);
    }

    #[test]
    fn test_zero_amount_removes_level_and_ignores_absent() {
        let mut side = BookSide::new(true);
        side.apply_levels(&[lvl(dec!(100), dec!(5)), lvl(dec!(101), dec!(3))]);
        side.apply_levels(&[lvl(dec!(100), dec!(0))]);
        assert_eq!(side.len(), 1);
        assert!(side.get(&dec!(100)).is_none());

        // Deleting a price that is not present is a no-op.
        side.apply_levels(&[lvl(dec!(250), dec!(0))]);
        assert_eq!(side.len(), 1);
        assert_eq!(side.best(), Some(dec!(101)));
    }

    #[test]
    fn test_set_snapshot_replaces_and_skips_zero_rows() {
        let mut side = BookSide::new(true);
        side.apply_levels(&[lvl(dec!(100), dec!(5)), lvl(dec!(101), dec!(3))]);
        side.set_snapshot(&[lvl(dec!(200), dec!(1)), lvl(dec!(201), dec!(0))]);
        assert_eq!(side.len(), 1);
        assert_eq!(side.best(), Some(dec!(200)));
    }

    #[test]
    fn test_get_levels_returns_independent_clone() {
        let mut side = BookSide::new(true);
        side.apply_levels(&[lvl(dec!(100), dec!(5))]);
        let levels = side.get_levels();
        side.apply_levels(&[lvl(dec!(100), dec!(0))]);
        assert!(side.is_empty());
        assert_eq!(levels[&dec!(100)], dec!(5));
    }

    // -- ActiveOrderBook scenarios ---------------------------------------

    #[test]
    fn test_stale_diff_is_rejected_and_book_unchanged() {
        let mut book = scenario_book();
        let err = book
            .apply_diff(&[lvl(dec!(10.0), dec!(6))], &[], 99)
            .unwrap_err();
        assert!(matches!(err, SyncError::StaleMessage { sequence: 99, last_applied: 100 }));
        assert_eq!(book.bids().get(&dec!(10.0)), Some(dec!(5)));
        assert_eq!(book.last_applied(), 100);
    }

    #[test]
    fn test_equal_sequence_is_a_no_op() {
        let mut book = scenario_book();
        assert!(book.apply_diff(&[lvl(dec!(10.0), dec!(6))], &[], 100).is_err());
        assert_eq!(book.bids().get(&dec!(10.0)), Some(dec!(5)));
    }

    #[test]
    fn test_scenario_sequence_b_through_e() {
        let mut book = scenario_book();

        // B: applied.
        book.apply_diff(&[lvl(dec!(10.0), dec!(7))], &[], 105).unwrap();
        assert_eq!(book.last_applied(), 105);
        assert_eq!(book.bids().get(&dec!(10.0)), Some(dec!(7)));

        // C: 103 < 105, rejected.
        assert!(book.apply_diff(&[lvl(dec!(10.0), dec!(8))], &[], 103).is_err());
        assert_eq!(book.bids().get(&dec!(10.0)), Some(dec!(7)));
        assert_eq!(book.last_applied(), 105);

        // D: ask deleted.
        book.apply_diff(&[], &[lvl(dec!(11.0), dec!(0))], 106).unwrap();
        assert!(book.asks().is_empty());
        assert_eq!(book.best_ask(), None);

        // E: snapshot replaces unconditionally.
        book.apply_snapshot(&[lvl(dec!(10.0), dec!(9))], &[], 110);
        assert_eq!(book.bids().get_levels().len(), 1);
        assert_eq!(book.bids().get(&dec!(10.0)), Some(dec!(9)));
        assert!(book.asks().is_empty());
        assert_eq!(book.last_applied(), 110);
    }

    #[test]
    fn test_snapshot_may_move_sequence_backwards() {
        let mut book = scenario_book();
        book.apply_diff(&[lvl(dec!(10.0), dec!(7))], &[], 200).unwrap();
        book.apply_snapshot(&[lvl(dec!(9.5), dec!(1))], &[], 150);
        assert_eq!(book.last_applied(), 150);
        assert_eq!(book.best_bid(), Some(dec!(9.5)));
    }

    #[test]
    fn test_snapshot_is_idempotent() {
        let bids = [lvl(dec!(10), dec!(1)), lvl(dec!(9), dec!(2))];
        let asks = [lvl(dec!(11), dec!(3))];
        let mut book = ActiveOrderBook::new("ETH-USD");
        book.apply_snapshot(&bids, &asks, 7);
        let once = (book.bids().clone(), book.asks().clone());
        book.apply_snapshot(&bids, &asks, 7);
        assert_eq!(once, (book.bids().clone(), book.asks().clone()));
    }

    #[test]
    fn test_last_applied_is_monotonic_across_diffs() {
        let mut book = ActiveOrderBook::new("BTC-USD");
        let mut previous = book.last_applied();
        for seq in [5u64, 3, 8, 8, 2, 9, 1, 15] {
            let _ = book.apply_diff(&[lvl(dec!(1), Decimal::from(seq))], &[], seq);
            assert!(book.last_applied() >= previous);
            previous = book.last_applied();
        }
        assert_eq!(book.last_applied(), 15);
    }

    #[test]
    fn test_readiness_tracks_first_snapshot() {
        let mut book = ActiveOrderBook::new("BTC-USD");
        book.apply_diff(&[lvl(dec!(1), dec!(1))], &[], 1).unwrap();
        assert!(!book.is_ready());
        book.apply_snapshot(&[], &[], 2);
        assert!(book.is_ready());
    }

    // -- Reads -------------------------------------------------------------

    #[test]
    fn test_mid_price_requires_both_sides() {
        let mut book = scenario_book();
        assert_eq!(book.mid_price(), Some(dec!(10.5)));
        book.apply_diff(&[], &[lvl(dec!(11.0), dec!(0))], 101).unwrap();
        assert_eq!(book.mid_price(), None);
    }

    #[test]
    fn test_price_for_volume_walks_best_first() {
        let mut book = ActiveOrderBook::new("BTC-USD");
        book.apply_snapshot(
            &[lvl(dec!(99), dec!(1)), lvl(dec!(98), dec!(2)), lvl(dec!(97), dec!(5))],
            &[lvl(dec!(101), dec!(1)), lvl(dec!(102), dec!(2)), lvl(dec!(105), dec!(5))],
            1,
        );
        assert_eq!(book.get_price_for_volume(true, dec!(0.5)), Some(dec!(101)));
        assert_eq!(book.get_price_for_volume(true, dec!(3)), Some(dec!(102)));
        assert_eq!(book.get_price_for_volume(true, dec!(3.5)), Some(dec!(105)));
        assert_eq!(book.get_price_for_volume(false, dec!(2)), Some(dec!(98)));
        // Exhausted depth returns the deepest level.
        assert_eq!(book.get_price_for_volume(false, dec!(100)), Some(dec!(97)));
    }

    #[test]
    fn test_price_for_volume_on_empty_side() {
        let book = ActiveOrderBook::new("BTC-USD");
        assert_eq!(book.get_price_for_volume(true, dec!(1)), None);
    }

    // -- Handle --------------------------------------------------------------

    #[test]
    fn test_handle_sees_published_copy_only() {
        let (publisher, handle) = book_channel("BTC-USD");
        assert!(!handle.is_ready());
        assert_eq!(handle.health(), SymbolHealth::Initializing);

        let mut book = scenario_book();
        publisher.publish(&book);
        let before = handle.current();

        // Mutations after publishing are invisible until the next publish.
        book.apply_diff(&[lvl(dec!(10.0), dec!(7))], &[], 105).unwrap();
        assert_eq!(handle.last_applied(), 100);
        assert_eq!(before.bids().get(&dec!(10.0)), Some(dec!(5)));

        publisher.publish(&book);
        assert_eq!(handle.last_applied(), 105);
        assert_eq!(handle.best_bid(), Some(dec!(10.0)));
        assert_eq!(handle.best_ask(), Some(dec!(11.0)));
        assert!(handle.is_ready());

        publisher.set_health(SymbolHealth::Unhealthy {
            consecutive_failures: 5,
        });
        assert_eq!(
            handle.health(),
            SymbolHealth::Unhealthy {
                consecutive_failures: 5
            }
        );
    }

    #[tokio::test]
    async fn test_wait_ready_resolves_after_snapshot() {
        let (publisher, handle) = book_channel("BTC-USD");
        let mut waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.wait_ready().await });
        publisher.publish(&scenario_book());
        assert!(task.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_ready_fails_when_publisher_dropped() {
        let (publisher, mut handle) = book_channel("BTC-USD");
        drop(publisher);
        assert!(!handle.wait_ready().await);
    }
}
