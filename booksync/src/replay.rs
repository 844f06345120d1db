//! Bounded window of recently applied diffs.
//!
//! Diffs enter the window only after they were applied, so entries are kept
//! in non-decreasing sequence order. That lets the replay cut point be found
//! with a binary search instead of a scan. Equal sequences keep their arrival
//! order.

use std::collections::VecDeque;

use crate::types::{DiffMessage, SequenceId};

#[derive(Debug)]
pub struct ReplayWindow {
    entries: VecDeque<DiffMessage>,
    capacity: usize,
}

impl ReplayWindow {
    /// Create an empty window holding at most `capacity` diffs.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Append an applied diff, evicting the oldest one past capacity.
    ///
    /// A diff older than the current tail would break the ordering the
    /// binary search depends on; such entries drop everything after their
    /// insertion point first, so the window stays sorted.
    pub fn record(&mut self, diff: DiffMessage) {
        if let Some(tail) = self.entries.back() {
            if diff.sequence < tail.sequence {
                let cut = self.cut_point(diff.sequence);
                self.entries.truncate(cut);
            }
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(diff);
    }

    /// Diffs with `sequence > after`, in sequence order.
    ///
    /// Entries at or below `after` are discarded: a snapshot at `after`
    /// already reflects them. The returned diffs stay in the window.
    pub fn replay_after(&mut self, after: SequenceId) -> Vec<DiffMessage> {
        let cut = self.cut_point(after);
        self.entries.drain(..cut);
        self.entries.iter().cloned().collect()
    }

    /// Index of the first entry with `sequence > after`.
    fn cut_point(&self, after: SequenceId) -> usize {
        self.entries.partition_point(|d| d.sequence <= after)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sequences currently held, oldest first.
    pub fn sequences(&self) -> Vec<SequenceId> {
        self.entries.iter().map(|d| d.sequence).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PriceLevel, Side};
    use rust_decimal::Decimal;

    fn diff(seq: SequenceId) -> DiffMessage {
        DiffMessage::single(
            "BTC-USD",
            Side::Bid,
            PriceLevel::new(Decimal::from(100), Decimal::from(seq)),
            seq,
        )
    }

    #[test]
    fn test_replay_after_snapshot_returns_only_newer_diffs() {
        let mut window = ReplayWindow::new(16);
        for seq in [108, 109, 111, 112] {
            window.record(diff(seq));
        }

        let replay: Vec<SequenceId> = window.replay_after(110).iter().map(|d| d.sequence).collect();
        assert_eq!(replay, vec![111, 112]);
        // 108 and 109 are gone for good.
        assert_eq!(window.sequences(), vec![111, 112]);
    }

    #[test]
    fn test_replay_after_everything_is_empty() {
        let mut window = ReplayWindow::new(4);
        window.record(diff(1));
        window.record(diff(2));
        assert!(window.replay_after(2).is_empty());
        assert!(window.is_empty());
    }

    #[test]
    fn test_replay_after_older_snapshot_returns_all() {
        let mut window = ReplayWindow::new(4);
        for seq in [5, 6, 7] {
            window.record(diff(seq));
        }
        let replay: Vec<SequenceId> = window.replay_after(1).iter().map(|d| d.sequence).collect();
        assert_eq!(replay, vec![5, 6, 7]);
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut window = ReplayWindow::new(3);
        for seq in 1..=5 {
            window.record(diff(seq));
        }
        assert_eq!(window.sequences(), vec![3, 4, 5]);
        assert_eq!(window.capacity(), 3);
    }

    #[test]
    fn test_ties_keep_arrival_order() {
        let mut window = ReplayWindow::new(8);
        let mut first = diff(10);
        first.bids[0].amount = Decimal::from(1);
        let mut second = diff(10);
        second.bids[0].amount = Decimal::from(2);
        window.record(diff(9));
        window.record(first);
        window.record(second);

        let replay = window.replay_after(9);
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].bids[0].amount, Decimal::from(1));
        assert_eq!(replay[1].bids[0].amount, Decimal::from(2));
        assert!(window.replay_after(10).is_empty());
    }

    #[test]
    fn test_out_of_order_record_keeps_window_sorted() {
        let mut window = ReplayWindow::new(8);
        for seq in [10, 20, 30] {
            window.record(diff(seq));
        }
        window.record(diff(15));
        assert_eq!(window.sequences(), vec![10, 15]);
    }
}
