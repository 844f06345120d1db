//! Per-symbol tracker task and its snapshot refresher.
//!
//! The tracker is the only writer of its [`ActiveOrderBook`]. It drains the
//! pending buffer first, then its inbound queue, and publishes a copy of the
//! book after every batch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::book::{ActiveOrderBook, BookPublisher, SymbolHealth};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::fetcher::{next_refresh_delay, SnapshotSource};
use crate::pending::PendingBuffer;
use crate::replay::ReplayWindow;
use crate::types::{BookMessage, DiffMessage, SnapshotMessage};

/// Upper bound on inbound messages handled between two publishes.
const MAX_BATCH: usize = 1024;

/// Counters for one tracker, reset every stats interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub diffs_applied: u64,
    pub diffs_rejected: u64,
    pub snapshots_applied: u64,
    pub diffs_replayed: u64,
}

pub struct SymbolTracker {
    trading_pair: String,
    book: ActiveOrderBook,
    window: ReplayWindow,
    pending: PendingBuffer,
    inbound: mpsc::UnboundedReceiver<BookMessage>,
    publisher: Arc<BookPublisher>,
    last_applied: Arc<AtomicU64>,
    stats: TrackerStats,
    stats_interval: Duration,
    dirty: bool,
}

impl SymbolTracker {
    pub fn new(
        trading_pair: String,
        inbound: mpsc::UnboundedReceiver<BookMessage>,
        pending: PendingBuffer,
        publisher: Arc<BookPublisher>,
        last_applied: Arc<AtomicU64>,
        config: &SyncConfig,
    ) -> Self {
        let book = ActiveOrderBook::new(&trading_pair);
        Self {
            trading_pair,
            book,
            window: ReplayWindow::new(config.replay_window_capacity),
            pending,
            inbound,
            publisher,
            last_applied,
            stats: TrackerStats::default(),
            stats_interval: config.stats_interval,
            dirty: false,
        }
    }

    pub fn book(&self) -> &ActiveOrderBook {
        &self.book
    }

    pub fn stats(&self) -> TrackerStats {
        self.stats
    }

    /// Consume messages until cancelled or every sender is gone.
    ///
    /// Returns the counters accumulated since the last stats flush.
    pub async fn run(mut self, cancel: CancellationToken) -> TrackerStats {
        let mut stats_tick = time::interval(self.stats_interval);
        stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        stats_tick.tick().await; // consume the immediate first tick

        info!(symbol = %self.trading_pair, pending = self.pending.len(), "tracker started");

        loop {
            if !self.pending.is_empty() {
                while let Some(message) = self.pending.pop() {
                    self.process(message);
                }
            } else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = stats_tick.tick() => {
                        self.flush_stats();
                        continue;
                    }
                    message = self.inbound.recv() => match message {
                        Some(message) => self.process(message),
                        None => {
                            debug!(symbol = %self.trading_pair, "inbound queue closed");
                            break;
                        }
                    },
                }
                let mut batch = 1;
                while batch < MAX_BATCH {
                    match self.inbound.try_recv() {
                        Ok(message) => self.process(message),
                        Err(_) => break,
                    }
                    batch += 1;
                }
            }
            self.publish();
        }

        self.inbound.close();
        info!(symbol = %self.trading_pair, "tracker stopped");
        self.stats
    }

    /// Apply one message. Errors are logged and never stop the loop.
    pub fn process(&mut self, message: BookMessage) {
        match message {
            BookMessage::Diff(diff) => self.apply_diff(diff),
            BookMessage::Snapshot(snapshot) => self.apply_snapshot(snapshot),
        }
    }

    fn apply_diff(&mut self, diff: DiffMessage) {
        match self.book.apply_diff(&diff.bids, &diff.asks, diff.sequence) {
            Ok(()) => {
                self.stats.diffs_applied += 1;
                self.store_last_applied();
                self.window.record(diff);
                self.dirty = true;
            }
            Err(SyncError::StaleMessage {
                sequence,
                last_applied,
            }) => {
                self.stats.diffs_rejected += 1;
                debug!(symbol = %self.trading_pair, sequence, last_applied, "stale diff");
            }
            Err(e) => warn!(symbol = %self.trading_pair, error = %e, "failed to apply diff"),
        }
    }

    /// Replace the book, then re-apply every windowed diff newer than the
    /// snapshot in sequence order.
    fn apply_snapshot(&mut self, snapshot: SnapshotMessage) {
        self.book
            .apply_snapshot(&snapshot.bids, &snapshot.asks, snapshot.sequence);
        self.stats.snapshots_applied += 1;

        for diff in self.window.replay_after(snapshot.sequence) {
            if self
                .book
                .apply_diff(&diff.bids, &diff.asks, diff.sequence)
                .is_ok()
            {
                self.stats.diffs_replayed += 1;
            }
        }

        self.store_last_applied();
        self.dirty = true;
        debug!(
            symbol = %self.trading_pair,
            sequence = snapshot.sequence,
            last_applied = self.book.last_applied(),
            "snapshot applied"
        );
    }

    fn store_last_applied(&self) {
        self.last_applied
            .store(self.book.last_applied(), Ordering::Release);
    }

    fn publish(&mut self) {
        if self.dirty {
            self.publisher.publish(&self.book);
            self.dirty = false;
        }
    }

    fn flush_stats(&mut self) {
        let stats = std::mem::take(&mut self.stats);
        info!(
            symbol = %self.trading_pair,
            diffs_applied = stats.diffs_applied,
            diffs_rejected = stats.diffs_rejected,
            snapshots_applied = stats.snapshots_applied,
            diffs_replayed = stats.diffs_replayed,
            window = self.window.len(),
            "tracker stats"
        );
    }
}

// ---------------------------------------------------------------------------
// Snapshot refresher
// ---------------------------------------------------------------------------

/// Periodic and on-demand REST snapshots for one symbol.
pub struct SnapshotRefresher {
    pub trading_pair: String,
    pub source: Arc<dyn SnapshotSource>,
    pub snapshots: mpsc::UnboundedSender<BookMessage>,
    pub publisher: Arc<BookPublisher>,
    pub resync: Arc<Notify>,
    pub config: SyncConfig,
}

impl SnapshotRefresher {
    /// Run until cancelled.
    ///
    /// With `initialized == false` the first fetch starts immediately;
    /// otherwise the refresher waits for the next aligned refresh boundary
    /// or a resync request.
    pub async fn run(self, initialized: bool, cancel: CancellationToken) {
        self.drive(!initialized, None, cancel).await;
    }

    /// Fetch the first snapshot immediately, then run until cancelled.
    ///
    /// `first_attempt` receives whether the very first fetch succeeded; later
    /// retries continue in the background either way.
    pub async fn initialize(self, first_attempt: oneshot::Sender<bool>, cancel: CancellationToken) {
        self.drive(true, Some(first_attempt), cancel).await;
    }

    async fn drive(
        self,
        mut needs_snapshot: bool,
        mut first_attempt: Option<oneshot::Sender<bool>>,
        cancel: CancellationToken,
    ) {
        loop {
            if !needs_snapshot {
                let delay = next_refresh_delay(Utc::now(), self.config.full_refresh_interval);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = time::sleep(delay) => {
                        debug!(symbol = %self.trading_pair, "scheduled snapshot refresh");
                    }
                    _ = self.resync.notified() => {
                        info!(symbol = %self.trading_pair, "resync requested");
                    }
                }
            }
            needs_snapshot = false;

            match self.fetch_with_retry(&cancel, &mut first_attempt).await {
                Ok(snapshot) => {
                    if self.snapshots.send(BookMessage::Snapshot(snapshot)).is_err() {
                        return;
                    }
                }
                Err(SyncError::Cancelled) => return,
                Err(e) => {
                    error!(
                        symbol = %self.trading_pair,
                        error = %e,
                        "snapshot fetch not retryable, waiting for next refresh"
                    );
                }
            }
        }
    }

    /// Fetch until success or a non-retryable error, backing off between
    /// retryable failures.
    ///
    /// # Errors
    ///
    /// [`SyncError::Cancelled`] once `cancel` fires, or the first error for
    /// which [`SyncError::is_retryable`] is false.
    async fn fetch_with_retry(
        &self,
        cancel: &CancellationToken,
        first_attempt: &mut Option<oneshot::Sender<bool>>,
    ) -> Result<SnapshotMessage> {
        let mut failures: u32 = 0;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                result = self.source.fetch(&self.trading_pair) => result,
            };
            match result {
                Ok(snapshot) => {
                    if failures > 0 {
                        info!(symbol = %self.trading_pair, failures, "snapshot fetch recovered");
                    }
                    self.publisher.set_health(SymbolHealth::Healthy);
                    report_first(first_attempt, true);
                    return Ok(snapshot);
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    report_first(first_attempt, false);
                    if !e.is_retryable() {
                        self.publisher.set_health(SymbolHealth::Unhealthy {
                            consecutive_failures: failures,
                        });
                        return Err(e);
                    }

                    let backoff = self.config.snapshot_backoff(failures);
                    if failures >= self.config.unhealthy_after_failures {
                        error!(
                            symbol = %self.trading_pair,
                            failures,
                            error = %e,
                            "snapshot fetch keeps failing"
                        );
                        self.publisher.set_health(SymbolHealth::Unhealthy {
                            consecutive_failures: failures,
                        });
                    } else {
                        warn!(
                            symbol = %self.trading_pair,
                            failures,
                            error = %e,
                            backoff = ?backoff,
                            "snapshot fetch failed, retrying"
                        );
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                        _ = time::sleep(backoff) => {}
                    }
                }
            }
        }
    }
}

fn report_first(first_attempt: &mut Option<oneshot::Sender<bool>>, succeeded: bool) {
    if let Some(tx) = first_attempt.take() {
        let _ = tx.send(succeeded);
    }
}
