//! Explicit per-symbol pipeline registry.
//!
//! A pipeline exists only between [`PipelineRegistry::create`] and
//! [`PipelineRegistry::destroy`]. Messages for wanted symbols without one are
//! parked in that symbol's [`PendingBuffer`] until `create` hands the buffer to
//! the new tracker; messages for any other symbol are refused.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::book::{book_channel, BookPublisher, OrderBookHandle};
use crate::pending::PendingBuffer;
use crate::types::{BookMessage, SequenceId};

/// Registry shared by the router and the lifecycle manager.
pub type SharedRegistry = Arc<Mutex<PipelineRegistry>>;

/// Lock the registry, recovering the data if a holder panicked.
pub fn lock(registry: &SharedRegistry) -> MutexGuard<'_, PipelineRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Router-facing side of one symbol's pipeline.
#[derive(Debug)]
pub struct SymbolPipeline {
    trading_pair: String,
    inbound: mpsc::UnboundedSender<BookMessage>,
    last_applied: Arc<AtomicU64>,
    handle: OrderBookHandle,
    resync: Arc<Notify>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SymbolPipeline {
    pub fn trading_pair(&self) -> &str {
        &self.trading_pair
    }

    /// Last sequence the tracker applied, as seen by the router.
    pub fn last_applied(&self) -> SequenceId {
        self.last_applied.load(Ordering::Acquire)
    }

    /// Queue a message for the tracker. Returns `false` once the tracker is gone.
    pub fn send(&self, message: BookMessage) -> bool {
        self.inbound.send(message).is_ok()
    }

    pub fn handle(&self) -> &OrderBookHandle {
        &self.handle
    }

    /// Ask the snapshot refresher for an immediate re-snapshot.
    pub fn request_resync(&self) {
        self.resync.notify_one();
    }

    /// Cancel the pipeline's tasks and wait for them to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

/// Tracker-facing side, returned by [`PipelineRegistry::create`].
#[derive(Debug)]
pub struct PipelineSeed {
    pub trading_pair: String,
    pub inbound: mpsc::UnboundedReceiver<BookMessage>,
    /// Sender clone for the snapshot refresher.
    pub snapshots: mpsc::UnboundedSender<BookMessage>,
    pub pending: PendingBuffer,
    pub publisher: Arc<BookPublisher>,
    pub last_applied: Arc<AtomicU64>,
    pub resync: Arc<Notify>,
    pub cancel: CancellationToken,
}

/// Result of [`PipelineRegistry::park`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkOutcome {
    Parked,
    /// Parked after evicting the oldest buffered message.
    Evicted,
    /// The symbol is not wanted; the message was dropped.
    Unwanted,
}

/// Every live pipeline plus the pending buffers of symbols without one.
#[derive(Debug)]
pub struct PipelineRegistry {
    pipelines: HashMap<String, SymbolPipeline>,
    pending: HashMap<String, PendingBuffer>,
    pending_capacity: usize,
    wanted: BTreeSet<String>,
}

impl PipelineRegistry {
    pub fn new(pending_capacity: usize) -> Self {
        Self {
            pipelines: HashMap::new(),
            pending: HashMap::new(),
            pending_capacity,
            wanted: BTreeSet::new(),
        }
    }

    pub fn shared(pending_capacity: usize) -> SharedRegistry {
        Arc::new(Mutex::new(Self::new(pending_capacity)))
    }

    /// Create the pipeline for `trading_pair`, taking over its pending buffer.
    ///
    /// Returns `None` if one already exists. `parent` bounds the lifetime of
    /// the pipeline's tasks.
    pub fn create(&mut self, trading_pair: &str, parent: &CancellationToken) -> Option<PipelineSeed> {
        if self.pipelines.contains_key(trading_pair) {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let (publisher, handle) = book_channel(trading_pair);
        let last_applied = Arc::new(AtomicU64::new(0));
        let resync = Arc::new(Notify::new());
        let cancel = parent.child_token();
        let pending = self
            .pending
            .remove(trading_pair)
            .unwrap_or_else(|| PendingBuffer::new(self.pending_capacity));

        self.pipelines.insert(
            trading_pair.to_string(),
            SymbolPipeline {
                trading_pair: trading_pair.to_string(),
                inbound: tx.clone(),
                last_applied: Arc::clone(&last_applied),
                handle,
                resync: Arc::clone(&resync),
                cancel: cancel.clone(),
                tasks: Vec::new(),
            },
        );

        Some(PipelineSeed {
            trading_pair: trading_pair.to_string(),
            inbound: rx,
            snapshots: tx,
            pending,
            publisher: Arc::new(publisher),
            last_applied,
            resync,
            cancel,
        })
    }

    /// Attach a spawned task so `destroy` can wait for it.
    pub fn attach(&mut self, trading_pair: &str, task: JoinHandle<()>) {
        match self.pipelines.get_mut(trading_pair) {
            Some(pipeline) => pipeline.tasks.push(task),
            None => task.abort(),
        }
    }

    /// Remove the pipeline and any pending messages for `trading_pair`.
    ///
    /// The caller finishes teardown with [`SymbolPipeline::shutdown`] outside
    /// the lock.
    pub fn destroy(&mut self, trading_pair: &str) -> Option<SymbolPipeline> {
        self.pending.remove(trading_pair);
        self.pipelines.remove(trading_pair)
    }

    pub fn get(&self, trading_pair: &str) -> Option<&SymbolPipeline> {
        self.pipelines.get(trading_pair)
    }

    pub fn contains(&self, trading_pair: &str) -> bool {
        self.pipelines.contains_key(trading_pair)
    }

    /// Park a message for a wanted symbol without a pipeline.
    pub fn park(&mut self, message: BookMessage) -> ParkOutcome {
        if !self.wanted.contains(message.trading_pair()) {
            return ParkOutcome::Unwanted;
        }
        let capacity = self.pending_capacity;
        let evicted = self
            .pending
            .entry(message.trading_pair().to_string())
            .or_insert_with(|| PendingBuffer::new(capacity))
            .push(message);
        if evicted {
            ParkOutcome::Evicted
        } else {
            ParkOutcome::Parked
        }
    }

    /// Number of parked messages for `trading_pair`.
    pub fn parked(&self, trading_pair: &str) -> usize {
        self.pending.get(trading_pair).map_or(0, PendingBuffer::len)
    }

    /// Replace the set of symbols that may be parked, dropping buffers for
    /// every symbol outside it.
    pub fn set_wanted(&mut self, wanted: &BTreeSet<String>) {
        self.pending.retain(|pair, _| wanted.contains(pair));
        self.wanted.clone_from(wanted);
    }

    /// Symbols with a live pipeline.
    pub fn tracked(&self) -> BTreeSet<String> {
        self.pipelines.keys().cloned().collect()
    }

    pub fn handle(&self, trading_pair: &str) -> Option<OrderBookHandle> {
        self.pipelines.get(trading_pair).map(|p| p.handle.clone())
    }

    /// Request a re-snapshot on every pipeline.
    pub fn resync_all(&self) {
        for pipeline in self.pipelines.values() {
            pipeline.request_resync();
        }
    }

    /// Remove every pipeline for shutdown.
    pub fn drain(&mut self) -> Vec<SymbolPipeline> {
        self.pending.clear();
        self.wanted.clear();
        self.pipelines.drain().map(|(_, p)| p).collect()
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}
