//! Tracking lifecycle: which symbols have pipelines, and the stream
//! connection that feeds them.
//!
//! ```text
//!  refresh(available) ──> registry.create / destroy ──> tracker + refresher tasks
//!          │
//!          └─ desired set (watch) ──> run_stream: connect, subscribe, route
//!                                          │ ConnectionLost
//!                                          └─> backoff, reconnect, resubscribe, resync all
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::MarketDataAdapter;
use crate::book::OrderBookHandle;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::fetcher::SnapshotSource;
use crate::registry::{self, PipelineRegistry, SharedRegistry};
use crate::router::{DiffRouter, RouterCounts, RouterStats};
use crate::stream::StreamMultiplexer;
use crate::tracker::{SnapshotRefresher, SymbolTracker};

/// Symbols started and stopped by one [`TrackingManager::refresh`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
}

impl RefreshReport {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty()
    }
}

/// Owns every per-symbol pipeline and the stream that feeds them.
pub struct TrackingManager {
    config: SyncConfig,
    adapter: Arc<dyn MarketDataAdapter>,
    source: Arc<dyn SnapshotSource>,
    registry: SharedRegistry,
    stats: Arc<RouterStats>,
    desired: watch::Sender<BTreeSet<String>>,
    refresh_lock: AsyncMutex<()>,
    cancel: CancellationToken,
}

impl TrackingManager {
    /// # Errors
    ///
    /// [`crate::SyncError::Config`] if `config` does not validate.
    pub fn new(
        config: SyncConfig,
        adapter: Arc<dyn MarketDataAdapter>,
        source: Arc<dyn SnapshotSource>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = PipelineRegistry::shared(config.pending_buffer_capacity);
        let (desired, _) = watch::channel(BTreeSet::new());
        Ok(Self {
            config,
            adapter,
            source,
            registry,
            stats: Arc::new(RouterStats::default()),
            desired,
            refresh_lock: AsyncMutex::new(()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// A router feeding this manager's pipelines.
    pub fn router(&self) -> DiffRouter {
        DiffRouter::new(
            Arc::clone(&self.adapter),
            Arc::clone(&self.registry),
            Arc::clone(&self.stats),
        )
    }

    /// A stream multiplexer sharing this manager's adapter, so REST and
    /// stream sequences come from one clock.
    pub fn multiplexer(&self, ws_url: &str) -> StreamMultiplexer {
        StreamMultiplexer::new(ws_url, Arc::clone(&self.adapter), &self.config)
    }

    /// Router counters accumulated since the last stats flush.
    pub fn stats(&self) -> RouterCounts {
        self.stats.snapshot()
    }

    /// Read handle for a tracked symbol.
    pub fn handle(&self, trading_pair: &str) -> Option<OrderBookHandle> {
        registry::lock(&self.registry).handle(trading_pair)
    }

    pub fn tracked(&self) -> BTreeSet<String> {
        registry::lock(&self.registry).tracked()
    }

    /// The symbol set the stream should be subscribed to.
    pub fn desired(&self) -> watch::Receiver<BTreeSet<String>> {
        self.desired.subscribe()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Reconcile running pipelines with `available`.
    ///
    /// New symbols get a pipeline with a tracker and a refresher; their
    /// initial snapshots are fetched one after another, `snapshot_pacing`
    /// apart. Stale
    /// symbols are cancelled and released. Calling it again with the same
    /// set does nothing.
    pub async fn refresh<I, S>(&self, available: I) -> RefreshReport
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let _guard = self.refresh_lock.lock().await;
        let available: BTreeSet<String> = available.into_iter().map(Into::into).collect();
        let tracked = self.tracked();

        let started: Vec<String> = available.difference(&tracked).cloned().collect();
        let stopped: Vec<String> = tracked.difference(&available).cloned().collect();
        if started.is_empty() && stopped.is_empty() {
            return RefreshReport::default();
        }

        self.desired.send_replace(available.clone());
        registry::lock(&self.registry).set_wanted(&available);

        for pair in &stopped {
            let removed = registry::lock(&self.registry).destroy(pair);
            if let Some(pipeline) = removed {
                pipeline.shutdown().await;
                info!(symbol = %pair, "stopped tracking");
            }
        }

        let total = started.len();
        for (i, pair) in started.iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            self.start(pair).await;
            info!("Initialized order book for {pair}. {}/{total} completed.", i + 1);
            if i + 1 < total {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = time::sleep(self.config.snapshot_pacing) => {}
                }
            }
        }

        RefreshReport { started, stopped }
    }

    /// Create one pipeline, spawn its tasks, and wait for the first snapshot
    /// attempt.
    ///
    /// Creation, spawning and attaching happen under one registry lock, so a
    /// symbol is never registered without its tracker and refresher even if
    /// this future is dropped while waiting.
    async fn start(&self, pair: &str) {
        let first_attempt = {
            let mut pipelines = registry::lock(&self.registry);
            let Some(seed) = pipelines.create(pair, &self.cancel) else {
                return;
            };

            let tracker = SymbolTracker::new(
                seed.trading_pair.clone(),
                seed.inbound,
                seed.pending,
                Arc::clone(&seed.publisher),
                seed.last_applied,
                &self.config,
            );
            let refresher = SnapshotRefresher {
                trading_pair: seed.trading_pair,
                source: Arc::clone(&self.source),
                snapshots: seed.snapshots,
                publisher: seed.publisher,
                resync: seed.resync,
                config: self.config.clone(),
            };

            let (first_tx, first_rx) = oneshot::channel();
            let tracker_cancel = seed.cancel.clone();
            let tracker_task = tokio::spawn(async move {
                tracker.run(tracker_cancel).await;
            });
            let refresher_task = tokio::spawn(refresher.initialize(first_tx, seed.cancel));
            pipelines.attach(pair, tracker_task);
            pipelines.attach(pair, refresher_task);
            first_rx
        };

        if !first_attempt.await.unwrap_or(false) {
            warn!(symbol = %pair, "initial snapshot failed, retrying in background");
        }
    }

    /// Keep one stream connection alive until cancelled.
    ///
    /// Every reconnect resubscribes the desired set and forces a fresh
    /// snapshot for every tracked symbol.
    pub async fn run_stream(&self, multiplexer: StreamMultiplexer) {
        let router = self.router();
        let mut desired = self.desired.subscribe();
        let mut connections: u64 = 0;

        loop {
            match self
                .run_connection(&multiplexer, &router, &mut desired, connections)
                .await
            {
                Ok(()) => {
                    info!("stream stopped gracefully");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "stream connection lost");
                    if self.cancel.is_cancelled() {
                        return;
                    }
                    info!(delay = ?self.config.reconnect_backoff, "reconnecting");
                    tokio::select! {
                        _ = time::sleep(self.config.reconnect_backoff) => {}
                        _ = self.cancel.cancelled() => {
                            info!("shutdown during reconnect wait");
                            return;
                        }
                    }
                }
            }
            connections += 1;
        }
    }

    /// One connection lifetime. `Ok` only on cancellation.
    async fn run_connection(
        &self,
        multiplexer: &StreamMultiplexer,
        router: &DiffRouter,
        desired: &mut watch::Receiver<BTreeSet<String>>,
        previous_connections: u64,
    ) -> Result<()> {
        let mut conn = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            conn = multiplexer.connect() => conn?,
        };

        let initial: Vec<String> = desired.borrow_and_update().iter().cloned().collect();
        conn.subscribe(&initial).await?;
        if previous_connections > 0 {
            info!(symbols = initial.len(), "resubscribed, forcing snapshots");
            registry::lock(&self.registry).resync_all();
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    conn.disconnect().await;
                    return Ok(());
                }
                changed = desired.changed() => {
                    if changed.is_err() {
                        conn.disconnect().await;
                        return Ok(());
                    }
                    let wanted = desired.borrow_and_update().clone();
                    let current = conn.subscriptions().clone();
                    let added: Vec<String> = wanted.difference(&current).cloned().collect();
                    conn.subscribe(&added).await?;
                    for pair in current.difference(&wanted) {
                        conn.unsubscribe(pair).await?;
                    }
                }
                frame = conn.receive() => {
                    let frame = frame?;
                    router.route(&frame);
                }
            }
        }
    }

    /// Log and reset the router counters every `stats_interval`.
    pub async fn run_stats(&self) {
        let mut tick = time::interval(self.config.stats_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tick.tick() => {
                    let counts = self.stats.take();
                    info!(
                        accepted = counts.accepted,
                        rejected = counts.rejected,
                        queued = counts.queued,
                        malformed = counts.malformed,
                        evicted = counts.evicted,
                        tracked = self.tracked().len(),
                        "router stats"
                    );
                }
            }
        }
    }

    /// Cancel everything and wait for every pipeline task to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let _guard = self.refresh_lock.lock().await;
        let pipelines = registry::lock(&self.registry).drain();
        debug!(pipelines = pipelines.len(), "shutting down pipelines");
        for pipeline in pipelines {
            pipeline.shutdown().await;
        }
        info!("tracking stopped");
    }
}
