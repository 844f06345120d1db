//! REST depth snapshots.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::adapter::MarketDataAdapter;
use crate::error::{Result, SyncError};
use crate::rest::HttpClient;
use crate::types::SnapshotMessage;

/// Anything that can produce a full book for one trading pair.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, trading_pair: &str) -> Result<SnapshotMessage>;
}

/// Fetches snapshots over REST and normalizes them through an adapter.
#[derive(Debug, Clone)]
pub struct SnapshotFetcher {
    http: HttpClient,
    adapter: Arc<dyn MarketDataAdapter>,
    depth_limit: usize,
    timeout: Duration,
}

impl SnapshotFetcher {
    pub fn new(
        rest_url: &str,
        adapter: Arc<dyn MarketDataAdapter>,
        depth_limit: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            http: HttpClient::new(rest_url),
            adapter,
            depth_limit,
            timeout,
        }
    }

    /// One REST request for `trading_pair`.
    ///
    /// The sequence is taken before the request goes out, so diffs received
    /// while it is in flight sort after the snapshot and get replayed.
    ///
    /// # Errors
    ///
    /// Every failure is reported as [`SyncError::SnapshotFetchFailed`].
    pub async fn fetch_snapshot(&self, trading_pair: &str) -> Result<SnapshotMessage> {
        let sequence = self.adapter.next_sequence();
        let request = self.adapter.snapshot_request(trading_pair, self.depth_limit);
        let fail = |e: SyncError| SyncError::SnapshotFetchFailed {
            symbol: trading_pair.to_string(),
            reason: e.to_string(),
        };

        let body = self
            .http
            .get_bytes(&request.path, &request.query, self.timeout)
            .await
            .map_err(fail)?;
        let snapshot = self
            .adapter
            .parse_snapshot(trading_pair, &body, sequence)
            .map_err(fail)?;

        debug!(
            symbol = %trading_pair,
            sequence = snapshot.sequence,
            bids = snapshot.bids.len(),
            asks = snapshot.asks.len(),
            "fetched snapshot"
        );
        Ok(snapshot)
    }
}

#[async_trait]
impl SnapshotSource for SnapshotFetcher {
    async fn fetch(&self, trading_pair: &str) -> Result<SnapshotMessage> {
        self.fetch_snapshot(trading_pair).await
    }
}

/// Time from `now` until the next multiple of `interval` since the Unix
/// epoch. An hourly interval lands on the top of the hour.
pub fn next_refresh_delay(now: DateTime<Utc>, interval: Duration) -> Duration {
    let step = interval.as_millis().max(1);
    let now_ms = now.timestamp_millis().max(0) as u128;
    let next = (now_ms / step + 1) * step;
    Duration::from_millis((next - now_ms) as u64)
}
