//! Tracking lifecycle with a fake snapshot source.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use booksync::{
    BitfinexAdapter, BookMessage, DiffMessage, PriceLevel, Result, RouterCounts, Side,
    SnapshotMessage, SnapshotSource, SymbolHealth, SyncConfig, SyncError, TrackingManager,
};
use futures_util::{SinkExt, StreamExt};
use rust_decimal_macros::dec;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

/// Serves a one-level book per symbol, after `delay`, and counts calls.
#[derive(Default)]
struct FakeSource {
    calls: Mutex<HashMap<String, usize>>,
    failing: bool,
    delay: Duration,
}

impl FakeSource {
    fn calls(&self, pair: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(pair)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl SnapshotSource for FakeSource {
    async fn fetch(&self, trading_pair: &str) -> Result<SnapshotMessage> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(trading_pair.to_string())
            .or_default() += 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing {
            return Err(SyncError::SnapshotFetchFailed {
                symbol: trading_pair.into(),
                reason: "HTTP error 500".into(),
            });
        }
        Ok(SnapshotMessage {
            trading_pair: trading_pair.to_string(),
            bids: vec![PriceLevel::new(dec!(100), dec!(1))],
            asks: vec![PriceLevel::new(dec!(101), dec!(1))],
            sequence: 1,
        })
    }
}

fn test_config() -> SyncConfig {
    SyncConfig {
        snapshot_pacing: Duration::from_millis(1),
        reconnect_backoff: Duration::from_millis(50),
        ..SyncConfig::default()
    }
}

fn manager(source: Arc<FakeSource>) -> TrackingManager {
    TrackingManager::new(test_config(), Arc::new(BitfinexAdapter::default()), source).unwrap()
}

#[tokio::test]
async fn test_refresh_starts_and_stops_pipelines() {
    let source = Arc::new(FakeSource::default());
    let manager = manager(source.clone());

    let report = manager.refresh(["BTC-USD", "ETH-USD"]).await;
    assert_eq!(report.started, vec!["BTC-USD".to_string(), "ETH-USD".to_string()]);
    assert!(report.stopped.is_empty());
    assert_eq!(source.calls("BTC-USD"), 1);

    let mut btc = manager.handle("BTC-USD").unwrap();
    assert!(btc.wait_ready().await);
    assert_eq!(btc.best_bid(), Some(dec!(100)));
    assert_eq!(btc.mid_price(), Some(dec!(100.5)));
    assert_eq!(btc.health(), SymbolHealth::Healthy);

    let report = manager.refresh(["ETH-USD"]).await;
    assert_eq!(report.stopped, vec!["BTC-USD".to_string()]);
    assert!(report.started.is_empty());
    assert!(manager.handle("BTC-USD").is_none());
    // Readers keep the last published copy.
    assert!(btc.is_ready());
    assert_eq!(btc.best_ask(), Some(dec!(101)));

    manager.shutdown().await;
    assert!(manager.tracked().is_empty());
}

#[tokio::test]
async fn test_refresh_is_idempotent() {
    let source = Arc::new(FakeSource::default());
    let manager = manager(source.clone());

    manager.refresh(["BTC-USD"]).await;
    let again = manager.refresh(["BTC-USD"]).await;
    assert!(again.is_empty());
    assert_eq!(source.calls("BTC-USD"), 1);
    assert_eq!(manager.tracked().len(), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_failed_initial_snapshot_leaves_symbol_tracked() {
    let source = Arc::new(FakeSource {
        failing: true,
        ..FakeSource::default()
    });
    let manager = manager(source.clone());

    manager.refresh(["BTC-USD"]).await;
    let handle = manager.handle("BTC-USD").unwrap();
    assert!(!handle.is_ready());
    assert_ne!(handle.health(), SymbolHealth::Healthy);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_interrupted_refresh_still_initializes() {
    let source = Arc::new(FakeSource {
        delay: Duration::from_millis(300),
        ..FakeSource::default()
    });
    let manager = manager(source.clone());

    // Caller gives up while the first snapshot is still in flight.
    let first = tokio::time::timeout(Duration::from_millis(50), manager.refresh(["BTC-USD"])).await;
    assert!(first.is_err());
    assert!(manager.refresh(["BTC-USD"]).await.is_empty());

    let mut handle = manager.handle("BTC-USD").unwrap();
    let ready = tokio::time::timeout(Duration::from_secs(2), handle.wait_ready()).await;
    assert!(matches!(ready, Ok(true)));
    assert_eq!(handle.health(), SymbolHealth::Healthy);
    assert_eq!(source.calls("BTC-USD"), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let source = Arc::new(FakeSource::default());
    let manager = manager(source);
    manager.refresh(["BTC-USD", "ETH-USD"]).await;
    assert_eq!(manager.tracked().len(), 2);

    manager.shutdown().await;
    manager.shutdown().await;
    assert!(manager.tracked().is_empty());
    assert!(manager.cancel_token().is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_stats_loop_resets_router_counters() {
    let manager = Arc::new(manager(Arc::new(FakeSource::default())));
    let stats_task = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.run_stats().await })
    };

    // Nothing is tracked, so the diff is dropped and counted as rejected.
    manager.router().dispatch(BookMessage::Diff(DiffMessage::single(
        "BTC-USD",
        Side::Bid,
        PriceLevel::new(dec!(100), dec!(1)),
        1,
    )));
    assert_eq!(manager.stats().rejected, 1);

    tokio::time::sleep(manager.config().stats_interval + Duration::from_secs(1)).await;
    assert_eq!(manager.stats(), RouterCounts::default());

    manager.shutdown().await;
    stats_task.await.unwrap();
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let config = SyncConfig {
        replay_window_capacity: 0,
        ..SyncConfig::default()
    };
    let result = TrackingManager::new(
        config,
        Arc::new(BitfinexAdapter::default()),
        Arc::new(FakeSource::default()),
    );
    assert!(matches!(result, Err(SyncError::Config(_))));
}

#[tokio::test]
async fn test_stream_diffs_reach_book_and_reconnect_forces_snapshot() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    tokio::spawn(async move {
        // First session: ack, one update, then drop the connection.
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        let _subscribe = ws.next().await;
        ws.send(Message::Text(
            r#"{"event":"subscribed","channel":"book","chanId":5,"symbol":"tBTCUSD","prec":"P0"}"#
                .to_string(),
        ))
        .await
        .unwrap();
        ws.send(Message::Text("[5,[99.5,1,4]]".to_string()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = ws.close(None).await;
        drop(ws);

        // Second session stays open.
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let source = Arc::new(FakeSource::default());
    let manager = Arc::new(manager(source.clone()));
    manager.refresh(["BTC-USD"]).await;

    let multiplexer = manager.multiplexer(&url);
    let runner = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.run_stream(multiplexer).await })
    };

    let handle = manager.handle("BTC-USD").unwrap();
    let mut books = handle.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        books.wait_for(|book| book.bids().get(&dec!(99.5)) == Some(dec!(4))),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(manager.stats().accepted >= 1);

    // Reconnect triggers a forced re-snapshot.
    tokio::time::timeout(Duration::from_secs(5), async {
        while source.calls("BTC-USD") < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    manager.shutdown().await;
    runner.await.unwrap();
}
