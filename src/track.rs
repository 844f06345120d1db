use std::collections::HashMap;
use std::io::{self, BufWriter, Write};
use std::sync::Arc;
use std::time::Duration;

use booksync::{
    BitfinexAdapter, BitmexAdapter, ExchangeEndpoints, MarketDataAdapter, SequenceId,
    SnapshotFetcher, TrackingManager,
};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cli::{Exchange, ExchangeArgs, SnapshotArgs, TrackArgs};
use crate::error::AppError;
use crate::output::{self, TopOfBook};

fn build_adapter(exchange: Exchange) -> Arc<dyn MarketDataAdapter> {
    match exchange {
        Exchange::Bitfinex => Arc::new(BitfinexAdapter::new()),
        Exchange::Bitmex => Arc::new(BitmexAdapter::new()),
    }
}

fn endpoints(args: &ExchangeArgs) -> Result<ExchangeEndpoints, AppError> {
    Ok(ExchangeEndpoints::new(args.rest_url(), args.ws_url())?)
}

/// Run the full pipeline until cancelled, printing top of book on change.
pub async fn run_track(args: TrackArgs, cancel: CancellationToken) -> Result<(), AppError> {
    let endpoints = endpoints(&args.exchange)?;
    let config = args.sync_config();
    let adapter = build_adapter(args.exchange.exchange);
    let fetcher = SnapshotFetcher::new(
        &endpoints.rest_url,
        Arc::clone(&adapter),
        config.snapshot_depth_limit,
        config.rest_timeout,
    );
    let manager = Arc::new(TrackingManager::new(config, adapter, Arc::new(fetcher))?);

    info!(
        exchange = ?args.exchange.exchange,
        rest = %endpoints.rest_url,
        ws = %endpoints.ws_url,
        symbols = ?args.symbols,
        "starting tracking"
    );

    let stream_task = {
        let manager = Arc::clone(&manager);
        let multiplexer = manager.multiplexer(&endpoints.ws_url);
        tokio::spawn(async move { manager.run_stream(multiplexer).await })
    };
    let stats_task = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.run_stats().await })
    };

    tokio::select! {
        report = manager.refresh(args.symbols.iter().cloned()) => {
            info!(started = report.started.len(), "all order books initialized");
        }
        _ = cancel.cancelled() => {}
    }

    let result = if cancel.is_cancelled() {
        Ok(())
    } else {
        print_loop(&manager, &args, &cancel).await
    };

    manager.shutdown().await;
    let _ = stream_task.await;
    let _ = stats_task.await;
    info!("tracking stopped");
    result
}

/// Print a line per symbol whenever its book moved, at most once per interval.
async fn print_loop(
    manager: &TrackingManager,
    args: &TrackArgs,
    cancel: &CancellationToken,
) -> Result<(), AppError> {
    let stdout = io::stdout().lock();
    let mut writer = BufWriter::new(stdout);
    let mut buf = String::with_capacity(256);
    let mut printed: HashMap<String, SequenceId> = HashMap::new();

    let mut tick = time::interval(Duration::from_millis(args.print_interval_ms.max(1)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("shutdown requested");
                writer.flush()?;
                return Ok(());
            }
            _ = tick.tick() => {
                for symbol in &args.symbols {
                    let Some(handle) = manager.handle(symbol) else {
                        continue;
                    };
                    let book = handle.current();
                    if !book.is_ready() || printed.get(symbol) == Some(&book.last_applied()) {
                        continue;
                    }
                    printed.insert(symbol.clone(), book.last_applied());
                    output::write_top(&TopOfBook::from_book(&book), args.json, &mut buf, &mut writer)?;
                }
            }
        }
    }
}

/// Fetch and print one REST snapshot.
pub async fn run_snapshot(args: SnapshotArgs) -> Result<(), AppError> {
    let endpoints = endpoints(&args.exchange)?;
    let fetcher = SnapshotFetcher::new(
        &endpoints.rest_url,
        build_adapter(args.exchange.exchange),
        args.depth,
        Duration::from_secs(args.rest_timeout_secs),
    );

    let snapshot = match fetcher.fetch_snapshot(&args.symbol).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(symbol = %args.symbol, error = %e, "snapshot fetch failed");
            return Err(e.into());
        }
    };
    debug!(
        bids = snapshot.bids.len(),
        asks = snapshot.asks.len(),
        "snapshot received"
    );

    let stdout = io::stdout().lock();
    let mut writer = BufWriter::new(stdout);
    output::write_snapshot(&snapshot, args.json, &mut writer)
}
