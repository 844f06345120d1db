pub mod adapter;
pub mod book;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod lifecycle;
pub mod pending;
pub mod registry;
pub mod replay;
pub mod rest;
pub mod router;
pub mod stream;
pub mod tracker;
pub mod types;

// ---- Top-level re-exports for ergonomic usage ----

// Config + errors
pub use config::{ExchangeEndpoints, SyncConfig};
pub use error::{Result, SyncError};

// Wire adapters
pub use adapter::{BitfinexAdapter, BitmexAdapter, MarketDataAdapter, SequenceClock};

// Book state + read handle
pub use book::{ActiveOrderBook, BookSide, OrderBookHandle, SymbolHealth};
pub use types::{BookMessage, DiffMessage, PriceLevel, SequenceId, Side, SnapshotMessage};

// Buffers
pub use pending::PendingBuffer;
pub use replay::ReplayWindow;

// Pipeline stages
pub use fetcher::{SnapshotFetcher, SnapshotSource};
pub use lifecycle::{RefreshReport, TrackingManager};
pub use rest::HttpClient;
pub use router::{DiffRouter, RouteOutcome, RouterCounts, RouterStats};
pub use stream::{StreamConnection, StreamMultiplexer};
pub use tracker::{SnapshotRefresher, SymbolTracker, TrackerStats};
