//! BitMEX `orderBookL2_25` table (side-tagged rows).

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{split_pair, FrameKind, MarketDataAdapter, RawFrame, SequenceClock, SnapshotRequest};
use crate::error::{Result, SyncError};
use crate::types::{BookMessage, DiffMessage, PriceLevel, SequenceId, SnapshotMessage};

pub const BITMEX_REST_URL: &str = "https://www.bitmex.com";
pub const BITMEX_WS_URL: &str = "wss://ws.bitmex.com/realtime";

const BOOK_TABLE: &str = "orderBookL2_25";

/// Quote currencies recognised when splitting an exchange symbol, longest first.
const QUOTES: [&str; 6] = ["USDT", "USDC", "USD", "EUR", "XBT", "ETH"];

/// One L2 row. `delete` rows may omit `size`.
#[derive(Debug, Clone, Deserialize)]
struct L2Row {
    symbol: String,
    side: String,
    #[serde(default)]
    size: Option<Decimal>,
    #[serde(default)]
    price: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowSide {
    Buy,
    Sell,
}

impl L2Row {
    fn side(&self) -> Result<RowSide> {
        match self.side.as_str() {
            "Buy" => Ok(RowSide::Buy),
            "Sell" => Ok(RowSide::Sell),
            other => Err(SyncError::Malformed(format!("bitmex side {other:?}"))),
        }
    }

    fn price(&self) -> Result<Decimal> {
        self.price
            .ok_or_else(|| SyncError::Malformed(format!("bitmex row without price for {}", self.symbol)))
    }

    /// Level for partial/insert/update rows.
    fn level(&self) -> Result<PriceLevel> {
        let size = self
            .size
            .ok_or_else(|| SyncError::Malformed(format!("bitmex row without size for {}", self.symbol)))?;
        Ok(PriceLevel::new(self.price()?, size))
    }
}

#[derive(Debug, Deserialize)]
struct TableFrame {
    table: String,
    action: String,
    #[serde(default)]
    data: Vec<L2Row>,
    #[serde(default)]
    filter: Option<Value>,
}

/// Levels collected for one symbol while walking a frame.
#[derive(Debug, Default)]
struct Collected {
    bids: Vec<PriceLevel>,
    asks: Vec<PriceLevel>,
}

#[derive(Debug, Default)]
pub struct BitmexAdapter {
    clock: SequenceClock,
}

impl BitmexAdapter {
    pub fn new() -> Self {
        warn!("bitmex L2 table has no sequence numbers; ordering by receipt time");
        Self::default()
    }

    fn topic(&self, trading_pair: &str) -> String {
        format!("{BOOK_TABLE}:{}", self.to_exchange_symbol(trading_pair))
    }

    /// Group rows by symbol, keeping first-seen symbol order.
    fn collect(
        &self,
        rows: &[L2Row],
        delete: bool,
    ) -> Result<Vec<(String, Collected)>> {
        let mut grouped: Vec<(String, Collected)> = Vec::new();
        for row in rows {
            let level = if delete {
                PriceLevel::new(row.price()?, Decimal::ZERO)
            } else {
                row.level()?
            };
            let side = row.side()?;
            let Some(pair) = self.from_exchange_symbol(&row.symbol) else {
                return Err(SyncError::Malformed(format!(
                    "bitmex symbol {} cannot be mapped",
                    row.symbol
                )));
            };
            let index = match grouped.iter().position(|(p, _)| *p == pair) {
                Some(i) => i,
                None => {
                    grouped.push((pair, Collected::default()));
                    grouped.len() - 1
                }
            };
            let entry = &mut grouped[index].1;
            match side {
                RowSide::Buy => entry.bids.push(level),
                RowSide::Sell => entry.asks.push(level),
            }
        }
        Ok(grouped)
    }
}

impl MarketDataAdapter for BitmexAdapter {
    fn name(&self) -> &'static str {
        "bitmex"
    }

    fn to_exchange_symbol(&self, trading_pair: &str) -> String {
        match split_pair(trading_pair) {
            Some((base, quote)) => {
                let base = if base == "BTC" { "XBT" } else { base };
                let quote = if quote == "BTC" { "XBT" } else { quote };
                format!("{base}{quote}")
            }
            None => trading_pair.to_string(),
        }
    }

    fn from_exchange_symbol(&self, exchange_symbol: &str) -> Option<String> {
        let quote = QUOTES
            .iter()
            .find(|q| exchange_symbol.len() > q.len() && exchange_symbol.ends_with(*q))?;
        let base = &exchange_symbol[..exchange_symbol.len() - quote.len()];
        let normalize = |s: &str| if s == "XBT" { "BTC".to_string() } else { s.to_string() };
        Some(format!("{}-{}", normalize(base), normalize(quote)))
    }

    fn snapshot_request(&self, trading_pair: &str, depth_limit: usize) -> SnapshotRequest {
        SnapshotRequest {
            path: "/api/v1/orderBook/L2".to_string(),
            query: vec![
                ("symbol".to_string(), self.to_exchange_symbol(trading_pair)),
                ("depth".to_string(), depth_limit.to_string()),
            ],
        }
    }

    fn parse_snapshot(
        &self,
        trading_pair: &str,
        body: &[u8],
        sequence: SequenceId,
    ) -> Result<SnapshotMessage> {
        let rows: Vec<L2Row> = serde_json::from_slice(body)
            .map_err(|e| SyncError::Malformed(format!("bitmex snapshot: {e}")))?;
        let expected = self.to_exchange_symbol(trading_pair);
        let mut bids = Vec::new();
        let mut asks = Vec::new();
        for row in rows.iter().filter(|r| r.symbol == expected) {
            let level = row.level()?;
            match row.side()? {
                RowSide::Buy => bids.push(level),
                RowSide::Sell => asks.push(level),
            }
        }
        Ok(SnapshotMessage {
            trading_pair: trading_pair.to_string(),
            bids,
            asks,
            sequence,
        })
    }

    fn subscribe_frames(&self, trading_pair: &str) -> Vec<String> {
        vec![json!({"op": "subscribe", "args": [self.topic(trading_pair)]}).to_string()]
    }

    fn unsubscribe_frames(&self, trading_pair: &str, _channel_id: Option<u64>) -> Vec<String> {
        vec![json!({"op": "unsubscribe", "args": [self.topic(trading_pair)]}).to_string()]
    }

    fn classify(&self, text: &str) -> FrameKind {
        if text == "pong" {
            return FrameKind::Heartbeat;
        }
        let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(text) else {
            return FrameKind::Data { channel_id: None };
        };
        if obj.contains_key("table") {
            return FrameKind::Data { channel_id: None };
        }
        if let Some(error) = obj.get("error").and_then(Value::as_str) {
            return FrameKind::Error(error.to_string());
        }
        if obj.get("success").and_then(Value::as_bool) == Some(true) {
            if let Some(topic) = obj.get("subscribe").and_then(Value::as_str) {
                let pair = topic
                    .split_once(':')
                    .and_then(|(_, symbol)| self.from_exchange_symbol(symbol));
                return match pair {
                    Some(trading_pair) => FrameKind::Subscribed {
                        channel_id: None,
                        trading_pair,
                    },
                    None => FrameKind::Error(format!("unmappable subscription: {topic}")),
                };
            }
            if obj.contains_key("unsubscribe") {
                return FrameKind::Unsubscribed { channel_id: None };
            }
        }
        FrameKind::Control
    }

    fn parse_stream_message(&self, frame: &RawFrame) -> Result<Vec<BookMessage>> {
        let parsed: TableFrame = serde_json::from_str(&frame.text)
            .map_err(|e| SyncError::Malformed(format!("bitmex frame: {e}")))?;
        if !parsed.table.starts_with("orderBookL2") {
            debug!(table = %parsed.table, "ignoring non-book table");
            return Ok(Vec::new());
        }

        let sequence = frame.received;
        match parsed.action.as_str() {
            "partial" => {
                let mut grouped = self.collect(&parsed.data, false)?;
                // An empty partial still resets the filtered symbol.
                if grouped.is_empty() {
                    let filtered = parsed
                        .filter
                        .as_ref()
                        .and_then(|f| f.get("symbol"))
                        .and_then(Value::as_str)
                        .and_then(|s| self.from_exchange_symbol(s));
                    if let Some(pair) = filtered {
                        grouped.push((pair, Collected::default()));
                    }
                }
                Ok(grouped
                    .into_iter()
                    .map(|(trading_pair, c)| {
                        BookMessage::Snapshot(SnapshotMessage {
                            trading_pair,
                            bids: c.bids,
                            asks: c.asks,
                            sequence,
                        })
                    })
                    .collect())
            }
            "insert" | "update" | "delete" => {
                let grouped = self.collect(&parsed.data, parsed.action == "delete")?;
                Ok(grouped
                    .into_iter()
                    .map(|(trading_pair, c)| {
                        BookMessage::Diff(DiffMessage {
                            trading_pair,
                            bids: c.bids,
                            asks: c.asks,
                            sequence,
                        })
                    })
                    .collect())
            }
            other => Err(SyncError::Malformed(format!("bitmex action {other:?}"))),
        }
    }

    fn next_sequence(&self) -> SequenceId {
        self.clock.next()
    }
}
