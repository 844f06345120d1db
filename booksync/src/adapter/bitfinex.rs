//! Bitfinex v2 public book channel (sign-encoded rows).
//!
//! Rows are `[price, count, amount]`. `amount > 0` is a bid, `amount < 0` an
//! ask of size `|amount|`. On the stream, `count == 0` deletes the price and
//! `amount` is `1` (bid side) or `-1` (ask side).

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use super::{split_pair, FrameKind, MarketDataAdapter, RawFrame, SequenceClock, SnapshotRequest};
use crate::error::{Result, SyncError};
use crate::types::{BookMessage, DiffMessage, PriceLevel, SequenceId, Side, SnapshotMessage};

pub const BITFINEX_REST_URL: &str = "https://api-pub.bitfinex.com";
pub const BITFINEX_WS_URL: &str = "wss://api-pub.bitfinex.com/ws/2";

/// Book lengths the REST endpoint accepts.
const ALLOWED_LENGTHS: [usize; 3] = [1, 25, 100];

/// Aggregation precision requested on both REST and stream.
const PRECISION: &str = "P0";

/// One `[price, count, amount]` row.
#[derive(Debug, Clone, Copy, Deserialize)]
struct BookRow(Decimal, u64, Decimal);

impl BookRow {
    /// Side and level for a row that carries an amount (snapshot or upsert).
    fn level(&self) -> Option<(Side, PriceLevel)> {
        let BookRow(price, _, amount) = *self;
        if amount.is_zero() {
            return None;
        }
        let side = if amount.is_sign_negative() {
            Side::Ask
        } else {
            Side::Bid
        };
        Some((side, PriceLevel::new(price, amount.abs())))
    }
}

#[derive(Debug, Default)]
pub struct BitfinexAdapter {
    clock: SequenceClock,
}

impl BitfinexAdapter {
    pub fn new() -> Self {
        warn!("bitfinex book channel has no sequence numbers; ordering by receipt time");
        Self::default()
    }

    fn rows_to_snapshot(
        trading_pair: &str,
        rows: &[BookRow],
        sequence: SequenceId,
    ) -> SnapshotMessage {
        let mut bids = Vec::new();
        let mut asks = Vec::new();
        for (side, level) in rows.iter().filter_map(BookRow::level) {
            match side {
                Side::Bid => bids.push(level),
                Side::Ask => asks.push(level),
            }
        }
        SnapshotMessage {
            trading_pair: trading_pair.to_string(),
            bids,
            asks,
            sequence,
        }
    }

    fn row_to_diff(trading_pair: &str, row: BookRow, sequence: SequenceId) -> Result<DiffMessage> {
        let BookRow(price, count, amount) = row;
        if count > 0 {
            let (side, level) = row.level().ok_or_else(|| {
                SyncError::Malformed(format!("bitfinex upsert with zero amount at {price}"))
            })?;
            return Ok(DiffMessage::single(trading_pair, side, level, sequence));
        }
        let side = if amount == Decimal::ONE {
            Side::Bid
        } else if amount == Decimal::NEGATIVE_ONE {
            Side::Ask
        } else {
            return Err(SyncError::Malformed(format!(
                "bitfinex delete with amount {amount} at {price}"
            )));
        };
        Ok(DiffMessage::single(
            trading_pair,
            side,
            PriceLevel::new(price, Decimal::ZERO),
            sequence,
        ))
    }
}

impl MarketDataAdapter for BitfinexAdapter {
    fn name(&self) -> &'static str {
        "bitfinex"
    }

    fn to_exchange_symbol(&self, trading_pair: &str) -> String {
        match split_pair(trading_pair) {
            Some((base, quote)) if base.len() > 3 || quote.len() > 3 => {
                format!("t{base}:{quote}")
            }
            Some((base, quote)) => format!("t{base}{quote}"),
            None => format!("t{trading_pair}"),
        }
    }

    fn from_exchange_symbol(&self, exchange_symbol: &str) -> Option<String> {
        let raw = exchange_symbol.strip_prefix('t').unwrap_or(exchange_symbol);
        if let Some((base, quote)) = raw.split_once(':') {
            return Some(format!("{base}-{quote}"));
        }
        if raw.len() == 6 && raw.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Some(format!("{}-{}", &raw[..3], &raw[3..]));
        }
        None
    }

    fn snapshot_request(&self, trading_pair: &str, depth_limit: usize) -> SnapshotRequest {
        let len = ALLOWED_LENGTHS
            .iter()
            .copied()
            .find(|allowed| *allowed >= depth_limit)
            .unwrap_or(ALLOWED_LENGTHS[ALLOWED_LENGTHS.len() - 1]);
        SnapshotRequest {
            path: format!(
                "/v2/book/{}/{PRECISION}",
                self.to_exchange_symbol(trading_pair)
            ),
            query: vec![("len".to_string(), len.to_string())],
        }
    }

    fn parse_snapshot(
        &self,
        trading_pair: &str,
        body: &[u8],
        sequence: SequenceId,
    ) -> Result<SnapshotMessage> {
        let rows: Vec<BookRow> = serde_json::from_slice(body)
            .map_err(|e| SyncError::Malformed(format!("bitfinex snapshot: {e}")))?;
        Ok(Self::rows_to_snapshot(trading_pair, &rows, sequence))
    }

    fn subscribe_frames(&self, trading_pair: &str) -> Vec<String> {
        vec![json!({
            "event": "subscribe",
            "channel": "book",
            "prec": PRECISION,
            "symbol": self.to_exchange_symbol(trading_pair),
        })
        .to_string()]
    }

    fn unsubscribe_frames(&self, _trading_pair: &str, channel_id: Option<u64>) -> Vec<String> {
        match channel_id {
            Some(id) => vec![json!({"event": "unsubscribe", "chanId": id}).to_string()],
            None => Vec::new(),
        }
    }

    fn classify(&self, text: &str) -> FrameKind {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            return FrameKind::Data { channel_id: None };
        };
        match &value {
            Value::Object(obj) => match obj.get("event").and_then(Value::as_str) {
                Some("subscribed") => {
                    let channel_id = obj.get("chanId").and_then(Value::as_u64);
                    let pair = obj
                        .get("symbol")
                        .and_then(Value::as_str)
                        .and_then(|s| self.from_exchange_symbol(s));
                    match pair {
                        Some(trading_pair) => FrameKind::Subscribed {
                            channel_id,
                            trading_pair,
                        },
                        None => FrameKind::Error(format!("unmappable subscription: {text}")),
                    }
                }
                Some("unsubscribed") => FrameKind::Unsubscribed {
                    channel_id: obj.get("chanId").and_then(Value::as_u64),
                },
                Some("error") => FrameKind::Error(
                    obj.get("msg")
                        .and_then(Value::as_str)
                        .unwrap_or(text)
                        .to_string(),
                ),
                _ => FrameKind::Control,
            },
            Value::Array(items) => {
                let channel_id = items.first().and_then(Value::as_u64);
                match items.get(1) {
                    Some(Value::String(tag)) if tag == "hb" => FrameKind::Heartbeat,
                    // Checksum frames ("cs") carry no levels.
                    Some(Value::String(_)) => FrameKind::Control,
                    _ => FrameKind::Data { channel_id },
                }
            }
            _ => FrameKind::Data { channel_id: None },
        }
    }

    fn parse_stream_message(&self, frame: &RawFrame) -> Result<Vec<BookMessage>> {
        let trading_pair = frame
            .trading_pair
            .as_deref()
            .ok_or_else(|| SyncError::Malformed("bitfinex frame on unknown channel".into()))?;
        let value: Value = serde_json::from_str(&frame.text)
            .map_err(|e| SyncError::Malformed(format!("bitfinex frame: {e}")))?;
        let content = value
            .as_array()
            .and_then(|items| items.get(1))
            .ok_or_else(|| SyncError::Malformed(format!("bitfinex frame: {}", frame.text)))?;

        let Value::Array(items) = content else {
            return Err(SyncError::Malformed(format!("bitfinex frame: {}", frame.text)));
        };

        // `[[p,c,a], ...]` (or `[]`) is the channel's opening snapshot.
        if items.is_empty() || items.iter().all(Value::is_array) {
            let rows: Vec<BookRow> = serde_json::from_value(content.clone())
                .map_err(|e| SyncError::Malformed(format!("bitfinex snapshot: {e}")))?;
            return Ok(vec![BookMessage::Snapshot(Self::rows_to_snapshot(
                trading_pair,
                &rows,
                frame.received,
            ))]);
        }

        let row: BookRow = serde_json::from_value(content.clone())
            .map_err(|e| SyncError::Malformed(format!("bitfinex update: {e}")))?;
        Ok(vec![BookMessage::Diff(Self::row_to_diff(
            trading_pair,
            row,
            frame.received,
        )?)])
    }

    fn next_sequence(&self) -> SequenceId {
        self.clock.next()
    }
}
