use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Per-symbol ordering key carried by every snapshot and diff.
///
/// Adapters decide where it comes from: an exchange-assigned counter or a
/// strictly increasing receipt clock (see [`crate::adapter::SequenceClock`]).
pub type SequenceId = u64;

/// Book side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    Ask,
}

/// One price level. `amount == 0` deletes the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub amount: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, amount: Decimal) -> Self {
        Self { price, amount }
    }

    /// Whether this level removes `price` from its side.
    pub fn is_delete(&self) -> bool {
        self.amount.is_zero()
    }
}

/// Full, authoritative replacement of both sides of one book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMessage {
    pub trading_pair: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub sequence: SequenceId,
}

/// Incremental upsert/delete of price levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffMessage {
    pub trading_pair: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub sequence: SequenceId,
}

impl DiffMessage {
    /// A diff touching a single level on one side.
    pub fn single(trading_pair: &str, side: Side, level: PriceLevel, sequence: SequenceId) -> Self {
        let (bids, asks) = match side {
            Side::Bid => (vec![level], Vec::new()),
            Side::Ask => (Vec::new(), vec![level]),
        };
        Self {
            trading_pair: trading_pair.to_string(),
            bids,
            asks,
            sequence,
        }
    }
}

/// Anything a tracker consumes from its inbound queue.
#[derive(Debug, Clone, PartialEq)]
pub enum BookMessage {
    Snapshot(SnapshotMessage),
    Diff(DiffMessage),
}

impl BookMessage {
    pub fn trading_pair(&self) -> &str {
        match self {
            BookMessage::Snapshot(s) => &s.trading_pair,
            BookMessage::Diff(d) => &d.trading_pair,
        }
    }

    pub fn sequence(&self) -> SequenceId {
        match self {
            BookMessage::Snapshot(s) => s.sequence,
            BookMessage::Diff(d) => d.sequence,
        }
    }
}
