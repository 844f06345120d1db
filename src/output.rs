use std::io::Write;

use booksync::{ActiveOrderBook, PriceLevel, SequenceId, SnapshotMessage};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::AppError;

/// Best levels of one book, as printed by `track`.
#[derive(Debug, Serialize, PartialEq)]
pub struct TopOfBook<'a> {
    pub symbol: &'a str,
    pub bid: Option<Decimal>,
    pub bid_qty: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub ask_qty: Option<Decimal>,
    pub mid: Option<Decimal>,
    pub sequence: SequenceId,
    pub updated_ms: i64,
}

impl<'a> TopOfBook<'a> {
    pub fn from_book(book: &'a ActiveOrderBook) -> Self {
        let bid = book.bids().best_level();
        let ask = book.asks().best_level();
        Self {
            symbol: book.trading_pair(),
            bid: bid.map(|l| l.price),
            bid_qty: bid.map(|l| l.amount),
            ask: ask.map(|l| l.price),
            ask_qty: ask.map(|l| l.amount),
            mid: book.mid_price(),
            sequence: book.last_applied(),
            updated_ms: book.updated_at().timestamp_millis(),
        }
    }
}

/// Write one top-of-book line.
///
/// TSV columns: symbol, bid, bid_qty, ask, ask_qty, mid, sequence, updated_ms.
/// Missing values print as `-`.
pub fn write_top<W: Write>(
    top: &TopOfBook<'_>,
    json_mode: bool,
    buf: &mut String,
    writer: &mut W,
) -> Result<(), AppError> {
    buf.clear();

    if json_mode {
        buf.push_str(&serde_json::to_string(top)?);
    } else {
        buf.push_str(top.symbol);
        for value in [top.bid, top.bid_qty, top.ask, top.ask_qty, top.mid] {
            buf.push('\t');
            push_decimal(buf, value);
        }
        buf.push('\t');
        buf.push_str(&top.sequence.to_string());
        buf.push('\t');
        buf.push_str(&top.updated_ms.to_string());
    }

    buf.push('\n');
    writer.write_all(buf.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Write a full snapshot, bids best-first then asks best-first.
///
/// TSV rows are `side price amount`.
pub fn write_snapshot<W: Write>(
    snapshot: &SnapshotMessage,
    json_mode: bool,
    writer: &mut W,
) -> Result<(), AppError> {
    if json_mode {
        serde_json::to_writer(&mut *writer, snapshot)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        return Ok(());
    }

    let mut bids: Vec<&PriceLevel> = snapshot.bids.iter().collect();
    bids.sort_by(|a, b| b.price.cmp(&a.price));
    let mut asks: Vec<&PriceLevel> = snapshot.asks.iter().collect();
    asks.sort_by(|a, b| a.price.cmp(&b.price));

    for (side, levels) in [("bid", bids), ("ask", asks)] {
        for level in levels {
            writeln!(writer, "{side}\t{}\t{}", level.price, level.amount)?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn push_decimal(buf: &mut String, value: Option<Decimal>) {
    match value {
        Some(v) => buf.push_str(&v.normalize().to_string()),
        None => buf.push('-'),
    }
}
