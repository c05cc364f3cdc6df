//! Core types - integer prices and quantities, no floating point in the books

use serde::{Deserialize, Serialize};

/// Price in KRW. Always an integer multiple of the instrument tick.
pub type Price = i64;

/// Quantity in shares (or warrant units).
pub type Qty = i64;

/// Number of levels kept per side of the ladder.
pub const DEPTH: usize = 10;

/// Total ladder length: asks `0..DEPTH`, bids `DEPTH..2*DEPTH`.
pub const LADDER_LEN: usize = 2 * DEPTH;

/// Index of the best ask in the ladder.
pub const BEST_ASK: usize = DEPTH - 1;

/// Index of the best bid in the ladder.
pub const BEST_BID: usize = DEPTH;

/// Per-origin statistics slots: one per ladder index plus
/// "improved best bid" and "improved best ask".
pub const ORIGIN_SLOTS: usize = LADDER_LEN + 2;

/// A price and the quantity resting (or trading) at it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQty {
    pub price: Price,
    pub qty: Qty,
}

impl PriceQty {
    pub const fn new(price: Price, qty: Qty) -> Self {
        Self { price, qty }
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1 for buys, -1 for sells. Used for signed quantities on the wire.
    pub fn sign(self) -> i64 {
        match self {
            Side::Buy => 1,
            Side::Sell => -1,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Stable handle to a resting order: price first so a range scan yields one
/// price level, then placement sequence so a level iterates oldest to newest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderKey {
    pub price: Price,
    pub id: u64,
}

impl std::fmt::Display for OrderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}@{}", self.id, self.price)
    }
}
