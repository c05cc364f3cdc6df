//! Per-instrument price ladder and the tick/fee schedule of each instrument
//! kind.
//!
//! The ladder holds the best `DEPTH` asks and the best `DEPTH` bids in one
//! array. Prices strictly decrease with the index: index `BEST_ASK` is the
//! best ask and `BEST_BID` the best bid.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::types::{BEST_ASK, BEST_BID, DEPTH, LADDER_LEN, OrderKey, Price, PriceQty, Qty, Side};

/// Commission charged on both sides: 0.015%
const COMMISSION_BP: i64 = 15; // in units of 1e-5
/// Securities transaction tax on equity sells: 0.15%, floored
const TRANSACTION_TAX_BP: i64 = 150;
/// Rural special tax on equity sells: 0.15%, rounded
const RURAL_TAX_BP: i64 = 150;

fn rate(units: i64) -> Decimal {
    Decimal::new(units, 5)
}

fn round_half_up(d: Decimal) -> i64 {
    d.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(0)
}

fn floor(d: Decimal) -> i64 {
    d.floor().to_i64().unwrap_or(0)
}

/// Instrument class. Carries the tick-size and fee schedule; everything else
/// about an instrument is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentKind {
    /// Listed cash equity
    Equity,
    /// Equity-linked warrant
    Warrant,
    /// Exchange-traded fund tracking an index
    Tracker,
}

impl InstrumentKind {
    /// Tick size in effect for prices at or above `price` within its band.
    pub fn tick_size(self, price: Price) -> Price {
        match self {
            InstrumentKind::Equity => match price {
                p if p < 1_000 => 1,
                p if p < 5_000 => 5,
                p if p < 10_000 => 10,
                p if p < 50_000 => 50,
                p if p < 100_000 => 100,
                p if p < 500_000 => 500,
                _ => 1_000,
            },
            InstrumentKind::Warrant | InstrumentKind::Tracker => 5,
        }
    }

    /// Next valid price above `price`.
    pub fn tick_up(self, price: Price) -> Price {
        let aligned = self.align_down(price);
        if aligned < price {
            return aligned + self.tick_size(aligned);
        }
        price + self.tick_size(price)
    }

    /// Next valid price below `price`. Never goes below zero.
    pub fn tick_down(self, price: Price) -> Price {
        if price <= 0 {
            return 0;
        }
        let aligned = self.align_down(price);
        if aligned < price {
            return aligned;
        }
        (price - self.tick_size(price - 1)).max(0)
    }

    /// Largest valid price not above `price`.
    fn align_down(self, price: Price) -> Price {
        if price <= 0 {
            return 0;
        }
        let tick = self.tick_size(price);
        price - price % tick
    }

    pub fn is_valid_price(self, price: Price) -> bool {
        price > 0 && price % self.tick_size(price) == 0
    }

    /// Minimum tradable unit.
    pub fn lot(self) -> Qty {
        match self {
            InstrumentKind::Warrant => 10,
            InstrumentKind::Equity | InstrumentKind::Tracker => 1,
        }
    }

    /// Round a quantity down to whole lots.
    pub fn round_lot(self, qty: Qty) -> Qty {
        if qty <= 0 {
            return 0;
        }
        qty - qty % self.lot()
    }

    /// Fee paid on top of a buy of notional `raw`.
    pub fn buy_fee(self, raw: i64) -> i64 {
        if raw <= 0 {
            return 0;
        }
        round_half_up(Decimal::from(raw) * rate(COMMISSION_BP))
    }

    /// Fee and taxes withheld from a sell of notional `raw`.
    pub fn sell_fee(self, raw: i64) -> i64 {
        if raw <= 0 {
            return 0;
        }
        let amount = Decimal::from(raw);
        let commission = round_half_up(amount * rate(COMMISSION_BP));
        match self {
            InstrumentKind::Equity => {
                commission
                    + floor(amount * rate(TRANSACTION_TAX_BP))
                    + round_half_up(amount * rate(RURAL_TAX_BP))
            }
            InstrumentKind::Warrant | InstrumentKind::Tracker => commission,
        }
    }

    /// Fee for `raw` on the given side.
    pub fn fee(self, side: Side, raw: i64) -> i64 {
        match side {
            Side::Buy => self.buy_fee(raw),
            Side::Sell => self.sell_fee(raw),
        }
    }

    /// Largest lot-aligned quantity whose cost including the buy fee fits in
    /// `cash`.
    pub fn max_affordable(self, price: Price, cash: i64) -> Qty {
        if price <= 0 || cash <= 0 {
            return 0;
        }
        let cost = |q: Qty| price * q + self.buy_fee(price * q);
        let per_unit = Decimal::from(price) * (Decimal::ONE + rate(COMMISSION_BP));
        let mut q = self.round_lot(floor(Decimal::from(cash) / per_unit));
        let lot = self.lot();
        while q > 0 && cost(q) > cash {
            q -= lot;
        }
        while cost(q + lot) <= cash {
            q += lot;
        }
        q.max(0)
    }
}

/// Best-N bid and ask levels of one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ladder(pub [PriceQty; LADDER_LEN]);

impl Default for Ladder {
    fn default() -> Self {
        Ladder([PriceQty::default(); LADDER_LEN])
    }
}

impl Ladder {
    pub fn best_bid(&self) -> PriceQty {
        self.0[BEST_BID]
    }

    pub fn best_ask(&self) -> PriceQty {
        self.0[BEST_ASK]
    }

    /// Best price on the side opposite to `side` (what a `side` order trades
    /// against).
    pub fn opposite_best(&self, side: Side) -> Price {
        match side {
            Side::Buy => self.best_ask().price,
            Side::Sell => self.best_bid().price,
        }
    }

    /// Ladder index holding `price`, if any.
    pub fn index_of(&self, price: Price) -> Option<usize> {
        if price <= 0 {
            return None;
        }
        self.0.iter().position(|l| l.price == price)
    }

    /// Quantity displayed at `price` (0 if not on the ladder).
    pub fn qty_at(&self, price: Price) -> Qty {
        self.index_of(price).map(|i| self.0[i].qty).unwrap_or(0)
    }

    pub fn prices(&self) -> impl Iterator<Item = Price> + '_ {
        self.0.iter().map(|l| l.price)
    }

    pub fn quantities(&self) -> impl Iterator<Item = Qty> + '_ {
        self.0.iter().map(|l| l.qty)
    }

    /// Rebuild a contiguous ladder centred on the known best bid/ask.
    ///
    /// Raw exchange data may skip empty price levels; every level is
    /// reconstructed with tick arithmetic and quantities copied by exact
    /// price match. Requantizing an already requantized ladder with its own
    /// best bid/ask returns it unchanged.
    pub fn requantize(&self, kind: InstrumentKind, known_bid: Price, known_ask: Price) -> Ladder {
        let (bid, ask) = match (known_bid > 0, known_ask > 0) {
            (false, false) => return *self,
            (true, false) => (known_bid, kind.tick_up(known_bid)),
            (false, true) => (kind.tick_down(known_ask), known_ask),
            (true, true) if known_bid >= known_ask => (known_bid, kind.tick_up(known_bid)),
            (true, true) => (known_bid, known_ask),
        };

        let mut out = Ladder::default();
        let mut price = ask;
        for i in (0..DEPTH).rev() {
            out.0[i] = PriceQty::new(price, self.qty_at(price));
            price = kind.tick_up(price);
        }
        let mut price = bid;
        for i in DEPTH..LADDER_LEN {
            out.0[i] = PriceQty::new(price, if price > 0 { self.qty_at(price) } else { 0 });
            price = kind.tick_down(price);
        }
        out
    }

    /// Whether the ladder has a usable two-sided market.
    pub fn is_quoted(&self) -> bool {
        self.best_bid().price > 0 && self.best_ask().price > 0
    }
}

/// Warrant-only reference data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WarrantDetail {
    /// 'c' or 'p'
    pub call_put: char,
    /// Expiry as yyyymmdd
    pub expiry: u32,
    /// Price, delta, gamma, theta, vega, rho, implied vol, leverage
    pub greeks: [f64; 8],
}

/// Kind-specific market data published with the ladder.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Detail {
    #[default]
    None,
    Warrant(WarrantDetail),
    Tracker { nav_deviation: f64 },
}

/// Common access to the plain order fields, so one instrument record serves
/// both the live book (`Order`) and the simulated book (`SimOrder`).
pub trait BookOrder: Clone + std::fmt::Debug {
    fn from_order(order: Order) -> Self;
    fn order(&self) -> &Order;
    fn order_mut(&mut self) -> &mut Order;
}

/// A resting limit order of mine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub price: Price,
    pub qty: Qty,
    pub side: Side,
    /// Statistics slot (ladder index at insertion); None for orders not
    /// inserted during this session.
    pub origin: Option<usize>,
    /// Cash still reserved by this order (buys only).
    pub escrow: i64,
}

impl BookOrder for Order {
    fn from_order(order: Order) -> Self {
        order
    }
    fn order(&self) -> &Order {
        self
    }
    fn order_mut(&mut self) -> &mut Order {
        self
    }
}

/// One tracked instrument: market snapshot plus my position and orders.
#[derive(Debug, Clone)]
pub struct Instrument<T> {
    pub code: String,
    pub kind: InstrumentKind,
    /// Session VWAP of the market
    pub avg_trade_price: Price,
    /// Session volume of the market
    pub traded_qty: Qty,
    pub ladder: Ladder,
    /// Holdings not committed to sell orders
    pub idle_holdings: Qty,
    pub orders: BTreeMap<OrderKey, T>,
    pub detail: Detail,
}

impl<T: BookOrder> Instrument<T> {
    pub fn new(code: impl Into<String>, kind: InstrumentKind) -> Self {
        Self {
            code: code.into(),
            kind,
            avg_trade_price: 0,
            traded_qty: 0,
            ladder: Ladder::default(),
            idle_holdings: 0,
            orders: BTreeMap::new(),
            detail: match kind {
                InstrumentKind::Warrant => Detail::Warrant(WarrantDetail::default()),
                InstrumentKind::Tracker => Detail::Tracker { nav_deviation: 0.0 },
                InstrumentKind::Equity => Detail::None,
            },
        }
    }

    /// Replace the market snapshot, requantizing the raw ladder around its
    /// own best bid/ask.
    pub fn set_quote(&mut self, avg_trade_price: Price, traded_qty: Qty, raw: &Ladder) {
        self.avg_trade_price = avg_trade_price;
        self.traded_qty = traded_qty;
        self.ladder = raw.requantize(self.kind, raw.best_bid().price, raw.best_ask().price);
    }

    /// Live orders (qty > 0), keyed, in price then placement order.
    pub fn live_orders(&self) -> impl Iterator<Item = (&OrderKey, &T)> {
        self.orders.iter().filter(|(_, o)| o.order().qty > 0)
    }

    /// Keys of my `side` orders at `price`, newest first.
    pub fn level_newest_first(&self, side: Side, price: Price) -> Vec<OrderKey> {
        let lo = OrderKey { price, id: 0 };
        let hi = OrderKey { price, id: u64::MAX };
        self.orders
            .range(lo..=hi)
            .rev()
            .filter(|(_, o)| o.order().side == side && o.order().qty > 0)
            .map(|(k, _)| *k)
            .collect()
    }

    /// End-of-tick sweep of exhausted orders. Returns how many were removed.
    pub fn sweep(&mut self) -> usize {
        let before = self.orders.len();
        self.orders.retain(|_, o| o.order().qty > 0);
        before - self.orders.len()
    }
}
