//! OrderBook - resolves agent requests into concrete operations and applies
//! the only three mutations allowed to touch cash or holdings: insert, trade,
//! cancel.

use std::ops::Deref;
use tracing::{debug, error, warn};

use crate::book::catalog::Catalog;
use crate::book::request::{Allotment, Op, ReqKind, Request};
use crate::book::security::{BookOrder, Instrument, InstrumentKind, Ladder, Order};
use crate::core::types::{LADDER_LEN, OrderKey, Price, PriceQty, Qty, Side};
use crate::core::{Error, Result};

/// Slot for a buy placed strictly inside the spread.
pub const SLOT_IMPROVED_BID: usize = LADDER_LEN;
/// Slot for a sell placed strictly inside the spread.
pub const SLOT_IMPROVED_ASK: usize = LADDER_LEN + 1;

/// Statistics slot for an order placed at `price` against `ladder`.
pub fn origin_slot(ladder: &Ladder, side: Side, price: Price) -> Option<usize> {
    if let Some(i) = ladder.index_of(price) {
        return Some(i);
    }
    let bid = ladder.best_bid().price;
    let ask = ladder.best_ask().price;
    if bid <= 0 || ask <= 0 {
        return None;
    }
    match side {
        Side::Buy if price > bid && price < ask => Some(SLOT_IMPROVED_BID),
        Side::Sell if price > bid && price < ask => Some(SLOT_IMPROVED_ASK),
        // beyond the visible depth: attribute to the outermost level
        Side::Buy if price < ladder.0[LADDER_LEN - 1].price => Some(LADDER_LEN - 1),
        Side::Sell if price > ladder.0[0].price => Some(0),
        _ => None,
    }
}

/// Cash a buy order releases when `qty` of it leaves the book.
///
/// The final release returns the whole remaining escrow so rounding of
/// partial fees never strands a unit.
fn escrow_release(kind: InstrumentKind, order: &Order, qty: Qty) -> i64 {
    if qty >= order.qty {
        return order.escrow;
    }
    let raw = order.price * qty;
    (raw + kind.buy_fee(raw)).min(order.escrow)
}

/// Catalog plus the operations that resolve and apply requests.
#[derive(Debug, Clone)]
pub struct OrderBook<T> {
    cat: Catalog<T>,
    next_id: u64,
}

impl<T> Deref for OrderBook<T> {
    type Target = Catalog<T>;

    fn deref(&self) -> &Catalog<T> {
        &self.cat
    }
}

impl<T: BookOrder> OrderBook<T> {
    pub fn new(balance: i64) -> Self {
        Self {
            cat: Catalog::new(balance),
            next_id: 1,
        }
    }

    pub fn add_instrument(&mut self, code: &str, kind: InstrumentKind, holdings: i64) {
        self.cat.add_instrument(code, kind, holdings);
    }

    pub fn catalog(&self) -> &Catalog<T> {
        &self.cat
    }

    pub(crate) fn set_tick(&mut self, tick: u32) {
        self.cat.tick = tick;
    }

    pub(crate) fn set_index(&mut self, index: f64) {
        self.cat.index = index;
    }

    pub(crate) fn latch_reference(&mut self) {
        self.cat.latch_reference();
    }

    /// Market-data access. Not for cash or holdings.
    pub(crate) fn instrument_mut(&mut self, code: &str) -> Option<&mut Instrument<T>> {
        self.cat.instruments.get_mut(code)
    }

    pub(crate) fn instruments_mut(&mut self) -> impl Iterator<Item = &mut Instrument<T>> {
        self.cat.instruments.values_mut()
    }

    /// Replace an instrument's market snapshot.
    pub fn set_quote(&mut self, code: &str, avg_trade_price: Price, traded_qty: Qty, raw: &Ladder) -> Result<()> {
        let inst = self
            .cat
            .instruments
            .get_mut(code)
            .ok_or_else(|| Error::UnknownInstrument(code.to_string()))?;
        inst.set_quote(avg_trade_price, traded_qty, raw);
        Ok(())
    }

    /// End-of-tick removal of orders whose quantity reached zero.
    pub fn sweep(&mut self) -> usize {
        self.cat.instruments.values_mut().map(|i| i.sweep()).sum()
    }

    pub fn order(&self, code: &str, key: &OrderKey) -> Option<&T> {
        self.cat.instruments.get(code)?.orders.get(key)
    }

    // ------------------------------------------------------------------
    // Request resolution
    // ------------------------------------------------------------------

    /// Resolve one request into concrete operations against the current
    /// state. Invalid or unaffordable requests are logged and resolve to
    /// nothing; this never fails.
    pub fn allot(&self, req: &Request) -> Allotment {
        match req.kind {
            ReqKind::CancelAll => return self.allot_cancel_all(),
            ReqKind::SellAll => return self.allot_sell_all(),
            _ => {}
        }

        let Some(inst) = self.cat.instruments.get(&req.code) else {
            warn!("unknown instrument {} in request '{}'", req.code, req);
            return Allotment::default();
        };

        let ops = match req.kind {
            ReqKind::Buy => self.allot_new(inst, Side::Buy, req),
            ReqKind::Sell => self.allot_new(inst, Side::Sell, req),
            ReqKind::CancelBuy => self.allot_cancel(inst, Side::Buy, req),
            ReqKind::CancelSell => self.allot_cancel(inst, Side::Sell, req),
            ReqKind::ModifyBuy => self.allot_modify(inst, Side::Buy, req),
            ReqKind::ModifySell => self.allot_modify(inst, Side::Sell, req),
            ReqKind::CancelAll | ReqKind::SellAll => unreachable!(),
        };
        Allotment { ops, exempt: false }
    }

    /// Clamp a limit price to the opposite best and check it is on the grid.
    fn clamp_price(inst: &Instrument<T>, side: Side, price: Price) -> Option<Price> {
        let opp = inst.ladder.opposite_best(side);
        let clamped = match side {
            Side::Buy if opp > 0 => price.min(opp),
            Side::Sell if opp > 0 => price.max(opp),
            _ => price,
        };
        if !inst.kind.is_valid_price(clamped) {
            warn!("{} {}: invalid tick price {}", side, inst.code, clamped);
            return None;
        }
        Some(clamped)
    }

    fn allot_new(&self, inst: &Instrument<T>, side: Side, req: &Request) -> Vec<Op> {
        let Some(price) = Self::clamp_price(inst, side, req.price) else {
            return vec![];
        };
        let max = match side {
            Side::Buy => inst.kind.max_affordable(price, self.cat.balance),
            Side::Sell => inst.idle_holdings,
        };
        let wanted = if req.qty == 0 { max } else { req.qty.min(max) };
        let qty = inst.kind.round_lot(wanted);
        if qty <= 0 {
            warn!("{} {} @{}: nothing to place (requested {}, max {})", side, inst.code, price, req.qty, max);
            return vec![];
        }
        vec![Op::Insert {
            code: inst.code.clone(),
            side,
            price,
            qty,
        }]
    }

    /// Orders of `side` at `price`, newest first, until `qty` is covered
    /// (0 = the whole level).
    fn cancel_plan(inst: &Instrument<T>, side: Side, price: Price, qty: Qty) -> Vec<(OrderKey, Qty)> {
        let mut remaining = if qty == 0 { Qty::MAX } else { qty };
        let mut plan = vec![];
        for key in inst.level_newest_first(side, price) {
            if remaining <= 0 {
                break;
            }
            let open = inst.orders[&key].order().qty;
            let take = open.min(remaining);
            plan.push((key, take));
            remaining -= take;
        }
        plan
    }

    fn allot_cancel(&self, inst: &Instrument<T>, side: Side, req: &Request) -> Vec<Op> {
        let plan = Self::cancel_plan(inst, side, req.price, req.qty);
        if plan.is_empty() {
            warn!("cancel {} {} @{}: no open order", side, inst.code, req.price);
        }
        plan.into_iter()
            .map(|(key, qty)| Op::Cancel {
                code: inst.code.clone(),
                key,
                qty,
            })
            .collect()
    }

    fn allot_modify(&self, inst: &Instrument<T>, side: Side, req: &Request) -> Vec<Op> {
        let plan = Self::cancel_plan(inst, side, req.price, req.qty);
        if plan.is_empty() {
            warn!("modify {} {} @{}: no open order", side, inst.code, req.price);
            return vec![];
        }
        let Some(new_price) = Self::clamp_price(inst, side, req.mod_price) else {
            return vec![];
        };
        if new_price == req.price {
            warn!("modify {} {} @{}: price unchanged", side, inst.code, req.price);
            return vec![];
        }

        let total: Qty = plan.iter().map(|(_, q)| q).sum();
        let new_qty = match side {
            Side::Buy => {
                let released: i64 = plan
                    .iter()
                    .map(|(key, q)| escrow_release(inst.kind, inst.orders[key].order(), *q))
                    .sum();
                let max = inst.kind.max_affordable(new_price, self.cat.balance + released);
                inst.kind.round_lot(total.min(max))
            }
            Side::Sell => inst.kind.round_lot(total),
        };
        if new_qty <= 0 {
            warn!("modify {} {} @{} -> {}: nothing to re-place", side, inst.code, req.price, new_price);
            return vec![];
        }

        let mut ops: Vec<Op> = plan
            .into_iter()
            .map(|(key, qty)| Op::Cancel {
                code: inst.code.clone(),
                key,
                qty,
            })
            .collect();
        ops.push(Op::Insert {
            code: inst.code.clone(),
            side,
            price: new_price,
            qty: new_qty,
        });
        ops
    }

    fn allot_cancel_all(&self) -> Allotment {
        let ops = self
            .cat
            .instruments
            .values()
            .flat_map(|inst| {
                inst.live_orders().map(move |(key, o)| Op::Cancel {
                    code: inst.code.clone(),
                    key: *key,
                    qty: o.order().qty,
                })
            })
            .collect();
        Allotment { ops, exempt: true }
    }

    fn allot_sell_all(&self) -> Allotment {
        let mut ops = vec![];
        for inst in self.cat.instruments.values() {
            let qty = inst.kind.round_lot(inst.idle_holdings);
            if qty <= 0 {
                continue;
            }
            let bid = inst.ladder.best_bid().price;
            if bid <= 0 {
                warn!("sell-all {}: no bid to sell into", inst.code);
                continue;
            }
            ops.push(Op::Insert {
                code: inst.code.clone(),
                side: Side::Sell,
                price: bid,
                qty,
            });
        }
        Allotment { ops, exempt: false }
    }

    // ------------------------------------------------------------------
    // Committed mutations
    // ------------------------------------------------------------------

    /// Place a new order: reserve cash (buy) or holdings (sell).
    pub fn apply_insert(&mut self, code: &str, side: Side, price: Price, qty: Qty) -> Result<OrderKey> {
        let cat = &mut self.cat;
        let inst = cat
            .instruments
            .get_mut(code)
            .ok_or_else(|| Error::UnknownInstrument(code.to_string()))?;

        let raw = price * qty;
        let escrow = match side {
            Side::Buy => {
                let cost = raw + inst.kind.buy_fee(raw);
                cat.balance -= cost;
                cost
            }
            Side::Sell => {
                inst.idle_holdings -= qty;
                0
            }
        };

        let key = OrderKey { price, id: self.next_id };
        self.next_id += 1;
        let order = Order {
            price,
            qty,
            side,
            origin: origin_slot(&inst.ladder, side, price),
            escrow,
        };
        debug!("insert {} {} {}@{} as {}", side, code, qty, price, key);
        inst.orders.insert(key, T::from_order(order));

        self.check_invariants(code);
        Ok(key)
    }

    /// Record a fill of `fill.qty` at `fill.price` (which may be better than
    /// the order's limit).
    pub fn apply_trade(&mut self, code: &str, key: OrderKey, fill: PriceQty) -> Result<()> {
        let cat = &mut self.cat;
        let inst = cat
            .instruments
            .get_mut(code)
            .ok_or_else(|| Error::UnknownInstrument(code.to_string()))?;
        let kind = inst.kind;
        let entry = inst
            .orders
            .get_mut(&key)
            .ok_or_else(|| Error::InvalidState(format!("trade on unknown order {code} {key}")))?;
        let order = entry.order_mut();

        if fill.qty > order.qty {
            error!("fill {} exceeds open qty {} on {} {}", fill.qty, order.qty, code, key);
        }
        let qty = fill.qty.min(order.qty);
        if qty <= 0 {
            return Ok(());
        }

        let notional = fill.price * qty;
        let fee = kind.fee(order.side, notional);
        match order.side {
            Side::Buy => {
                let release = escrow_release(kind, order, qty);
                order.escrow -= release;
                cat.balance += release - (notional + fee);
                inst.idle_holdings += qty;
            }
            Side::Sell => {
                cat.balance += notional - fee;
            }
        }
        order.qty -= qty;
        let (side, origin) = (order.side, order.origin);
        cat.stats.record_fill(origin, side, notional, qty, fee);
        debug!("fill {} {} {}@{} on {}", side, code, qty, fill.price, key);

        self.check_invariants(code);
        Ok(())
    }

    /// Cancel up to `qty` of an order, returning what it had reserved.
    /// Returns the quantity actually canceled.
    pub fn apply_cancel(&mut self, code: &str, key: OrderKey, qty: Qty) -> Result<Qty> {
        let cat = &mut self.cat;
        let inst = cat
            .instruments
            .get_mut(code)
            .ok_or_else(|| Error::UnknownInstrument(code.to_string()))?;
        let kind = inst.kind;
        let entry = inst
            .orders
            .get_mut(&key)
            .ok_or_else(|| Error::InvalidState(format!("cancel on unknown order {code} {key}")))?;
        let order = entry.order_mut();

        let qty = qty.min(order.qty);
        if qty <= 0 {
            return Ok(0);
        }
        match order.side {
            Side::Buy => {
                let release = escrow_release(kind, order, qty);
                order.escrow -= release;
                cat.balance += release;
            }
            Side::Sell => inst.idle_holdings += qty,
        }
        order.qty -= qty;
        debug!("cancel {} {} x{} on {}", order.side, code, qty, key);

        self.check_invariants(code);
        Ok(qty)
    }

    /// Accounting violations are logged, never fatal: a trading session with
    /// a transient negative is still recoverable.
    fn check_invariants(&self, code: &str) {
        if self.cat.balance < 0 {
            error!("🚨 negative cash balance {} after operation on {}", self.cat.balance, code);
        }
        if let Some(inst) = self.cat.instruments.get(code) {
            if inst.idle_holdings < 0 {
                error!("🚨 negative idle holdings {} on {}", inst.idle_holdings, code);
            }
            for (key, o) in &inst.orders {
                let o = o.order();
                if o.qty < 0 || o.escrow < 0 {
                    error!("🚨 order {} on {} went negative: qty={} escrow={}", key, code, o.qty, o.escrow);
                }
            }
        }
    }
}
