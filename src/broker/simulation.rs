//! Simulated broker: replays recorded quotes and trades and decides which of
//! my resting orders would have filled.
//!
//! Every resting order tracks how much quantity is queued in front of it at
//! its price: `ahead_others` (other participants, capped by the displayed
//! depth) and `ahead_mine` (my own earlier orders at the same price). A fill
//! first eats through that queue and only the leftover reaches the order.
//!
//! Per tick and instrument:
//! 1. apply the newest quote, keeping the previous ladder for trade tagging
//! 2. refresh queue positions against the new ladder
//! 3. top-of-book depletion: new quantity appearing at an unchanged opposite
//!    top is handed to my top-of-book orders, shortest queue first
//! 4. trade-driven fills at the trade's level and one tick inside it, never
//!    more in total than the printed quantity
//! 5. gap correction: orders the market moved through fill at the new top

use serde::Serialize;
use std::collections::HashMap;
use std::ops::Bound;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::book::{BookOrder, Detail, Evaluation, Instrument, Ladder, Op, Order, OrderBook, Stats};
use crate::broker::replay::{QuoteRecord, Replay};
use crate::broker::{Broker, Interrupt, OpBudget, TickContext, TickStatus};
use crate::core::types::{OrderKey, Price, PriceQty, Qty, Side};
use crate::core::{Config, Error, Result};

/// Order plus its simulated queue position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimOrder {
    pub order: Order,
    pub ahead_others: Qty,
    pub ahead_mine: Qty,
}

impl BookOrder for SimOrder {
    fn from_order(order: Order) -> Self {
        Self {
            order,
            ahead_others: 0,
            ahead_mine: 0,
        }
    }
    fn order(&self) -> &Order {
        &self.order
    }
    fn order_mut(&mut self) -> &mut Order {
        &mut self.order
    }
}

/// Whether a `side` order at `price` is at or through the opposite top.
fn is_top_of_book(side: Side, price: Price, ladder: &Ladder) -> bool {
    match side {
        Side::Buy => {
            let ask = ladder.best_ask().price;
            ask > 0 && price >= ask
        }
        Side::Sell => {
            let bid = ladder.best_bid().price;
            bid > 0 && price <= bid
        }
    }
}

/// Which side initiated a trade at `price`, judged against the book it
/// traded into.
fn aggressor(ladder: &Ladder, price: Price) -> Option<Side> {
    let bid = ladder.best_bid().price;
    let ask = ladder.best_ask().price;
    if bid > 0 && price <= bid {
        Some(Side::Sell)
    } else if ask > 0 && price >= ask {
        Some(Side::Buy)
    } else {
        None
    }
}

/// Sort key putting the most aggressive `side` price first.
fn priority(side: Side, price: Price) -> Price {
    match side {
        Side::Buy => -price,
        Side::Sell => price,
    }
}

/// Opposite-top quantity already accounted for.
#[derive(Debug, Clone, Copy, Default)]
struct Mark {
    price: Price,
    qty: Qty,
}

/// Per instrument: marks on the best ask (for my buys) and the best bid (for
/// my sells).
#[derive(Debug, Clone, Copy, Default)]
struct Depletion {
    buy: Mark,
    sell: Mark,
}

/// Outcome of one `pop_queue`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Popped {
    /// Input quantity absorbed (queue ahead plus fill)
    used: Qty,
    filled: Qty,
}

/// End-of-session summary written as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub tick: u32,
    pub balance: i64,
    pub evaluation: Evaluation,
    pub total: i64,
    pub bal_init: Option<i64>,
    pub bal_ref: Option<i64>,
    pub profit_rate: Option<f64>,
    pub profit_rate_ref: Option<f64>,
    pub stats: Stats,
    pub skipped_lines: usize,
}

pub struct Simulation {
    book: OrderBook<SimOrder>,
    replay: Replay,
    budget: OpBudget,
    interrupt: Interrupt,
    depletion: HashMap<String, Depletion>,
    report: Option<PathBuf>,
    tapes_done: bool,
}

impl Simulation {
    pub fn new(book: OrderBook<SimOrder>, replay: Replay, max_ops_per_tick: usize) -> Self {
        Self {
            book,
            replay,
            budget: OpBudget::new(max_ops_per_tick),
            interrupt: Interrupt::new(),
            depletion: HashMap::new(),
            report: None,
            tapes_done: false,
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let sim = &cfg.simulation;
        let (Some(quotes), Some(trades)) = (&sim.quote_file, &sim.trade_file) else {
            return Err(Error::Config("simulation needs quote_file and trade_file".into()));
        };
        let replay = Replay::open(quotes, trades)?;
        let mut book = OrderBook::new(sim.initial_balance);
        for inst in &cfg.instruments {
            book.add_instrument(&inst.code, inst.kind, inst.holdings);
        }
        info!(
            "🧪 simulation: {} instrument(s), balance {}, {} ops/tick",
            cfg.instruments.len(),
            sim.initial_balance,
            cfg.session.max_ops_per_tick
        );
        Ok(Self::new(book, replay, cfg.session.max_ops_per_tick).with_report(sim.report.clone()))
    }

    /// Write the session report to `path` when the session ends.
    pub fn with_report(mut self, path: Option<PathBuf>) -> Self {
        self.report = path;
        self
    }

    pub fn report(&self) -> SessionReport {
        let evaluation = self.book.evaluate();
        SessionReport {
            tick: self.book.tick(),
            balance: self.book.balance(),
            evaluation,
            total: evaluation.total(),
            bal_init: self.book.bal_init(),
            bal_ref: self.book.bal_ref(),
            profit_rate: self.book.profit_rate(),
            profit_rate_ref: self.book.profit_rate_ref(),
            stats: self.book.stats().clone(),
            skipped_lines: self.replay.quotes.skipped() + self.replay.trades.skipped(),
        }
    }

    fn write_report(&self) -> Result<()> {
        let Some(path) = &self.report else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&self.report())?;
        std::fs::write(path, json)?;
        info!("📝 session report written to {}", path.display());
        Ok(())
    }

    fn instrument_mut(&mut self, code: &str) -> Result<&mut Instrument<SimOrder>> {
        self.book
            .instrument_mut(code)
            .ok_or_else(|| Error::UnknownInstrument(code.to_string()))
    }

    // ------------------------------------------------------------------
    // Order lifecycle
    // ------------------------------------------------------------------

    /// Insert and stamp the queue position: displayed depth at the price
    /// ahead of it (none at the top of book) and my earlier orders there.
    fn insert(&mut self, code: &str, side: Side, price: Price, qty: Qty) -> Result<OrderKey> {
        let key = self.book.apply_insert(code, side, price, qty)?;
        let inst = self.instrument_mut(code)?;
        let ahead_others = if is_top_of_book(side, price, &inst.ladder) {
            0
        } else {
            inst.ladder.qty_at(price)
        };
        let ahead_mine: Qty = inst
            .orders
            .range(OrderKey { price, id: 0 }..key)
            .filter(|(_, o)| o.order.side == side)
            .map(|(_, o)| o.order.qty)
            .sum();
        if let Some(o) = inst.orders.get_mut(&key) {
            o.ahead_others = ahead_others;
            o.ahead_mine = ahead_mine;
        }
        Ok(key)
    }

    fn cancel(&mut self, code: &str, key: OrderKey, qty: Qty) -> Result<()> {
        let canceled = self.book.apply_cancel(code, key, qty)?;
        if canceled > 0 {
            let inst = self.instrument_mut(code)?;
            let side = inst.orders.get(&key).map(|o| o.order.side);
            if let Some(side) = side {
                trim_queue_ahead(inst, key, side, canceled);
            }
        }
        Ok(())
    }

    /// Consume `qty` of market flow against one order: the queue in front of
    /// it first, then the order itself at `price`.
    fn pop_queue(&mut self, code: &str, key: OrderKey, qty: Qty, price: Price) -> Result<Popped> {
        let inst = self.instrument_mut(code)?;
        let o = inst
            .orders
            .get_mut(&key)
            .ok_or_else(|| Error::InvalidState(format!("pop on unknown order {code} {key}")))?;

        let mut left = qty.max(0);
        let others = left.min(o.ahead_others.max(0));
        o.ahead_others -= others;
        left -= others;
        let mine = left.min(o.ahead_mine.max(0));
        o.ahead_mine -= mine;
        left -= mine;
        let filled = left.min(o.order.qty.max(0));

        if filled > 0 {
            self.book.apply_trade(code, key, PriceQty::new(price, filled))?;
        }
        Ok(Popped {
            used: others + mine + filled,
            filled,
        })
    }

    // ------------------------------------------------------------------
    // Matching
    // ------------------------------------------------------------------

    fn match_instrument(&mut self, code: &str, quote: Option<(Price, Qty, Ladder)>, trades: &[PriceQty]) -> Result<usize> {
        let prev = self.instrument_mut(code)?.ladder;
        if let Some((avg, traded, raw)) = quote {
            self.book.set_quote(code, avg, traded, &raw)?;
        }
        let ladder = self.instrument_mut(code)?.ladder;
        if !ladder.is_quoted() {
            if !trades.is_empty() {
                debug!("{}: {} trade(s) before any two-sided quote", code, trades.len());
            }
            return Ok(0);
        }

        self.refresh(code, &ladder)?;

        let tag_against = if prev.is_quoted() { prev } else { ladder };
        let mut filled = 0;
        filled += self.deplete(code, Side::Buy, ladder.best_ask())?;
        filled += self.deplete(code, Side::Sell, ladder.best_bid())?;
        for t in trades {
            filled += self.trade_fill(code, *t, aggressor(&tag_against, t.price), &ladder)?;
        }
        filled += self.gap_correct(code, &ladder)?;
        Ok(filled)
    }

    /// Others may have canceled: never believe more is ahead than is shown.
    /// Top-of-book orders are handled by depletion and have nothing ahead.
    fn refresh(&mut self, code: &str, ladder: &Ladder) -> Result<()> {
        let inst = self.instrument_mut(code)?;
        for o in inst.orders.values_mut().filter(|o| o.order.qty > 0) {
            if is_top_of_book(o.order.side, o.order.price, ladder) {
                o.ahead_others = 0;
            } else {
                o.ahead_others = o.ahead_others.min(ladder.qty_at(o.order.price));
            }
        }
        Ok(())
    }

    /// Hand fresh opposite-top quantity to my top-of-book `side` orders.
    fn deplete(&mut self, code: &str, side: Side, top: PriceQty) -> Result<usize> {
        let marks = self.depletion.entry(code.to_string()).or_default();
        let mark = match side {
            Side::Buy => &mut marks.buy,
            Side::Sell => &mut marks.sell,
        };
        let fresh = if top.price > 0 && mark.price == top.price {
            (top.qty - mark.qty).max(0)
        } else {
            0
        };
        *mark = Mark {
            price: top.price,
            qty: top.qty,
        };
        if fresh == 0 {
            return Ok(0);
        }

        let inst = self.instrument_mut(code)?;
        let ladder = inst.ladder;
        let mut queue: Vec<(Price, Qty, OrderKey)> = inst
            .live_orders()
            .filter(|(_, o)| o.order.side == side && is_top_of_book(side, o.order.price, &ladder))
            .map(|(k, o)| (priority(side, k.price), o.ahead_others + o.ahead_mine, *k))
            .collect();
        queue.sort();
        let keys: Vec<OrderKey> = queue.into_iter().map(|(_, _, k)| k).collect();

        let filled = self.flow_through(code, &keys, fresh, Some(top.price))?;
        debug!("{} {} depletion: {} fresh at {}, {} order(s) filled", code, side, fresh, top.price, filled);
        Ok(filled)
    }

    /// Pass `qty` of market flow down my `keys`, grouped by price in
    /// priority order. Orders at one price stand in the same queue, so each
    /// sees the whole remainder and the level absorbs the deepest position
    /// reached. Fills happen at `fill_price`, or at each order's own limit.
    fn flow_through(&mut self, code: &str, keys: &[OrderKey], qty: Qty, fill_price: Option<Price>) -> Result<usize> {
        let mut left = qty;
        let mut filled = 0;
        for level in keys.chunk_by(|a, b| a.price == b.price) {
            if left <= 0 {
                break;
            }
            let mut used = 0;
            for key in level {
                let p = self.pop_queue(code, *key, left, fill_price.unwrap_or(key.price))?;
                used = used.max(p.used);
                if p.filled > 0 {
                    filled += 1;
                }
            }
            left -= used;
        }
        Ok(filled)
    }

    /// A trade at `t.price` reaches my orders at that price and one tick
    /// inside it. Trades initiated from my own side only reach orders at the
    /// top of book.
    fn trade_fill(&mut self, code: &str, t: PriceQty, initiator: Option<Side>, ladder: &Ladder) -> Result<usize> {
        let inst = self.instrument_mut(code)?;
        let kind = inst.kind;
        let mut buys = vec![];
        let mut sells = vec![];
        for (key, o) in inst.live_orders() {
            let (side, price) = (o.order.side, o.order.price);
            let top = is_top_of_book(side, price, ladder);
            match side {
                Side::Buy if price >= t.price && price <= kind.tick_up(t.price) => {
                    if initiator != Some(Side::Buy) || top {
                        buys.push(*key);
                    }
                }
                Side::Sell if price <= t.price && price >= kind.tick_down(t.price) => {
                    if initiator != Some(Side::Sell) || top {
                        sells.push(*key);
                    }
                }
                _ => {}
            }
        }
        buys.sort_by_key(|k| (priority(Side::Buy, k.price), k.id));
        sells.sort_by_key(|k| (priority(Side::Sell, k.price), k.id));

        Ok(self.flow_through(code, &buys, t.qty, None)? + self.flow_through(code, &sells, t.qty, None)?)
    }

    /// Orders the top moved through fill in full at the new top.
    fn gap_correct(&mut self, code: &str, ladder: &Ladder) -> Result<usize> {
        let ask = ladder.best_ask().price;
        let bid = ladder.best_bid().price;
        let stale: Vec<(OrderKey, PriceQty)> = self
            .instrument_mut(code)?
            .live_orders()
            .filter_map(|(key, o)| match o.order.side {
                Side::Buy if ask > 0 && o.order.price > ask => Some((*key, PriceQty::new(ask, o.order.qty))),
                Side::Sell if bid > 0 && o.order.price < bid => Some((*key, PriceQty::new(bid, o.order.qty))),
                _ => None,
            })
            .collect();

        for (key, fill) in &stale {
            debug!("{} gap fill {} {}@{}", code, key, fill.qty, fill.price);
            self.book.apply_trade(code, *key, *fill)?;
        }
        Ok(stale.len())
    }
}

/// My cancel at a price shortens the queue for every order of mine placed
/// after it at that price.
fn trim_queue_ahead(inst: &mut Instrument<SimOrder>, key: OrderKey, side: Side, qty: Qty) {
    let hi = OrderKey {
        price: key.price,
        id: u64::MAX,
    };
    for o in inst
        .orders
        .range_mut((Bound::Excluded(key), Bound::Included(hi)))
        .map(|(_, o)| o)
        .filter(|o| o.order.side == side)
    {
        o.ahead_mine = (o.ahead_mine - qty).max(0);
    }
}

impl Broker for Simulation {
    type Order = SimOrder;

    fn book(&self) -> &OrderBook<SimOrder> {
        &self.book
    }

    fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    fn advance_tick(&mut self, ctx: &TickContext) -> Result<TickStatus> {
        let swept = self.book.sweep();
        self.budget.reset();
        self.book.set_tick(ctx.tick);

        if ctx.past_close() {
            let r = self.report();
            info!(
                "💰 final balance {} total {} (profit {:?}), bought {} sold {} fees {}",
                r.balance, r.total, r.profit_rate, r.stats.sum_buy, r.stats.sum_sell, r.stats.sum_fee
            );
            self.write_report()?;
            return Ok(TickStatus::SessionEnd);
        }

        let quotes = self.replay.quotes.take_until(ctx.boundary)?;
        let trades = self.replay.trades.take_until(ctx.boundary)?;
        let (n_quotes, n_trades) = (quotes.len(), trades.len());

        let mut depth: HashMap<String, (Price, Qty, Ladder)> = HashMap::new();
        for (_, rec) in quotes {
            match rec {
                QuoteRecord::Depth {
                    code,
                    avg_trade_price,
                    traded_qty,
                    ladder,
                } => {
                    depth.insert(code, (avg_trade_price, traded_qty, ladder));
                }
                QuoteRecord::Index(index) => self.book.set_index(index),
                QuoteRecord::Warrant { code, detail } => {
                    if let Some(inst) = self.book.instrument_mut(&code) {
                        inst.detail = Detail::Warrant(detail);
                    }
                }
                QuoteRecord::Nav { code, deviation } => {
                    if let Some(inst) = self.book.instrument_mut(&code) {
                        inst.detail = Detail::Tracker { nav_deviation: deviation };
                    }
                }
            }
        }
        let mut prints: HashMap<String, Vec<PriceQty>> = HashMap::new();
        for (_, t) in trades {
            prints.entry(t.code).or_default().push(t.fill);
        }

        let codes: Vec<String> = self.book.instruments().map(|i| i.code.clone()).collect();
        let mut filled = 0;
        for code in &codes {
            let quote = depth.remove(code);
            let trades = prints.remove(code).unwrap_or_default();
            filled += self.match_instrument(code, quote, &trades)?;
        }

        if self.book.bal_init().is_none() && self.book.instruments().all(|i| i.ladder.is_quoted()) {
            self.book.latch_reference();
            info!("📌 reference evaluation latched: {:?}", self.book.bal_init());
        }

        if !self.tapes_done && self.replay.quotes.is_exhausted()? && self.replay.trades.is_exhausted()? {
            self.tapes_done = true;
            warn!("replay tapes exhausted at tick {}, before the session close", ctx.tick);
        }
        debug!(swept, quotes = n_quotes, trades = n_trades, filled, "tick replayed");
        Ok(TickStatus::Continue)
    }

    fn reserve(&mut self, n: usize) -> Result<()> {
        self.budget.reserve(n)
    }

    fn execute(&mut self, op: &Op) -> Result<()> {
        match op {
            Op::Insert { code, side, price, qty } => self.insert(code, *side, *price, *qty).map(|_| ()),
            Op::Cancel { code, key, qty } => self.cancel(code, *key, *qty),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::InstrumentKind;
    use crate::broker::replay::format_depth_line;
    use crate::broker::{MsgInSummary, Session, SessionClock};
    use crate::core::types::{BEST_ASK, BEST_BID};

    const CODE: &str = "005930";
    const OPEN: u32 = 9 * 3600;
    const CASH: i64 = 1_000_000;
    const FEE: InstrumentKind = InstrumentKind::Equity;

    fn quote(t: u32, ask: (Price, Qty), bid: (Price, Qty)) -> String {
        let mut l = Ladder::default();
        l.0[BEST_ASK] = PriceQty::new(ask.0, ask.1);
        l.0[BEST_BID] = PriceQty::new(bid.0, bid.1);
        format_depth_line(t, CODE, 0, 0, &l)
    }

    fn session(quotes: &[String], trades: &str, max_ops: usize, close_after: u32) -> Session<Simulation> {
        session_with(Replay::from_strings(&quotes.join("\n"), trades), max_ops, close_after)
    }

    fn session_with(replay: Replay, max_ops: usize, close_after: u32) -> Session<Simulation> {
        let mut book = OrderBook::new(CASH);
        book.add_instrument(CODE, InstrumentKind::Equity, 0);
        let clock = SessionClock {
            open: OPEN,
            close: OPEN + close_after,
            tick_secs: 10,
        };
        Session::new(Simulation::new(book, replay, max_ops), clock)
    }

    fn step(s: &mut Session<Simulation>, msg: &str) -> MsgInSummary {
        assert_eq!(s.advance().unwrap(), TickStatus::Continue);
        s.build_msg_out().unwrap();
        s.apply_msg_in(msg).unwrap()
    }

    fn orders(s: &Session<Simulation>) -> Vec<SimOrder> {
        s.broker().book().instrument(CODE).unwrap().orders.values().cloned().collect()
    }

    fn balance(s: &Session<Simulation>) -> i64 {
        s.broker().book().balance()
    }

    #[test]
    fn test_buy_trade_cancel_round_trip() {
        let quotes = [quote(OPEN, (10_000, 50), (9_990, 40))];
        let trades = format!("{} {CODE} 10000 3\n", OPEN + 12);
        let mut s = session(&quotes, &trades, 20, 600);

        step(&mut s, "b 005930 10000 5\n\n");
        assert_eq!(balance(&s), CASH - (50_000 + FEE.buy_fee(50_000)));
        let o = &orders(&s)[0];
        assert_eq!((o.ahead_others, o.ahead_mine), (0, 0));

        step(&mut s, "\n");
        let o = &orders(&s)[0];
        assert_eq!(o.order.qty, 2);
        assert_eq!((o.ahead_others, o.ahead_mine), (0, 0));
        assert_eq!(s.broker().book().instrument(CODE).unwrap().idle_holdings, 3);

        let before = balance(&s);
        let summary = step(&mut s, "cb 005930 10000 0\n\n");
        assert_eq!(summary.executed, 1);
        assert_eq!(balance(&s) - before, 20_000 + FEE.buy_fee(20_000));
        assert_eq!(balance(&s), CASH - (30_000 + FEE.buy_fee(30_000)));
    }

    #[test]
    fn test_gap_down_fills_at_new_ask() {
        let quotes = [
            quote(OPEN, (10_000, 50), (9_990, 40)),
            quote(OPEN + 15, (9_950, 10), (9_940, 20)),
        ];
        let mut s = session(&quotes, "", 20, 600);
        step(&mut s, "b 005930 9990 4\n\n");
        assert_eq!(orders(&s)[0].ahead_others, 40);

        step(&mut s, "\n");
        assert_eq!(orders(&s)[0].order.qty, 0);
        assert_eq!(balance(&s), CASH - (39_800 + FEE.buy_fee(39_800)));
        assert_eq!(s.broker().book().stats().sum_buy, 39_800);
    }

    #[test]
    fn test_queue_ahead_drains_before_fill() {
        let quotes = [quote(OPEN, (10_000, 50), (9_990, 40))];
        let trades = format!("{t} {CODE} 9990 30\n{t} {CODE} 9990 12\n", t = OPEN + 12);
        let mut s = session(&quotes, &trades, 20, 600);
        step(&mut s, "b 005930 9990 5\n\n");
        step(&mut s, "\n");
        let o = &orders(&s)[0];
        assert_eq!(o.ahead_others, 0);
        assert_eq!(o.order.qty, 3);
    }

    #[test]
    fn test_my_earlier_orders_queue_ahead() {
        let quotes = [quote(OPEN, (10_000, 50), (9_990, 40))];
        let trades = format!("{} {CODE} 9990 45\n", OPEN + 12);
        let mut s = session(&quotes, &trades, 20, 600);
        step(&mut s, "b 005930 9990 5\nb 005930 9990 3\n\n");
        let os = orders(&s);
        assert_eq!((os[0].ahead_mine, os[1].ahead_mine), (0, 5));

        step(&mut s, "\n");
        let os = orders(&s);
        assert_eq!(os[0].order.qty, 0);
        assert_eq!(os[1].order.qty, 3);
        assert_eq!((os[1].ahead_others, os[1].ahead_mine), (0, 0));
    }

    #[test]
    fn test_cancel_trims_later_queue() {
        let quotes = [quote(OPEN, (10_000, 50), (9_990, 40))];
        let mut s = session(&quotes, "", 20, 600);
        step(&mut s, "b 005930 9990 5\nb 005930 9990 3\n\n");
        let first = *s.broker().book().instrument(CODE).unwrap().orders.keys().next().unwrap();

        // cancel part of the older order directly
        let mut sim = s.into_broker();
        sim.execute(&Op::Cancel { code: CODE.into(), key: first, qty: 2 }).unwrap();
        let os: Vec<SimOrder> = sim.book().instrument(CODE).unwrap().orders.values().cloned().collect();
        assert_eq!(os[0].order.qty, 3);
        assert_eq!(os[1].ahead_mine, 3);
    }

    #[test]
    fn test_trades_two_ticks_away_ignored() {
        let quotes = [quote(OPEN, (10_000, 50), (9_990, 40))];
        let trades = format!("{t} {CODE} 9960 100\n{t} {CODE} 9970 2\n", t = OPEN + 12);
        let mut s = session(&quotes, &trades, 20, 600);
        step(&mut s, "b 005930 9980 5\n\n");
        assert_eq!(orders(&s)[0].ahead_others, 0);
        step(&mut s, "\n");
        // 9960 is two ticks below; only the 9970 print reaches the order
        assert_eq!(orders(&s)[0].order.qty, 3);
    }

    #[test]
    fn test_depletion_feeds_top_of_book() {
        let quotes = [
            quote(OPEN, (10_000, 50), (9_990, 40)),
            quote(OPEN + 15, (10_000, 53), (9_990, 40)),
        ];
        let mut s = session(&quotes, "", 20, 600);
        step(&mut s, "b 005930 10000 5\n\n");
        step(&mut s, "\n");
        assert_eq!(orders(&s)[0].order.qty, 2);
    }

    #[test]
    fn test_depletion_shared_by_my_orders_at_one_price() {
        let quotes = [
            quote(OPEN, (10_000, 50), (9_990, 40)),
            quote(OPEN + 15, (10_000, 58), (9_990, 40)),
            quote(OPEN + 25, (10_000, 61), (9_990, 40)),
        ];
        let mut s = session(&quotes, "", 20, 600);
        step(&mut s, "b 005930 10000 5\nb 005930 10000 3\nb 005930 10000 4\n\n");
        let os = orders(&s);
        assert_eq!((os[1].ahead_mine, os[2].ahead_mine), (5, 8));

        // 8 fresh covers the first two exactly
        step(&mut s, "\n");
        let os = orders(&s);
        assert_eq!((os[0].order.qty, os[1].order.qty, os[2].order.qty), (0, 0, 4));
        assert_eq!((os[1].ahead_mine, os[2].ahead_mine), (0, 0));
        assert_eq!(s.broker().book().instrument(CODE).unwrap().idle_holdings, 8);

        // swept; the last order now heads the queue
        step(&mut s, "\n");
        let os = orders(&s);
        assert_eq!(os.len(), 1);
        assert_eq!(os[0].order.qty, 1);
        assert_eq!(s.broker().book().stats().sum_buy, 11 * 10_000);
    }

    #[test]
    fn test_one_print_fills_at_most_its_quantity() {
        let quotes = [quote(OPEN, (10_000, 50), (9_990, 40))];
        let trades = format!("{} {CODE} 9970 3\n", OPEN + 12);
        let mut s = session(&quotes, &trades, 20, 600);
        step(&mut s, "b 005930 9980 5\nb 005930 9970 5\n\n");
        step(&mut s, "\n");
        let os = orders(&s);
        // the better-priced buy takes the whole print
        assert_eq!((os[0].order.price, os[0].order.qty), (9_970, 5));
        assert_eq!((os[1].order.price, os[1].order.qty), (9_980, 2));
        assert_eq!(s.broker().book().instrument(CODE).unwrap().idle_holdings, 3);
        assert_eq!(s.broker().book().stats().sum_buy, 3 * 9_980);
    }

    #[test]
    fn test_undecodable_quote_line_is_skipped() {
        let mut quotes = quote(OPEN, (10_000, 50), (9_990, 40)).into_bytes();
        quotes.extend_from_slice(b"\n\xff\xfe\n");
        quotes.extend_from_slice(quote(OPEN + 15, (10_000, 53), (9_990, 40)).as_bytes());
        let replay = Replay::from_readers(
            Box::new(std::io::Cursor::new(quotes)),
            Box::new(std::io::Cursor::new(Vec::new())),
        );
        let mut s = session_with(replay, 20, 600);
        step(&mut s, "b 005930 10000 5\n\n");
        step(&mut s, "\n");
        assert_eq!(orders(&s)[0].order.qty, 2);
        assert_eq!(s.broker().report().skipped_lines, 1);
    }

    struct Unreadable;

    impl std::io::Read for Unreadable {
        fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("device gone"))
        }
    }

    #[test]
    fn test_replay_failure_costs_only_its_tick() {
        let replay = Replay::from_readers(
            Box::new(std::io::BufReader::new(Unreadable)),
            Box::new(std::io::Cursor::new(Vec::new())),
        );
        let mut s = session_with(replay, 20, 20);
        assert!(matches!(s.advance(), Err(Error::Replay(_))));
        assert_eq!(s.tick(), 1);
        assert!(matches!(s.advance(), Err(Error::Replay(_))));
        assert_eq!(s.tick(), 2);
        assert_eq!(s.advance().unwrap(), TickStatus::SessionEnd);
        assert!(s.is_ended());
    }

    #[test]
    fn test_queue_monotonic_over_session() {
        let quotes = [
            quote(OPEN, (10_000, 50), (9_990, 40)),
            quote(OPEN + 15, (10_000, 50), (9_990, 60)),
            quote(OPEN + 25, (10_000, 50), (9_990, 10)),
        ];
        let trades = format!("{} {CODE} 9990 4\n{} {CODE} 9990 7\n", OPEN + 16, OPEN + 33);
        let mut s = session(&quotes, &trades, 20, 600);
        step(&mut s, "b 005930 9990 5\n\n");
        let mut last = orders(&s)[0].clone();
        for _ in 0..3 {
            step(&mut s, "\n");
            let o = orders(&s)[0].clone();
            assert!(o.ahead_others <= last.ahead_others);
            assert!(o.ahead_mine <= last.ahead_mine);
            assert!(o.order.qty <= last.order.qty);
            assert!(o.ahead_others >= 0 && o.order.qty >= 0);
            last = o;
        }
        // capped to 10 by the thin quote, then 7 printed through it
        assert_eq!(last.ahead_others, 3);
    }

    #[test]
    fn test_budget_rate_limits() {
        let quotes = [quote(OPEN, (10_000, 50), (9_990, 40))];
        let mut s = session(&quotes, "", 1, 600);
        let summary = step(&mut s, "b 005930 9990 1\nb 005930 9980 1\n\n");
        assert_eq!(summary.executed, 1);
        assert_eq!(summary.throttled, 1);
        let summary = step(&mut s, "b 005930 9980 1\n\n");
        assert_eq!(summary.executed, 1);
    }

    #[test]
    fn test_report_written_at_session_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let quotes = [quote(OPEN, (10_000, 50), (9_990, 40))];
        let replay = Replay::from_strings(&quotes.join("\n"), "");
        let mut book = OrderBook::new(CASH);
        book.add_instrument(CODE, InstrumentKind::Equity, 0);
        let sim = Simulation::new(book, replay, 20).with_report(Some(path.clone()));
        let clock = SessionClock { open: OPEN, close: OPEN + 20, tick_secs: 10 };
        let mut s = Session::new(sim, clock);

        while s.advance().unwrap() == TickStatus::Continue {
            s.build_msg_out().unwrap();
            s.apply_msg_in("\n").unwrap();
        }
        let v: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(v["balance"], CASH);
        assert_eq!(v["bal_init"], CASH);
        assert_eq!(v["stats"]["tck_orig"].as_array().unwrap().len(), 22);
    }

    #[test]
    fn test_from_config_requires_tapes() {
        let cfg = Config::default();
        assert!(matches!(Simulation::from_config(&cfg), Err(Error::Config(_))));
    }
}
