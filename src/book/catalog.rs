//! Catalog - the instruments I track, my cash, and lifetime statistics.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::book::security::{BookOrder, Instrument, InstrumentKind};
use crate::core::types::{ORIGIN_SLOTS, Side};

/// Filled-flow accumulator for one origin slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickStat {
    /// Signed cash flow: negative for buys, positive for sells
    pub bal: i64,
    /// Signed quantity: positive for buys, negative for sells
    pub qty: i64,
    /// Number of fill events
    pub cnt: i64,
}

/// Running statistics for post-hoc strategy analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Notional bought
    pub sum_buy: i64,
    /// Notional sold
    pub sum_sell: i64,
    /// Fees and taxes paid
    pub sum_fee: i64,
    /// Per origin slot (ladder index at insertion, plus the two
    /// "improved the best price" slots)
    pub tck_orig: [TickStat; ORIGIN_SLOTS],
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            sum_buy: 0,
            sum_sell: 0,
            sum_fee: 0,
            tck_orig: [TickStat::default(); ORIGIN_SLOTS],
        }
    }
}

impl Stats {
    pub(crate) fn record_fill(&mut self, origin: Option<usize>, side: Side, notional: i64, qty: i64, fee: i64) {
        match side {
            Side::Buy => self.sum_buy += notional,
            Side::Sell => self.sum_sell += notional,
        }
        self.sum_fee += fee;
        if let Some(slot) = origin.and_then(|i| self.tck_orig.get_mut(i)) {
            match side {
                Side::Buy => slot.bal -= notional + fee,
                Side::Sell => slot.bal += notional - fee,
            }
            slot.qty += side.sign() * qty;
            slot.cnt += 1;
        }
    }
}

/// Breakdown of what the portfolio is worth right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    /// Cash not committed to anything
    pub cash: i64,
    /// Cash reserved by resting buy orders (including their fee)
    pub staged_buy: i64,
    /// Idle holdings marked at best bid, net of sell fee
    pub holdings: i64,
    /// Resting sell orders marked at best bid, net of sell fee
    pub staged_sell: i64,
}

impl Evaluation {
    pub fn total(&self) -> i64 {
        self.cash + self.staged_buy + self.holdings + self.staged_sell
    }
}

/// Instruments plus aggregate account state.
///
/// Fields are only readable from outside the crate; every mutation of cash
/// or holdings goes through the `OrderBook` apply operations.
#[derive(Debug, Clone)]
pub struct Catalog<T> {
    pub(crate) tick: u32,
    pub(crate) balance: i64,
    pub(crate) stats: Stats,
    pub(crate) instruments: BTreeMap<String, Instrument<T>>,
    /// KOSPI200 proxy, published only when warrants are tracked
    pub(crate) index: f64,
    pub(crate) bal_ref: Option<i64>,
    pub(crate) bal_init: Option<i64>,
}

impl<T: BookOrder> Catalog<T> {
    pub fn new(balance: i64) -> Self {
        Self {
            tick: 0,
            balance,
            stats: Stats::default(),
            instruments: BTreeMap::new(),
            index: 0.0,
            bal_ref: None,
            bal_init: None,
        }
    }

    /// Register an instrument with holdings carried over from before the
    /// session. Re-adding an existing code keeps the existing record.
    pub fn add_instrument(&mut self, code: &str, kind: InstrumentKind, holdings: i64) {
        self.instruments.entry(code.to_string()).or_insert_with(|| {
            let mut inst = Instrument::new(code, kind);
            inst.idle_holdings = holdings.max(0);
            inst
        });
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    pub fn balance(&self) -> i64 {
        self.balance
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn index(&self) -> f64 {
        self.index
    }

    pub fn instrument(&self, code: &str) -> Option<&Instrument<T>> {
        self.instruments.get(code)
    }

    pub fn instruments(&self) -> impl Iterator<Item = &Instrument<T>> {
        self.instruments.values()
    }

    pub fn has_warrants(&self) -> bool {
        self.instruments.values().any(|i| i.kind == InstrumentKind::Warrant)
    }

    /// Value everything at the current best bid.
    pub fn evaluate(&self) -> Evaluation {
        self.evaluate_with(|inst| inst.ladder.best_bid().price)
    }

    /// Value everything at a caller-chosen mark price per instrument.
    pub fn evaluate_with(&self, mark: impl Fn(&Instrument<T>) -> i64) -> Evaluation {
        let mut eval = Evaluation {
            cash: self.balance,
            ..Default::default()
        };
        for inst in self.instruments.values() {
            let px = mark(inst).max(0);
            let idle = px * inst.idle_holdings;
            eval.holdings += idle - inst.kind.sell_fee(idle);
            for (_, o) in inst.live_orders() {
                let o = o.order();
                match o.side {
                    Side::Buy => eval.staged_buy += o.escrow,
                    Side::Sell => {
                        let raw = px * o.qty;
                        eval.staged_sell += raw - inst.kind.sell_fee(raw);
                    }
                }
            }
        }
        eval
    }

    /// Latch the profit-rate denominators. Only the first call has an effect.
    ///
    /// `bal_init` is the evaluation at the session open; `bal_ref` marks
    /// holdings at the market's average trade price as a stand-in for the
    /// previous close.
    pub fn latch_reference(&mut self) {
        if self.bal_init.is_none() {
            self.bal_init = Some(self.evaluate().total());
        }
        if self.bal_ref.is_none() {
            let reference = self
                .evaluate_with(|inst| {
                    if inst.avg_trade_price > 0 {
                        inst.avg_trade_price
                    } else {
                        inst.ladder.best_bid().price
                    }
                })
                .total();
            self.bal_ref = Some(reference);
        }
    }

    pub fn bal_init(&self) -> Option<i64> {
        self.bal_init
    }

    pub fn bal_ref(&self) -> Option<i64> {
        self.bal_ref
    }

    /// Profit since the session open, as a fraction of `bal_init`.
    pub fn profit_rate(&self) -> Option<f64> {
        rate_against(self.evaluate().total(), self.bal_init?)
    }

    /// Profit against the previous-close proxy, as a fraction of `bal_ref`.
    pub fn profit_rate_ref(&self) -> Option<f64> {
        rate_against(self.evaluate().total(), self.bal_ref?)
    }
}

fn rate_against(now: i64, base: i64) -> Option<f64> {
    if base <= 0 {
        return None;
    }
    Some((now - base) as f64 / base as f64)
}
