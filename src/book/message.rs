//! Market-state message sent to the agent once per tick.
//!
//! ```text
//! /*
//! b <tick> <cashBalance> <sumBuy> <sumSell> <sumFeeTax>
//! s <22 x (bal qty cnt)>
//! k <kospi200>                                 (only with warrants)
//! d <code> <avgPrice> <tradedQty> <20 prices> <20 quantities>
//! e <code> <callPut> <expiry> <8 greeks>       (warrants)
//! n <code> <deviationFromNAV>                  (trackers)
//! o <code> <idleHoldings> <(price qty)...>     (qty +buy / -sell)
//! */
//! ```

use std::fmt::Write;
use std::str::FromStr;

use crate::book::catalog::Catalog;
use crate::book::security::{BookOrder, Detail, Instrument, InstrumentKind, Order, WarrantDetail};
use crate::core::types::{LADDER_LEN, ORIGIN_SLOTS, OrderKey, PriceQty, Side};
use crate::core::{Error, Result};

pub const BLOCK_OPEN: &str = "/*";
pub const BLOCK_CLOSE: &str = "*/";

impl<T: BookOrder> Catalog<T> {
    /// Render the full state block, terminated by a newline.
    pub fn write_state(&self) -> String {
        let mut out = String::with_capacity(256 + self.instruments.len() * 320);
        // writes into a String cannot fail
        let _ = self.write_state_into(&mut out);
        out
    }

    fn write_state_into(&self, out: &mut String) -> std::fmt::Result {
        writeln!(out, "{BLOCK_OPEN}")?;
        writeln!(
            out,
            "b {} {} {} {} {}",
            self.tick, self.balance, self.stats.sum_buy, self.stats.sum_sell, self.stats.sum_fee
        )?;

        out.push('s');
        for t in &self.stats.tck_orig {
            write!(out, " {} {} {}", t.bal, t.qty, t.cnt)?;
        }
        out.push('\n');

        if self.has_warrants() {
            writeln!(out, "k {}", self.index)?;
        }

        for inst in self.instruments.values() {
            write!(out, "d {} {} {}", inst.code, inst.avg_trade_price, inst.traded_qty)?;
            for p in inst.ladder.prices() {
                write!(out, " {p}")?;
            }
            for q in inst.ladder.quantities() {
                write!(out, " {q}")?;
            }
            out.push('\n');

            match &inst.detail {
                Detail::Warrant(w) => {
                    write!(out, "e {} {} {}", inst.code, w.call_put, w.expiry)?;
                    for g in &w.greeks {
                        write!(out, " {g}")?;
                    }
                    out.push('\n');
                }
                Detail::Tracker { nav_deviation } => writeln!(out, "n {} {}", inst.code, nav_deviation)?,
                Detail::None => {}
            }

            write!(out, "o {} {}", inst.code, inst.idle_holdings)?;
            for (_, o) in inst.live_orders() {
                let o = o.order();
                write!(out, " {} {}", o.price, o.side.sign() * o.qty)?;
            }
            out.push('\n');
        }
        writeln!(out, "{BLOCK_CLOSE}")
    }
}

/// Cursor over the whitespace-separated fields of one line.
struct Fields<'a> {
    line: &'a str,
    it: std::str::SplitWhitespace<'a>,
}

impl<'a> Fields<'a> {
    fn new(line: &'a str) -> Self {
        Self {
            line,
            it: line.split_whitespace(),
        }
    }

    fn next_str(&mut self) -> Result<&'a str> {
        self.it
            .next()
            .ok_or_else(|| Error::Protocol(format!("truncated line {:?}", self.line)))
    }

    fn next<V: FromStr>(&mut self) -> Result<V> {
        let s = self.next_str()?;
        s.parse()
            .map_err(|_| Error::Protocol(format!("bad field {s:?} in {:?}", self.line)))
    }

    fn rest(&mut self) -> Vec<&'a str> {
        self.it.by_ref().collect()
    }
}

fn instrument_for<'c>(cat: &'c mut Catalog<Order>, code: &str, line: &str) -> Result<&'c mut Instrument<Order>> {
    cat.instruments
        .get_mut(code)
        .ok_or_else(|| Error::Protocol(format!("line before 'd' for {code}: {line:?}")))
}

impl Catalog<Order> {
    /// Rebuild a catalog mirror from a state block.
    ///
    /// Instrument kinds are not on the wire: an `e` line marks a warrant, an
    /// `n` line a tracker, anything else is an equity. Buy-order escrow is
    /// reconstructed from price, quantity and kind.
    pub fn parse_state(text: &str) -> Result<Catalog<Order>> {
        let mut cat = Catalog::new(0);
        let mut next_id = 1u64;
        let mut saw_header = false;

        for line in text.lines().map(str::trim) {
            if line.is_empty() || line == BLOCK_OPEN || line == BLOCK_CLOSE {
                continue;
            }
            let mut f = Fields::new(line);
            match f.next_str()? {
                "b" => {
                    cat.tick = f.next()?;
                    cat.balance = f.next()?;
                    cat.stats.sum_buy = f.next()?;
                    cat.stats.sum_sell = f.next()?;
                    cat.stats.sum_fee = f.next()?;
                    saw_header = true;
                }
                "s" => {
                    for slot in 0..ORIGIN_SLOTS {
                        let t = &mut cat.stats.tck_orig[slot];
                        t.bal = f.next()?;
                        t.qty = f.next()?;
                        t.cnt = f.next()?;
                    }
                }
                "k" => cat.index = f.next()?,
                "d" => {
                    let code = f.next_str()?;
                    cat.add_instrument(code, InstrumentKind::Equity, 0);
                    let inst = instrument_for(&mut cat, code, line)?;
                    inst.avg_trade_price = f.next()?;
                    inst.traded_qty = f.next()?;
                    for i in 0..LADDER_LEN {
                        inst.ladder.0[i].price = f.next()?;
                    }
                    for i in 0..LADDER_LEN {
                        inst.ladder.0[i].qty = f.next()?;
                    }
                }
                "e" => {
                    let code = f.next_str()?;
                    let call_put = f.next()?;
                    let expiry = f.next()?;
                    let mut greeks = [0.0; 8];
                    for g in greeks.iter_mut() {
                        *g = f.next()?;
                    }
                    let inst = instrument_for(&mut cat, code, line)?;
                    inst.kind = InstrumentKind::Warrant;
                    inst.detail = Detail::Warrant(WarrantDetail { call_put, expiry, greeks });
                }
                "n" => {
                    let code = f.next_str()?;
                    let nav_deviation = f.next()?;
                    let inst = instrument_for(&mut cat, code, line)?;
                    inst.kind = InstrumentKind::Tracker;
                    inst.detail = Detail::Tracker { nav_deviation };
                }
                "o" => {
                    let code = f.next_str()?;
                    let idle = f.next()?;
                    let pairs = f.rest();
                    if pairs.len() % 2 != 0 {
                        return Err(Error::Protocol(format!("odd order field count in {line:?}")));
                    }
                    let inst = instrument_for(&mut cat, code, line)?;
                    inst.idle_holdings = idle;
                    for pair in pairs.chunks(2) {
                        let pq = parse_pair(pair, line)?;
                        let side = if pq.qty >= 0 { Side::Buy } else { Side::Sell };
                        let qty = pq.qty.abs();
                        let escrow = match side {
                            Side::Buy => pq.price * qty + inst.kind.buy_fee(pq.price * qty),
                            Side::Sell => 0,
                        };
                        let origin = crate::book::orderbook::origin_slot(&inst.ladder, side, pq.price);
                        inst.orders.insert(
                            OrderKey { price: pq.price, id: next_id },
                            Order { price: pq.price, qty, side, origin, escrow },
                        );
                        next_id += 1;
                    }
                }
                other => return Err(Error::Protocol(format!("unknown state line tag {other:?}"))),
            }
        }

        if !saw_header {
            return Err(Error::Protocol("state block without 'b' line".into()));
        }
        Ok(cat)
    }
}

fn parse_pair(pair: &[&str], line: &str) -> Result<PriceQty> {
    let bad = |s: &str| Error::Protocol(format!("bad order field {s:?} in {line:?}"));
    let price = pair[0].parse().map_err(|_| bad(pair[0]))?;
    let qty = pair[1].parse().map_err(|_| bad(pair[1]))?;
    Ok(PriceQty::new(price, qty))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::orderbook::OrderBook;
    use crate::book::security::Ladder;
    use crate::core::types::{BEST_ASK, BEST_BID};

    fn sample() -> OrderBook<Order> {
        let mut ob = OrderBook::new(1_000_000);
        ob.add_instrument("005930", InstrumentKind::Equity, 10);
        ob.add_instrument("57JA01", InstrumentKind::Warrant, 0);
        ob.add_instrument("069500", InstrumentKind::Tracker, 0);

        let mut raw = Ladder::default();
        raw.0[BEST_ASK] = PriceQty::new(10_000, 50);
        raw.0[BEST_BID] = PriceQty::new(9_990, 40);
        ob.set_quote("005930", 9_995, 12_345, &raw).unwrap();

        let mut raw = Ladder::default();
        raw.0[BEST_ASK] = PriceQty::new(355, 1_000);
        raw.0[BEST_BID] = PriceQty::new(350, 2_000);
        ob.set_quote("57JA01", 352, 40_000, &raw).unwrap();

        ob.instrument_mut("57JA01").unwrap().detail = Detail::Warrant(WarrantDetail {
            call_put: 'c',
            expiry: 20261217,
            greeks: [355.0, 0.52, 0.01, -0.3, 0.2, 0.05, 0.21, 7.5],
        });
        ob.instrument_mut("069500").unwrap().detail = Detail::Tracker { nav_deviation: -0.25 };
        ob.set_index(312.45);
        ob.set_tick(7);

        ob.apply_insert("005930", Side::Buy, 9_990, 3).unwrap();
        ob.apply_insert("005930", Side::Sell, 10_050, 4).unwrap();
        ob
    }

    #[test]
    fn test_write_state_layout() {
        let ob = sample();
        let text = ob.write_state();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.first(), Some(&"/*"));
        assert_eq!(lines.last(), Some(&"*/"));
        assert!(lines[1].starts_with("b 7 "));
        assert_eq!(lines[2].split_whitespace().count(), 1 + 3 * ORIGIN_SLOTS);
        assert_eq!(lines[3], "k 312.45");
        assert!(lines.contains(&"o 005930 6 9990 3 10050 -4"));
        assert!(lines.contains(&"n 069500 -0.25"));
        let d = lines.iter().find(|l| l.starts_with("d 005930")).unwrap();
        assert_eq!(d.split_whitespace().count(), 4 + 2 * LADDER_LEN);
    }

    #[test]
    fn test_no_index_line_without_warrants() {
        let mut ob: OrderBook<Order> = OrderBook::new(0);
        ob.add_instrument("005930", InstrumentKind::Equity, 0);
        assert!(!ob.write_state().lines().any(|l| l.starts_with("k ")));
    }

    #[test]
    fn test_parse_state_mirrors_catalog() {
        let ob = sample();
        let text = ob.write_state();
        let mirror = Catalog::parse_state(&text).unwrap();

        assert_eq!(mirror.tick(), 7);
        assert_eq!(mirror.balance(), ob.balance());
        assert_eq!(mirror.stats(), ob.stats());
        assert_eq!(mirror.index(), 312.45);

        let inst = mirror.instrument("005930").unwrap();
        assert_eq!(inst.kind, InstrumentKind::Equity);
        assert_eq!(inst.ladder, ob.instrument("005930").unwrap().ladder);
        assert_eq!(inst.idle_holdings, 6);
        let orders: Vec<(i64, i64, Side)> = inst.orders.values().map(|o| (o.price, o.qty, o.side)).collect();
        assert_eq!(orders, vec![(9_990, 3, Side::Buy), (10_050, 4, Side::Sell)]);

        assert_eq!(mirror.instrument("57JA01").unwrap().kind, InstrumentKind::Warrant);
        assert_eq!(mirror.instrument("069500").unwrap().kind, InstrumentKind::Tracker);
        assert_eq!(mirror.instrument("57JA01").unwrap().detail, ob.instrument("57JA01").unwrap().detail);

        // a mirror renders to the same block
        assert_eq!(mirror.write_state(), text);
    }

    #[test]
    fn test_parse_state_rejects_garbage() {
        assert!(Catalog::parse_state("/*\n*/\n").is_err());
        assert!(Catalog::parse_state("b 1 2 3 4\n").is_err());
        assert!(Catalog::parse_state("b 1 2 3 4 5\no 005930 0\n").is_err());
        assert!(Catalog::parse_state("b 1 2 3 4 5\nz\n").is_err());
    }
}
