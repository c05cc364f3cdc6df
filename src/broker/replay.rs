//! Recorded market tapes for the simulated broker.
//!
//! Both files are whitespace separated, one event per line, sorted by time
//! (seconds since midnight):
//!
//! ```text
//! quote file: <time> <code> <avgPrice> <tradedQty> <20 prices> <20 quantities>
//!             <time> k <index>
//!             <time> e <code> <callPut> <expiry> <8 greeks>
//!             <time> n <code> <deviation>
//! trade file: <time> <code> <price> <qty>
//! ```

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

use crate::book::{Ladder, WarrantDetail};
use crate::core::types::{LADDER_LEN, Price, PriceQty, Qty};
use crate::core::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum QuoteRecord {
    Depth {
        code: String,
        avg_trade_price: Price,
        traded_qty: Qty,
        ladder: Ladder,
    },
    Index(f64),
    Warrant {
        code: String,
        detail: WarrantDetail,
    },
    Nav {
        code: String,
        deviation: f64,
    },
}

/// One market trade print.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trade {
    pub code: String,
    pub fill: PriceQty,
}

fn num<T: FromStr>(s: Option<&str>, what: &str) -> Result<T> {
    let s = s.ok_or_else(|| Error::Protocol(format!("missing {what}")))?;
    s.parse().map_err(|_| Error::Protocol(format!("bad {what} {s:?}")))
}

/// Parse one quote-tape line into its time and record.
pub fn parse_quote_line(line: &str) -> Result<(u32, QuoteRecord)> {
    let mut it = line.split_whitespace();
    let time = num(it.next(), "time")?;
    let tag = it.next().ok_or_else(|| Error::Protocol("missing code".into()))?;
    let rec = match tag {
        "k" => QuoteRecord::Index(num(it.next(), "index")?),
        "e" => {
            let code = it.next().ok_or_else(|| Error::Protocol("missing code".into()))?.to_string();
            let call_put = num(it.next(), "call/put")?;
            let expiry = num(it.next(), "expiry")?;
            let mut greeks = [0.0; 8];
            for g in greeks.iter_mut() {
                *g = num(it.next(), "greek")?;
            }
            QuoteRecord::Warrant {
                code,
                detail: WarrantDetail { call_put, expiry, greeks },
            }
        }
        "n" => QuoteRecord::Nav {
            code: it.next().ok_or_else(|| Error::Protocol("missing code".into()))?.to_string(),
            deviation: num(it.next(), "deviation")?,
        },
        code => {
            let avg_trade_price = num(it.next(), "avg price")?;
            let traded_qty = num(it.next(), "traded qty")?;
            let mut ladder = Ladder::default();
            for i in 0..LADDER_LEN {
                ladder.0[i].price = num(it.next(), "ladder price")?;
            }
            for i in 0..LADDER_LEN {
                ladder.0[i].qty = num(it.next(), "ladder qty")?;
            }
            QuoteRecord::Depth {
                code: code.to_string(),
                avg_trade_price,
                traded_qty,
                ladder,
            }
        }
    };
    if it.next().is_some() {
        return Err(Error::Protocol("trailing fields".into()));
    }
    Ok((time, rec))
}

/// Parse one trade-tape line.
pub fn parse_trade_line(line: &str) -> Result<(u32, Trade)> {
    let mut it = line.split_whitespace();
    let time = num(it.next(), "time")?;
    let code = it.next().ok_or_else(|| Error::Protocol("missing code".into()))?.to_string();
    let price = num(it.next(), "price")?;
    let qty: Qty = num(it.next(), "qty")?;
    if it.next().is_some() {
        return Err(Error::Protocol("trailing fields".into()));
    }
    if price <= 0 || qty <= 0 {
        return Err(Error::Protocol(format!("non-positive trade {price}x{qty}")));
    }
    Ok((
        time,
        Trade {
            code,
            fill: PriceQty::new(price, qty),
        },
    ))
}

/// Time-ordered reader over one tape, one record of lookahead.
pub struct Tape<T> {
    name: String,
    lines: std::io::Split<Box<dyn BufRead + Send>>,
    parse: fn(&str) -> Result<(u32, T)>,
    peeked: Option<(u32, T)>,
    line_no: usize,
    skipped: usize,
}

impl<T> Tape<T> {
    pub fn new(name: impl Into<String>, reader: Box<dyn BufRead + Send>, parse: fn(&str) -> Result<(u32, T)>) -> Self {
        Self {
            name: name.into(),
            lines: reader.split(b'\n'),
            parse,
            peeked: None,
            line_no: 0,
            skipped: 0,
        }
    }

    /// Malformed lines skipped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn fill_peek(&mut self) -> Result<()> {
        while self.peeked.is_none() {
            let Some(bytes) = self.lines.next() else {
                return Ok(());
            };
            self.line_no += 1;
            let bytes = bytes.map_err(|e| Error::Replay(format!("{} line {}: {}", self.name, self.line_no, e)))?;
            let Ok(line) = std::str::from_utf8(&bytes) else {
                self.skipped += 1;
                warn!("{} line {} skipped: not valid UTF-8", self.name, self.line_no);
                continue;
            };
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match (self.parse)(line) {
                Ok(rec) => self.peeked = Some(rec),
                Err(e) => {
                    self.skipped += 1;
                    warn!("{} line {} skipped: {}", self.name, self.line_no, e);
                }
            }
        }
        Ok(())
    }

    /// Every record with time strictly before `boundary`.
    pub fn take_until(&mut self, boundary: u32) -> Result<Vec<(u32, T)>> {
        let mut out = vec![];
        loop {
            self.fill_peek()?;
            let due = matches!(&self.peeked, Some((t, _)) if *t < boundary);
            match self.peeked.take() {
                Some(rec) if due => out.push(rec),
                rest => {
                    self.peeked = rest;
                    return Ok(out);
                }
            }
        }
    }

    pub fn is_exhausted(&mut self) -> Result<bool> {
        self.fill_peek()?;
        Ok(self.peeked.is_none())
    }
}

/// The pair of tapes one simulated session replays.
pub struct Replay {
    pub quotes: Tape<QuoteRecord>,
    pub trades: Tape<Trade>,
}

impl Replay {
    pub fn open(quote_file: &Path, trade_file: &Path) -> Result<Self> {
        let open = |p: &Path| -> Result<Box<dyn BufRead + Send>> {
            let f = File::open(p).map_err(|e| Error::Replay(format!("{}: {}", p.display(), e)))?;
            Ok(Box::new(BufReader::new(f)))
        };
        info!("📼 replaying quotes {} and trades {}", quote_file.display(), trade_file.display());
        Ok(Self::from_readers(open(quote_file)?, open(trade_file)?))
    }

    pub fn from_readers(quotes: Box<dyn BufRead + Send>, trades: Box<dyn BufRead + Send>) -> Self {
        Self {
            quotes: Tape::new("quotes", quotes, parse_quote_line),
            trades: Tape::new("trades", trades, parse_trade_line),
        }
    }

    /// In-memory tapes, mostly for tests.
    pub fn from_strings(quotes: &str, trades: &str) -> Self {
        Self::from_readers(
            Box::new(std::io::Cursor::new(quotes.to_string())),
            Box::new(std::io::Cursor::new(trades.to_string())),
        )
    }
}

/// Render a depth record as a quote-tape line.
pub fn format_depth_line(time: u32, code: &str, avg_trade_price: Price, traded_qty: Qty, ladder: &Ladder) -> String {
    let mut s = format!("{time} {code} {avg_trade_price} {traded_qty}");
    for p in ladder.prices() {
        s.push_str(&format!(" {p}"));
    }
    for q in ladder.quantities() {
        s.push_str(&format!(" {q}"));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BEST_ASK, BEST_BID};
    use std::io::Write;

    fn ladder() -> Ladder {
        let mut l = Ladder::default();
        l.0[BEST_ASK] = PriceQty::new(10_000, 50);
        l.0[BEST_BID] = PriceQty::new(9_990, 40);
        l
    }

    #[test]
    fn test_parse_quote_kinds() {
        let (t, rec) = parse_quote_line(&format_depth_line(32_410, "005930", 9_995, 100, &ladder())).unwrap();
        assert_eq!(t, 32_410);
        assert!(matches!(rec, QuoteRecord::Depth { ref code, ladder: l, .. } if code == "005930" && l == ladder()));

        let (_, rec) = parse_quote_line("32410 k 312.5").unwrap();
        assert_eq!(rec, QuoteRecord::Index(312.5));

        let (_, rec) = parse_quote_line("32410 e 57JA01 p 20261217 35 -0.4 0.01 -0.3 0.2 0.05 0.21 7.5").unwrap();
        match rec {
            QuoteRecord::Warrant { code, detail } => {
                assert_eq!(code, "57JA01");
                assert_eq!(detail.call_put, 'p');
                assert_eq!(detail.greeks[7], 7.5);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(parse_quote_line("32410 005930 1 2 3").is_err());
        assert!(parse_quote_line("32410 k 1 2").is_err());
    }

    #[test]
    fn test_parse_trade_line() {
        let (t, tr) = parse_trade_line("32415 005930 10000 3").unwrap();
        assert_eq!((t, tr.code.as_str(), tr.fill), (32_415, "005930", PriceQty::new(10_000, 3)));
        assert!(parse_trade_line("32415 005930 10000").is_err());
        assert!(parse_trade_line("32415 005930 10000 0").is_err());
    }

    #[test]
    fn test_take_until_splits_on_boundary_and_skips_garbage() {
        let mut tape = Replay::from_strings(
            "",
            "100 A 10 1\n105 A 10 2\ngarbage here\n\n110 A 10 3\n119 A 10 4\n120 A 10 5\n",
        )
        .trades;
        let first = tape.take_until(110).unwrap();
        assert_eq!(first.iter().map(|(_, t)| t.fill.qty).collect::<Vec<_>>(), vec![1, 2]);
        let second = tape.take_until(120).unwrap();
        assert_eq!(second.iter().map(|(_, t)| t.fill.qty).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(tape.skipped(), 1);
        assert!(!tape.is_exhausted().unwrap());
        assert_eq!(tape.take_until(u32::MAX).unwrap().len(), 1);
        assert!(tape.is_exhausted().unwrap());
    }

    #[test]
    fn test_undecodable_line_skipped() {
        let mut trades = b"100 A 10 1\n".to_vec();
        trades.extend_from_slice(b"\xff\xfe\n");
        trades.extend_from_slice(b"105 A 10 2\n");
        let mut tape = Replay::from_readers(
            Box::new(std::io::Cursor::new(Vec::new())),
            Box::new(std::io::Cursor::new(trades)),
        )
        .trades;
        let got = tape.take_until(200).unwrap();
        assert_eq!(got.iter().map(|(_, t)| t.fill.qty).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(tape.skipped(), 1);
    }

    #[test]
    fn test_open_files() {
        let mut q = tempfile::NamedTempFile::new().unwrap();
        let mut t = tempfile::NamedTempFile::new().unwrap();
        writeln!(q, "{}", format_depth_line(100, "005930", 9_995, 10, &ladder())).unwrap();
        writeln!(q, "105 k 300.25").unwrap();
        writeln!(t, "101 005930 10000 7").unwrap();

        let mut replay = Replay::open(q.path(), t.path()).unwrap();
        assert_eq!(replay.quotes.take_until(200).unwrap().len(), 2);
        let trades = replay.trades.take_until(200).unwrap();
        assert_eq!(trades[0].1.fill, PriceQty::new(10_000, 7));
    }

    #[test]
    fn test_missing_file_is_replay_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.txt");
        assert!(matches!(Replay::open(&missing, &missing), Err(Error::Replay(_))));
    }
}
