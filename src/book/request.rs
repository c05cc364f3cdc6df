//! Agent requests and the concrete operations they resolve into.
//!
//! Wire grammar, one request per line:
//!
//! ```text
//! b  <code> <price> <qty>
//! s  <code> <price> <qty>
//! cb <code> <price> <qty>
//! cs <code> <price> <qty>
//! mb <code> <price> <qty> <newPrice>
//! ms <code> <price> <qty> <newPrice>
//! ca
//! sa
//! ```

use std::fmt;
use std::str::FromStr;

use crate::core::types::{OrderKey, Price, Qty, Side};
use crate::core::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqKind {
    Buy,
    Sell,
    CancelBuy,
    CancelSell,
    ModifyBuy,
    ModifySell,
    CancelAll,
    SellAll,
}

impl ReqKind {
    fn tag(self) -> &'static str {
        match self {
            ReqKind::Buy => "b",
            ReqKind::Sell => "s",
            ReqKind::CancelBuy => "cb",
            ReqKind::CancelSell => "cs",
            ReqKind::ModifyBuy => "mb",
            ReqKind::ModifySell => "ms",
            ReqKind::CancelAll => "ca",
            ReqKind::SellAll => "sa",
        }
    }
}

/// One unresolved agent request. `qty == 0` means "as much as possible".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub kind: ReqKind,
    pub code: String,
    pub price: Price,
    pub qty: Qty,
    pub mod_price: Price,
}

impl Request {
    pub fn new(kind: ReqKind, code: impl Into<String>, price: Price, qty: Qty) -> Self {
        Self {
            kind,
            code: code.into(),
            price,
            qty,
            mod_price: 0,
        }
    }

    pub fn modify(side: Side, code: impl Into<String>, price: Price, qty: Qty, mod_price: Price) -> Self {
        let kind = match side {
            Side::Buy => ReqKind::ModifyBuy,
            Side::Sell => ReqKind::ModifySell,
        };
        Self {
            kind,
            code: code.into(),
            price,
            qty,
            mod_price,
        }
    }

    pub fn cancel_all() -> Self {
        Self::new(ReqKind::CancelAll, "", 0, 0)
    }

    pub fn sell_all() -> Self {
        Self::new(ReqKind::SellAll, "", 0, 0)
    }
}

fn field<T: FromStr>(parts: &[&str], i: usize, name: &str, line: &str) -> Result<T> {
    parts
        .get(i)
        .ok_or_else(|| Error::Protocol(format!("missing {name} in {line:?}")))?
        .parse()
        .map_err(|_| Error::Protocol(format!("bad {name} in {line:?}")))
}

impl FromStr for Request {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let tag = *parts
            .first()
            .ok_or_else(|| Error::Protocol("empty request".into()))?;

        let kind = match tag {
            "b" => ReqKind::Buy,
            "s" => ReqKind::Sell,
            "cb" => ReqKind::CancelBuy,
            "cs" => ReqKind::CancelSell,
            "mb" => ReqKind::ModifyBuy,
            "ms" => ReqKind::ModifySell,
            "ca" => ReqKind::CancelAll,
            "sa" => ReqKind::SellAll,
            other => return Err(Error::Protocol(format!("unknown request {other:?}"))),
        };

        let expected = match kind {
            ReqKind::CancelAll | ReqKind::SellAll => 1,
            ReqKind::ModifyBuy | ReqKind::ModifySell => 5,
            _ => 4,
        };
        if parts.len() != expected {
            return Err(Error::Protocol(format!(
                "{tag} takes {} fields, got {} in {line:?}",
                expected - 1,
                parts.len() - 1
            )));
        }
        if expected == 1 {
            return Ok(Request::new(kind, "", 0, 0));
        }

        let mut req = Request::new(
            kind,
            parts[1],
            field(&parts, 2, "price", line)?,
            field(&parts, 3, "qty", line)?,
        );
        if expected == 5 {
            req.mod_price = field(&parts, 4, "new price", line)?;
        }
        if req.qty < 0 {
            return Err(Error::Protocol(format!("negative qty in {line:?}")));
        }
        Ok(req)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ReqKind::CancelAll | ReqKind::SellAll => write!(f, "{}", self.kind.tag()),
            ReqKind::ModifyBuy | ReqKind::ModifySell => write!(
                f,
                "{} {} {} {} {}",
                self.kind.tag(),
                self.code,
                self.price,
                self.qty,
                self.mod_price
            ),
            _ => write!(f, "{} {} {} {}", self.kind.tag(), self.code, self.price, self.qty),
        }
    }
}

/// A concrete, validated book operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Place a new limit order
    Insert {
        code: String,
        side: Side,
        price: Price,
        qty: Qty,
    },
    /// Cancel `qty` of an existing order
    Cancel { code: String, key: OrderKey, qty: Qty },
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Insert { code, side, price, qty } => write!(f, "insert {side} {code} {qty}@{price}"),
            Op::Cancel { code, key, qty } => write!(f, "cancel {code} {key} x{qty}"),
        }
    }
}

/// Resolved form of one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allotment {
    pub ops: Vec<Op>,
    /// Cancel-all operations do not count against the per-tick budget
    pub exempt: bool,
}

/// Split an inbound message into requests, logging and dropping bad lines.
pub fn parse_message(msg: &str) -> Vec<Request> {
    msg.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|line| match line.parse::<Request>() {
            Ok(req) => Some(req),
            Err(e) => {
                tracing::warn!("dropping request line: {}", e);
                None
            }
        })
        .collect()
}
