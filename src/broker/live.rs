//! Live broker: relays resolved operations to a real brokerage and books the
//! fills and cancel confirmations it reports back.
//!
//! The brokerage's event thread never touches the OrderBook. It pushes
//! `MarketEvent`s into a flume channel through an `EventSink`, which also
//! raises the interrupt flag on every quote. The control thread drains the
//! channel while waiting for the tick boundary.

use chrono::Timelike;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::book::{Ladder, Op, Order, OrderBook};
use crate::broker::gate::{RateGate, retry_query};
use crate::broker::{Broker, Interrupt, OpBudget, TickContext, TickStatus};
use crate::core::types::{OrderKey, Price, PriceQty, Qty, Side};
use crate::core::{Config, Error, Result};

const QUERY_ATTEMPTS: u32 = 4;
const MAX_POLL: Duration = Duration::from_millis(500);

/// Synchronous brokerage API. Implementations may block, but only for a
/// bounded time.
pub trait Brokerage: Send {
    /// Cash available for orders.
    fn balance(&mut self) -> Result<i64>;

    /// Holdings per instrument code.
    fn holdings(&mut self) -> Result<Vec<(String, Qty)>>;

    /// Place a limit order, returning the brokerage's order number.
    fn place(&mut self, code: &str, side: Side, price: Price, qty: Qty) -> Result<u64>;

    /// Request cancellation of `qty` of an order. Confirmed later by a
    /// `MarketEvent::Canceled`.
    fn cancel(&mut self, order_no: u64, code: &str, qty: Qty) -> Result<()>;
}

/// Asynchronous notifications from the brokerage.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Quote {
        code: String,
        avg_trade_price: Price,
        traded_qty: Qty,
        ladder: Ladder,
    },
    /// Market trade print (not mine)
    Trade { code: String, fill: PriceQty },
    /// One of my orders traded
    Fill { order_no: u64, fill: PriceQty },
    /// Cancellation of one of my orders confirmed
    Canceled { order_no: u64, qty: Qty },
    Index(f64),
}

/// Event-thread handle.
#[derive(Clone)]
pub struct EventSink {
    tx: flume::Sender<MarketEvent>,
    interrupt: Interrupt,
}

impl EventSink {
    pub fn send(&self, event: MarketEvent) -> Result<()> {
        let fresh_quote = matches!(event, MarketEvent::Quote { .. });
        self.tx
            .send(event)
            .map_err(|_| Error::Brokerage("event channel closed".into()))?;
        if fresh_quote {
            self.interrupt.raise();
        }
        Ok(())
    }
}

fn wall_clock() -> u32 {
    chrono::Local::now().num_seconds_from_midnight()
}

pub struct Live {
    book: OrderBook<Order>,
    brokerage: Box<dyn Brokerage>,
    gate: RateGate,
    events: flume::Receiver<MarketEvent>,
    interrupt: Interrupt,
    budget: OpBudget,
    by_number: HashMap<u64, (String, OrderKey)>,
    by_key: HashMap<OrderKey, u64>,
    clock: fn() -> u32,
}

impl Live {
    /// Query the account and build the book. A failed balance query is fatal.
    pub fn connect(mut brokerage: Box<dyn Brokerage>, cfg: &Config, gate: RateGate) -> Result<(Self, EventSink)> {
        let balance = retry_query(&gate, QUERY_ATTEMPTS, "balance query", || brokerage.balance()).map_err(|e| {
            error!("🚨 balance query failed at start-up: {}", e);
            e
        })?;
        let held = retry_query(&gate, QUERY_ATTEMPTS, "holdings query", || brokerage.holdings())?;

        let mut book = OrderBook::new(balance);
        for inst in &cfg.instruments {
            let holdings = held
                .iter()
                .find(|(code, _)| *code == inst.code)
                .map(|(_, q)| *q)
                .unwrap_or(inst.holdings);
            book.add_instrument(&inst.code, inst.kind, holdings);
        }
        info!("🔌 brokerage connected: balance {}, {} instrument(s)", balance, cfg.instruments.len());

        let (tx, rx) = flume::unbounded();
        let interrupt = Interrupt::new();
        let sink = EventSink {
            tx,
            interrupt: interrupt.clone(),
        };
        let live = Self {
            book,
            brokerage,
            gate,
            events: rx,
            interrupt,
            budget: OpBudget::new(cfg.session.max_ops_per_tick),
            by_number: HashMap::new(),
            by_key: HashMap::new(),
            clock: wall_clock,
        };
        Ok((live, sink))
    }

    /// Replace the wall clock (seconds since midnight).
    pub fn with_clock(mut self, clock: fn() -> u32) -> Self {
        self.clock = clock;
        self
    }

    fn handle(&mut self, event: MarketEvent) {
        let result = match event {
            MarketEvent::Quote {
                code,
                avg_trade_price,
                traded_qty,
                ladder,
            } => {
                if self.book.instrument(&code).is_none() {
                    return;
                }
                self.book.set_quote(&code, avg_trade_price, traded_qty, &ladder)
            }
            MarketEvent::Trade { code, fill } => {
                debug!("print {} {}x{}", code, fill.price, fill.qty);
                Ok(())
            }
            MarketEvent::Fill { order_no, fill } => match self.by_number.get(&order_no) {
                Some((code, key)) => {
                    let (code, key) = (code.clone(), *key);
                    self.book.apply_trade(&code, key, fill)
                }
                None => Err(Error::Brokerage(format!("fill for unknown order no {order_no}"))),
            },
            MarketEvent::Canceled { order_no, qty } => match self.by_number.get(&order_no) {
                Some((code, key)) => {
                    let (code, key) = (code.clone(), *key);
                    self.book.apply_cancel(&code, key, qty).map(|_| ())
                }
                None => Err(Error::Brokerage(format!("cancel for unknown order no {order_no}"))),
            },
            MarketEvent::Index(index) => {
                self.book.set_index(index);
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("event not applied: {}", e);
        }
    }

    /// Forget order numbers whose orders were swept.
    fn prune(&mut self) {
        let book = &self.book;
        self.by_number
            .retain(|_, (code, key)| book.order(code, key).is_some());
        let live = &self.by_number;
        self.by_key.retain(|_, no| live.contains_key(no));
    }
}

impl Broker for Live {
    type Order = Order;

    fn book(&self) -> &OrderBook<Order> {
        &self.book
    }

    fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    fn advance_tick(&mut self, ctx: &TickContext) -> Result<TickStatus> {
        self.book.sweep();
        self.prune();
        self.budget.reset();
        self.book.set_tick(ctx.tick);
        if ctx.past_close() {
            info!("💰 session closed: balance {}, evaluation {}", self.book.balance(), self.book.evaluate().total());
            return Ok(TickStatus::SessionEnd);
        }

        let mut handled = 0usize;
        loop {
            let now = (self.clock)();
            if now >= ctx.boundary {
                break;
            }
            let wait = Duration::from_secs(u64::from(ctx.boundary - now)).min(MAX_POLL);
            match self.events.recv_timeout(wait) {
                Ok(event) => {
                    self.handle(event);
                    handled += 1;
                }
                Err(flume::RecvTimeoutError::Timeout) => {}
                Err(flume::RecvTimeoutError::Disconnected) => {
                    return Err(Error::Brokerage("event channel closed".into()));
                }
            }
        }
        while let Ok(event) = self.events.try_recv() {
            self.handle(event);
            handled += 1;
        }

        if self.book.bal_init().is_none() && self.book.instruments().all(|i| i.ladder.is_quoted()) {
            self.book.latch_reference();
        }
        // quotes up to here are in the message about to be built
        self.interrupt.take();
        debug!(handled, "events applied");
        Ok(TickStatus::Continue)
    }

    fn reserve(&mut self, n: usize) -> Result<()> {
        self.budget.reserve(n)
    }

    fn execute(&mut self, op: &Op) -> Result<()> {
        match op {
            Op::Insert { code, side, price, qty } => {
                self.gate.acquire()?;
                let no = self.brokerage.place(code, *side, *price, *qty)?;
                let key = self.book.apply_insert(code, *side, *price, *qty)?;
                self.by_number.insert(no, (code.clone(), key));
                self.by_key.insert(key, no);
                debug!("placed {} as order no {}", op, no);
            }
            Op::Cancel { code, key, qty } => {
                let no = *self
                    .by_key
                    .get(key)
                    .ok_or_else(|| Error::InvalidState(format!("no order number for {code} {key}")))?;
                self.gate.acquire()?;
                self.brokerage.cancel(no, code, *qty)?;
                debug!("cancel requested for order no {} x{}", no, qty);
            }
        }
        Ok(())
    }
}
