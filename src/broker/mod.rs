//! Broker - drives one tick of real or replayed time over an OrderBook.
//!
//! ```text
//! Idle --advance--> TickReady --build_msg_out--> Sent --apply_msg_in--> Idle
//! ```

pub mod gate;
pub mod live;
pub mod replay;
pub mod simulation;

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::book::{BookOrder, Op, OrderBook, parse_message};
use crate::core::config::SessionConfig;
use crate::core::{Error, Result};

pub use live::{Brokerage, Live, MarketEvent};
pub use simulation::{SimOrder, Simulation};

/// Cooperative wake flag. Raised by the event side when fresh market data
/// makes in-flight requests stale; consumed by the control side.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Clear the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// Session open/close and tick length, in seconds since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionClock {
    pub open: u32,
    pub close: u32,
    pub tick_secs: u32,
}

impl SessionClock {
    pub fn from_config(cfg: &SessionConfig) -> Result<Self> {
        Ok(Self {
            open: cfg.open_secs()?,
            close: cfg.close_secs()?,
            tick_secs: cfg.tick_secs.max(1),
        })
    }

    /// End of tick `n` (tick 1 ends one period after the open).
    pub fn boundary(&self, tick: u32) -> u32 {
        self.open.saturating_add(tick.saturating_mul(self.tick_secs))
    }
}

/// "HH:MM:SS" for seconds since midnight.
pub fn fmt_clock(secs: u32) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

/// Everything a broker needs to know about the tick being advanced.
#[derive(Debug, Clone)]
pub struct TickContext {
    pub tick: u32,
    /// Tick end, seconds since midnight
    pub boundary: u32,
    /// Session close, seconds since midnight
    pub close: u32,
    pub span: tracing::Span,
}

impl TickContext {
    pub fn new(tick: u32, boundary: u32, close: u32) -> Self {
        let span = tracing::info_span!("tick", n = tick, at = %fmt_clock(boundary));
        Self {
            tick,
            boundary,
            close,
            span,
        }
    }

    pub fn past_close(&self) -> bool {
        self.boundary > self.close
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStatus {
    Continue,
    SessionEnd,
}

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MsgInSummary {
    /// Well-formed request lines
    pub requests: usize,
    /// Requests whose operations all executed
    pub executed: usize,
    /// Requests that resolved to nothing or failed at the brokerage
    pub dropped: usize,
    /// Requests not attempted because the tick budget ran out
    pub throttled: usize,
    /// Processing stopped early on fresh market data
    pub interrupted: bool,
}

/// Named operations allowed per tick. Cancel-all bypasses it.
#[derive(Debug, Clone, Copy)]
pub struct OpBudget {
    limit: usize,
    used: usize,
}

impl OpBudget {
    pub fn new(limit: usize) -> Self {
        Self { limit, used: 0 }
    }

    pub fn reset(&mut self) {
        self.used = 0;
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Reserve `n` operations at once, or none of them.
    pub fn reserve(&mut self, n: usize) -> Result<()> {
        if self.used + n > self.limit {
            return Err(Error::RateLimited(format!(
                "{} ops requested, {} of {} left this tick",
                n,
                self.limit - self.used.min(self.limit),
                self.limit
            )));
        }
        self.used += n;
        Ok(())
    }
}

/// A source of fills for an OrderBook, real or simulated.
pub trait Broker: Send {
    type Order: BookOrder;

    fn book(&self) -> &OrderBook<Self::Order>;

    /// Flag checked between requests; never raised by the simulation.
    fn interrupt(&self) -> &Interrupt;

    /// Block (live) or replay (simulation) up to `ctx.boundary`, applying
    /// every fill that happened before it.
    fn advance_tick(&mut self, ctx: &TickContext) -> Result<TickStatus>;

    /// Charge the per-tick budget for `n` operations.
    fn reserve(&mut self, n: usize) -> Result<()>;

    /// Carry out one resolved operation.
    fn execute(&mut self, op: &Op) -> Result<()>;

    fn build_msg_out(&self) -> String {
        self.book().write_state()
    }

    /// Parse, resolve and execute one inbound message.
    ///
    /// Running out of budget stops processing for this tick and is not an
    /// error; the remaining requests are counted as throttled.
    fn apply_msg_in(&mut self, msg: &str) -> Result<MsgInSummary> {
        let requests = parse_message(msg);
        let mut summary = MsgInSummary {
            requests: requests.len(),
            ..Default::default()
        };

        for (i, req) in requests.iter().enumerate() {
            let allot = self.book().allot(req);
            if allot.ops.is_empty() {
                summary.dropped += 1;
                continue;
            }
            if self.interrupt().take() {
                info!("⚡ fresh market data, abandoning {} request(s)", requests.len() - i);
                summary.interrupted = true;
                break;
            }
            if !allot.exempt {
                if let Err(e) = self.reserve(allot.ops.len()) {
                    warn!("'{}' not executed: {}", req, e);
                    summary.throttled = requests.len() - i;
                    break;
                }
            }

            let mut failed = false;
            for op in &allot.ops {
                debug!("{} -> {}", req, op);
                if let Err(e) = self.execute(op) {
                    if e.is_retryable() {
                        warn!("'{}' stopped at {}: {}", req, op, e);
                        summary.throttled = requests.len() - i;
                        return Ok(summary);
                    }
                    warn!("'{}' failed at {}: {}", req, op, e);
                    failed = true;
                    break;
                }
            }
            if failed {
                summary.dropped += 1;
            } else {
                summary.executed += 1;
            }
        }
        Ok(summary)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    TickReady,
    Sent,
}

/// Enforces the tick state machine around a broker.
pub struct Session<B> {
    broker: B,
    clock: SessionClock,
    phase: Phase,
    tick: u32,
    ended: bool,
    ctx: Option<TickContext>,
}

impl<B: Broker> Session<B> {
    pub fn new(broker: B, clock: SessionClock) -> Self {
        Self {
            broker,
            clock,
            phase: Phase::Idle,
            tick: 0,
            ended: false,
            ctx: None,
        }
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn into_broker(self) -> B {
        self.broker
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    pub fn clock(&self) -> SessionClock {
        self.clock
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    fn expect(&self, phase: Phase, call: &str) -> Result<()> {
        if self.ended {
            return Err(Error::InvalidState(format!("{call} after session end")));
        }
        if self.phase != phase {
            return Err(Error::InvalidState(format!(
                "{call} needs phase {:?}, session is {:?}",
                phase, self.phase
            )));
        }
        Ok(())
    }

    /// Move to the next tick.
    pub fn advance(&mut self) -> Result<TickStatus> {
        self.expect(Phase::Idle, "advance")?;
        let tick = self.tick + 1;
        let ctx = TickContext::new(tick, self.clock.boundary(tick), self.clock.close);
        let status = {
            let _enter = ctx.span.enter();
            self.broker.advance_tick(&ctx)
        };
        let status = match status {
            Ok(status) => status,
            Err(e @ Error::Replay(_)) => {
                // the tick is lost, the session goes on
                self.tick = tick;
                self.ctx = Some(ctx);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        self.tick = tick;
        match status {
            TickStatus::Continue => self.phase = Phase::TickReady,
            TickStatus::SessionEnd => {
                let _enter = ctx.span.enter();
                info!("🏁 session closed after {} tick(s)", tick - 1);
                self.ended = true;
            }
        }
        self.ctx = Some(ctx);
        Ok(status)
    }

    pub fn build_msg_out(&mut self) -> Result<String> {
        self.expect(Phase::TickReady, "build_msg_out")?;
        self.phase = Phase::Sent;
        Ok(self.broker.build_msg_out())
    }

    pub fn apply_msg_in(&mut self, msg: &str) -> Result<MsgInSummary> {
        self.expect(Phase::Sent, "apply_msg_in")?;
        self.phase = Phase::Idle;
        let span = self.ctx.as_ref().map(|c| c.span.clone()).unwrap_or_else(tracing::Span::none);
        let _enter = span.enter();
        let summary = self.broker.apply_msg_in(msg)?;
        debug!(?summary, "message applied");
        Ok(summary)
    }
}
