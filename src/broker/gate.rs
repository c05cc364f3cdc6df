//! Brokerage call quota: at most N calls per rolling one-second window, with
//! a bounded wait when the window is full.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::core::{Error, Result};

const WINDOW: Duration = Duration::from_secs(1);
const BACKOFF_BASE: Duration = Duration::from_millis(250);

struct Window {
    start: Instant,
    used: u32,
}

pub struct RateGate {
    per_sec: u32,
    max_wait: Duration,
    window: Mutex<Window>,
    freed: Condvar,
}

impl RateGate {
    pub fn new(per_sec: u32, max_wait: Duration) -> Self {
        Self {
            per_sec: per_sec.max(1),
            max_wait,
            window: Mutex::new(Window {
                start: Instant::now(),
                used: 0,
            }),
            freed: Condvar::new(),
        }
    }

    /// Take one slot, waiting for the window to roll if it is full.
    pub fn acquire(&self) -> Result<()> {
        let deadline = Instant::now() + self.max_wait;
        let mut w = self.window.lock();
        loop {
            let now = Instant::now();
            if now.duration_since(w.start) >= WINDOW {
                w.start = now;
                w.used = 0;
                self.freed.notify_all();
            }
            if w.used < self.per_sec {
                w.used += 1;
                return Ok(());
            }
            if now >= deadline {
                return Err(Error::Timeout(format!(
                    "brokerage quota of {}/s still full after {:?}",
                    self.per_sec, self.max_wait
                )));
            }
            let wake = (w.start + WINDOW).min(deadline);
            self.freed.wait_until(&mut w, wake);
        }
    }

    /// Slots used in the current window.
    pub fn in_use(&self) -> u32 {
        self.window.lock().used
    }
}

/// Run an idempotent brokerage query through the gate, retrying retryable
/// failures with exponential backoff.
pub fn retry_query<T>(gate: &RateGate, attempts: u32, what: &str, mut query: impl FnMut() -> Result<T>) -> Result<T> {
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        let result = gate.acquire().and_then(|_| query());
        match result {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                let backoff = BACKOFF_BASE * (1 << attempt.min(6));
                warn!("{} failed ({}), retry {} in {:?}", what, e, attempt + 1, backoff);
                std::thread::sleep(backoff);
                attempt += 1;
            }
            Err(e) => {
                debug!("{} gave up after {} attempt(s)", what, attempt + 1);
                return Err(e);
            }
        }
    }
}
