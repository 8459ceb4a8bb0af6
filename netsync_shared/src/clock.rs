//! Millisecond clocks.
//!
//! All sync timing is expressed as `f64` milliseconds. The session only reads
//! time through [`Clock`], so tests drive it with [`ManualClock`].

use std::cell::Cell;
use std::rc::Rc;

use chrono::Utc;
use tokio::time::Instant;

/// Milliseconds on some monotonic-enough timeline.
pub type Millis = f64;

/// Source of the current time.
pub trait Clock {
    fn now_ms(&self) -> Millis;
}

/// Epoch milliseconds that only move forward. The wall clock is read once
/// at construction; after that time comes from a monotonic instant, so
/// clock steps on the host never reach frame timing.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    base: Instant,
    epoch_ms: Millis,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            epoch_ms: Utc::now().timestamp_millis() as Millis,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> Millis {
        self.epoch_ms + self.base.elapsed().as_secs_f64() * 1000.0
    }
}

/// Hand-advanced clock; clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<Millis>>,
}

impl ManualClock {
    pub fn new(start: Millis) -> Self {
        Self {
            now: Rc::new(Cell::new(start)),
        }
    }

    pub fn set(&self, now: Millis) {
        self.now.set(now);
    }

    pub fn advance(&self, delta: Millis) {
        self.now.set(self.now.get() + delta);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Millis {
        self.now.get()
    }
}
