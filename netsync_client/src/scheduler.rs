//! Fixed-timestep scheduling.
//!
//! Frames arrive at whatever rate the host manages; the session wants whole
//! simulation steps. The accumulator carries the remainder between frames
//! and caps catch-up after long stalls.

use netsync_shared::clock::Millis;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct FixedStepScheduler {
    step_ms: Millis,
    accumulator: Millis,
    max_steps: u32,
}

impl FixedStepScheduler {
    pub fn new(tick_hz: u32, max_steps: u32) -> Self {
        Self {
            step_ms: 1000.0 / f64::from(tick_hz.max(1)),
            accumulator: 0.0,
            max_steps: max_steps.max(1),
        }
    }

    pub fn step_ms(&self) -> Millis {
        self.step_ms
    }

    pub fn step_secs(&self) -> f32 {
        (self.step_ms / 1000.0) as f32
    }

    /// Adds `elapsed_ms` of wall time and returns how many steps to run.
    pub fn advance(&mut self, elapsed_ms: Millis) -> u32 {
        self.accumulator += elapsed_ms.max(0.0);
        let mut steps = 0;
        while self.accumulator >= self.step_ms && steps < self.max_steps {
            self.accumulator -= self.step_ms;
            steps += 1;
        }
        if self.accumulator >= self.step_ms {
            debug!(
                dropped_ms = self.accumulator,
                "Scheduler fell behind, dropping backlog"
            );
            self.accumulator %= self.step_ms;
        }
        steps
    }

    /// Fraction of a step left in the accumulator.
    pub fn alpha(&self) -> f64 {
        self.accumulator / self.step_ms
    }
}
