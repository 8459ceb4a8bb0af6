//! Input handling.
//!
//! The host samples raw input each frame into an [`InputState`]; the
//! [`InputSampler`] stamps it with the next sequence number and produces the
//! `InputSample` that travels to the server.

use netsync_shared::{
    clock::Millis,
    math::Vec2,
    net::{Actions, Direction, InputSample},
};

/// User input state at a moment in time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InputState {
    pub direction: Direction,
    pub aim: Vec2,
    pub actions: Actions,
}

impl InputState {
    pub fn is_idle(&self) -> bool {
        self.direction.is_empty() && self.actions.is_empty()
    }
}

/// Hands out strictly increasing sequence numbers; a number is never reused
/// for the lifetime of the sampler.
#[derive(Debug, Clone)]
pub struct InputSampler {
    next_seq: u64,
    display_name: String,
}

impl InputSampler {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            next_seq: 1,
            display_name: display_name.into(),
        }
    }

    /// Sequence number the next sample will carry.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn sample(&mut self, input: InputState, now: Millis) -> InputSample {
        let seq = self.next_seq;
        self.next_seq += 1;
        InputSample {
            seq,
            direction: input.direction,
            aim: input.aim,
            actions: input.actions,
            display_name: self.display_name.clone(),
            t: now,
        }
    }
}
