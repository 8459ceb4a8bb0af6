//! Prediction and reconciliation for the locally controlled entity.
//!
//! Input moves the predicted position immediately. Every tick the predicted
//! position is then blended toward the last authoritative position with a
//! small rate; large corrections (teleports, respawns) use an even smaller
//! rate so they glide instead of snapping.

use netsync_shared::{
    config::PredictionConfig,
    math::Vec2,
    net::{Actions, Direction, PlayerState},
};
use tracing::debug;

/// Last server-confirmed state of the local entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AuthoritativeState {
    pub position: Vec2,
    pub seq: u64,
    pub boost: f32,
}

impl From<&PlayerState> for AuthoritativeState {
    fn from(p: &PlayerState) -> Self {
        Self {
            position: Vec2::new(p.x, p.y),
            seq: p.seq,
            boost: p.boost,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PredictionEngine {
    cfg: PredictionConfig,
    predicted: Vec2,
    authoritative: Option<AuthoritativeState>,
}

impl PredictionEngine {
    pub fn new(cfg: PredictionConfig, spawn: Vec2) -> Self {
        Self {
            cfg,
            predicted: spawn,
            authoritative: None,
        }
    }

    pub fn predicted(&self) -> Vec2 {
        self.predicted
    }

    pub fn authoritative(&self) -> Option<&AuthoritativeState> {
        self.authoritative.as_ref()
    }

    /// Distance between predicted and authoritative positions.
    pub fn error(&self) -> Option<f32> {
        self.authoritative
            .map(|a| a.position.distance(self.predicted))
    }

    /// Applies held input for `dt_sec`. Does nothing while `can_act` is false.
    pub fn integrate(&mut self, direction: Direction, actions: Actions, dt_sec: f32, can_act: bool) {
        if !can_act || direction.is_empty() {
            return;
        }
        let boosting = actions.contains(Actions::BOOST)
            && self.authoritative.map_or(true, |a| a.boost > 0.0);
        let speed = if boosting {
            self.cfg.speed * self.cfg.boost_multiplier
        } else {
            self.cfg.speed
        };
        self.predicted = self.predicted + direction.axis() * (speed * dt_sec);
    }

    /// Replaces the authoritative state. Snapshots older than the current
    /// one (lower `seq`) are rejected and `false` is returned.
    pub fn apply_authoritative(&mut self, state: AuthoritativeState) -> bool {
        if let Some(current) = &self.authoritative {
            if state.seq < current.seq {
                debug!(
                    seq = state.seq,
                    current = current.seq,
                    "Dropping out-of-order authoritative state"
                );
                return false;
            }
        }
        self.authoritative = Some(state);
        true
    }

    /// Blends predicted toward authoritative once; returns the rate used.
    pub fn reconcile(&mut self) -> Option<f32> {
        let target = self.authoritative?.position;
        let delta = target - self.predicted;
        let alpha = if delta.len() > self.cfg.impulse_threshold {
            self.cfg.impulse_alpha
        } else {
            self.cfg.base_alpha
        };
        self.predicted = self.predicted + delta * alpha;
        Some(alpha)
    }

    /// Forgets the authoritative state and places the entity at `spawn`.
    pub fn reset(&mut self, spawn: Vec2) {
        self.predicted = spawn;
        self.authoritative = None;
    }
}
