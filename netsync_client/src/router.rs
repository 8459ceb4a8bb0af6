//! Outbound message routing.
//!
//! Latency-sensitive traffic (inputs, positions, projectiles) prefers the
//! fast outlet and falls back to the reliable channel when no healthy fast
//! outlet exists. Authority-sensitive traffic (scores, team changes, resets,
//! joins, signaling) only ever uses the reliable channel, because the two
//! channels give no ordering guarantee relative to each other.
//!
//! Fast traffic has two destinations. Peer-bound kinds (positions, ball)
//! may use the direct peer mesh; everything else on the fast route is
//! meant for the server and must reach it.
//!
//! Nothing is queued: if no outlet can take a message it is dropped and the
//! caller gets an error.

use netsync_shared::net::{encode_to_bytes, MessageKind, NetMsg};
use tracing::{debug, warn};

use crate::transport::{Outlet, SendError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Fast,
    Reliable,
}

/// Kinds that may travel on the fast outlet. Everything else is reliable.
pub const FAST_KINDS: &[MessageKind] = &[
    MessageKind::FastHandshake,
    MessageKind::Input,
    MessageKind::PositionUpdate,
    MessageKind::BallPosition,
    MessageKind::ProjectileUpdate,
];

/// Fast kinds addressed to other clients rather than the server.
pub const PEER_KINDS: &[MessageKind] = &[MessageKind::PositionUpdate, MessageKind::BallPosition];

pub fn peer_bound(kind: MessageKind) -> bool {
    PEER_KINDS.contains(&kind)
}

pub fn classify(kind: MessageKind) -> Route {
    if FAST_KINDS.contains(&kind) {
        Route::Fast
    } else {
        Route::Reliable
    }
}

/// Per-route counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub sent_fast: u64,
    pub sent_reliable: u64,
    /// Fast-classified messages that went out on the reliable channel.
    pub fallbacks: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
pub struct MessageRouter {
    stats: RouterStats,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    /// Sends `msg` on the best available outlet and returns the route used.
    pub fn send(
        &mut self,
        msg: &NetMsg,
        fast: Option<&mut dyn Outlet>,
        reliable: &mut dyn Outlet,
    ) -> Result<Route, SendError> {
        let kind = msg.kind();
        let payload = encode_to_bytes(msg).map_err(|e| SendError::Encode(e.to_string()))?;

        if classify(kind) == Route::Fast {
            if let Some(fast) = fast.filter(|f| f.is_healthy()) {
                match fast.send_payload(&payload) {
                    Ok(()) => {
                        self.stats.sent_fast += 1;
                        return Ok(Route::Fast);
                    }
                    Err(e) => {
                        debug!(kind = kind.tag(), error = %e, "Fast send failed, falling back");
                    }
                }
            }
            self.stats.fallbacks += 1;
        }

        if reliable.is_healthy() {
            match reliable.send_payload(&payload) {
                Ok(()) => {
                    self.stats.sent_reliable += 1;
                    return Ok(Route::Reliable);
                }
                Err(e) => {
                    self.stats.dropped += 1;
                    warn!(kind = kind.tag(), error = %e, "Reliable send failed, message dropped");
                    return Err(e);
                }
            }
        }

        self.stats.dropped += 1;
        debug!(kind = kind.tag(), "No open channel, message dropped");
        Err(SendError::NoRoute)
    }
}
