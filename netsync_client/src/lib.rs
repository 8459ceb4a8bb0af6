//! `netsync_client`
//!
//! Client-side sync core:
//! - Inbound delivery buffer with configurable latency
//! - Transport channels (reliable + fast) with backoff, heartbeat and suspend
//! - Peer signaling for direct fast channels
//! - Message routing with failover to the reliable channel
//! - Prediction and reconciliation for the local entity
//! - Interpolation for remote entities and the shared object
//!
//! Everything up to [`session::SyncSession`] is synchronous and free of I/O;
//! [`client`] wires it to tokio sockets.

pub mod client;
pub mod delivery;
pub mod input;
pub mod interp;
pub mod peer_udp;
pub mod prediction;
pub mod router;
pub mod scheduler;
pub mod session;
pub mod signaling;
pub mod transport;

pub use client::GameClient;
pub use session::{Frame, LinkEvent, SessionEvent, SyncSession};
