//! `netsync_server`
//!
//! Reference relay server for the sync core:
//! - Fixed timestep tick loop
//! - Client id assignment and heartbeat replies
//! - Peer signaling relay
//! - Authoritative input integration and `state` snapshots
//!
//! Networking model:
//! - TCP: control plane, signaling and snapshots
//! - UDP on the same port: fast-channel input

pub mod server;

pub use server::{bind_ephemeral, RelayServer};
