//! `netsync_shared`
//!
//! Shared libraries used by the sync client and the reference server.
//!
//! Design goals:
//! - Deterministic and modular where practical.
//! - Clear separation of concerns (math, ring, net, config, clock).
//! - Wire types decoded once, at the boundary, into a closed enum.
//! - No `unsafe`.

pub mod clock;
pub mod config;
pub mod math;
pub mod net;
pub mod ring;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::clock::*;
    pub use crate::config::*;
    pub use crate::math::*;
    pub use crate::net::*;
    pub use crate::ring::*;
}
