//! `netsync_shared`
//!
//! Libraries shared by the client network layer and its test harness.
//!
//! Design goals:
//! - Wire format is plain JSON with an explicit `type` tag per message.
//! - Decoding never panics; unknown tags are data, not errors.
//! - Transports are thin: framing and socket plumbing only, no policy.
//! - No `unsafe`.

pub mod config;
pub mod error;
pub mod math;
pub mod net;
pub mod protocol;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::math::*;
    pub use crate::net::*;
    pub use crate::protocol::*;
}
