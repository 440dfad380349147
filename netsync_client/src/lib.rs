//! `netsync_client`
//!
//! Client-side network layer:
//! - Connection lifecycle over a reliable control stream and an unreliable state channel
//! - One receive worker per channel, feeding a dispatch queue
//! - Bounded per-entity snapshot history
//! - Interpolation of remote entities a fixed delay in the past
//!
//! Nothing here touches gameplay state off the consumer thread; everything a
//! worker learns reaches [`world::RemoteWorld`] through [`NetClient::tick`].

pub mod client;
pub mod dispatch;
pub mod history;
pub mod interp;
pub mod lifecycle;
pub mod observer;
pub mod world;

pub(crate) mod workers;

pub use client::NetClient;
pub use lifecycle::{ConnectionState, DisconnectReason};
pub use observer::{ListenerId, SnapshotListener};
