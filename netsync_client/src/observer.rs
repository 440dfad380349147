//! Snapshot subscriptions.
//!
//! Listeners are plain trait objects registered on the client and called on
//! the consumer thread, after the world has been updated. Every callback has
//! an empty default so a listener only implements what it cares about.

use netsync_shared::{
    math::Vec2,
    protocol::{ClientId, Snapshot},
};

use crate::lifecycle::DisconnectReason;

/// Receives world updates. Called on the thread that runs `tick`.
pub trait SnapshotListener: Send {
    /// A snapshot was applied.
    fn on_snapshot(&mut self, _snapshot: &Snapshot) {}

    /// A remote entity appeared; create its representation.
    fn on_entity_joined(&mut self, _id: ClientId, _position: Vec2) {}

    /// A remote entity was absent from the latest snapshot; tear it down.
    fn on_entity_left(&mut self, _id: ClientId) {}

    /// The server assigned this client's identity.
    fn on_identified(&mut self, _id: ClientId) {}

    /// The session ended. Every joined entity has already been reported left.
    fn on_disconnected(&mut self, _reason: DisconnectReason) {}
}

/// Handle returned by subscribing; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Registered listeners, called in subscription order.
#[derive(Default)]
pub struct Listeners {
    next_id: u64,
    entries: Vec<(ListenerId, Box<dyn SnapshotListener>)>,
}

impl Listeners {
    pub fn add(&mut self, listener: Box<dyn SnapshotListener>) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, listener));
        id
    }

    /// Returns `false` if `id` was not registered.
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn notify(&mut self, mut f: impl FnMut(&mut dyn SnapshotListener)) {
        for (_, listener) in &mut self.entries {
            f(listener.as_mut());
        }
    }
}
