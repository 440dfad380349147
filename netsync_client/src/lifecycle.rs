//! Connection lifecycle.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Identified
//!      ^              |             |             |
//!      +--------------+-------------+-------------+   (failure / teardown)
//! ```
//!
//! [`Link`] is the only state shared between the receive workers and the
//! consumer. Identity, state, the last disconnect reason and the channel
//! cancellation tokens sit behind one mutex, so every transition is atomic.
//! The lock is never held across an `.await`.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use netsync_shared::{error::NetError, protocol::ClientId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{dispatch::Dispatcher, world::RemoteWorld};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial and terminal state. No channels open.
    Disconnected,
    /// Opening channels.
    Connecting,
    /// Both channels open, no identity yet.
    Connected,
    /// Identity assigned; gameplay traffic is meaningful.
    Identified,
}

/// Why the last session ended. Not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The collaborator called `disconnect()`.
    Requested,
    /// The server closed the control channel, or it failed.
    RemoteClosed,
    /// The client is shutting down.
    Shutdown,
}

/// Which transport a worker serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Control,
    Data,
}

/// Per-session cancellation for the two receive workers.
#[derive(Debug, Clone, Default)]
pub struct ChannelTokens {
    pub control: CancellationToken,
    pub data: CancellationToken,
}

impl ChannelTokens {
    pub fn new() -> Self {
        Self::default()
    }

    fn cancel_except(&self, origin: Option<Channel>) {
        if origin != Some(Channel::Control) {
            self.control.cancel();
        }
        if origin != Some(Channel::Data) {
            self.data.cancel();
        }
    }
}

/// Identity plus the session it belongs to, read in one step.
///
/// Worker jobs carry this so the consumer can drop work that was read under a
/// session that has since been torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStamp {
    pub id: ClientId,
    pub generation: u64,
}

#[derive(Debug)]
struct LinkStatus {
    state: ConnectionState,
    identity: ClientId,
    /// Bumped by every teardown, in step with the resets it queues.
    generation: u64,
    last_reason: Option<DisconnectReason>,
    probe_sent_at: Option<Instant>,
    tokens: Option<ChannelTokens>,
}

/// Shared lifecycle state and the single teardown path.
pub struct Link {
    status: Mutex<LinkStatus>,
    dispatcher: Dispatcher<RemoteWorld>,
}

impl Link {
    pub fn new(dispatcher: Dispatcher<RemoteWorld>) -> Self {
        Self {
            status: Mutex::new(LinkStatus {
                state: ConnectionState::Disconnected,
                identity: ClientId::UNASSIGNED,
                generation: 0,
                last_reason: None,
                probe_sent_at: None,
                tokens: None,
            }),
            dispatcher,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LinkStatus> {
        // Nothing inside can be left half-updated by a panic.
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// The assigned identity, if any.
    pub fn identity(&self) -> Option<ClientId> {
        let id = self.lock().identity;
        id.is_assigned().then_some(id)
    }

    pub fn last_reason(&self) -> Option<DisconnectReason> {
        self.lock().last_reason
    }

    /// Disconnected -> Connecting.
    pub fn begin_connect(&self) -> Result<(), NetError> {
        let mut status = self.lock();
        if status.state != ConnectionState::Disconnected {
            return Err(NetError::AlreadyConnected);
        }
        status.state = ConnectionState::Connecting;
        Ok(())
    }

    /// Connecting -> Disconnected after a failed attempt.
    pub fn fail_connect(&self) {
        let mut status = self.lock();
        if status.state == ConnectionState::Connecting {
            status.state = ConnectionState::Disconnected;
            status.identity = ClientId::UNASSIGNED;
        }
    }

    /// Connecting -> Connected, taking ownership of the session's tokens.
    ///
    /// Returns `false` (and cancels the tokens) if the link left `Connecting`
    /// in the meantime.
    pub fn establish(&self, tokens: ChannelTokens) -> bool {
        let mut status = self.lock();
        if status.state != ConnectionState::Connecting {
            drop(status);
            tokens.cancel_except(None);
            return false;
        }
        status.state = ConnectionState::Connected;
        status.tokens = Some(tokens);
        true
    }

    /// Connected -> Identified.
    ///
    /// Returns `Ok(false)` for a repeat of the identity already held.
    pub fn assign_identity(&self, id: ClientId) -> Result<bool, NetError> {
        if !id.is_assigned() {
            return Err(NetError::ProtocolViolation(
                "identity assignment with the unassigned id 0".to_string(),
            ));
        }
        let mut status = self.lock();
        match status.state {
            ConnectionState::Connected => {
                status.identity = id;
                status.state = ConnectionState::Identified;
                Ok(true)
            }
            ConnectionState::Identified if status.identity == id => Ok(false),
            state => Err(NetError::ProtocolViolation(format!(
                "identity assignment {id} while {state:?} (holding {})",
                status.identity
            ))),
        }
    }

    /// The current identity and session generation, while identified.
    pub fn session(&self) -> Option<SessionStamp> {
        let status = self.lock();
        (status.state == ConnectionState::Identified).then_some(SessionStamp {
            id: status.identity,
            generation: status.generation,
        })
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Records that a liveness probe just left.
    pub fn note_probe_sent(&self) {
        self.lock().probe_sent_at = Some(Instant::now());
    }

    /// Takes the outstanding probe's send time, if any.
    pub fn take_probe_sent(&self) -> Option<Instant> {
        self.lock().probe_sent_at.take()
    }

    /// Tears the session down. Any state -> Disconnected, identity reset.
    ///
    /// `origin` names the channel whose worker is calling, if any. That
    /// channel is not cancelled; its worker is already unwinding on its own.
    /// Every other open channel is.
    ///
    /// Idempotent: returns `true` only for the call that performed the
    /// transition. That call also bumps the session generation and queues the
    /// consumer-side reset, which moves the world to the same generation.
    pub fn teardown(&self, reason: DisconnectReason, origin: Option<Channel>) -> bool {
        let tokens = {
            let mut status = self.lock();
            if status.state == ConnectionState::Disconnected {
                debug!(?reason, "Teardown requested while already disconnected");
                return false;
            }
            status.state = ConnectionState::Disconnected;
            status.identity = ClientId::UNASSIGNED;
            status.generation += 1;
            status.last_reason = Some(reason);
            status.probe_sent_at = None;
            status.tokens.take()
        };

        if let Some(tokens) = tokens {
            tokens.cancel_except(origin);
        }
        info!(?reason, ?origin, "Disconnected");
        self.dispatcher
            .dispatch(move |world: &mut RemoteWorld| world.on_disconnected(reason));
        true
    }
}
