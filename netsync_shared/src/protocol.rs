//! Wire protocol and codec.
//!
//! Every message is one UTF-8 JSON object:
//!
//! ```text
//! {"clientID": 42, "type": "sgu", "payload": {...}}
//! ```
//!
//! | tag   | direction        | payload                                           |
//! |-------|------------------|---------------------------------------------------|
//! | `aid` | server -> client | `{clientID}`                                      |
//! | `cp`  | client -> server | none                                              |
//! | `sp`  | server -> client | none                                              |
//! | `cpu` | client -> server | `{timestamp, playerState: {p: {x, y}}}`           |
//! | `sgu` | server -> client | `{timestamp, players: {"<id>": {p: {x, y}}}}`     |
//!
//! Decoding is two-phase: the envelope is read first (tag + raw payload), then
//! the payload is decoded with the shape the tag calls for. Unknown tags decode
//! into [`Payload::Unknown`] so callers can drop them without treating them as
//! failures.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    error::{DecodeError, NetError},
    math::Vec2,
};

pub const TAG_ASSIGN_ID: &str = "aid";
pub const TAG_PING: &str = "cp";
pub const TAG_PONG: &str = "sp";
pub const TAG_CLIENT_STATE: &str = "cpu";
pub const TAG_SERVER_SNAPSHOT: &str = "sgu";

/// Server-assigned client identity. Also keys entities inside snapshots.
///
/// `0` means "not assigned yet".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ClientId(pub u32);

impl ClientId {
    pub const UNASSIGNED: ClientId = ClientId(0);

    pub fn is_assigned(self) -> bool {
        self != Self::UNASSIGNED
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of one entity at one sample time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct EntityState {
    #[serde(rename = "p")]
    pub position: Vec2,
}

impl EntityState {
    pub fn at(position: Vec2) -> Self {
        Self { position }
    }
}

/// `aid` payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AssignId {
    #[serde(rename = "clientID")]
    pub client_id: ClientId,
}

/// `cpu` payload: the local entity's state as reported by the motion controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientStateUpdate {
    /// Client wall clock, milliseconds.
    pub timestamp: i64,
    #[serde(rename = "playerState")]
    pub player_state: EntityState,
}

/// `sgu` payload: server broadcast of every entity it knows about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Snapshot {
    /// Server clock, milliseconds.
    pub timestamp: i64,
    #[serde(rename = "players", default)]
    pub entities: BTreeMap<ClientId, EntityState>,
}

impl Snapshot {
    pub fn ids(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.entities.keys().copied()
    }
}

/// Variant-specific part of a [`Message`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    AssignId(AssignId),
    Ping,
    Pong,
    ClientState(ClientStateUpdate),
    ServerSnapshot(Snapshot),
    /// A tag this build does not understand. Never produced by encoding a
    /// known variant; receivers log and drop it.
    Unknown { tag: String },
}

impl Payload {
    /// The discriminant as written on the wire.
    pub fn tag(&self) -> &str {
        match self {
            Payload::AssignId(_) => TAG_ASSIGN_ID,
            Payload::Ping => TAG_PING,
            Payload::Pong => TAG_PONG,
            Payload::ClientState(_) => TAG_CLIENT_STATE,
            Payload::ServerSnapshot(_) => TAG_SERVER_SNAPSHOT,
            Payload::Unknown { tag } => tag,
        }
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub client_id: ClientId,
    pub payload: Payload,
}

impl Message {
    pub fn new(client_id: ClientId, payload: Payload) -> Self {
        Self { client_id, payload }
    }

    pub fn assign_id(client_id: ClientId) -> Self {
        Self::new(client_id, Payload::AssignId(AssignId { client_id }))
    }

    pub fn ping(client_id: ClientId) -> Self {
        Self::new(client_id, Payload::Ping)
    }

    pub fn pong(client_id: ClientId) -> Self {
        Self::new(client_id, Payload::Pong)
    }

    pub fn client_state(client_id: ClientId, timestamp: i64, position: Vec2) -> Self {
        Self::new(
            client_id,
            Payload::ClientState(ClientStateUpdate {
                timestamp,
                player_state: EntityState::at(position),
            }),
        )
    }

    pub fn snapshot(client_id: ClientId, snapshot: Snapshot) -> Self {
        Self::new(client_id, Payload::ServerSnapshot(snapshot))
    }

    pub fn tag(&self) -> &str {
        self.payload.tag()
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum WirePayload<'a> {
    AssignId(&'a AssignId),
    ClientState(&'a ClientStateUpdate),
    ServerSnapshot(&'a Snapshot),
}

#[derive(Serialize)]
struct WireMessage<'a> {
    #[serde(rename = "clientID")]
    client_id: ClientId,
    #[serde(rename = "type")]
    tag: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<WirePayload<'a>>,
}

/// First decoding phase: tag and raw payload only.
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "clientID", default)]
    client_id: ClientId,
    #[serde(rename = "type")]
    tag: String,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

/// Serializes a message into one frame/datagram.
pub fn encode(msg: &Message) -> Result<Bytes, NetError> {
    let payload = match &msg.payload {
        Payload::AssignId(p) => Some(WirePayload::AssignId(p)),
        Payload::ClientState(p) => Some(WirePayload::ClientState(p)),
        Payload::ServerSnapshot(p) => Some(WirePayload::ServerSnapshot(p)),
        Payload::Ping | Payload::Pong | Payload::Unknown { .. } => None,
    };
    let wire = WireMessage {
        client_id: msg.client_id,
        tag: msg.tag(),
        payload,
    };
    let bytes = serde_json::to_vec(&wire).map_err(NetError::Encode)?;
    Ok(Bytes::from(bytes))
}

/// Parses one frame/datagram.
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    let envelope: Envelope = serde_json::from_slice(bytes).map_err(DecodeError::Malformed)?;
    let Envelope {
        client_id,
        tag,
        payload,
    } = envelope;

    let payload = match tag.as_str() {
        TAG_ASSIGN_ID => Payload::AssignId(payload_as(TAG_ASSIGN_ID, payload)?),
        TAG_PING => Payload::Ping,
        TAG_PONG => Payload::Pong,
        TAG_CLIENT_STATE => Payload::ClientState(payload_as(TAG_CLIENT_STATE, payload)?),
        TAG_SERVER_SNAPSHOT => Payload::ServerSnapshot(payload_as(TAG_SERVER_SNAPSHOT, payload)?),
        _ => Payload::Unknown { tag },
    };
    Ok(Message { client_id, payload })
}

fn payload_as<T: serde::de::DeserializeOwned>(
    kind: &'static str,
    payload: Option<serde_json::Value>,
) -> Result<T, DecodeError> {
    match payload {
        None | Some(serde_json::Value::Null) => Err(DecodeError::MissingPayload { kind }),
        Some(value) => serde_json::from_value(value)
            .map_err(|source| DecodeError::IncompatiblePayload { kind, source }),
    }
}

/// Wall clock in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
