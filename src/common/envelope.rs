//! Wire envelope shared by the rendezvous server and the clients.
//!
//! One JSON object per datagram, camelCase field names, `type` selecting how
//! the `payload` decodes. Anything that does not decode cleanly is dropped by
//! the caller; a datagram is never partially processed.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::common::types::{PresenceKind, UserEntry};

/// Well-known `content` values.
pub const LOGIN_ACCEPTED: &str = "accepted";
pub const LOGIN_REJECTED: &str = "rejected";
pub const LOOKUP_FOUND: &str = "found";
pub const LOOKUP_NOT_FOUND: &str = "not found";

/// Envelope taxonomy, serialized by variant name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Login,
    Logout,
    Chat,
    UserList,
    P2PRequest,
    P2PResponse,
    ServerShutdown,
    Presence,
}

/// Sent with Login: the port the client listens on for direct peer traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoginPayload {
    #[serde(rename = "P2PPort", default)]
    pub p2p_port: u16,
}

/// Sent with UserList pushes and replies.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserListPayload {
    #[serde(rename = "Users", default)]
    pub users: Vec<UserEntry>,
}

/// Sent with a successful P2PResponse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupPayload {
    #[serde(rename = "Username")]
    pub username: String,
    #[serde(rename = "EndPoint")]
    pub endpoint: std::net::SocketAddr,
}

/// Payload decoded according to the envelope kind. Kinds without payload
/// data carry `None`; an absent wire payload decodes to the kind's default.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    #[default]
    None,
    Login(LoginPayload),
    UserList(UserListPayload),
    Lookup(LookupPayload),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("payload does not fit {kind:?}: {source}")]
    Payload {
        kind: MessageKind,
        source: serde_json::Error,
    },
}

/// The wire unit. `content` semantics depend on `kind`: chat text for Chat,
/// accept/reject markers for Login replies, presence verbs for Presence.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: MessageKind,
    pub sender: String,
    pub receiver: String,
    pub content: String,
    pub payload: Payload,
    /// Unix seconds, UTC.
    pub timestamp: i64,
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: MessageKind,
    #[serde(default)]
    sender: String,
    #[serde(default)]
    receiver: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<serde_json::Value>,
    #[serde(default)]
    timestamp: i64,
}

impl Envelope {
    pub fn new(kind: MessageKind, sender: impl Into<String>) -> Self {
        Self {
            kind,
            sender: sender.into(),
            receiver: String::new(),
            content: String::new(),
            payload: Payload::None,
            timestamp: now_ts(),
        }
    }

    pub fn chat(sender: &str, receiver: &str, text: &str) -> Self {
        Self {
            receiver: receiver.to_string(),
            content: text.to_string(),
            ..Self::new(MessageKind::Chat, sender)
        }
    }

    pub fn presence(verb: PresenceKind, sender: &str, receiver: &str) -> Self {
        Self {
            receiver: receiver.to_string(),
            content: verb.as_str().to_string(),
            ..Self::new(MessageKind::Presence, sender)
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let payload = match &self.payload {
            Payload::None => None,
            Payload::Login(p) => Some(serde_json::to_value(p)?),
            Payload::UserList(p) => Some(serde_json::to_value(p)?),
            Payload::Lookup(p) => Some(serde_json::to_value(p)?),
        };
        let wire = WireEnvelope {
            kind: self.kind,
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            content: self.content.clone(),
            payload,
            timestamp: self.timestamp,
        };
        serde_json::to_vec(&wire)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let wire: WireEnvelope = serde_json::from_slice(bytes)?;
        let payload = match wire.kind {
            MessageKind::Login => Payload::Login(typed_or_default(wire.kind, wire.payload)?),
            MessageKind::UserList => Payload::UserList(typed_or_default(wire.kind, wire.payload)?),
            // A "not found" lookup reply legitimately carries no payload.
            MessageKind::P2PResponse => match wire.payload {
                Some(value) => Payload::Lookup(typed(wire.kind, value)?),
                None => Payload::None,
            },
            _ => Payload::None,
        };
        Ok(Self {
            kind: wire.kind,
            sender: wire.sender,
            receiver: wire.receiver,
            content: wire.content,
            payload,
            timestamp: wire.timestamp,
        })
    }
}

fn typed<T: DeserializeOwned>(
    kind: MessageKind,
    value: serde_json::Value,
) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|source| DecodeError::Payload { kind, source })
}

fn typed_or_default<T: DeserializeOwned + Default>(
    kind: MessageKind,
    payload: Option<serde_json::Value>,
) -> Result<T, DecodeError> {
    match payload {
        Some(value) => typed(kind, value),
        None => Ok(T::default()),
    }
}

/// Wire timestamps are Unix seconds.
pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}
