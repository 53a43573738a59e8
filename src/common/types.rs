use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// One online user as the rendezvous server advertises it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub username: String,
    /// Where the user accepts direct peer traffic, as "address:port".
    pub endpoint: SocketAddr,
}

/// Liveness verbs carried as the `content` of a Presence envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
    Join,
    Leave,
    Ping,
    Ack,
}

impl PresenceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PresenceKind::Join => "Join",
            PresenceKind::Leave => "Leave",
            PresenceKind::Ping => "Ping",
            PresenceKind::Ack => "Ack",
        }
    }

    pub fn parse(content: &str) -> Option<Self> {
        match content {
            "Join" => Some(PresenceKind::Join),
            "Leave" => Some(PresenceKind::Leave),
            "Ping" => Some(PresenceKind::Ping),
            "Ack" => Some(PresenceKind::Ack),
            _ => None,
        }
    }
}
