//! Wire protocol for the room server.
//!
//! Messages are single JSON objects tagged by a `type` field, one per text
//! frame. The join handshake is `JoinOrCreate` → `JoinAccepted` /
//! `JoinRejected`; after that the server pushes `StateChange`, `Error`, and
//! finally `Leave`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identity payload included in join options.
///
/// Mirrors what the host's identity API returns; may be absent entirely when
/// the user has no profile (guest session).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserData {
    pub user_id: String,
    pub display_name: String,
    /// Wallet public key, present only when a wallet is connected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    pub has_connected_web3: bool,
}

/// Descriptor of the realm/environment the caller is currently in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Realm {
    pub server_name: String,
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Options the server requires to admit a room join.
///
/// Built fresh for every connection attempt: identity and realm can change
/// between attempts (wallet connect/disconnect, realm hop), so these are
/// never cached and replayed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct JoinOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<UserData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realm: Option<Realm>,
    /// Client-local timestamp/timezone string, stamped at attempt time.
    pub timezone: String,
    /// Caller-supplied room parameters (e.g. `location`, `roomName`).
    #[serde(flatten)]
    pub params: BTreeMap<String, String>,
}

impl JoinOptions {
    /// Insert a caller-supplied room parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Join the named room, creating it on the server if absent.
    JoinOrCreate {
        room_name: String,
        options: JoinOptions,
    },

    /// Application payload forwarded into the joined room.
    RoomMessage { payload: serde_json::Value },
}

/// Messages pushed from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// The join handshake succeeded.
    JoinAccepted { room_id: String, session_id: String },

    /// The join handshake was refused (room full, bad options, …).
    JoinRejected { code: u32, message: String },

    /// Full or partial room state snapshot.
    StateChange { state: serde_json::Value },

    /// The server removed us from the room; no further messages follow.
    Leave { code: u32 },

    /// A non-fatal room-level error.
    Error { code: u32, message: String },
}

// ---------------------------------------------------------------------------
// Wire-level parsing
// ---------------------------------------------------------------------------

/// Outcome of parsing one server line.
#[derive(Debug)]
pub enum ServerLine {
    /// A message for us, already deserialized.
    Message(ServerMessage),
    /// Empty / blank line — skip it.
    Empty,
    /// Couldn't parse the line (kept as raw text for logging).
    Unknown(String),
}

/// Parse one raw text frame from the server.
pub fn parse_server_line(line: &str) -> ServerLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ServerLine::Empty;
    }
    match serde_json::from_str::<ServerMessage>(trimmed) {
        Ok(msg) => ServerLine::Message(msg),
        Err(_) => ServerLine::Unknown(trimmed.to_string()),
    }
}
