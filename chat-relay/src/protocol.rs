//! Wire protocol for the chat relay.
//!
//! Connect-time metadata rides in the WebSocket upgrade query string:
//! ```text
//! ws://host:port/?username=alice&serverOffset=42
//! ```
//!
//! Every frame after the upgrade is a JSON text frame holding one named event:
//! ```text
//! client → server   {"event":"chat message","data":"hello"}
//! server → client   {"event":"chat message","data":["hello","43","alice"]}
//! ```
//!
//! Live broadcast and backlog replay share the server event shape, so a
//! client cannot tell them apart and does not need to.

use serde::{Deserialize, Serialize};
use url::form_urlencoded;

use crate::error::ProtocolError;

/// Author recorded when the client does not claim a display name.
pub const ANONYMOUS: &str = "anonymous";

/// Name of the only application event, in both directions.
pub const CHAT_MESSAGE_EVENT: &str = "chat message";

/// Query parameter carrying the claimed display name.
pub const USERNAME_PARAM: &str = "username";

/// Query parameter carrying the last message id the client has seen.
pub const SERVER_OFFSET_PARAM: &str = "serverOffset";

/// A persisted chat message. Immutable once the log assigns its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub content: String,
    pub author: String,
}

/// Identity and resume point declared by a client when it connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub username: String,
    pub server_offset: u64,
}

impl Default for Handshake {
    fn default() -> Self {
        Self {
            username: ANONYMOUS.to_string(),
            server_offset: 0,
        }
    }
}

impl Handshake {
    pub fn new(username: impl Into<String>, server_offset: u64) -> Self {
        Self {
            username: username.into(),
            server_offset,
        }
    }

    /// Parse the upgrade request's query string.
    ///
    /// Missing or blank `username` falls back to [`ANONYMOUS`]; a missing,
    /// negative or unparseable `serverOffset` falls back to 0.
    pub fn from_query(query: Option<&str>) -> Self {
        let mut handshake = Self::default();
        let Some(query) = query else {
            return handshake;
        };

        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                USERNAME_PARAM => {
                    let name = value.trim();
                    if !name.is_empty() {
                        handshake.username = name.to_string();
                    }
                }
                SERVER_OFFSET_PARAM => {
                    handshake.server_offset = value.trim().parse::<u64>().unwrap_or(0);
                }
                _ => {}
            }
        }

        handshake
    }

    /// Encode as an upgrade query string (without the leading `?`).
    pub fn to_query(&self) -> String {
        form_urlencoded::Serializer::new(String::new())
            .append_pair(USERNAME_PARAM, &self.username)
            .append_pair(SERVER_OFFSET_PARAM, &self.server_offset.to_string())
            .finish()
    }
}

/// Events a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Post a message to everyone.
    #[serde(rename = "chat message")]
    ChatMessage(String),
}

impl ClientEvent {
    pub fn chat(content: impl Into<String>) -> Self {
        Self::ChatMessage(content.into())
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Events the server sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// `(content, id, author)`; the id is text-encoded.
    #[serde(rename = "chat message")]
    ChatMessage(String, String, String),
}

impl ServerEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// The numeric message id, if the text encoding is well formed.
    pub fn message_id(&self) -> Option<u64> {
        match self {
            Self::ChatMessage(_, id, _) => id.parse().ok(),
        }
    }

    /// Convert back into a [`Message`].
    pub fn into_message(self) -> Result<Message, ProtocolError> {
        match self {
            Self::ChatMessage(content, id, author) => {
                let id = id
                    .parse()
                    .map_err(|_| ProtocolError::Deserialization(format!("bad message id {id:?}")))?;
                Ok(Message {
                    id,
                    content,
                    author,
                })
            }
        }
    }
}

impl From<&Message> for ServerEvent {
    fn from(msg: &Message) -> Self {
        Self::ChatMessage(msg.content.clone(), msg.id.to_string(), msg.author.clone())
    }
}
