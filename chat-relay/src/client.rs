//! WebSocket client for the relay.
//!
//! The client keeps the highest message id it has received and presents it
//! as `serverOffset` whenever it (re)connects, so the server only replays
//! what was missed while it was away.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::{ProtocolError, RelayError};
use crate::protocol::{ClientEvent, Handshake, Message, ServerEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// A chat participant.
pub struct RelayClient {
    server_url: String,
    username: String,
    /// Highest message id received so far
    offset: u64,
    stream: Option<WsStream>,
}

impl RelayClient {
    /// Create a disconnected client. `server_url` is a `ws://` url without
    /// a query string.
    pub fn new(server_url: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            username: username.into(),
            offset: 0,
            stream: None,
        }
    }

    /// Start from a known offset instead of 0.
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn connection_state(&self) -> ConnectionState {
        if self.stream.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// The upgrade url carrying this client's handshake.
    pub fn connect_url(&self) -> Result<Url, ProtocolError> {
        let mut url = Url::parse(&self.server_url)
            .map_err(|e| ProtocolError::InvalidUrl(format!("{}: {e}", self.server_url)))?;
        let handshake = Handshake::new(self.username.clone(), self.offset);
        url.set_query(Some(&handshake.to_query()));
        Ok(url)
    }

    /// Open the connection. The server starts replaying the backlog
    /// immediately; read it with [`next_message`](Self::next_message).
    pub async fn connect(&mut self) -> Result<(), RelayError> {
        let url = self.connect_url()?;
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        self.stream = Some(stream);
        log::debug!("{} connected to {} at offset {}", self.username, self.server_url, self.offset);
        Ok(())
    }

    /// Post a message. It comes back through [`next_message`](Self::next_message)
    /// once the server has persisted it.
    pub async fn send(&mut self, content: impl Into<String>) -> Result<(), RelayError> {
        let stream = self.stream.as_mut().ok_or(ProtocolError::NotConnected)?;
        let text = ClientEvent::chat(content).encode()?;
        stream.send(WsMessage::Text(text.into())).await?;
        Ok(())
    }

    /// Wait for the next chat message, backlog or live, and advance the
    /// offset past it.
    pub async fn next_message(&mut self) -> Result<Message, RelayError> {
        let stream = self.stream.as_mut().ok_or(ProtocolError::NotConnected)?;
        loop {
            match stream.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    let msg = ServerEvent::decode(text.as_str())?.into_message()?;
                    self.offset = self.offset.max(msg.id);
                    return Ok(msg);
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    self.stream = None;
                    return Err(ProtocolError::ConnectionClosed.into());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.stream = None;
                    return Err(e.into());
                }
            }
        }
    }

    /// Close the connection. The offset is kept for the next connect.
    pub async fn disconnect(&mut self) -> Result<(), RelayError> {
        if let Some(mut stream) = self.stream.take() {
            stream.close(None).await?;
        }
        Ok(())
    }

    /// Disconnect and connect again, resuming from the current offset.
    pub async fn reconnect(&mut self) -> Result<(), RelayError> {
        self.disconnect().await?;
        self.connect().await
    }
}
