//! Session registry: the server-side state of every live connection.
//!
//! The registry is the only owner of [`Session`] values. The gateway holds a
//! [`ConnectionId`] and routes events by it; the engines read snapshots via
//! [`SessionRegistry::get`] and [`SessionRegistry::all`].
//!
//! Each operation takes the lock exactly once, so individual operations are
//! atomic. Nothing spans more than one operation.

use std::collections::HashMap;
use std::fmt;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::error::RegistryError;
use crate::protocol::Message;

/// Opaque handle for one transport connection lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Delivery primitive for one connection.
///
/// Live broadcast and backlog replay both go through [`Outbox::deliver`];
/// the connection task drains the other end onto the socket in FIFO order.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Message>,
}

impl Outbox {
    /// Create an outbox and the receiver the connection writer drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a message for this connection. Returns false if the connection
    /// has already gone away.
    pub fn deliver(&self, msg: &Message) -> bool {
        self.tx.send(msg.clone()).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Server-side state for one connection lifetime.
#[derive(Debug, Clone)]
pub struct Session {
    pub connection: ConnectionId,
    /// Display name claimed at connect time.
    pub author: String,
    /// Last message id the client declared it had seen.
    pub resume_offset: u64,
    /// Set once the backlog has been replayed; never reset.
    pub recovered: bool,
    pub outbox: Outbox,
}

/// Synchronized map from connection handle to session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ConnectionId, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and store a new session with `recovered = false`.
    pub async fn register(
        &self,
        connection: ConnectionId,
        author: impl Into<String>,
        resume_offset: u64,
        outbox: Outbox,
    ) -> Result<Session, RegistryError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&connection) {
            return Err(RegistryError::DuplicateConnection(connection));
        }

        let session = Session {
            connection,
            author: author.into(),
            resume_offset,
            recovered: false,
            outbox,
        };
        sessions.insert(connection, session.clone());
        Ok(session)
    }

    /// Remove a session. No-op if it is absent.
    pub async fn unregister(&self, connection: &ConnectionId) -> Option<Session> {
        self.sessions.write().await.remove(connection)
    }

    /// Flip `recovered` to true. Idempotent once set.
    pub async fn mark_recovered(&self, connection: &ConnectionId) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(connection) {
            Some(session) => {
                session.recovered = true;
                Ok(())
            }
            None => Err(RegistryError::UnknownConnection(*connection)),
        }
    }

    pub async fn get(&self, connection: &ConnectionId) -> Option<Session> {
        self.sessions.read().await.get(connection).cloned()
    }

    /// Every live session, in no particular order.
    pub async fn all(&self) -> Vec<Session> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
