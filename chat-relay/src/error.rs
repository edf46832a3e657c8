//! Error types shared across the relay.
//!
//! Component errors stay narrow (`LogError`, `RegistryError`,
//! `ProtocolError`); `RelayError` aggregates them for the engines and the
//! gateway.

use thiserror::Error;

use crate::session::ConnectionId;

/// Failures of the persistent message log.
#[derive(Error, Debug, Clone)]
pub enum LogError {
    /// The store could not be reached, or a read/write failed.
    #[error("Persistence error: {0}")]
    Persistence(String),
    /// A stored record could not be encoded or decoded.
    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: u64, reason: String },
}

impl From<rocksdb::Error> for LogError {
    fn from(e: rocksdb::Error) -> Self {
        LogError::Persistence(e.to_string())
    }
}

/// Session registry misuse. Neither should occur under correct gateway use.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Connection already registered: {0}")]
    DuplicateConnection(ConnectionId),
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

/// Wire format errors.
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Not connected")]
    NotConnected,
    #[error("Invalid server url: {0}")]
    InvalidUrl(String),
}

/// Top-level relay error.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// Socket failure on the server side of an upgraded connection.
    #[error("Connection error: {0}")]
    Http(#[from] axum::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A blocking storage task panicked or was cancelled.
    #[error("Storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
