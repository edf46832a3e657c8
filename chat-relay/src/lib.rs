//! # chat-relay: Realtime chat relay with reconnect recovery
//!
//! Clients connect over WebSocket, post text messages, and receive a live
//! broadcast of every message plus a replay of whatever they missed while
//! disconnected.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌──────────────────┐
//! │ RelayClient │ ◄─────────────────► │ RelayServer      │
//! │ (offset)    │  JSON named events  │ (gateway task    │
//! └─────────────┘                     │  per connection) │
//!                                     └───┬──────────┬───┘
//!                            admit        │          │  chat message
//!                                         ▼          ▼
//!                               ┌──────────────┐ ┌──────────────┐
//!                               │RecoveryEngine│ │BroadcastEngine│
//!                               └──────┬───────┘ └──────┬───────┘
//!                                      │  DeliveryOrder │
//!                                      ▼                ▼
//!                               ┌──────────────┐ ┌──────────────┐
//!                               │  MessageLog  │ │SessionRegistry│
//!                               └──────────────┘ └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Handshake query and JSON event frames
//! - [`session`]: Session registry and per-connection outbox
//! - [`storage`]: Message log trait, RocksDB and in-memory logs
//! - [`order`]: Id-ordered release shared by fan-out and replay
//! - [`recovery`]: Backlog replay after (re)connect
//! - [`broadcast`]: Persist-then-fan-out and relay stats
//! - [`server`]: WebSocket connection gateway and client page
//! - [`client`]: Client that tracks its offset across reconnects

pub mod error;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod order;
pub mod recovery;
pub mod broadcast;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use error::{LogError, ProtocolError, RegistryError, RelayError};
pub use protocol::{ClientEvent, Handshake, Message, ServerEvent, ANONYMOUS};
pub use session::{ConnectionId, Outbox, Session, SessionRegistry};
pub use storage::{MemoryMessageLog, MessageLog, RocksMessageLog, StoreConfig};
pub use recovery::{RecoveryEngine, RecoveryOutcome};
pub use broadcast::{BroadcastEngine, RelayStats, RelayStatsSnapshot};
pub use order::DeliveryOrder;
pub use server::{RelayServer, ServerConfig};
pub use client::{ConnectionState, RelayClient};
