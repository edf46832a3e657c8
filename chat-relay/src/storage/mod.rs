//! Persistent message log.
//!
//! Architecture:
//! ```text
//! ┌────────────────┐  append / read_after  ┌──────────────────────────┐
//! │ BroadcastEngine│ ────────────────────► │ dyn MessageLog           │
//! │ RecoveryEngine │   (blocking pool)     │                          │
//! └────────────────┘                       │  RocksMessageLog         │
//!                                          │   CF "messages" id → rec │
//!                                          │   CF "meta"  next_id     │
//!                                          │                          │
//!                                          │  MemoryMessageLog        │
//!                                          │   (no storage path)      │
//!                                          └──────────────────────────┘
//! ```
//!
//! Ids are assigned by the log on append, start at 1 and strictly increase.
//! `read_after(k)` returns every message with `id > k` in ascending order.

pub mod memory;
pub mod rocks;

#[cfg(test)]
pub(crate) mod gated;

use std::sync::Arc;

pub use memory::MemoryMessageLog;
pub use rocks::{RocksMessageLog, StoreConfig};

use crate::error::{LogError, RelayError};
use crate::protocol::Message;

/// Append-only ordered log of chat messages.
///
/// Implementations are synchronous; async callers run them on the blocking
/// pool so a slow store only stalls the task that is waiting on it.
pub trait MessageLog: Send + Sync + 'static {
    /// Persist a message and return it with its assigned id.
    fn append(&self, content: &str, author: &str) -> Result<Message, LogError>;

    /// All messages with `id > offset`, ascending. Empty if there are none.
    fn read_after(&self, offset: u64) -> Result<Vec<Message>, LogError>;

    /// Highest id assigned so far, 0 for an empty log.
    fn last_id(&self) -> Result<u64, LogError>;
}

/// Open the log selected by configuration: RocksDB when a store is
/// configured, in-memory otherwise.
pub fn open_log(store: Option<&StoreConfig>) -> Result<Arc<dyn MessageLog>, LogError> {
    match store {
        Some(config) => {
            let store = RocksMessageLog::open(config.clone())?;
            log::info!(
                "Opened message log at {} (last id {})",
                config.path.display(),
                store.last_id()?
            );
            Ok(Arc::new(store))
        }
        None => {
            log::warn!("No storage path configured; messages will not survive a restart");
            Ok(Arc::new(MemoryMessageLog::new()))
        }
    }
}

/// Run [`MessageLog::append`] on the blocking pool.
pub(crate) async fn append_blocking(
    store: &Arc<dyn MessageLog>,
    content: String,
    author: String,
) -> Result<Message, RelayError> {
    let store = Arc::clone(store);
    Ok(tokio::task::spawn_blocking(move || store.append(&content, &author)).await??)
}

/// Run [`MessageLog::read_after`] on the blocking pool.
pub(crate) async fn read_after_blocking(
    store: &Arc<dyn MessageLog>,
    offset: u64,
) -> Result<Vec<Message>, RelayError> {
    let store = Arc::clone(store);
    Ok(tokio::task::spawn_blocking(move || store.read_after(offset)).await??)
}
