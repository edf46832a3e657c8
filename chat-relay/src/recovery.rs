//! Backlog replay for new and resumed connections.
//!
//! A client declares the last id it has seen (`serverOffset`). Recovery reads
//! every message after that offset in one log query and pushes them through
//! the session's outbox, the same primitive live broadcast uses, then marks
//! the session recovered.
//!
//! ```text
//! begin_replay ──► read_after(offset) ──► under DeliveryOrder:
//!  (live fan-out      (no lock held)        backlog, then buffered live
//!   now buffers)                            messages past it, then mark
//!                                           recovered and hold back
//! ```
//!
//! A message therefore reaches a session either through the backlog or
//! live, never both, and always in id order. Ids at or below the resume
//! offset are never sent to that connection.

use std::sync::Arc;

use crate::broadcast::RelayStats;
use crate::error::{RegistryError, RelayError};
use crate::order::DeliveryOrder;
use crate::session::{ConnectionId, SessionRegistry};
use crate::storage::{read_after_blocking, MessageLog};

/// Result of a [`RecoveryEngine::recover`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The session had already been recovered; nothing was sent.
    AlreadyRecovered,
    /// Another recover call for the same connection has not finished yet.
    InProgress,
    /// `count` messages were delivered; `through` is the highest id sent
    /// (the resume offset when there was nothing to send).
    Replayed { count: usize, through: u64 },
}

pub struct RecoveryEngine {
    log: Arc<dyn MessageLog>,
    registry: Arc<SessionRegistry>,
    order: Arc<DeliveryOrder>,
    stats: Arc<RelayStats>,
}

impl RecoveryEngine {
    pub fn new(
        log: Arc<dyn MessageLog>,
        registry: Arc<SessionRegistry>,
        order: Arc<DeliveryOrder>,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            log,
            registry,
            order,
            stats,
        }
    }

    /// Replay the backlog for `connection` once per connection lifetime.
    ///
    /// If the log read fails nothing is delivered and the session stays
    /// un-recovered, so a later call tries again.
    pub async fn recover(&self, connection: &ConnectionId) -> Result<RecoveryOutcome, RelayError> {
        let session = self
            .registry
            .get(connection)
            .await
            .ok_or(RegistryError::UnknownConnection(*connection))?;

        if session.recovered {
            return Ok(RecoveryOutcome::AlreadyRecovered);
        }
        if !self.order.lock().await.begin_replay(*connection) {
            return Ok(RecoveryOutcome::InProgress);
        }

        let backlog = match read_after_blocking(&self.log, session.resume_offset).await {
            Ok(backlog) => backlog,
            Err(e) => {
                self.order.lock().await.cancel_replay(connection);
                self.stats.record_recovery_failure();
                log::error!(
                    "Recovery for {connection} from offset {} abandoned: {e}",
                    session.resume_offset
                );
                return Err(e);
            }
        };

        let mut order = self.order.lock().await;
        let buffered = order
            .finish_replay(connection)
            .ok_or(RegistryError::UnknownConnection(*connection))?;

        // Buffered live messages may overlap the tail of the backlog
        let mut through = session.resume_offset;
        let mut count = 0;
        for msg in backlog.iter().chain(buffered.iter()) {
            if msg.id <= through {
                continue;
            }
            if !session.outbox.deliver(msg) {
                log::debug!("Connection {connection} closed during replay");
                break;
            }
            through = msg.id;
            count += 1;
        }

        self.registry.mark_recovered(connection).await?;
        order.hold_back(*connection, through);
        drop(order);

        self.stats.record_recovery(count);
        log::debug!(
            "Replayed {count} messages to {connection} ({} → {through})",
            session.resume_offset
        );

        Ok(RecoveryOutcome::Replayed { count, through })
    }
}
