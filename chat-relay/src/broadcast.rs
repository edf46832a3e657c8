//! Persist-then-fan-out broadcast.
//!
//! ```text
//! publish(conn, text)
//!     │  resolve author, take a ticket
//!     ▼
//! MessageLog::append            (blocking pool, nothing locked)
//!     │
//!     ▼
//! ┌────────────── DeliveryOrder ──────────────┐
//! │ settle ticket, release parked ids in order │
//! │ for s in registry.all():                   │
//! │   recovered  → s.outbox.deliver(m)         │
//! │   replaying  → buffered for its recovery   │
//! └────────────────────────────────────────────┘
//! ```
//!
//! Nothing is delivered unless the append succeeded. A slow append holds up
//! only its own publish; later messages that got lower ids go out without
//! it, and higher ids wait in [`DeliveryOrder`] so every session still sees
//! ids in ascending order.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::RelayError;
use crate::order::{DeliveryOrder, OrderState};
use crate::protocol::{Message, ANONYMOUS};
use crate::session::{ConnectionId, Session, SessionRegistry};
use crate::storage::{append_blocking, MessageLog};

/// Snapshot of relay counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub messages_published: u64,
    pub publish_failures: u64,
    /// Outbox deliveries from live fan-out
    pub deliveries: u64,
    /// Deliveries dropped because the connection was already gone
    pub dead_deliveries: u64,
    pub recoveries: u64,
    pub recovery_failures: u64,
    pub messages_replayed: u64,
}

/// Lock-free counters, bumped at every point where the relay swallows a
/// failure so operators can see the loss rate.
#[derive(Debug, Default)]
pub struct RelayStats {
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    deliveries: AtomicU64,
    dead_deliveries: AtomicU64,
    recoveries: AtomicU64,
    recovery_failures: AtomicU64,
    messages_replayed: AtomicU64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            messages_published: self.messages_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            dead_deliveries: self.dead_deliveries.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            recovery_failures: self.recovery_failures.load(Ordering::Relaxed),
            messages_replayed: self.messages_replayed.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_recovery(&self, replayed: usize) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
        self.messages_replayed
            .fetch_add(replayed as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_recovery_failure(&self) {
        self.recovery_failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Persists posted messages and fans them out to every live session.
pub struct BroadcastEngine {
    log: Arc<dyn MessageLog>,
    registry: Arc<SessionRegistry>,
    order: Arc<DeliveryOrder>,
    stats: Arc<RelayStats>,
}

impl BroadcastEngine {
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

    /// Persist `content` under the sender's author name, then deliver it to
    /// every registered session, sender included.
    ///
    /// On append failure nothing is delivered; the error is logged and
    /// counted before being returned.
    pub async fn publish(
        &self,
        connection: &ConnectionId,
        content: &str,
    ) -> Result<Message, RelayError> {
        let author = match self.registry.get(connection).await {
            Some(session) => session.author,
            None => {
                log::warn!("Publish from unregistered connection {connection}; posting as {ANONYMOUS}");
                ANONYMOUS.to_string()
            }
        };

        let ticket = self.order.lock().await.take_ticket();

        // The ticket is settled by its own task so a dropped caller cannot
        // leave it in flight
        let log = Arc::clone(&self.log);
        let order = Arc::clone(&self.order);
        let content = content.to_string();
        let appended = tokio::spawn(async move {
            let appended = append_blocking(&log, content, author).await;
            order.lock().await.settle(ticket, appended.as_ref().ok());
            appended
        })
        .await?;

        let released = {
            let mut order = self.order.lock().await;
            self.release(&mut order).await
        };

        match appended {
            Ok(msg) => {
                self.stats.messages_published.fetch_add(1, Ordering::Relaxed);
                log::debug!("Message {} from {} persisted; {released} released", msg.id, msg.author);
                Ok(msg)
            }
            Err(e) => {
                self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Dropping message from {connection}: append failed: {e}");
                Err(e)
            }
        }
    }

    /// Fan out every message the order allows. Returns how many went out.
    async fn release(&self, order: &mut OrderState) -> usize {
        let sessions = self.registry.all().await;
        let mut released = 0;
        while let Some(msg) = order.next_release() {
            self.fan_out(order, &sessions, &msg);
            released += 1;
        }
        if released > 0 {
            let registered: HashSet<ConnectionId> = sessions.iter().map(|s| s.connection).collect();
            order.prune(&registered);
        }
        released
    }

    fn fan_out(&self, order: &mut OrderState, sessions: &[Session], msg: &Message) {
        let mut delivered = 0u64;
        for session in sessions {
            if !order.deliver_live(&session.connection, session.recovered, msg) {
                continue;
            }
            if session.outbox.deliver(msg) {
                delivered += 1;
            } else {
                self.stats.dead_deliveries.fetch_add(1, Ordering::Relaxed);
                log::debug!("Connection {} closed before message {} arrived", session.connection, msg.id);
            }
        }
        self.stats.deliveries.fetch_add(delivered, Ordering::Relaxed);
    }
}
