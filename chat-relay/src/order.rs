//! Id-ordered release of persisted messages.
//!
//! ```text
//! publish ──► take_ticket ──► append (no lock) ──► settle(ticket, msg)
//!                                                        │
//!                                   parked by id ◄───────┘
//!                                        │ next_release: lowest id, once no
//!                                        │ older append is still in flight
//!                                        ▼
//!                                    fan-out
//! ```
//!
//! Appends run on the blocking pool and may finish in any order. A parked
//! message is released when it directly follows the release point, or when
//! every append that started before it arrived has settled. Everything
//! behind the lock is in-memory bookkeeping; no store call happens under it.
//!
//! Recovery registers a replaying connection here. Messages released while
//! its backlog is being read are buffered for it rather than delivered, and
//! once the backlog is out the connection is held back from any id its
//! replay already covered.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tokio::sync::{Mutex, MutexGuard};

use crate::protocol::Message;
use crate::session::ConnectionId;

/// Shared release order for broadcast fan-out and backlog replay.
#[derive(Debug)]
pub struct DeliveryOrder {
    state: Mutex<OrderState>,
}

impl Default for DeliveryOrder {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryOrder {
    /// Order for an empty log.
    pub fn new() -> Self {
        Self::starting_after(0)
    }

    /// Order for a log whose messages up to `last_id` were written before
    /// this process started.
    pub fn starting_after(last_id: u64) -> Self {
        Self {
            state: Mutex::new(OrderState::starting_after(last_id)),
        }
    }

    /// Highest id handed to fan-out so far.
    pub async fn released(&self) -> u64 {
        self.state.lock().await.released
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, OrderState> {
        self.state.lock().await
    }
}

#[derive(Debug)]
struct Parked {
    msg: Message,
    /// Newest ticket issued when the message arrived. Only appends holding
    /// a ticket up to this one can still come back with a lower id.
    newest_ticket: u64,
}

#[derive(Debug)]
pub(crate) struct OrderState {
    released: u64,
    next_ticket: u64,
    in_flight: BTreeSet<u64>,
    parked: BTreeMap<u64, Parked>,
    /// Live messages released while a connection's backlog is being read
    replaying: HashMap<ConnectionId, Vec<Message>>,
    /// Highest id a recovered connection already got through its replay
    held_back: HashMap<ConnectionId, u64>,
}

impl OrderState {
    fn starting_after(last_id: u64) -> Self {
        Self {
            released: last_id,
            next_ticket: 1,
            in_flight: BTreeSet::new(),
            parked: BTreeMap::new(),
            replaying: HashMap::new(),
            held_back: HashMap::new(),
        }
    }

    pub(crate) fn released(&self) -> u64 {
        self.released
    }

    /// Reserve a slot for an append that is about to start.
    pub(crate) fn take_ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.in_flight.insert(ticket);
        ticket
    }

    /// Close a ticket, parking the message it produced if the append
    /// succeeded.
    pub(crate) fn settle(&mut self, ticket: u64, appended: Option<&Message>) {
        self.in_flight.remove(&ticket);
        let Some(msg) = appended else {
            return;
        };
        if msg.id <= self.released {
            log::error!(
                "Message {} committed behind release point {}; it will only reach clients through recovery",
                msg.id,
                self.released
            );
            return;
        }
        self.parked.insert(
            msg.id,
            Parked {
                msg: msg.clone(),
                newest_ticket: self.next_ticket.saturating_sub(1),
            },
        );
    }

    /// Pop the next message that may be fanned out, if any.
    pub(crate) fn next_release(&mut self) -> Option<Message> {
        let entry = self.parked.first_entry()?;
        let id = *entry.key();
        let contiguous = self.released.checked_add(1) == Some(id);
        let unblocked = self
            .in_flight
            .range(..=entry.get().newest_ticket)
            .next()
            .is_none();
        if !(contiguous || unblocked) {
            return None;
        }
        self.released = id;
        Some(entry.remove().msg)
    }

    /// Decide whether a released message goes straight to `connection`'s
    /// outbox. Replaying connections get it buffered instead.
    pub(crate) fn deliver_live(
        &mut self,
        connection: &ConnectionId,
        recovered: bool,
        msg: &Message,
    ) -> bool {
        if let Some(buffer) = self.replaying.get_mut(connection) {
            buffer.push(msg.clone());
            return false;
        }
        if !recovered {
            // Recovery reads the log after this point and will include it
            return false;
        }
        match self.held_back.get(connection) {
            Some(&through) => msg.id > through,
            None => true,
        }
    }

    /// Start buffering live messages for `connection`. False if a replay is
    /// already running for it.
    pub(crate) fn begin_replay(&mut self, connection: ConnectionId) -> bool {
        if self.replaying.contains_key(&connection) {
            return false;
        }
        self.replaying.insert(connection, Vec::new());
        true
    }

    pub(crate) fn cancel_replay(&mut self, connection: &ConnectionId) {
        self.replaying.remove(connection);
    }

    /// Stop buffering and hand back what was buffered. None if the
    /// connection went away in the meantime.
    pub(crate) fn finish_replay(&mut self, connection: &ConnectionId) -> Option<Vec<Message>> {
        self.replaying.remove(connection)
    }

    /// Skip ids up to `through` for a freshly recovered connection.
    pub(crate) fn hold_back(&mut self, connection: ConnectionId, through: u64) {
        if through > self.released {
            self.held_back.insert(connection, through);
        }
    }

    /// Forget connections that are no longer registered and hold-backs the
    /// release point has passed.
    pub(crate) fn prune(&mut self, registered: &HashSet<ConnectionId>) {
        let released = self.released;
        self.replaying.retain(|c, _| registered.contains(c));
        self.held_back
            .retain(|c, through| *through > released && registered.contains(c));
    }
}
