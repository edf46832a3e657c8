//! Test log that parks one call until it is let through.

use std::sync::{Condvar, Mutex};

use super::{MemoryMessageLog, MessageLog};
use crate::error::LogError;
use crate::protocol::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Stall {
    /// Append of this content blocks before it gets an id
    BeforeAppend(String),
    /// Append of this content gets its id, then blocks
    AfterAppend(String),
    /// The first read blocks before querying
    BeforeRead,
    /// The first read queries, then blocks before returning
    AfterRead,
}

#[derive(Debug, Default)]
struct Gate {
    open: bool,
    stalled: bool,
    reads: usize,
}

/// Wraps [`MemoryMessageLog`]; one call blocks until [`GatedLog::open`].
pub(crate) struct GatedLog {
    inner: MemoryMessageLog,
    stall: Stall,
    gate: Mutex<Gate>,
    cond: Condvar,
}

impl GatedLog {
    pub(crate) fn before_append(trigger: &str) -> Self {
        Self::new(Stall::BeforeAppend(trigger.to_string()))
    }

    pub(crate) fn after_append(trigger: &str) -> Self {
        Self::new(Stall::AfterAppend(trigger.to_string()))
    }

    pub(crate) fn before_read() -> Self {
        Self::new(Stall::BeforeRead)
    }

    pub(crate) fn after_read() -> Self {
        Self::new(Stall::AfterRead)
    }

    fn new(stall: Stall) -> Self {
        Self {
            inner: MemoryMessageLog::new(),
            stall,
            gate: Mutex::new(Gate::default()),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn is_stalled(&self) -> bool {
        self.gate.lock().unwrap().stalled
    }

    pub(crate) fn open(&self) {
        self.gate.lock().unwrap().open = true;
        self.cond.notify_all();
    }

    /// Poll until the gated call is parked.
    pub(crate) async fn wait_until_stalled(&self) {
        for _ in 0..200 {
            if self.is_stalled() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("call never reached the gate");
    }

    fn wait(&self) {
        let mut gate = self.gate.lock().unwrap();
        gate.stalled = true;
        while !gate.open {
            gate = self.cond.wait(gate).unwrap();
        }
        gate.stalled = false;
    }

    fn first_read(&self) -> bool {
        let mut gate = self.gate.lock().unwrap();
        gate.reads += 1;
        gate.reads == 1
    }
}

impl MessageLog for GatedLog {
    fn append(&self, content: &str, author: &str) -> Result<Message, LogError> {
        match &self.stall {
            Stall::BeforeAppend(trigger) if trigger == content => {
                self.wait();
                self.inner.append(content, author)
            }
            Stall::AfterAppend(trigger) if trigger == content => {
                let msg = self.inner.append(content, author)?;
                self.wait();
                Ok(msg)
            }
            _ => self.inner.append(content, author),
        }
    }

    fn read_after(&self, offset: u64) -> Result<Vec<Message>, LogError> {
        match self.stall {
            Stall::BeforeRead if self.first_read() => {
                self.wait();
                self.inner.read_after(offset)
            }
            Stall::AfterRead if self.first_read() => {
                let backlog = self.inner.read_after(offset)?;
                self.wait();
                Ok(backlog)
            }
            _ => self.inner.read_after(offset),
        }
    }

    fn last_id(&self) -> Result<u64, LogError> {
        self.inner.last_id()
    }
}
