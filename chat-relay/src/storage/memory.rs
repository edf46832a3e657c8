//! In-process message log.
//!
//! Used when no storage path is configured, and by tests that need to make
//! the store fail on demand.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::MessageLog;
use crate::error::LogError;
use crate::protocol::Message;

#[derive(Debug, Default)]
struct MemoryState {
    messages: Vec<Message>,
    last_id: u64,
}

/// Message log kept in a `Vec`, ids starting at 1.
#[derive(Debug)]
pub struct MemoryMessageLog {
    state: Mutex<MemoryState>,
    available: AtomicBool,
}

impl Default for MemoryMessageLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMessageLog {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of stored messages.
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.messages.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), LogError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LogError::Persistence("store unreachable".into()))
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, LogError> {
        self.state
            .lock()
            .map_err(|_| LogError::Persistence("memory log lock poisoned".into()))
    }
}

impl MessageLog for MemoryMessageLog {
    fn append(&self, content: &str, author: &str) -> Result<Message, LogError> {
        self.check_available()?;
        let mut state = self.lock()?;
        state.last_id += 1;
        let msg = Message {
            id: state.last_id,
            content: content.to_string(),
            author: author.to_string(),
        };
        state.messages.push(msg.clone());
        Ok(msg)
    }

    fn read_after(&self, offset: u64) -> Result<Vec<Message>, LogError> {
        self.check_available()?;
        let state = self.lock()?;
        // Ids ascend with position, so everything after the partition point qualifies
        let start = state.messages.partition_point(|m| m.id <= offset);
        Ok(state.messages[start..].to_vec())
    }

    fn last_id(&self) -> Result<u64, LogError> {
        Ok(self.lock()?.last_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_read_after() {
        let store = MemoryMessageLog::new();
        for i in 1..=10 {
            let msg = store.append(&format!("m{i}"), "alice").unwrap();
            assert_eq!(msg.id, i);
        }

        let tail = store.read_after(5).unwrap();
        assert_eq!(tail.iter().map(|m| m.id).collect::<Vec<_>>(), vec![6, 7, 8, 9, 10]);
        assert!(store.read_after(10).unwrap().is_empty());
        assert_eq!(store.read_after(0).unwrap().len(), 10);
        assert_eq!(store.last_id().unwrap(), 10);
    }

    #[test]
    fn test_unavailable_store_fails_both_ways() {
        let store = MemoryMessageLog::new();
        store.append("kept", "alice").unwrap();

        store.set_available(false);
        assert!(matches!(store.append("lost", "alice"), Err(LogError::Persistence(_))));
        assert!(store.read_after(0).is_err());
        assert_eq!(store.len(), 1);

        store.set_available(true);
        let next = store.append("back", "alice").unwrap();
        assert_eq!(next.id, 2);
    }
}
