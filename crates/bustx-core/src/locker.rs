//! Admission lock on (requester, command) pairs

use std::collections::HashSet;

use bustx_frame::Command;

/// Lock key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey {
    /// Requester id
    pub requester_id: u32,
    /// Initiating command
    pub cmd: Command,
}

impl LockKey {
    /// Create a key
    pub fn new(requester_id: u32, cmd: Command) -> Self {
        Self { requester_id, cmd }
    }
}

/// Set of requesters with a transaction in flight, per command
#[derive(Debug, Clone, Default)]
pub struct TransactionLocker {
    locks: HashSet<LockKey>,
}

impl TransactionLocker {
    /// Create an empty locker
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock, `false` if it is already held
    pub fn lock(&mut self, requester_id: u32, cmd: Command) -> bool {
        if self.locks.insert(LockKey::new(requester_id, cmd)) {
            tracing::trace!(requester = requester_id, cmd, "requester locked");
            true
        } else {
            tracing::warn!(requester = requester_id, cmd, "requester already locked");
            false
        }
    }

    /// Release the lock, `false` if it was not held
    pub fn unlock(&mut self, requester_id: u32, cmd: Command) -> bool {
        self.locks.remove(&LockKey::new(requester_id, cmd))
    }

    /// Check whether the lock is held
    pub fn is_locked(&self, requester_id: u32, cmd: Command) -> bool {
        self.locks.contains(&LockKey::new(requester_id, cmd))
    }

    /// Held locks
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Check if no lock is held
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
