//! Per-command pool of idle transaction slots

use bustx_frame::Command;

/// Fixed-capacity LIFO freelist of slot indices for one command
///
/// The slots themselves live in the manager's arena. A bucket only tracks
/// which of them are idle, so its total never grows after registration.
#[derive(Debug, Clone)]
pub struct TransactionBucket {
    cmd: Command,
    capacity: usize,
    free: Vec<usize>,
}

impl TransactionBucket {
    /// Create an empty bucket
    pub fn new(cmd: Command, capacity: usize) -> Self {
        Self {
            cmd,
            capacity,
            free: Vec::with_capacity(capacity),
        }
    }

    /// Return a slot to the freelist
    pub fn push(&mut self, slot: usize) {
        debug_assert!(self.free.len() < self.capacity, "bucket overflow");
        self.free.push(slot);
    }

    /// Take the most recently returned slot
    pub fn pop(&mut self) -> Option<usize> {
        let slot = self.free.pop();
        if slot.is_none() {
            tracing::warn!(cmd = self.cmd, capacity = self.capacity, "transaction bucket is empty");
        }
        slot
    }

    /// Command served by this bucket
    pub fn cmd(&self) -> Command {
        self.cmd
    }

    /// Idle slots
    pub fn len(&self) -> usize {
        self.free.len()
    }

    /// Total slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Check if no slot is idle
    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }
}
