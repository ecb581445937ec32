//! Manager statistics

use std::fmt;

use bustx_frame::Command;
use serde::Serialize;

use crate::error::ErrorKind;

/// Running counters kept by the manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    /// Frames passed to `process_frame`
    pub frames_received: u64,
    /// Rejected as malformed input
    pub rejected_malformed: u64,
    /// Rejected for lack of capacity or a held lock
    pub rejected_exhausted: u64,
    /// Misuse errors returned
    pub misuse: u64,
    /// Transactions allocated
    pub transactions_started: u64,
    /// Transactions released
    pub transactions_finished: u64,
    /// Timeouts delivered to transactions
    pub timeouts_fired: u64,
    /// Handler errors, panics and protocol violations
    pub handler_faults: u64,
    /// Frames taken out of the outbox
    pub frames_sent: u64,
}

impl ManagerStats {
    pub(crate) fn record_error(&mut self, kind: ErrorKind) {
        match kind {
            ErrorKind::MalformedInput => self.rejected_malformed += 1,
            ErrorKind::ResourceExhausted => self.rejected_exhausted += 1,
            ErrorKind::Misuse => self.misuse += 1,
        }
    }

    /// Total rejected frames
    pub fn rejected(&self) -> u64 {
        self.rejected_malformed + self.rejected_exhausted
    }
}

/// Occupancy of one command's bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketReport {
    /// Command served by the bucket
    pub cmd: Command,
    /// Idle slots
    pub idle: usize,
    /// Total slots
    pub capacity: usize,
}

/// Point-in-time view of the manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsReport {
    /// Buckets in command order
    pub buckets: Vec<BucketReport>,
    /// Active transactions
    pub active: usize,
    /// Idle slots over all buckets
    pub idle: usize,
    /// Armed timers
    pub pending_timers: usize,
    /// Running counters
    pub counters: ManagerStats,
}

impl StatsReport {
    /// Total slots over all buckets
    pub fn capacity(&self) -> usize {
        self.buckets.iter().map(|b| b.capacity).sum()
    }

    /// Serialize for debugging
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "bucket num = {}", self.buckets.len())?;
        for bucket in &self.buckets {
            writeln!(
                f,
                "bucket|{:#06x}|idle={}|capacity={}",
                bucket.cmd, bucket.idle, bucket.capacity
            )?;
        }
        writeln!(
            f,
            "statistic|active={}|idle={}|timers={}",
            self.active, self.idle, self.pending_timers
        )?;
        let c = &self.counters;
        write!(
            f,
            "counters|received={}|malformed={}|exhausted={}|misuse={}|started={}|finished={}|timeouts={}|faults={}|sent={}",
            c.frames_received,
            c.rejected_malformed,
            c.rejected_exhausted,
            c.misuse,
            c.transactions_started,
            c.transactions_finished,
            c.timeouts_fired,
            c.handler_faults,
            c.frames_sent
        )
    }
}
