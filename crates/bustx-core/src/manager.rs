//! Transaction manager implementation

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use bustx_frame::{Command, Frame, TransactionId};
use bustx_timer::{Clock, MonotonicClock, TimeoutPool};

use crate::bucket::TransactionBucket;
use crate::error::{TxnError, TxnResult};
use crate::locker::TransactionLocker;
use crate::stats::{BucketReport, ManagerStats, StatsReport};
use crate::transaction::{Completion, PooledTransaction, Runtime, Transaction, TransactionBase};

/// Slots per command in synchronous mode
pub const SYNC_BUCKET_CAPACITY: usize = 1;

/// Slots per command in asynchronous mode
pub const ASYNC_BUCKET_CAPACITY: usize = 1024;

/// Concurrency mode of a registered command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionMode {
    /// One transaction at a time
    Synchronous,
    /// Up to [`ASYNC_BUCKET_CAPACITY`] transactions at a time
    Asynchronous,
}

impl TransactionMode {
    /// Bucket capacity for this mode
    pub fn capacity(self) -> usize {
        match self {
            Self::Synchronous => SYNC_BUCKET_CAPACITY,
            Self::Asynchronous => ASYNC_BUCKET_CAPACITY,
        }
    }
}

/// Manager configuration
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    /// Reject a new request while the same requester has one running for
    /// the same command
    pub use_locker: bool,
}

/// Result of a dispatched frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    /// Transaction that handled the frame
    pub transaction_id: TransactionId,
    /// Whether it is still running
    pub completion: Completion,
}

/// Owner of every transaction slot, bucket, lock and timer
///
/// Inbound frames enter through [`process_frame`](Self::process_frame) and
/// the host calls [`handle_timeout`](Self::handle_timeout) once per tick.
pub struct TransactionManager {
    /// Configuration
    config: ManagerConfig,
    /// Slot arena, never shrinks
    slots: Vec<PooledTransaction>,
    /// Active transactions by id
    active: HashMap<TransactionId, usize>,
    /// Idle slots by command
    buckets: BTreeMap<Command, TransactionBucket>,
    /// Admission locks
    locker: TransactionLocker,
    /// Transaction timeouts, payload is the owning id
    timers: TimeoutPool<TransactionId>,
    /// Time source
    clock: Box<dyn Clock + Send>,
    /// Frames queued by handlers
    outbox: Vec<Frame>,
    /// Next id candidate
    next_id: TransactionId,
    /// Counters
    stats: ManagerStats,
}

impl TransactionManager {
    /// Create a manager on the monotonic clock
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_clock(config, MonotonicClock::new())
    }

    /// Create a manager on a custom clock
    pub fn with_clock(config: ManagerConfig, clock: impl Clock + Send + 'static) -> Self {
        Self {
            config,
            slots: Vec::new(),
            active: HashMap::new(),
            buckets: BTreeMap::new(),
            locker: TransactionLocker::new(),
            timers: TimeoutPool::new(),
            clock: Box::new(clock),
            outbox: Vec::new(),
            next_id: seed_transaction_id(),
            stats: ManagerStats::default(),
        }
    }

    /// Register a handler factory for `cmd`
    ///
    /// Pre-allocates one handler per slot of the mode's capacity.
    pub fn register_command<F>(
        &mut self,
        cmd: Command,
        mode: TransactionMode,
        mut factory: F,
    ) -> TxnResult<()>
    where
        F: FnMut() -> Box<dyn Transaction>,
    {
        if self.buckets.contains_key(&cmd) {
            tracing::error!(cmd, "command registered twice");
            self.stats.misuse += 1;
            return Err(TxnError::AlreadyRegistered(cmd));
        }

        let capacity = mode.capacity();
        let mut bucket = TransactionBucket::new(cmd, capacity);
        self.slots.reserve(capacity);
        for _ in 0..capacity {
            let index = self.slots.len();
            self.slots.push(PooledTransaction::new(cmd, factory()));
            bucket.push(index);
        }
        self.buckets.insert(cmd, bucket);

        tracing::info!(cmd, ?mode, capacity, "command registered");
        Ok(())
    }

    /// Register `T::default()` as the handler for `cmd`
    pub fn register<T>(&mut self, cmd: Command, mode: TransactionMode) -> TxnResult<()>
    where
        T: Transaction + Default + 'static,
    {
        self.register_command(cmd, mode, || Box::new(T::default()))
    }

    /// Route an inbound frame
    ///
    /// A frame with transaction id 0 starts a new transaction, any other id
    /// resumes the active transaction it names.
    pub fn process_frame(&mut self, frame: &Frame) -> TxnResult<Dispatch> {
        self.stats.frames_received += 1;
        let result = self.dispatch(frame);
        if let Err(err) = &result {
            self.stats.record_error(err.kind());
        }
        result
    }

    fn dispatch(&mut self, frame: &Frame) -> TxnResult<Dispatch> {
        let cmd = frame.cmd();
        if !frame.is_valid() {
            tracing::warn!(cmd, length = frame.app_header.length, "invalid frame");
            return Err(TxnError::InvalidFrame {
                cmd,
                declared: frame.app_header.length,
                actual: bustx_frame::FRAME_HEADER_LEN + frame.payload.len(),
            });
        }

        frame.dump();
        let transaction_id = frame.transaction_id();
        tracing::debug!(
            cmd,
            txn_id = transaction_id,
            requester = frame.requester_id(),
            "process frame"
        );

        let (transaction_id, completion) = if transaction_id != 0 {
            let Some(&index) = self.active.get(&transaction_id) else {
                tracing::warn!(cmd, txn_id = transaction_id, "can not get active transaction");
                return Err(TxnError::UnknownTransaction {
                    cmd,
                    transaction_id,
                });
            };
            let (slot, mut rt) = self.slot_and_runtime(index);
            (transaction_id, slot.process_other_frame(frame, &mut rt)?)
        } else {
            let index = self.new_transaction(frame.requester_id(), cmd)?;
            let (slot, mut rt) = self.slot_and_runtime(index);
            let transaction_id = slot.base.id();
            (transaction_id, slot.process_first_frame(frame, &mut rt))
        };

        self.settle(transaction_id, completion);
        Ok(Dispatch {
            transaction_id,
            completion,
        })
    }

    /// Deliver every timer expired at the current time
    ///
    /// Returns the number of timeouts delivered to live transactions.
    pub fn handle_timeout(&mut self) -> usize {
        let now = self.clock.now_ms();
        let expired = self.timers.pop_expired(now);
        if expired.is_empty() {
            return 0;
        }
        tracing::debug!(now, count = expired.len(), "timers expired");

        let mut delivered = 0;
        for event in expired {
            let transaction_id = event.payload;
            let Some(&index) = self.active.get(&transaction_id) else {
                tracing::debug!(
                    txn_id = transaction_id,
                    timer_id = event.id,
                    "timeout for released transaction"
                );
                continue;
            };

            let (slot, mut rt) = self.slot_and_runtime(index);
            if let Some(completion) = slot.process_timeout(event.id, &mut rt) {
                delivered += 1;
                self.stats.timeouts_fired += 1;
                self.settle(transaction_id, completion);
            }
        }
        delivered
    }

    /// Release an active transaction back to its bucket
    ///
    /// Called automatically when a transaction exits. Calling it on a
    /// suspended transaction aborts it.
    pub fn free_transaction(&mut self, transaction_id: TransactionId) -> TxnResult<()> {
        let Some(index) = self.active.remove(&transaction_id) else {
            tracing::error!(txn_id = transaction_id, "transaction is not active");
            self.stats.misuse += 1;
            return Err(TxnError::DoubleFree(transaction_id));
        };

        let slot = &mut self.slots[index];
        let cmd = slot.base.cmd();
        let requester_id = slot.base.requester_id();
        if let Some(timer) = slot.base.timer() {
            self.timers.cancel(timer);
        }
        slot.destruct();

        match self.buckets.get_mut(&cmd) {
            Some(bucket) => bucket.push(index),
            None => tracing::error!(cmd, "no bucket for released transaction"),
        }
        if self.config.use_locker {
            self.unlock_requester(requester_id, cmd);
        }

        self.stats.transactions_finished += 1;
        tracing::debug!(cmd, txn_id = transaction_id, "transaction freed");
        Ok(())
    }

    /// Check whether `cmd` has a bucket
    pub fn is_registered(&self, cmd: Command) -> bool {
        self.buckets.contains_key(&cmd)
    }

    /// Active transactions
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Idle slots over all buckets
    pub fn idle_count(&self) -> usize {
        self.buckets.values().map(TransactionBucket::len).sum()
    }

    /// Bucket for `cmd`
    pub fn bucket(&self, cmd: Command) -> Option<&TransactionBucket> {
        self.buckets.get(&cmd)
    }

    /// Bookkeeping of an active transaction
    pub fn transaction(&self, transaction_id: TransactionId) -> Option<&TransactionBase> {
        self.active
            .get(&transaction_id)
            .map(|&index| &self.slots[index].base)
    }

    /// Check whether a (requester, command) lock is held
    pub fn is_locked(&self, requester_id: u32, cmd: Command) -> bool {
        self.locker.is_locked(requester_id, cmd)
    }

    /// Earliest armed timeout
    pub fn next_timer_deadline(&self) -> Option<u64> {
        self.timers.next_expiration()
    }

    /// Armed timeouts
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Current time of the manager's clock
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Take every frame queued by handlers
    pub fn drain_outbox(&mut self) -> Vec<Frame> {
        let frames = std::mem::take(&mut self.outbox);
        self.stats.frames_sent += frames.len() as u64;
        frames
    }

    /// Configuration
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Running counters
    pub fn counters(&self) -> &ManagerStats {
        &self.stats
    }

    /// Snapshot of buckets, occupancy and counters
    pub fn statistics(&self) -> StatsReport {
        let buckets: Vec<_> = self
            .buckets
            .values()
            .map(|bucket| BucketReport {
                cmd: bucket.cmd(),
                idle: bucket.len(),
                capacity: bucket.capacity(),
            })
            .collect();
        let report = StatsReport {
            buckets,
            active: self.active_count(),
            idle: self.idle_count(),
            pending_timers: self.timers.len(),
            counters: self.stats,
        };

        if report.active + report.idle != self.slots.len() {
            tracing::error!(
                active = report.active,
                idle = report.idle,
                slots = self.slots.len(),
                "slot accounting mismatch"
            );
        }
        report
    }

    /// Log the statistics snapshot at info level
    pub fn log_statistics(&self) {
        let report = self.statistics();
        tracing::info!(buckets = report.buckets.len(), "bucket num");
        for bucket in &report.buckets {
            tracing::info!(
                cmd = bucket.cmd,
                idle = bucket.idle,
                capacity = bucket.capacity,
                "bucket info"
            );
        }
        tracing::info!(
            active = report.active,
            idle = report.idle,
            timers = report.pending_timers,
            "statistic"
        );
        tracing::debug!(counters = ?report.counters, "statistic counters");
    }

    fn new_transaction(&mut self, requester_id: u32, cmd: Command) -> TxnResult<usize> {
        if !self.buckets.contains_key(&cmd) {
            tracing::warn!(cmd, "cmd is not registered");
            return Err(TxnError::UnregisteredCommand(cmd));
        }

        if self.config.use_locker && !self.lock_requester(requester_id, cmd) {
            return Err(TxnError::DuplicateRequest { requester_id, cmd });
        }

        let Some(index) = self.buckets.get_mut(&cmd).and_then(TransactionBucket::pop) else {
            if self.config.use_locker {
                self.unlock_requester(requester_id, cmd);
            }
            tracing::error!(cmd, requester = requester_id, "idle transaction is not enough");
            return Err(TxnError::PoolExhausted(cmd));
        };

        let transaction_id = self.allocate_id();
        self.slots[index].reconstruct(transaction_id);
        self.active.insert(transaction_id, index);
        self.stats.transactions_started += 1;
        tracing::debug!(
            cmd,
            txn_id = transaction_id,
            requester = requester_id,
            "transaction allocated"
        );
        Ok(index)
    }

    fn allocate_id(&mut self) -> TransactionId {
        loop {
            let candidate = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if candidate != 0 && !self.active.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    fn lock_requester(&mut self, requester_id: u32, cmd: Command) -> bool {
        self.locker.lock(requester_id, cmd)
    }

    fn unlock_requester(&mut self, requester_id: u32, cmd: Command) {
        if !self.locker.unlock(requester_id, cmd) {
            tracing::warn!(requester = requester_id, cmd, "unlock of free requester");
        }
    }

    fn settle(&mut self, transaction_id: TransactionId, completion: Completion) {
        if completion == Completion::Exited {
            if let Err(err) = self.free_transaction(transaction_id) {
                tracing::error!(txn_id = transaction_id, %err, "release after exit failed");
            }
        }
    }

    fn slot_and_runtime(&mut self, index: usize) -> (&mut PooledTransaction, Runtime<'_>) {
        let Self {
            slots,
            timers,
            clock,
            outbox,
            stats,
            ..
        } = self;
        let rt = Runtime {
            timers,
            clock: &**clock,
            outbox,
            stats,
        };
        (&mut slots[index], rt)
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("config", &self.config)
            .field("buckets", &self.buckets.len())
            .field("active", &self.active.len())
            .field("timers", &self.timers)
            .finish()
    }
}

/// Seed ids from the wall clock so restarts do not reuse recent ids
fn seed_transaction_id() -> TransactionId {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let seed = (elapsed.as_secs() % 3600) * 1_000_000 + u64::from(elapsed.subsec_micros());
    seed as TransactionId
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{Context, Reaction, ReactionResult};
    use bustx_timer::ManualClock;
    use bytes::Bytes;

    #[derive(Default)]
    struct Once;

    impl Transaction for Once {
        fn on_awake(&mut self, _ctx: &mut Context<'_>) -> ReactionResult {
            Ok(Reaction::Exit)
        }
    }

    fn manager() -> TransactionManager {
        TransactionManager::with_clock(ManagerConfig::default(), ManualClock::new(0))
    }

    #[test]
    fn test_mode_capacity() {
        assert_eq!(TransactionMode::Synchronous.capacity(), 1);
        assert_eq!(TransactionMode::Asynchronous.capacity(), 1024);
    }

    #[test]
    fn test_register_preallocates() {
        let mut mgr = manager();
        mgr.register::<Once>(0x10, TransactionMode::Asynchronous).unwrap();
        mgr.register::<Once>(0x11, TransactionMode::Synchronous).unwrap();

        assert_eq!(mgr.slots.len(), 1025);
        assert_eq!(mgr.idle_count(), 1025);
        assert_eq!(mgr.bucket(0x11).unwrap().capacity(), 1);
        assert!(mgr.is_registered(0x10));
        assert!(!mgr.is_registered(0x12));
    }

    #[test]
    fn test_register_twice() {
        let mut mgr = manager();
        mgr.register::<Once>(0x10, TransactionMode::Synchronous).unwrap();
        let err = mgr
            .register::<Once>(0x10, TransactionMode::Asynchronous)
            .unwrap_err();

        assert_eq!(err, TxnError::AlreadyRegistered(0x10));
        assert_eq!(mgr.bucket(0x10).unwrap().capacity(), 1);
    }

    #[test]
    fn test_seed_within_hour() {
        assert!(seed_transaction_id() < 3_600_000_000);
    }

    #[test]
    fn test_id_wraps_and_skips_zero() {
        let mut mgr = manager();
        mgr.next_id = TransactionId::MAX;
        assert_eq!(mgr.allocate_id(), TransactionId::MAX);
        assert_eq!(mgr.allocate_id(), 1);
    }

    #[test]
    fn test_id_skips_active() {
        let mut mgr = manager();
        mgr.active.insert(100, 0);
        mgr.active.insert(101, 1);
        mgr.next_id = 100;
        assert_eq!(mgr.allocate_id(), 102);
    }

    #[test]
    fn test_locker_untouched_when_disabled() {
        let mut mgr = manager();
        mgr.register::<Once>(0x10, TransactionMode::Asynchronous).unwrap();
        mgr.process_frame(&Frame::request(0x10, 7, Bytes::new())).unwrap();
        assert!(mgr.locker.is_empty());
    }

    #[test]
    fn test_slot_accounting() {
        let mut mgr = manager();
        mgr.register::<Once>(0x10, TransactionMode::Asynchronous).unwrap();
        for requester in 0..10 {
            let dispatch = mgr
                .process_frame(&Frame::request(0x10, requester, Bytes::new()))
                .unwrap();
            assert_eq!(dispatch.completion, Completion::Exited);
        }

        let report = mgr.statistics();
        assert_eq!(report.active + report.idle, mgr.slots.len());
        assert_eq!(report.counters.transactions_started, 10);
        assert_eq!(report.counters.transactions_finished, 10);
    }
}
