//! Transaction state machine
//!
//! A transaction is a pooled slot pairing a [`TransactionBase`] with a
//! user handler implementing [`Transaction`]. Inbound frames and timer
//! expirations drive it through `Awake -> Active* -> Idle`, with `Timeout`
//! entered whenever its armed timer fires.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use bustx_frame::{AppHeader, BusHeader, Command, Frame, TransactionId};
use bustx_timer::{Clock, TimeoutPool, TimerId};
use bytes::Bytes;
use serde::Serialize;

use crate::error::{TxnError, TxnResult};
use crate::stats::ManagerStats;

/// Upper bound on consecutive `Continue` reactions within one event
pub const MAX_CONTINUE_CHAIN: usize = 1024;

/// Standard wait intervals for [`Context::set_timeout`] and [`Context::enter_phase`]
pub mod wait {
    use std::time::Duration;

    /// 1 second
    pub const ONE_SECOND: Duration = Duration::from_secs(1);
    /// 2 seconds
    pub const TWO_SECONDS: Duration = Duration::from_secs(2);
    /// 3 seconds
    pub const THREE_SECONDS: Duration = Duration::from_secs(3);
    /// 4 seconds
    pub const FOUR_SECONDS: Duration = Duration::from_secs(4);
    /// 5 seconds
    pub const FIVE_SECONDS: Duration = Duration::from_secs(5);
    /// 10 seconds
    pub const TEN_SECONDS: Duration = Duration::from_secs(10);
    /// 15 seconds
    pub const FIFTEEN_SECONDS: Duration = Duration::from_secs(15);
}

/// Lifecycle state of a transaction slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    /// Pooled, inert
    #[default]
    Idle,
    /// Allocated, first frame being delivered
    Awake,
    /// Running or suspended awaiting input
    Active,
    /// Resumed because the armed timer expired
    Timeout,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Awake => "awake",
            Self::Active => "active",
            Self::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// What a handler wants after a reaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reaction {
    /// Suspend until the next frame or the armed timer
    Wait,
    /// Run `on_active` again immediately
    Continue,
    /// Finish and release the slot
    Exit,
}

/// Outcome of delivering an event to a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Completion {
    /// Still active, waiting for a frame or its timer
    Suspended,
    /// Reached exit, the slot has been released
    Exited,
}

/// Result of a handler reaction
///
/// An `Err` is contained by the event loop and forces the transaction to exit.
pub type ReactionResult = anyhow::Result<Reaction>;

/// Handler for one command's transactions
///
/// One instance lives in each pool slot and is reused across transactions,
/// so per-transaction state must be reset in [`Transaction::reconstruct`].
pub trait Transaction: Send {
    /// First frame of a new transaction
    fn on_awake(&mut self, ctx: &mut Context<'_>) -> ReactionResult;

    /// A follow-up frame arrived, or the previous reaction was `Continue`
    fn on_active(&mut self, _ctx: &mut Context<'_>) -> ReactionResult {
        Ok(Reaction::Exit)
    }

    /// The armed timer expired
    fn on_timeout(&mut self, _ctx: &mut Context<'_>) -> ReactionResult {
        Ok(Reaction::Exit)
    }

    /// Slot taken from the pool
    fn reconstruct(&mut self) {}

    /// Slot returned to the pool
    fn destruct(&mut self) {}
}

/// Bookkeeping shared by every transaction
#[derive(Debug, Clone, Default)]
pub struct TransactionBase {
    id: TransactionId,
    cmd: Command,
    requester_id: u32,
    state: TransactionState,
    phase: u32,
    pending_cmd: Command,
    timer: Option<TimerId>,
    frame: Frame,
}

impl TransactionBase {
    pub(crate) fn new(cmd: Command) -> Self {
        Self {
            cmd,
            ..Default::default()
        }
    }

    /// Transaction id, 0 while pooled
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Initiating command
    pub fn cmd(&self) -> Command {
        self.cmd
    }

    /// Requester of the initiating frame
    pub fn requester_id(&self) -> u32 {
        self.requester_id
    }

    /// Current state
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Handler-defined phase marker
    pub fn phase(&self) -> u32 {
        self.phase
    }

    /// Command the transaction waits for, 0 for any
    pub fn pending_cmd(&self) -> Command {
        self.pending_cmd
    }

    /// Armed timer, if any
    pub fn timer(&self) -> Option<TimerId> {
        self.timer
    }

    /// Most recently delivered frame
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    fn reconstruct(&mut self, id: TransactionId) {
        let cmd = self.cmd;
        *self = Self::new(cmd);
        self.id = id;
        self.state = TransactionState::Awake;
    }

    fn destruct(&mut self) {
        let cmd = self.cmd;
        *self = Self::new(cmd);
    }
}

/// Manager resources a transaction touches while handling an event
pub(crate) struct Runtime<'a> {
    pub(crate) timers: &'a mut TimeoutPool<TransactionId>,
    pub(crate) clock: &'a dyn Clock,
    pub(crate) outbox: &'a mut Vec<Frame>,
    pub(crate) stats: &'a mut ManagerStats,
}

/// Handler view of a running transaction
pub struct Context<'a> {
    base: &'a mut TransactionBase,
    timers: &'a mut TimeoutPool<TransactionId>,
    clock: &'a dyn Clock,
    outbox: &'a mut Vec<Frame>,
}

impl<'a> Context<'a> {
    fn new(base: &'a mut TransactionBase, rt: &'a mut Runtime<'_>) -> Self {
        Self {
            base,
            timers: &mut *rt.timers,
            clock: rt.clock,
            outbox: &mut *rt.outbox,
        }
    }

    /// Transaction bookkeeping
    pub fn base(&self) -> &TransactionBase {
        self.base
    }

    /// Transaction id
    pub fn id(&self) -> TransactionId {
        self.base.id
    }

    /// Initiating command
    pub fn cmd(&self) -> Command {
        self.base.cmd
    }

    /// Requester of the initiating frame
    pub fn requester_id(&self) -> u32 {
        self.base.requester_id
    }

    /// Current state
    pub fn state(&self) -> TransactionState {
        self.base.state
    }

    /// Phase marker
    pub fn phase(&self) -> u32 {
        self.base.phase
    }

    /// Command the transaction waits for
    pub fn pending_cmd(&self) -> Command {
        self.base.pending_cmd
    }

    /// Whether a timer is armed
    pub fn has_timer(&self) -> bool {
        self.base.timer.is_some()
    }

    /// Most recently delivered frame
    pub fn frame(&self) -> &Frame {
        &self.base.frame
    }

    /// Bus header of the last frame
    pub fn bus_header(&self) -> &BusHeader {
        &self.base.frame.bus_header
    }

    /// App header of the last frame
    pub fn app_header(&self) -> &AppHeader {
        &self.base.frame.app_header
    }

    /// Payload of the last frame
    pub fn payload(&self) -> &Bytes {
        &self.base.frame.payload
    }

    /// Current time in milliseconds
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Set the phase marker and clear the pending command
    pub fn set_phase(&mut self, phase: u32) {
        self.base.phase = phase;
        self.base.pending_cmd = 0;
    }

    /// Set the command the next frame must carry, 0 for any
    pub fn set_pending_cmd(&mut self, cmd: Command) {
        self.base.pending_cmd = cmd;
    }

    /// Arm a one-shot timer, replacing any armed one
    ///
    /// The pending command is cleared.
    pub fn set_timeout(&mut self, timeout: Duration) -> TimerId {
        self.base.pending_cmd = 0;
        self.cancel_timeout();

        let delay = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let timer = self.timers.add(self.clock.now_ms(), delay, self.base.id);
        self.base.timer = Some(timer);
        tracing::trace!(txn_id = self.base.id, timer_id = timer, delay, "timeout armed");
        timer
    }

    /// Cancel the armed timer, returns whether one was armed
    pub fn cancel_timeout(&mut self) -> bool {
        match self.base.timer.take() {
            Some(timer) => self.timers.cancel(timer),
            None => false,
        }
    }

    /// Move to `phase`, arm `timeout` and wait for `waiting_cmd`
    pub fn enter_phase(&mut self, phase: u32, timeout: Duration, waiting_cmd: Command) {
        self.set_phase(phase);
        self.set_timeout(timeout);
        self.set_pending_cmd(waiting_cmd);
    }

    /// Queue an outbound frame
    pub fn send(&mut self, frame: Frame) {
        self.outbox.push(frame);
    }

    /// Queue a reply to the last frame carrying this transaction's id
    pub fn reply(&mut self, cmd: Command, payload: impl Into<Bytes>) {
        let frame = self
            .base
            .frame
            .reply(cmd, payload)
            .with_transaction_id(self.base.id);
        self.outbox.push(frame);
    }
}

/// Pool slot: bookkeeping plus its handler instance
pub(crate) struct PooledTransaction {
    pub(crate) base: TransactionBase,
    handler: Box<dyn Transaction>,
}

impl PooledTransaction {
    pub(crate) fn new(cmd: Command, handler: Box<dyn Transaction>) -> Self {
        Self {
            base: TransactionBase::new(cmd),
            handler,
        }
    }

    pub(crate) fn reconstruct(&mut self, id: TransactionId) {
        self.base.reconstruct(id);
        self.handler.reconstruct();
    }

    pub(crate) fn destruct(&mut self) {
        self.handler.destruct();
        self.base.destruct();
    }

    /// Deliver the initiating frame
    pub(crate) fn process_first_frame(
        &mut self,
        frame: &Frame,
        rt: &mut Runtime<'_>,
    ) -> Completion {
        self.base.requester_id = frame.requester_id();
        self.base.frame = frame.clone();
        self.on_event(rt)
    }

    /// Deliver a follow-up frame
    pub(crate) fn process_other_frame(
        &mut self,
        frame: &Frame,
        rt: &mut Runtime<'_>,
    ) -> TxnResult<Completion> {
        let cmd = frame.cmd();
        if self.base.pending_cmd == 0 {
            self.base.pending_cmd = cmd;
        } else if self.base.pending_cmd != cmd {
            tracing::warn!(
                txn_id = self.base.id,
                expected = self.base.pending_cmd,
                got = cmd,
                "unexpected command for waiting transaction"
            );
            return Err(TxnError::UnexpectedCommand {
                transaction_id: self.base.id,
                expected: self.base.pending_cmd,
                got: cmd,
            });
        }

        self.base.frame = frame.clone();
        Ok(self.on_event(rt))
    }

    /// Deliver a timer expiration, `None` when the handle is stale
    pub(crate) fn process_timeout(
        &mut self,
        timer: TimerId,
        rt: &mut Runtime<'_>,
    ) -> Option<Completion> {
        if self.base.timer != Some(timer) {
            tracing::debug!(
                txn_id = self.base.id,
                timer_id = timer,
                armed = ?self.base.timer,
                "stale timeout ignored"
            );
            return None;
        }

        rt.timers.cancel(timer);
        self.base.timer = None;
        self.base.state = TransactionState::Timeout;
        Some(self.on_event(rt))
    }

    fn on_event(&mut self, rt: &mut Runtime<'_>) -> Completion {
        let mut chain = 0usize;

        loop {
            if let Some(timer) = self.base.timer.take() {
                rt.timers.cancel(timer);
            }

            let reaction = match self.react(rt) {
                Ok(reaction) => reaction,
                Err(reason) => {
                    tracing::error!(
                        cmd = self.base.cmd,
                        txn_id = self.base.id,
                        state = %self.base.state,
                        phase = self.base.phase,
                        %reason,
                        "transaction fault"
                    );
                    rt.stats.handler_faults += 1;
                    Reaction::Exit
                }
            };

            match reaction {
                Reaction::Wait if self.base.timer.is_none() => {
                    tracing::error!(
                        cmd = self.base.cmd,
                        txn_id = self.base.id,
                        phase = self.base.phase,
                        "wait without timer, forcing exit"
                    );
                    rt.stats.handler_faults += 1;
                    return self.exit();
                }
                Reaction::Wait => {
                    self.base.state = TransactionState::Active;
                    tracing::debug!(
                        txn_id = self.base.id,
                        phase = self.base.phase,
                        pending_cmd = self.base.pending_cmd,
                        "transaction waiting"
                    );
                    return Completion::Suspended;
                }
                Reaction::Continue => {
                    chain += 1;
                    if chain >= MAX_CONTINUE_CHAIN {
                        tracing::error!(
                            cmd = self.base.cmd,
                            txn_id = self.base.id,
                            chain,
                            "continue chain too long, forcing exit"
                        );
                        rt.stats.handler_faults += 1;
                        return self.exit();
                    }
                    self.base.state = TransactionState::Active;
                }
                Reaction::Exit => return self.exit(),
            }
        }
    }

    fn exit(&mut self) -> Completion {
        tracing::debug!(
            cmd = self.base.cmd,
            txn_id = self.base.id,
            phase = self.base.phase,
            "transaction exit"
        );
        self.base.state = TransactionState::Idle;
        Completion::Exited
    }

    /// Run one reaction behind the fault boundary
    fn react(&mut self, rt: &mut Runtime<'_>) -> Result<Reaction, String> {
        let state = self.base.state;
        let handler = &mut self.handler;
        let mut ctx = Context::new(&mut self.base, rt);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match state {
            TransactionState::Awake => handler.on_awake(&mut ctx),
            TransactionState::Active => handler.on_active(&mut ctx),
            TransactionState::Timeout => handler.on_timeout(&mut ctx),
            TransactionState::Idle => Err(anyhow::anyhow!("event delivered to idle transaction")),
        }));

        match outcome {
            Ok(Ok(reaction)) => Ok(reaction),
            Ok(Err(err)) => Err(format!("{err:#}")),
            Err(panic) => Err(panic_message(panic.as_ref())),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("panic: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("panic: {msg}")
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bustx_timer::ManualClock;

    struct Harness {
        timers: TimeoutPool<TransactionId>,
        clock: ManualClock,
        outbox: Vec<Frame>,
        stats: ManagerStats,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                timers: TimeoutPool::new(),
                clock: ManualClock::new(0),
                outbox: Vec::new(),
                stats: ManagerStats::default(),
            }
        }

        fn runtime(&mut self) -> Runtime<'_> {
            Runtime {
                timers: &mut self.timers,
                clock: &self.clock,
                outbox: &mut self.outbox,
                stats: &mut self.stats,
            }
        }
    }

    /// Waits for 0x2002 for one second, then exits on anything
    #[derive(Default)]
    struct Waiter {
        resets: usize,
    }

    impl Transaction for Waiter {
        fn on_awake(&mut self, ctx: &mut Context<'_>) -> ReactionResult {
            ctx.enter_phase(1, wait::ONE_SECOND, 0x2002);
            Ok(Reaction::Wait)
        }

        fn reconstruct(&mut self) {
            self.resets += 1;
        }
    }

    #[derive(Default)]
    struct Looper;

    impl Transaction for Looper {
        fn on_awake(&mut self, _ctx: &mut Context<'_>) -> ReactionResult {
            Ok(Reaction::Continue)
        }

        fn on_active(&mut self, _ctx: &mut Context<'_>) -> ReactionResult {
            Ok(Reaction::Continue)
        }
    }

    fn slot<T: Transaction + Default + 'static>(id: TransactionId) -> PooledTransaction {
        let mut slot = PooledTransaction::new(0x2001, Box::new(T::default()));
        slot.reconstruct(id);
        slot
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TransactionState::Idle.to_string(), "idle");
        assert_eq!(TransactionState::Timeout.to_string(), "timeout");
    }

    #[test]
    fn test_reconstruct_and_destruct() {
        let mut slot = slot::<Waiter>(5);
        assert_eq!(slot.base.id(), 5);
        assert_eq!(slot.base.cmd(), 0x2001);
        assert_eq!(slot.base.state(), TransactionState::Awake);

        slot.destruct();
        assert_eq!(slot.base.id(), 0);
        assert_eq!(slot.base.cmd(), 0x2001);
        assert_eq!(slot.base.state(), TransactionState::Idle);
    }

    #[test]
    fn test_enter_phase_arms_timer() {
        let mut h = Harness::new();
        let mut slot = slot::<Waiter>(9);

        let frame = Frame::request(0x2001, 77, &b"x"[..]);
        let completion = slot.process_first_frame(&frame, &mut h.runtime());

        assert_eq!(completion, Completion::Suspended);
        assert_eq!(slot.base.state(), TransactionState::Active);
        assert_eq!(slot.base.requester_id(), 77);
        assert_eq!(slot.base.phase(), 1);
        assert_eq!(slot.base.pending_cmd(), 0x2002);
        assert_eq!(h.timers.len(), 1);
        assert_eq!(h.timers.next_expiration(), Some(1_000));
    }

    #[test]
    fn test_other_frame_with_wrong_cmd_changes_nothing() {
        let mut h = Harness::new();
        let mut slot = slot::<Waiter>(9);
        slot.process_first_frame(&Frame::request(0x2001, 1, Bytes::new()), &mut h.runtime());
        let timer = slot.base.timer();

        let stray = Frame::request(0x2003, 1, Bytes::new()).with_transaction_id(9);
        let err = slot.process_other_frame(&stray, &mut h.runtime()).unwrap_err();

        assert!(matches!(err, TxnError::UnexpectedCommand { expected: 0x2002, got: 0x2003, .. }));
        assert_eq!(slot.base.timer(), timer);
        assert_eq!(slot.base.state(), TransactionState::Active);
        assert_eq!(slot.base.frame().cmd(), 0x2001);
    }

    #[test]
    fn test_stale_timeout_is_ignored() {
        let mut h = Harness::new();
        let mut slot = slot::<Waiter>(9);
        slot.process_first_frame(&Frame::request(0x2001, 1, Bytes::new()), &mut h.runtime());
        let armed = slot.base.timer().unwrap();

        assert_eq!(slot.process_timeout(armed + 100, &mut h.runtime()), None);
        assert_eq!(slot.base.timer(), Some(armed));
        assert_eq!(slot.base.state(), TransactionState::Active);
        assert_eq!(slot.base.phase(), 1);
        assert_eq!(slot.base.pending_cmd(), 0x2002);
        assert!(h.timers.contains(armed));

        assert_eq!(
            slot.process_timeout(armed, &mut h.runtime()),
            Some(Completion::Exited)
        );
        assert!(h.timers.is_empty());
    }

    #[test]
    fn test_timeout_after_sweep_leaves_pool_clean() {
        let mut h = Harness::new();
        let mut slot = slot::<Waiter>(9);
        slot.process_first_frame(&Frame::request(0x2001, 1, Bytes::new()), &mut h.runtime());
        let armed = slot.base.timer().unwrap();

        let fired = h.timers.pop_expired(1_000);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].id, armed);

        assert_eq!(
            slot.process_timeout(armed, &mut h.runtime()),
            Some(Completion::Exited)
        );
        assert!(h.timers.is_empty());
        assert_eq!(slot.base.timer(), None);
    }

    #[test]
    fn test_continue_chain_is_bounded() {
        let mut h = Harness::new();
        let mut slot = slot::<Looper>(3);

        let request = Frame::request(0x2001, 1, Bytes::new());
        let completion = slot.process_first_frame(&request, &mut h.runtime());

        assert_eq!(completion, Completion::Exited);
        assert_eq!(slot.base.state(), TransactionState::Idle);
        assert_eq!(h.stats.handler_faults, 1);
    }

    #[test]
    fn test_panic_message() {
        let caught = panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "panic: boom 1");
    }
}
