//! # bustx-core
//!
//! Transaction lifecycle engine for bus-connected servers.
//!
//! This crate provides:
//! - The transaction state machine and the [`Transaction`] handler trait
//! - Fixed-capacity per-command transaction pools
//! - Per-(requester, command) admission locking
//! - Timeout tracking driven by the host's tick
//!
//! ## Architecture
//!
//! ```text
//! +----------------------+
//! |  TransactionManager  |  <- process_frame / handle_timeout
//! +----------------------+
//!      |           |
//! +---------+ +-----------+
//! | Buckets | |  Active   |  <- idle slots by cmd / running slots by id
//! +---------+ +-----------+
//!      |           |
//! +----------------------+
//! |   Slot arena         |  <- TransactionBase + Box<dyn Transaction>
//! +----------------------+
//! ```
//!
//! ## Usage
//!
//! ```
//! use bustx_core::{
//!     Context, ManagerConfig, Reaction, ReactionResult, Transaction, TransactionManager,
//!     TransactionMode,
//! };
//! use bustx_frame::Frame;
//!
//! #[derive(Default)]
//! struct Echo;
//!
//! impl Transaction for Echo {
//!     fn on_awake(&mut self, ctx: &mut Context<'_>) -> ReactionResult {
//!         let payload = ctx.payload().clone();
//!         ctx.reply(0x1002, payload);
//!         Ok(Reaction::Exit)
//!     }
//! }
//!
//! let mut mgr = TransactionManager::new(ManagerConfig::default());
//! mgr.register::<Echo>(0x1001, TransactionMode::Asynchronous).unwrap();
//! mgr.process_frame(&Frame::request(0x1001, 42, &b"ping"[..])).unwrap();
//! assert_eq!(mgr.drain_outbox().len(), 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod bucket;
mod error;
mod locker;
mod manager;
mod stats;
mod transaction;

pub use bucket::TransactionBucket;
pub use error::{ErrorKind, TxnError, TxnResult};
pub use locker::{LockKey, TransactionLocker};
pub use manager::{
    Dispatch, ManagerConfig, TransactionManager, TransactionMode, ASYNC_BUCKET_CAPACITY,
    SYNC_BUCKET_CAPACITY,
};
pub use stats::{BucketReport, ManagerStats, StatsReport};
pub use transaction::{
    wait, Completion, Context, Reaction, ReactionResult, Transaction, TransactionBase,
    TransactionState, MAX_CONTINUE_CHAIN,
};

pub use bustx_frame::{Command, Frame, TransactionId};
pub use bustx_timer::{Clock, ManualClock, MonotonicClock, TimerId};
