//! # bustx-timer
//!
//! Expiration pool used to drive transaction timeouts.
//!
//! This crate provides:
//! - One-shot and repeating expiration events keyed by a unique handle
//! - Cancellation by handle
//! - Ordered extraction of every event expired at a given time
//! - A [`Clock`] abstraction with monotonic and manually driven implementations
//!
//! Time is a plain millisecond counter supplied by the caller, so the pool
//! itself never reads a clock and never blocks.
//!
//! ## Usage
//!
//! ```
//! use bustx_timer::TimeoutPool;
//!
//! let mut pool = TimeoutPool::new();
//! let id = pool.add(0, 100, "payload");
//! assert_eq!(pool.next_expiration(), Some(100));
//!
//! let fired = pool.pop_expired(100);
//! assert_eq!(fired[0].id, id);
//! assert!(pool.is_empty());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod clock;
mod pool;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use pool::{Expired, TimeoutPool, TimerId, CATCH_UP_WARN_FIRINGS};
