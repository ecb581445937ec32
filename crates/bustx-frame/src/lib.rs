//! # bustx-frame
//!
//! Frames exchanged over the bus.
//!
//! A frame is a routing header, an application header and an opaque payload:
//!
//! ```text
//! +-------------------+  20 bytes
//! |    BusHeader      |  src, dest, router, ttl, client position
//! +-------------------+  22 bytes
//! |    AppHeader      |  length, requester, ip, cmd, services, transaction id
//! +-------------------+
//! |    payload        |  length - 42 bytes
//! +-------------------+
//! ```
//!
//! All integers are big-endian.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod frame;

pub use error::{FrameError, FrameResult};
pub use frame::{
    AppHeader, BusHeader, Command, Frame, ServiceId, TransactionId, APP_HEADER_LEN,
    BUS_HEADER_LEN, FRAME_HEADER_LEN,
};
