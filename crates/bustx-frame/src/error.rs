//! Frame codec error types

use thiserror::Error;

/// Frame decoding errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Buffer ends before the headers or the declared payload
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required
        needed: usize,
        /// Bytes present
        available: usize,
    },

    /// Declared length cannot describe a frame
    #[error("frame length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch {
        /// Length from the application header
        declared: usize,
        /// Length implied by the buffer
        actual: usize,
    },
}

/// Result type for frame operations
pub type FrameResult<T> = Result<T, FrameError>;
