//! Transaction manager error types

use bustx_frame::{Command, TransactionId};
use serde::Serialize;
use thiserror::Error;

/// Transaction manager errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TxnError {
    /// Frame failed the header length check
    #[error("invalid frame: cmd {cmd:#06x}, declared length {declared}, actual {actual}")]
    InvalidFrame {
        /// Frame command
        cmd: Command,
        /// Length carried in the app header
        declared: u32,
        /// Length computed from the payload
        actual: usize,
    },

    /// No bucket registered for the command
    #[error("command {0:#06x} is not registered")]
    UnregisteredCommand(Command),

    /// Frame addressed to a transaction that is not active
    #[error("no active transaction {transaction_id} for cmd {cmd:#06x}")]
    UnknownTransaction {
        /// Frame command
        cmd: Command,
        /// Transaction id in the app header
        transaction_id: TransactionId,
    },

    /// Active transaction is waiting for a different command
    #[error("transaction {transaction_id} waits for cmd {expected:#06x}, got {got:#06x}")]
    UnexpectedCommand {
        /// Target transaction
        transaction_id: TransactionId,
        /// Pending command
        expected: Command,
        /// Command of the rejected frame
        got: Command,
    },

    /// Bucket has no idle slot
    #[error("transaction pool for cmd {0:#06x} is exhausted")]
    PoolExhausted(Command),

    /// Requester already has a transaction running for the command
    #[error("duplicate request from {requester_id} for cmd {cmd:#06x}")]
    DuplicateRequest {
        /// Requester id
        requester_id: u32,
        /// Requested command
        cmd: Command,
    },

    /// Command registered twice
    #[error("command {0:#06x} is already registered")]
    AlreadyRegistered(Command),

    /// Release of a transaction that is not active
    #[error("transaction {0} is not active")]
    DoubleFree(TransactionId),
}

/// Error category, used for counters and log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Frame cannot be routed or accepted
    MalformedInput,
    /// Pool or admission capacity reached
    ResourceExhausted,
    /// API used out of contract
    Misuse,
}

impl TxnError {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidFrame { .. }
            | Self::UnregisteredCommand(_)
            | Self::UnknownTransaction { .. }
            | Self::UnexpectedCommand { .. } => ErrorKind::MalformedInput,
            Self::PoolExhausted(_) | Self::DuplicateRequest { .. } => ErrorKind::ResourceExhausted,
            Self::AlreadyRegistered(_) | Self::DoubleFree(_) => ErrorKind::Misuse,
        }
    }
}

/// Result type for transaction manager operations
pub type TxnResult<T> = Result<T, TxnError>;
