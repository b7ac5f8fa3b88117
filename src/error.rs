//! Error types for each subsystem boundary.
//!
//! Handlers map these into wire status codes (see [`crate::protocol::Status`]);
//! nothing below this module needs to know about the wire at all.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("username must not be empty")]
    EmptyUsername,
    #[error("password must not be empty")]
    EmptyPassword,
    #[error("user {0:?} already exists")]
    AlreadyExists(String),
    #[error("authentication failed")]
    Failed,
}

#[derive(Debug, Error)]
pub enum TimeSeriesError {
    #[error("current day is already completed")]
    DayAlreadyCompleted,
    #[error("not enough historical days for the requested window")]
    InsufficientData,
    #[error("waiter interrupted")]
    Interrupted,
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt file: {0}")]
    CorruptFile(String),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too short")]
    Truncated,
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),
    #[error("invalid UTF-8 string in frame")]
    InvalidUtf8,
    #[error("missing or invalid parameter {0:?}")]
    InvalidParams(&'static str),
}
