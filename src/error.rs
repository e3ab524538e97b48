//! Error types shared across the crate.
//!
//! Interrupt-context code never produces these; it only bumps counters.
//! Everything here surfaces in the dispatcher or at boot.

use thiserror_no_std::Error;

/// Rejected configuration value or unreadable persisted configuration.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} out of range")]
    OutOfRange { field: &'static str },
    #[error("stored configuration could not be decoded")]
    Corrupt,
    #[error("stored configuration has version {0}")]
    Version(u8),
    #[error("configuration buffer too small")]
    BufferTooSmall,
    #[error("configuration storage unavailable")]
    Storage,
}

/// Payload could not be built; the dispatcher skips this cycle.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    #[error("payload exceeds {0} bytes")]
    Overflow(usize),
    #[error("payload serialization failed")]
    Serialize,
}

/// Unrecoverable startup failure. The firmware halts on any of these.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    #[error("could not allocate {0} send queue")]
    QueueAlloc(&'static str),
    #[error("could not allocate {0}")]
    StoreAlloc(&'static str),
    #[error("no transport available")]
    NoTransport,
    #[error("{0} initialization failed")]
    Radio(&'static str),
    #[error("could not spawn {0}")]
    Spawn(&'static str),
}
