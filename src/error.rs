//! Error kinds shared across the middleware

use std::io;
use thiserror::Error;

/// Top-level error type surfaced by the public API.
///
/// Per-peer protocol and transport failures never cross-contaminate other
/// peers; they are isolated inside the connection layer and surface here only
/// for the peer that caused them.
#[derive(Debug, Error)]
pub enum SilKitError {
    /// Invalid configuration document, unknown option, or duplicate service
    /// name. Surfaced synchronously to the creator; no state changes.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Malformed frame, version mismatch, or duplicate announcement.
    /// Closes the offending peer; others continue.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Connect refused, disconnect, or I/O timeout.
    #[error("transport error: {0}")]
    Transport(String),

    /// API call in a state that forbids it. The participant remains in its
    /// current state.
    #[error("state error: {0}")]
    State(String),

    /// Internal invariant violated. Fatal to the participant.
    #[error("assertion failed: {0}")]
    Assertion(String),

    /// Simulation step exceeded the hard response timeout.
    #[error("watchdog expired after {0} ms")]
    WatchdogExpired(u64),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type SilKitResult<T> = Result<T, SilKitError>;

impl SilKitError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        SilKitError::Configuration(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        SilKitError::Protocol(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        SilKitError::Transport(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        SilKitError::State(msg.into())
    }
}
