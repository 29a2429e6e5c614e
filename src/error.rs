//! Error types for gh-pulse
//!
//! This module defines the crate-wide error type and the explicit
//! [`Outcome`] kinds that every layer returns to decide between retrying,
//! stopping, and exiting with a specific code. Component-specific errors
//! (`AssertionError`, `TransportError`) live next to their components and
//! convert into [`PulseError`]. `CaptureError` and `HubError` never leave
//! their callers: they become a session exit or an HTTP status.

use thiserror::Error;

use crate::assertion::AssertionError;
use crate::source::TransportError;

/// Main error type for gh-pulse operations
#[derive(Error, Debug)]
pub enum PulseError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Assertion parsing errors (reported before streaming begins)
    #[error(transparent)]
    Assertion(#[from] AssertionError),

    /// Upstream transport errors
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Inbound collector errors
    #[error("Server error: {0}")]
    Server(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for gh-pulse operations
pub type Result<T> = anyhow::Result<T>;

/// What a layer tells its caller to do next.
///
/// Replaces inspecting a generic error value to decide whether to retry,
/// stop, or exit with a particular status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Transient failure; the caller should reconnect after backing off.
    Recoverable(String),
    /// Unrecoverable failure; the session must stop.
    Fatal(String),
    /// Stop and report this process exit code.
    ExitWithCode(i32),
    /// Stopped because cancellation was requested.
    Cancelled,
}

impl Outcome {
    /// Returns true if the caller should retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable(_))
    }
}
