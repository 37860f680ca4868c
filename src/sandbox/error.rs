//! Domain-specific error types for sandbox provider operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings.

use std::time::Duration;

/// Errors that can occur while driving a sandbox backend.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The backend could not allocate a new instance.
    #[error("Provider {provider} could not provision a sandbox: {message}")]
    Provision { provider: String, message: String },

    /// The backend itself (daemon, API endpoint) is not reachable.
    #[error("Provider is not available: {message}")]
    Unavailable { message: String },

    /// The referenced instance does not exist on the backend.
    #[error("Sandbox session not found: {session_id}")]
    NotFound { session_id: String },

    /// A command exceeded its effective timeout.
    #[error("Sandbox operation timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// Remote file access failed (missing path, permissions, ...).
    #[error("Remote I/O failed for {path}: {message}")]
    Io { path: String, message: String },

    /// The instance exists but is not in a state that allows the operation.
    #[error("Sandbox session {session_id} is {state}")]
    InvalidState { session_id: String, state: String },

    /// Any other backend operation failure (create exec, pause, ...).
    #[error("Sandbox operation failed: {message}")]
    Operation { message: String },
}

impl SandboxError {
    /// Creates a `Provision` error.
    pub fn provision(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provision {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Creates an `Unavailable` error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a `NotFound` error.
    pub fn not_found(session_id: impl Into<String>) -> Self {
        Self::NotFound {
            session_id: session_id.into(),
        }
    }

    /// Creates a `Timeout` error from a `Duration`.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout {
            timeout_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Creates an `Io` error.
    pub fn io(path: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Io {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Creates an `InvalidState` error.
    pub fn invalid_state(session_id: impl Into<String>, state: impl Into<String>) -> Self {
        Self::InvalidState {
            session_id: session_id.into(),
            state: state.into(),
        }
    }

    /// Creates an `Operation` error.
    pub fn operation(message: impl std::fmt::Display) -> Self {
        Self::Operation {
            message: message.to_string(),
        }
    }

    /// Returns true if this is a timeout error.
    #[allow(dead_code)] // Public API for callers
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if the instance does not exist.
    #[allow(dead_code)] // Public API for callers
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if this is a provisioning failure.
    #[allow(dead_code)] // Public API for callers
    pub fn is_provision(&self) -> bool {
        matches!(self, Self::Provision { .. })
    }

    /// Returns true if this is a remote file access failure.
    #[allow(dead_code)] // Public API for callers
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}
