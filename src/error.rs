use crate::sandbox::SandboxError;
use crate::store::{DesiredState, StoreError};

/// Failures surfaced by the reconciler and the session manager.
#[derive(Debug, thiserror::Error)]
pub(crate) enum LeaseError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("No sandbox session for thread '{thread_id}'")]
    NoSession { thread_id: String },

    #[error("Lease {lease_id} did not reach {desired}: {detail}")]
    NotConverged {
        lease_id: String,
        desired: DesiredState,
        detail: String,
    },

    #[error("Provider '{0}' is not enabled in this process")]
    UnknownProvider(String),

    #[error("Budget exhausted for chat session {chat_session_id}: {detail}")]
    BudgetExhausted {
        chat_session_id: String,
        detail: String,
    },

    #[error("Concurrent update lost on {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl LeaseError {
    pub fn no_session(thread_id: impl Into<String>) -> Self {
        Self::NoSession {
            thread_id: thread_id.into(),
        }
    }

    pub fn is_not_converged(&self) -> bool {
        matches!(self, Self::NotConverged { .. })
    }
}
