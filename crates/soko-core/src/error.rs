use thiserror::Error;

/// Settlement engine errors.
#[derive(Debug, Error)]
pub enum MarketError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Upstream '{collaborator}' failed: {message}")]
    Upstream {
        collaborator: &'static str,
        message: String,
    },

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl MarketError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn upstream(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self::Upstream {
            collaborator,
            message: message.into(),
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence(message.into())
    }

    /// Guard violations are recoverable no-ops for the caller, not hard
    /// failures that should be retried.
    pub fn is_guard_violation(&self) -> bool {
        matches!(self, Self::InvalidState(_) | Self::Conflict(_))
    }
}
