//! Error types for the budget engine.

use thiserror::Error;

/// Errors surfaced by the budget engine.
///
/// Most collaborator problems never reach callers: the resolver treats them
/// as "value unavailable" and falls through to the next quota source. The
/// variants here are what is left once that recovery is exhausted.
#[derive(Error, Debug)]
pub enum BudgetError {
    /// A recurrence rule cannot produce cycles (non-positive period).
    #[error("Invalid recurrence rule: {0}")]
    InvalidRecurrence(String),

    /// A call into an external collaborator failed.
    #[error("{collaborator} failed: {message}")]
    Collaborator {
        collaborator: &'static str,
        message: String,
    },

    /// Configuration file or value rejected.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tracker used in the wrong lifecycle state.
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// The tracker's event loop is no longer running.
    #[error("Tracker event channel closed")]
    ChannelClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for the budget engine.
pub type Result<T> = std::result::Result<T, BudgetError>;

impl BudgetError {
    /// Build a collaborator failure.
    pub fn collaborator(collaborator: &'static str, message: impl Into<String>) -> Self {
        BudgetError::Collaborator {
            collaborator,
            message: message.into(),
        }
    }

    /// Build a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        BudgetError::Config(msg.into())
    }

    /// Whether this error must abort a resolution pass instead of falling
    /// through to the next quota source.
    pub fn is_fatal_to_pass(&self) -> bool {
        matches!(self, BudgetError::InvalidRecurrence(_))
    }
}
