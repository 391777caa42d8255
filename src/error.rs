//! Crate-level error type.
//!
//! Caller mistakes (`NotFound`, `Validation`, `InvalidTransition`,
//! `NotDeletable`) are kept distinct from infrastructure failures so the
//! transport can tell "bad input" from "stale reference" from "the store is
//! broken". Benign no-ops are never errors; they surface as `None`.

use crate::model::{ExperimentStatus, TransitionAction};

/// Everything that can go wrong inside the experiment engine.
#[derive(Debug, thiserror::Error)]
pub enum ExperimentError {
    #[error("experiment not found: {id}")]
    NotFound { id: String },

    #[error("invalid experiment: {0}")]
    Validation(String),

    #[error("cannot {action} an experiment that is {current}")]
    InvalidTransition {
        current: ExperimentStatus,
        action: TransitionAction,
    },

    #[error("cannot delete an experiment that is {status}; only DRAFT experiments can be deleted")]
    NotDeletable { status: ExperimentStatus },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("experiment store lock poisoned")]
    LockPoisoned,
}

impl ExperimentError {
    pub fn not_found(id: impl Into<String>) -> Self {
        ExperimentError::NotFound { id: id.into() }
    }

    /// `true` when the caller sent something the engine refuses, as opposed
    /// to the engine itself failing.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ExperimentError::NotFound { .. }
                | ExperimentError::Validation(_)
                | ExperimentError::InvalidTransition { .. }
                | ExperimentError::NotDeletable { .. }
        )
    }
}

impl<T> From<std::sync::PoisonError<T>> for ExperimentError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        ExperimentError::LockPoisoned
    }
}

pub type Result<T> = std::result::Result<T, ExperimentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_message_names_both_sides() {
        let e = ExperimentError::InvalidTransition {
            current: ExperimentStatus::Running,
            action: TransitionAction::Start,
        };
        let msg = e.to_string();
        assert!(msg.contains("RUNNING"), "{msg}");
        assert!(msg.contains("start"), "{msg}");
    }

    #[test]
    fn test_not_deletable_message_names_status() {
        let e = ExperimentError::NotDeletable { status: ExperimentStatus::Completed };
        assert!(e.to_string().contains("COMPLETED"));
    }

    #[test]
    fn test_client_error_classification() {
        assert!(ExperimentError::not_found("x").is_client_error());
        assert!(ExperimentError::Validation("bad".into()).is_client_error());
        assert!(!ExperimentError::LockPoisoned.is_client_error());
        assert!(!ExperimentError::Config("bad".into()).is_client_error());
    }
}
