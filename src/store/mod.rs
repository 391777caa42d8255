//! # Stage: Experiment Store
//!
//! ## Responsibility
//! Persist experiments, variants and assignments, and expose every mutation
//! the engine needs as a single atomic primitive.
//!
//! ## Guarantees
//! - Check-then-act: status transitions and deletes validate and write under
//!   one lock / one transaction, so a rejected call mutates nothing
//! - Exactly-once assignment: at most one [`Assignment`] per
//!   `(experiment_id, visitor_id)`; the variant's `visitors` counter moves only
//!   when a row is actually inserted
//! - No lost updates: counters are incremented in the store, never written
//!   back from a value the caller read earlier
//! - Status-gated writes: assignments are only written while the experiment is
//!   RUNNING and outcomes only while it is RUNNING or PAUSED, checked in the
//!   same lock / transaction as the write
//!
//! ## NOT Responsible For
//! - Traffic sampling and variant choice (that is `bucketing`)
//!
//! Two backends implement [`ExperimentStore`]: [`MemoryStore`] and
//! [`SqliteStore`].

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::model::{
    Assignment, Churn, Conversion, Experiment, ExperimentStatus, TransitionAction,
};

/// Result of an insert-or-get on the `(experiment_id, visitor_id)` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignOutcome {
    /// A new row was written and the variant's visitor counter incremented.
    Inserted(Assignment),
    /// Another call got there first; nothing was written.
    Existing(Assignment),
    /// The experiment had left RUNNING by the time of the write; nothing was
    /// written.
    NotRunning(ExperimentStatus),
}

impl AssignOutcome {
    pub fn assignment(&self) -> Option<&Assignment> {
        match self {
            AssignOutcome::Inserted(a) | AssignOutcome::Existing(a) => Some(a),
            AssignOutcome::NotRunning(_) => None,
        }
    }

    pub fn into_assignment(self) -> Option<Assignment> {
        match self {
            AssignOutcome::Inserted(a) | AssignOutcome::Existing(a) => Some(a),
            AssignOutcome::NotRunning(_) => None,
        }
    }

    pub fn was_inserted(&self) -> bool {
        matches!(self, AssignOutcome::Inserted(_))
    }
}

/// Storage backend for the experiment engine.
///
/// Every method is one atomic unit with respect to concurrent callers.
pub trait ExperimentStore: Send + Sync {
    /// Persist a freshly created experiment together with its variants.
    fn insert_experiment(&self, experiment: &Experiment) -> Result<()>;

    fn get_experiment(&self, id: &str) -> Result<Option<Experiment>>;

    /// Experiments owned by `org_id`, newest first.
    fn list_experiments(&self, org_id: &str) -> Result<Vec<Experiment>>;

    /// Apply a lifecycle action; fails with `NotFound` or `InvalidTransition`
    /// without touching the stored experiment.
    fn transition(&self, id: &str, action: TransitionAction, now_ms: u64) -> Result<Experiment>;

    /// Remove a DRAFT experiment with its variants and assignments.
    fn delete_experiment(&self, id: &str) -> Result<()>;

    fn find_assignment(&self, experiment_id: &str, visitor_id: &str) -> Result<Option<Assignment>>;

    /// Insert `assignment` unless one already exists for its visitor, in which
    /// case the existing row is returned unchanged. Writes nothing and returns
    /// [`AssignOutcome::NotRunning`] unless the experiment is RUNNING.
    fn insert_assignment(&self, assignment: Assignment) -> Result<AssignOutcome>;

    /// Record the first conversion for a visitor. `None` if the visitor has no
    /// assignment, already converted, or the experiment no longer accepts
    /// outcomes. `NotFound` for an unknown experiment.
    fn mark_converted(
        &self,
        experiment_id: &str,
        visitor_id: &str,
        conversion: &Conversion,
    ) -> Result<Option<Assignment>>;

    /// Churn the most recent converted, not yet churned assignment of
    /// `customer_id`. `None` if there is no such assignment or the experiment
    /// no longer accepts outcomes. `NotFound` for an unknown experiment.
    fn mark_churned(
        &self,
        experiment_id: &str,
        customer_id: &str,
        churn: Churn,
    ) -> Result<Option<Assignment>>;
}
