//! Experiment state machine.
//!
//! ```text
//! DRAFT -> RUNNING <-> PAUSED -> { COMPLETED, CANCELLED }
//! DRAFT -> CANCELLED
//! DRAFT -> (deleted)
//! ```
//!
//! These functions only decide; stores call them while holding their lock (or
//! inside their transaction) so check and write happen as one step.

use crate::error::{ExperimentError, Result};
use crate::model::{Experiment, ExperimentStatus, TransitionAction};

/// Target status for `action` from `current`, or the rejection naming both.
pub fn next_status(
    current: ExperimentStatus,
    action: TransitionAction,
) -> Result<ExperimentStatus> {
    use crate::model::ExperimentStatus::*;
    use crate::model::TransitionAction::*;

    let next = match (current, action) {
        (Draft, Start) => Running,
        (Running, Pause) => Paused,
        (Paused, Resume) => Running,
        (Running | Paused, End) => Completed,
        (Draft | Running | Paused, Cancel) => Cancelled,
        _ => return Err(ExperimentError::InvalidTransition { current, action }),
    };
    Ok(next)
}

/// Apply `action` to `experiment` in place, stamping timestamps.
///
/// On rejection the experiment is left untouched.
pub fn apply(experiment: &mut Experiment, action: TransitionAction, now_ms: u64) -> Result<()> {
    let next = next_status(experiment.status, action)?;
    experiment.status = next;
    match action {
        TransitionAction::Start => experiment.started_at_ms = Some(now_ms),
        TransitionAction::End | TransitionAction::Cancel => experiment.ended_at_ms = Some(now_ms),
        TransitionAction::Pause | TransitionAction::Resume => {}
    }
    Ok(())
}

/// Only drafts can be deleted; once traffic has been bucketed history is kept.
pub fn ensure_deletable(status: ExperimentStatus) -> Result<()> {
    if status == ExperimentStatus::Draft {
        Ok(())
    } else {
        Err(ExperimentError::NotDeletable { status })
    }
}
