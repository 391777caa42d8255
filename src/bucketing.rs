//! # Stage: Bucketing & Outcome Recorder
//!
//! ## Responsibility
//! Put each visitor of a RUNNING experiment into exactly one variant, and
//! record conversions and churns against that bucket.
//!
//! ## Guarantees
//! - Exactly-once: a visitor's first bucket is returned on every later call,
//!   however many requests race for it (the store's insert-or-get decides)
//! - Dynamic allocation: visitors excluded by traffic sampling are not stored,
//!   so they can be drawn again on a later request
//! - Idempotent outcomes: replayed conversion and churn signals are no-ops
//! - Visitor-facing calls never fail on expected conditions; they degrade to
//!   [`AssignmentDecision::NotAssigned`] and log at `debug`
//!
//! ## NOT Responsible For
//! - Choosing which experiment a visitor should see
//! - Checking billing identifiers against the billing system

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::debug;

use crate::engine::ExperimentEngine;
use crate::error::{ExperimentError, Result};
use crate::model::{now_ms, Assignment, Churn, Conversion, Experiment, ExperimentStatus};
use crate::store::AssignOutcome;

// ---------------------------------------------------------------------------
// RandomSource
// ---------------------------------------------------------------------------

/// Source of uniform randomness for traffic sampling and variant choice.
pub trait RandomSource: Send + Sync {
    /// Uniform sample in `[0, 1)`.
    fn next_f64(&self) -> f64;

    /// Uniform index in `[0, len)`; `0` when `len == 0`.
    fn next_index(&self, len: usize) -> usize;
}

/// Thread-local generator from `rand`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_f64(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }

    fn next_index(&self, len: usize) -> usize {
        if len == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..len)
        }
    }
}

/// Reproducible generator, used by `simulate` and tests.
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self { rng: Mutex::new(StdRng::seed_from_u64(seed)) }
    }
}

impl RandomSource for SeededRandom {
    fn next_f64(&self) -> f64 {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.gen::<f64>()
    }

    fn next_index(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.gen_range(0..len)
    }
}

// ---------------------------------------------------------------------------
// Assignment decisions
// ---------------------------------------------------------------------------

/// The bucket a visitor landed in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariantAssignment {
    pub assignment_id: String,
    pub variant_id: String,
    pub variant_name: String,
    pub price_cents: u64,
    pub is_control: bool,
}

/// Why a visitor was not bucketed. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotAssignedReason {
    UnknownExperiment,
    NotRunning,
    ExcludedByTraffic,
}

impl std::fmt::Display for NotAssignedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotAssignedReason::UnknownExperiment => write!(f, "unknown_experiment"),
            NotAssignedReason::NotRunning => write!(f, "not_running"),
            NotAssignedReason::ExcludedByTraffic => write!(f, "excluded_by_traffic"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignmentDecision {
    Assigned(VariantAssignment),
    /// Serve the default, non-experimental price.
    NotAssigned(NotAssignedReason),
}

impl AssignmentDecision {
    pub fn variant(&self) -> Option<&VariantAssignment> {
        match self {
            AssignmentDecision::Assigned(v) => Some(v),
            AssignmentDecision::NotAssigned(_) => None,
        }
    }

    pub fn is_assigned(&self) -> bool {
        matches!(self, AssignmentDecision::Assigned(_))
    }
}

fn decision_for(experiment: &Experiment, assignment: &Assignment) -> Result<AssignmentDecision> {
    let variant = experiment.variant(&assignment.variant_id).ok_or_else(|| {
        ExperimentError::Validation(format!(
            "assignment '{}' points at unknown variant '{}'",
            assignment.id, assignment.variant_id
        ))
    })?;
    Ok(AssignmentDecision::Assigned(VariantAssignment {
        assignment_id: assignment.id.clone(),
        variant_id: variant.id.clone(),
        variant_name: variant.name.clone(),
        price_cents: variant.price_cents,
        is_control: variant.is_control,
    }))
}

// ---------------------------------------------------------------------------
// Engine operations
// ---------------------------------------------------------------------------

impl ExperimentEngine {
    /// Bucket `visitor_id` into a variant of `experiment_id`.
    ///
    /// Returns the existing bucket when the visitor was already assigned.
    /// Otherwise draws once against `traffic_allocation` and, on inclusion,
    /// picks a variant with equal weight and persists the assignment. The
    /// store re-checks the status when writing, so a visitor is never bucketed
    /// into an experiment that was paused or ended mid-request.
    pub fn assign_visitor(
        &self,
        experiment_id: &str,
        visitor_id: &str,
    ) -> Result<AssignmentDecision> {
        let Some(experiment) = self.store.get_experiment(experiment_id)? else {
            debug!(experiment_id, visitor_id, "assign skipped: unknown experiment");
            return Ok(AssignmentDecision::NotAssigned(NotAssignedReason::UnknownExperiment));
        };
        if experiment.status != ExperimentStatus::Running {
            debug!(
                experiment_id,
                visitor_id,
                status = %experiment.status,
                "assign skipped: not running"
            );
            return Ok(AssignmentDecision::NotAssigned(NotAssignedReason::NotRunning));
        }

        if let Some(existing) = self.store.find_assignment(experiment_id, visitor_id)? {
            return decision_for(&experiment, &existing);
        }

        let draw = self.random.next_f64() * 100.0;
        if draw >= experiment.traffic_allocation {
            debug!(
                experiment_id,
                visitor_id,
                draw,
                "assign skipped: excluded by traffic allocation"
            );
            return Ok(AssignmentDecision::NotAssigned(NotAssignedReason::ExcludedByTraffic));
        }

        let index = self.random.next_index(experiment.variants.len());
        let Some(chosen) = experiment.variants.get(index) else {
            return Err(ExperimentError::Validation(format!(
                "experiment '{experiment_id}' has no variants"
            )));
        };

        let outcome = self.store.insert_assignment(Assignment::new(
            experiment_id,
            visitor_id,
            chosen.id.clone(),
            now_ms(),
        ))?;
        match &outcome {
            AssignOutcome::Inserted(a) => {
                debug!(experiment_id, visitor_id, variant_id = %a.variant_id, "visitor assigned");
                decision_for(&experiment, a)
            }
            AssignOutcome::Existing(a) => {
                debug!(experiment_id, visitor_id, "concurrent assign resolved to existing bucket");
                decision_for(&experiment, a)
            }
            AssignOutcome::NotRunning(status) => {
                debug!(experiment_id, visitor_id, %status, "assign skipped: stopped mid-request");
                Ok(AssignmentDecision::NotAssigned(NotAssignedReason::NotRunning))
            }
        }
    }

    /// Record the first conversion of an assigned visitor.
    ///
    /// `Ok(None)` when the visitor has no assignment, already converted, or the
    /// experiment no longer accepts outcomes.
    pub fn record_conversion(
        &self,
        experiment_id: &str,
        visitor_id: &str,
        customer_id: &str,
        subscription_id: &str,
        revenue_cents: u64,
    ) -> Result<Option<Assignment>> {
        let conversion = Conversion {
            customer_id: customer_id.to_string(),
            subscription_id: subscription_id.to_string(),
            revenue_cents,
            converted_at_ms: now_ms(),
        };
        let updated = self.store.mark_converted(experiment_id, visitor_id, &conversion)?;
        match &updated {
            Some(a) => debug!(
                experiment_id,
                visitor_id,
                variant_id = %a.variant_id,
                revenue_cents,
                "conversion recorded"
            ),
            None => debug!(experiment_id, visitor_id, "conversion ignored: no open assignment"),
        }
        Ok(updated)
    }

    /// Record churn for the customer's most recent converted assignment.
    pub fn record_churn(
        &self,
        experiment_id: &str,
        customer_id: &str,
        lifetime_revenue_cents: u64,
    ) -> Result<Option<Assignment>> {
        let churn = Churn { lifetime_revenue_cents, churned_at_ms: now_ms() };
        let updated = self.store.mark_churned(experiment_id, customer_id, churn)?;
        match &updated {
            Some(a) => {
                debug!(experiment_id, customer_id, variant_id = %a.variant_id, "churn recorded")
            }
            None => debug!(experiment_id, customer_id, "churn ignored: no converted assignment"),
        }
        Ok(updated)
    }
}
