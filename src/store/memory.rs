//! In-process [`ExperimentStore`] guarded by a single mutex.
//!
//! Used by the test-suite, the `simulate` command, and `serve` when no
//! database path is configured.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{AssignOutcome, ExperimentStore};
use crate::error::{ExperimentError, Result};
use crate::lifecycle;
use crate::model::{
    Assignment, Churn, Conversion, Experiment, ExperimentStatus, TransitionAction, Variant,
};

#[derive(Debug, Default)]
struct Inner {
    experiments: HashMap<String, Experiment>,
    /// Experiment ids in insertion order.
    order: Vec<String>,
    /// Assignments in insertion order; `index` maps the unique key to a slot.
    assignments: Vec<Assignment>,
    index: HashMap<(String, String), usize>,
}

impl Inner {
    fn experiment_mut(&mut self, id: &str) -> Result<&mut Experiment> {
        self.experiments.get_mut(id).ok_or_else(|| ExperimentError::not_found(id))
    }

    /// `false` once the experiment has stopped taking conversions and churns.
    fn accepts_outcomes(&self, id: &str) -> Result<bool> {
        self.experiments
            .get(id)
            .map(|e| e.status.accepts_outcomes())
            .ok_or_else(|| ExperimentError::not_found(id))
    }

    fn bump_variant(
        &mut self,
        experiment_id: &str,
        variant_id: &str,
        f: impl FnOnce(&mut Variant),
    ) {
        if let Some(v) = self
            .experiments
            .get_mut(experiment_id)
            .and_then(|e| e.variants.iter_mut().find(|v| v.id == variant_id))
        {
            f(v);
        }
    }

    fn reindex(&mut self) {
        self.index = self
            .assignments
            .iter()
            .enumerate()
            .map(|(i, a)| ((a.experiment_id.clone(), a.visitor_id.clone()), i))
            .collect();
    }
}

/// Mutex-protected in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of assignment rows across all experiments.
    pub fn assignment_count(&self) -> Result<usize> {
        Ok(self.inner.lock()?.assignments.len())
    }
}

impl ExperimentStore for MemoryStore {
    fn insert_experiment(&self, experiment: &Experiment) -> Result<()> {
        let mut guard = self.inner.lock()?;
        let inner = &mut *guard;
        if inner.experiments.contains_key(&experiment.id) {
            return Err(ExperimentError::Validation(format!(
                "experiment '{}' already exists",
                experiment.id
            )));
        }
        inner.order.push(experiment.id.clone());
        inner.experiments.insert(experiment.id.clone(), experiment.clone());
        Ok(())
    }

    fn get_experiment(&self, id: &str) -> Result<Option<Experiment>> {
        Ok(self.inner.lock()?.experiments.get(id).cloned())
    }

    fn list_experiments(&self, org_id: &str) -> Result<Vec<Experiment>> {
        let inner = self.inner.lock()?;
        Ok(inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.experiments.get(id))
            .filter(|e| e.org_id == org_id)
            .cloned()
            .collect())
    }

    fn transition(&self, id: &str, action: TransitionAction, now_ms: u64) -> Result<Experiment> {
        let mut guard = self.inner.lock()?;
        let inner = &mut *guard;
        let experiment = inner.experiment_mut(id)?;
        lifecycle::apply(experiment, action, now_ms)?;
        Ok(experiment.clone())
    }

    fn delete_experiment(&self, id: &str) -> Result<()> {
        let mut guard = self.inner.lock()?;
        let inner = &mut *guard;
        let status = inner.experiment_mut(id)?.status;
        lifecycle::ensure_deletable(status)?;
        inner.experiments.remove(id);
        inner.order.retain(|e| e != id);
        inner.assignments.retain(|a| a.experiment_id != id);
        inner.reindex();
        Ok(())
    }

    fn find_assignment(&self, experiment_id: &str, visitor_id: &str) -> Result<Option<Assignment>> {
        let inner = self.inner.lock()?;
        let key = (experiment_id.to_string(), visitor_id.to_string());
        Ok(inner.index.get(&key).map(|&i| inner.assignments[i].clone()))
    }

    fn insert_assignment(&self, assignment: Assignment) -> Result<AssignOutcome> {
        let mut guard = self.inner.lock()?;
        let inner = &mut *guard;
        let status = inner.experiment_mut(&assignment.experiment_id)?.status;
        if status != ExperimentStatus::Running {
            return Ok(AssignOutcome::NotRunning(status));
        }

        let key = (assignment.experiment_id.clone(), assignment.visitor_id.clone());
        if let Some(&i) = inner.index.get(&key) {
            return Ok(AssignOutcome::Existing(inner.assignments[i].clone()));
        }

        let experiment = inner.experiment_mut(&assignment.experiment_id)?;
        let variant = experiment
            .variants
            .iter_mut()
            .find(|v| v.id == assignment.variant_id)
            .ok_or_else(|| {
                ExperimentError::Validation(format!(
                    "variant '{}' does not belong to experiment '{}'",
                    assignment.variant_id, assignment.experiment_id
                ))
            })?;
        variant.visitors += 1;

        inner.index.insert(key, inner.assignments.len());
        inner.assignments.push(assignment.clone());
        Ok(AssignOutcome::Inserted(assignment))
    }

    fn mark_converted(
        &self,
        experiment_id: &str,
        visitor_id: &str,
        conversion: &Conversion,
    ) -> Result<Option<Assignment>> {
        let mut guard = self.inner.lock()?;
        let inner = &mut *guard;
        if !inner.accepts_outcomes(experiment_id)? {
            return Ok(None);
        }
        let key = (experiment_id.to_string(), visitor_id.to_string());
        let Some(&i) = inner.index.get(&key) else {
            return Ok(None);
        };
        if inner.assignments[i].converted {
            return Ok(None);
        }

        let assignment = &mut inner.assignments[i];
        assignment.converted = true;
        assignment.converted_at_ms = Some(conversion.converted_at_ms);
        assignment.customer_id = Some(conversion.customer_id.clone());
        assignment.subscription_id = Some(conversion.subscription_id.clone());
        assignment.conversion_revenue_cents = Some(conversion.revenue_cents);
        let updated = assignment.clone();

        inner.bump_variant(experiment_id, &updated.variant_id, |v| {
            v.conversions += 1;
            v.total_revenue_cents = v.total_revenue_cents.saturating_add(conversion.revenue_cents);
        });
        Ok(Some(updated))
    }

    fn mark_churned(
        &self,
        experiment_id: &str,
        customer_id: &str,
        churn: Churn,
    ) -> Result<Option<Assignment>> {
        let mut guard = self.inner.lock()?;
        let inner = &mut *guard;
        if !inner.accepts_outcomes(experiment_id)? {
            return Ok(None);
        }
        let latest = inner
            .assignments
            .iter()
            .enumerate()
            .filter(|(_, a)| {
                a.experiment_id == experiment_id
                    && a.converted
                    && !a.churned
                    && a.customer_id.as_deref() == Some(customer_id)
            })
            .max_by_key(|(i, a)| (a.converted_at_ms, *i))
            .map(|(i, _)| i);
        let Some(i) = latest else {
            return Ok(None);
        };

        let assignment = &mut inner.assignments[i];
        assignment.churned = true;
        assignment.churned_at_ms = Some(churn.churned_at_ms);
        assignment.lifetime_revenue_cents = Some(churn.lifetime_revenue_cents);
        let updated = assignment.clone();

        inner.bump_variant(experiment_id, &updated.variant_id, |v| v.churned += 1);
        Ok(Some(updated))
    }
}
