//! # Stage: Experiment Engine
//!
//! ## Responsibility
//! Entry point for every operator and visitor-facing operation: create,
//! transition, delete, get and list experiments here; bucketing and outcome
//! recording live in [`crate::bucketing`]; reporting in [`crate::results`].
//!
//! ## Guarantees
//! - No process-wide state: the store and the random source are injected
//! - Validation happens before anything is written; a rejected create leaves
//!   no trace in the store
//! - `Send + Sync`: share one engine behind an `Arc` across request handlers
//!
//! ## NOT Responsible For
//! - Authentication or org membership checks (the caller's concern)
//! - Validating billing identifiers passed in with outcomes

use std::sync::Arc;

use tracing::info;

use crate::bucketing::{RandomSource, ThreadRandom};
use crate::config::EngineConfig;
use crate::error::{ExperimentError, Result};
use crate::model::{
    now_ms, Experiment, ExperimentStatus, NewExperiment, TransitionAction, Variant,
};
use crate::stats;
use crate::store::{ExperimentStore, MemoryStore};

/// The pricing-experiment engine.
pub struct ExperimentEngine {
    pub(crate) store: Arc<dyn ExperimentStore>,
    pub(crate) random: Arc<dyn RandomSource>,
    pub(crate) config: EngineConfig,
}

impl ExperimentEngine {
    pub fn new(
        store: Arc<dyn ExperimentStore>,
        random: Arc<dyn RandomSource>,
        config: EngineConfig,
    ) -> Self {
        Self { store, random, config }
    }

    /// Engine over a fresh [`MemoryStore`] with thread-local randomness.
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(ThreadRandom), config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ExperimentStore> {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Validate `request` and persist it as a DRAFT experiment.
    ///
    /// When no variant is flagged control the first one is promoted. When no
    /// minimum sample size is supplied it is sized from the configured
    /// baseline rate, power and minimum detectable effect.
    pub fn create_experiment(&self, request: NewExperiment) -> Result<Experiment> {
        validate_new_experiment(&request)?;

        let confidence_level = request
            .confidence_level
            .unwrap_or(self.config.default_confidence_level);
        let minimum_sample_size = match request.minimum_sample_size {
            Some(n) => n,
            None => stats::required_sample_size(
                request
                    .minimum_detectable_effect
                    .unwrap_or(self.config.minimum_detectable_effect),
                confidence_level,
                self.config.power,
                self.config.baseline_conversion_rate,
            ),
        };

        let id = uuid::Uuid::new_v4().to_string();
        let control_index = request.variants.iter().position(|v| v.is_control).unwrap_or(0);
        let original_price_cents = request
            .target_plan
            .price_cents
            .unwrap_or(request.variants[control_index].price_cents);

        let variants = request
            .variants
            .iter()
            .enumerate()
            .map(|(i, v)| Variant {
                id: uuid::Uuid::new_v4().to_string(),
                experiment_id: id.clone(),
                name: v.name.trim().to_string(),
                price_cents: v.price_cents,
                original_price_cents,
                is_control: i == control_index,
                visitors: 0,
                conversions: 0,
                churned: 0,
                total_revenue_cents: 0,
            })
            .collect();

        let experiment = Experiment {
            id,
            org_id: request.org_id,
            name: request.name.trim().to_string(),
            hypothesis: request.hypothesis,
            target_plan: request.target_plan,
            status: ExperimentStatus::Draft,
            planned_duration_days: request.planned_duration_days,
            traffic_allocation: request.traffic_allocation,
            minimum_sample_size,
            confidence_level,
            created_at_ms: now_ms(),
            started_at_ms: None,
            ended_at_ms: None,
            metadata: request.metadata,
            variants,
        };

        self.store.insert_experiment(&experiment)?;
        info!(
            experiment_id = %experiment.id,
            org_id = %experiment.org_id,
            variants = experiment.variants.len(),
            minimum_sample_size,
            "experiment created"
        );
        Ok(experiment)
    }

    /// Apply an operator action (start, pause, resume, end, cancel).
    pub fn transition(&self, id: &str, action: TransitionAction) -> Result<Experiment> {
        let experiment = self.store.transition(id, action, now_ms())?;
        info!(experiment_id = %id, %action, status = %experiment.status, "experiment transitioned");
        Ok(experiment)
    }

    /// Delete a DRAFT experiment together with its variants.
    pub fn delete_experiment(&self, id: &str) -> Result<()> {
        self.store.delete_experiment(id)?;
        info!(experiment_id = %id, "experiment deleted");
        Ok(())
    }

    pub fn get_experiment(&self, id: &str) -> Result<Experiment> {
        self.store.get_experiment(id)?.ok_or_else(|| ExperimentError::not_found(id))
    }

    /// Experiments of one organisation, newest first, variants included.
    pub fn list_experiments(&self, org_id: &str) -> Result<Vec<Experiment>> {
        self.store.list_experiments(org_id)
    }
}

/// Reject a create request that would break an experiment invariant.
pub fn validate_new_experiment(request: &NewExperiment) -> Result<()> {
    let invalid = |msg: String| Err(ExperimentError::Validation(msg));

    if request.org_id.trim().is_empty() {
        return invalid("org_id must not be empty".into());
    }
    if request.name.trim().is_empty() {
        return invalid("name must not be empty".into());
    }
    if request.hypothesis.trim().is_empty() {
        return invalid("hypothesis must not be empty".into());
    }
    if request.target_plan.id.trim().is_empty() {
        return invalid("target plan id must not be empty".into());
    }
    if request.planned_duration_days == 0 {
        return invalid("planned duration must be at least one day".into());
    }
    if !(request.traffic_allocation > 0.0 && request.traffic_allocation <= 100.0) {
        return invalid(format!(
            "traffic allocation must be in (0, 100], got {}",
            request.traffic_allocation
        ));
    }
    if request.minimum_sample_size == Some(0) {
        return invalid("minimum sample size must be positive".into());
    }
    if let Some(mde) = request.minimum_detectable_effect {
        if !(mde > 0.0 && mde.is_finite()) {
            return invalid(format!("minimum detectable effect must be positive, got {mde}"));
        }
    }
    if request.variants.len() < 2 {
        return invalid(format!(
            "an experiment needs at least 2 variants, got {}",
            request.variants.len()
        ));
    }
    if request.variants.iter().any(|v| v.name.trim().is_empty()) {
        return invalid("variant names must not be empty".into());
    }
    let controls = request.variants.iter().filter(|v| v.is_control).count();
    if controls > 1 {
        return invalid(format!("exactly one variant may be the control, {controls} were flagged"));
    }
    Ok(())
}
