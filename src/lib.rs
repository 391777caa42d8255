//! Server-side pricing experiments.
//!
//! Operators define experiments that compare price points for one plan,
//! visitors are bucketed into exactly one variant, conversions and churns are
//! recorded against that bucket, and two-proportion z-tests decide whether a
//! price beat the control.
//!
//! ```no_run
//! use pricing_experiments::{EngineConfig, ExperimentEngine};
//!
//! let engine = ExperimentEngine::in_memory(EngineConfig::default());
//! let results = engine.get_results("exp_123");
//! ```

pub mod bucketing;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod results;
pub mod stats;
pub mod store;
pub mod web;

pub use bucketing::{
    AssignmentDecision, NotAssignedReason, RandomSource, SeededRandom, ThreadRandom,
    VariantAssignment,
};
pub use config::{AppConfig, EngineConfig, ServerConfig};
pub use engine::ExperimentEngine;
pub use error::{ExperimentError, Result};
pub use model::{
    Assignment, ConfidenceLevel, Experiment, ExperimentStatus, NewExperiment, NewVariant,
    TargetPlan, TransitionAction, Variant,
};
pub use results::{ExperimentResults, VariantResult, WinnerMetric};
pub use store::{ExperimentStore, MemoryStore, SqliteStore};
