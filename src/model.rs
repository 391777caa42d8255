//! Experiment, Variant and Assignment records plus the creation payloads.
//!
//! Counters on [`Variant`] are only ever changed by the store's atomic
//! primitives; nothing in this module mutates them.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

// ---------------------------------------------------------------------------
// ExperimentStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a pricing experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Paused,
    Completed,
    Cancelled,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Draft => "DRAFT",
            ExperimentStatus::Running => "RUNNING",
            ExperimentStatus::Paused => "PAUSED",
            ExperimentStatus::Completed => "COMPLETED",
            ExperimentStatus::Cancelled => "CANCELLED",
        }
    }

    /// `COMPLETED` and `CANCELLED` accept no further mutation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExperimentStatus::Completed | ExperimentStatus::Cancelled)
    }

    /// Statuses in which already-bucketed visitors can still convert or churn.
    pub fn accepts_outcomes(&self) -> bool {
        matches!(self, ExperimentStatus::Running | ExperimentStatus::Paused)
    }
}

impl std::fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExperimentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DRAFT" => Ok(ExperimentStatus::Draft),
            "RUNNING" => Ok(ExperimentStatus::Running),
            "PAUSED" => Ok(ExperimentStatus::Paused),
            "COMPLETED" => Ok(ExperimentStatus::Completed),
            "CANCELLED" => Ok(ExperimentStatus::Cancelled),
            other => Err(format!("unknown experiment status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// TransitionAction
// ---------------------------------------------------------------------------

/// Operator-invoked status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionAction {
    Start,
    Pause,
    Resume,
    End,
    Cancel,
}

impl TransitionAction {
    pub const ALL: [TransitionAction; 5] = [
        TransitionAction::Start,
        TransitionAction::Pause,
        TransitionAction::Resume,
        TransitionAction::End,
        TransitionAction::Cancel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionAction::Start => "start",
            TransitionAction::Pause => "pause",
            TransitionAction::Resume => "resume",
            TransitionAction::End => "end",
            TransitionAction::Cancel => "cancel",
        }
    }
}

impl std::fmt::Display for TransitionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransitionAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransitionAction::ALL
            .into_iter()
            .find(|a| a.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown transition action: {s}"))
    }
}

// ---------------------------------------------------------------------------
// ConfidenceLevel
// ---------------------------------------------------------------------------

/// Supported confidence levels. Serialized as the plain number (`0.95`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub enum ConfidenceLevel {
    Ninety,
    #[default]
    NinetyFive,
    NinetyNine,
}

impl ConfidenceLevel {
    pub fn value(&self) -> f64 {
        match self {
            ConfidenceLevel::Ninety => 0.90,
            ConfidenceLevel::NinetyFive => 0.95,
            ConfidenceLevel::NinetyNine => 0.99,
        }
    }

    /// Significance threshold `1 - confidence`.
    pub fn alpha(&self) -> f64 {
        match self {
            ConfidenceLevel::Ninety => 0.10,
            ConfidenceLevel::NinetyFive => 0.05,
            ConfidenceLevel::NinetyNine => 0.01,
        }
    }

    /// Two-sided critical value of the standard normal.
    pub fn z_critical(&self) -> f64 {
        match self {
            ConfidenceLevel::Ninety => 1.645,
            ConfidenceLevel::NinetyFive => 1.96,
            ConfidenceLevel::NinetyNine => 2.576,
        }
    }
}

impl TryFrom<f64> for ConfidenceLevel {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        [ConfidenceLevel::Ninety, ConfidenceLevel::NinetyFive, ConfidenceLevel::NinetyNine]
            .into_iter()
            .find(|l| (l.value() - value).abs() < 1e-9)
            .ok_or_else(|| format!("confidence level must be 0.90, 0.95 or 0.99, got {value}"))
    }
}

impl From<ConfidenceLevel> for f64 {
    fn from(level: ConfidenceLevel) -> f64 {
        level.value()
    }
}

// ---------------------------------------------------------------------------
// Experiment / Variant / Assignment
// ---------------------------------------------------------------------------

/// The subscription plan whose price is under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetPlan {
    pub id: String,
    pub name: String,
    /// Current list price of the plan; snapshotted onto every variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_cents: Option<u64>,
}

/// Descriptive metadata carried through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentMetadata {
    #[serde(default)]
    pub ai_generated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_lift: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default)]
    pub risks: Vec<String>,
}

/// One priced alternative and its running counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    pub experiment_id: String,
    pub name: String,
    pub price_cents: u64,
    pub original_price_cents: u64,
    pub is_control: bool,
    pub visitors: u64,
    pub conversions: u64,
    pub churned: u64,
    pub total_revenue_cents: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub org_id: String,
    pub name: String,
    pub hypothesis: String,
    pub target_plan: TargetPlan,
    pub status: ExperimentStatus,
    pub planned_duration_days: u32,
    /// Percentage of visitors eligible for inclusion, in `(0, 100]`.
    pub traffic_allocation: f64,
    /// Per-variant visitor threshold below which significance is not trusted.
    pub minimum_sample_size: u64,
    pub confidence_level: ConfidenceLevel,
    pub created_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub ended_at_ms: Option<u64>,
    #[serde(default)]
    pub metadata: ExperimentMetadata,
    pub variants: Vec<Variant>,
}

impl Experiment {
    pub fn control(&self) -> Option<&Variant> {
        self.variants.iter().find(|v| v.is_control)
    }

    pub fn variant(&self, variant_id: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == variant_id)
    }

    pub fn total_visitors(&self) -> u64 {
        self.variants.iter().map(|v| v.visitors).sum()
    }
}

/// A visitor's bucket in one experiment, plus outcomes recorded against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: String,
    pub experiment_id: String,
    pub visitor_id: String,
    pub variant_id: String,
    pub assigned_at_ms: u64,
    pub converted: bool,
    pub converted_at_ms: Option<u64>,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub conversion_revenue_cents: Option<u64>,
    pub churned: bool,
    pub churned_at_ms: Option<u64>,
    pub lifetime_revenue_cents: Option<u64>,
}

impl Assignment {
    pub fn new(
        experiment_id: impl Into<String>,
        visitor_id: impl Into<String>,
        variant_id: impl Into<String>,
        assigned_at_ms: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            experiment_id: experiment_id.into(),
            visitor_id: visitor_id.into(),
            variant_id: variant_id.into(),
            assigned_at_ms,
            converted: false,
            converted_at_ms: None,
            customer_id: None,
            subscription_id: None,
            conversion_revenue_cents: None,
            churned: false,
            churned_at_ms: None,
            lifetime_revenue_cents: None,
        }
    }
}

/// Conversion signal from the billing side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversion {
    pub customer_id: String,
    pub subscription_id: String,
    pub revenue_cents: u64,
    pub converted_at_ms: u64,
}

/// Churn signal from the billing side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Churn {
    pub lifetime_revenue_cents: u64,
    pub churned_at_ms: u64,
}

// ---------------------------------------------------------------------------
// Creation payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewVariant {
    pub name: String,
    pub price_cents: u64,
    #[serde(default)]
    pub is_control: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewExperiment {
    pub org_id: String,
    pub name: String,
    pub hypothesis: String,
    pub target_plan: TargetPlan,
    pub planned_duration_days: u32,
    pub traffic_allocation: f64,
    #[serde(default)]
    pub confidence_level: Option<ConfidenceLevel>,
    /// Supplied explicitly, or computed from the power analysis at creation.
    #[serde(default)]
    pub minimum_sample_size: Option<u64>,
    /// Relative lift the default sample size is designed to detect.
    #[serde(default)]
    pub minimum_detectable_effect: Option<f64>,
    #[serde(default)]
    pub metadata: ExperimentMetadata,
    pub variants: Vec<NewVariant>,
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
