//! # Stage: Results Analyzer
//!
//! ## Responsibility
//! Turn stored variant counters into a report: per-variant rates, tests of
//! every treatment against the control, winner determination and an
//! operator-facing recommendation.
//!
//! ## Guarantees
//! - Never fails on zero traffic: every ratio defaults to `0.0`
//! - Advisory only: `can_end_early` never transitions the experiment
//!
//! ## Winner policy
//! Variants are ranked by [`WinnerMetric`] (revenue per visitor unless
//! configured otherwise). The top-ranked variant is tested against the
//! control; when the control itself ranks first, the best treatment is tested
//! and a significant result makes the control the winner. A winner also needs
//! both compared arms at the minimum sample size; other arms do not hold it
//! back. `can_end_early` additionally asks for the whole experiment's sample.

use serde::{Deserialize, Serialize};

use crate::engine::ExperimentEngine;
use crate::error::{ExperimentError, Result};
use crate::model::{now_ms, ConfidenceLevel, Experiment, ExperimentStatus, Variant};
use crate::stats::{self, ConfidenceInterval};

const DAY_MS: u64 = 86_400_000;

/// Metric used to rank variants when picking a winner candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WinnerMetric {
    #[default]
    RevenuePerVisitor,
    ConversionRate,
}

impl WinnerMetric {
    fn score(&self, v: &VariantResult) -> f64 {
        match self {
            WinnerMetric::RevenuePerVisitor => v.revenue_per_visitor,
            WinnerMetric::ConversionRate => v.conversion_rate,
        }
    }
}

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantResult {
    pub variant_id: String,
    pub name: String,
    pub price_cents: u64,
    pub is_control: bool,
    /// 1-based position in the winner ranking.
    pub rank: usize,
    pub visitors: u64,
    pub conversions: u64,
    pub churned: u64,
    pub total_revenue_cents: u64,
    pub conversion_rate: f64,
    /// Mean revenue per conversion, in cents.
    pub average_revenue_cents: f64,
    pub churn_rate: f64,
    /// Revenue per visitor, in cents.
    pub revenue_per_visitor: f64,
    pub meets_sample_size: bool,
    /// Visitors still needed to reach the minimum sample size.
    pub visitors_needed: u64,
    // Populated for treatments only.
    pub z_score: Option<f64>,
    pub p_value: Option<f64>,
    pub relative_lift_pct: Option<f64>,
    pub confidence_interval: Option<ConfidenceInterval>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinnerSummary {
    pub variant_id: String,
    pub name: String,
    pub price_cents: u64,
    pub is_control: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResults {
    pub experiment_id: String,
    pub name: String,
    pub status: ExperimentStatus,
    pub duration_days: u64,
    pub confidence_level: ConfidenceLevel,
    pub minimum_sample_size: u64,
    pub winner_metric: WinnerMetric,
    pub total_visitors: u64,
    pub total_conversions: u64,
    pub variants: Vec<VariantResult>,
    pub winner: Option<WinnerSummary>,
    pub is_significant: bool,
    /// p-value of the deciding comparison, if one could be made.
    pub p_value: Option<f64>,
    /// Conversion-rate lift of the winner candidate over the loser, in percent.
    pub relative_lift_pct: f64,
    pub statistical_power: f64,
    pub can_end_early: bool,
    pub recommendation: String,
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

fn variant_result(v: &Variant, control: Option<&Variant>, e: &Experiment) -> VariantResult {
    let conversion_rate = stats::ratio(v.conversions, v.visitors);
    let comparison = control.filter(|_| !v.is_control).map(|c| {
        let pc = stats::ratio(c.conversions, c.visitors);
        let z = stats::z_score_for_proportions(pc, c.visitors, conversion_rate, v.visitors);
        (
            z,
            stats::p_value(z),
            stats::relative_lift_pct(pc, conversion_rate),
            stats::confidence_interval(
                pc,
                c.visitors,
                conversion_rate,
                v.visitors,
                e.confidence_level,
            ),
        )
    });

    VariantResult {
        variant_id: v.id.clone(),
        name: v.name.clone(),
        price_cents: v.price_cents,
        is_control: v.is_control,
        rank: 0,
        visitors: v.visitors,
        conversions: v.conversions,
        churned: v.churned,
        total_revenue_cents: v.total_revenue_cents,
        conversion_rate,
        average_revenue_cents: stats::ratio(v.total_revenue_cents, v.conversions),
        churn_rate: stats::ratio(v.churned, v.conversions),
        revenue_per_visitor: stats::ratio(v.total_revenue_cents, v.visitors),
        meets_sample_size: v.visitors >= e.minimum_sample_size,
        visitors_needed: e.minimum_sample_size.saturating_sub(v.visitors),
        z_score: comparison.map(|c| c.0),
        p_value: comparison.map(|c| c.1),
        relative_lift_pct: comparison.map(|c| c.2),
        confidence_interval: comparison.map(|c| c.3),
    }
}

/// Build the report for `experiment` as of `now_ms`.
pub fn analyze(experiment: &Experiment, metric: WinnerMetric, now_ms: u64) -> ExperimentResults {
    let e = experiment;
    let start = e.started_at_ms.unwrap_or(e.created_at_ms);
    let end = e.ended_at_ms.unwrap_or(now_ms);
    let duration_days = end.saturating_sub(start) / DAY_MS;

    let control = e.control();
    let mut variants: Vec<VariantResult> =
        e.variants.iter().map(|v| variant_result(v, control, e)).collect();

    // Stable sort: ties keep creation order.
    let mut ranking: Vec<usize> = (0..variants.len()).collect();
    ranking.sort_by(|&a, &b| {
        metric
            .score(&variants[b])
            .partial_cmp(&metric.score(&variants[a]))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for (rank, &i) in ranking.iter().enumerate() {
        variants[i].rank = rank + 1;
    }

    let alpha = e.confidence_level.alpha();
    let control_result = variants.iter().find(|v| v.is_control);
    let candidate = ranking.first().map(|&i| &variants[i]);

    // (treatment under test, control wins if significant)
    let comparison = match candidate {
        Some(c) if c.is_control => ranking
            .iter()
            .map(|&i| &variants[i])
            .find(|v| !v.is_control)
            .map(|t| (t, true)),
        Some(c) => Some((c, false)),
        None => None,
    };

    let total_visitors: u64 = variants.iter().map(|v| v.visitors).sum();
    let total_conversions: u64 = variants.iter().map(|v| v.conversions).sum();
    let required_total = e.minimum_sample_size.saturating_mul(variants.len() as u64);

    let mut winner = None;
    let mut is_significant = false;
    let mut p_value = None;
    let mut relative_lift_pct = 0.0;
    let mut statistical_power = 0.0;

    if let (Some(control), Some((treatment, control_wins))) = (control_result, comparison) {
        let p = treatment.p_value.unwrap_or(1.0);
        let lift = treatment.relative_lift_pct.unwrap_or(0.0);
        p_value = Some(p);
        is_significant = p < alpha;
        relative_lift_pct = if control_wins { -lift } else { lift };
        statistical_power = stats::statistical_power(
            control.visitors,
            treatment.visitors,
            control.conversion_rate,
            treatment.conversion_rate,
            alpha,
        );
        if is_significant && control.meets_sample_size && treatment.meets_sample_size {
            let w = if control_wins { control } else { treatment };
            winner = Some(WinnerSummary {
                variant_id: w.variant_id.clone(),
                name: w.name.clone(),
                price_cents: w.price_cents,
                is_control: w.is_control,
            });
        }
    }

    let can_end_early = is_significant && total_visitors >= required_total;

    let recommendation = recommend(
        e.status,
        winner.as_ref(),
        relative_lift_pct,
        p_value,
        can_end_early,
        required_total.saturating_sub(total_visitors),
    );

    ExperimentResults {
        experiment_id: e.id.clone(),
        name: e.name.clone(),
        status: e.status,
        duration_days,
        confidence_level: e.confidence_level,
        minimum_sample_size: e.minimum_sample_size,
        winner_metric: metric,
        total_visitors,
        total_conversions,
        variants,
        winner,
        is_significant,
        p_value,
        relative_lift_pct,
        statistical_power,
        can_end_early,
        recommendation,
    }
}

/// `4900` -> `"$49.00"`.
pub fn format_price(cents: u64) -> String {
    format!("${}.{:02}", cents / 100, cents % 100)
}

fn recommend(
    status: ExperimentStatus,
    winner: Option<&WinnerSummary>,
    lift: f64,
    p_value: Option<f64>,
    can_end_early: bool,
    visitors_needed: u64,
) -> String {
    match status {
        ExperimentStatus::Draft => {
            "Experiment is still a draft. Start it to begin collecting data.".to_string()
        }
        ExperimentStatus::Completed | ExperimentStatus::Cancelled => match winner {
            Some(w) => format!(
                "Winner: {} at {} ({:+.1}% relative conversion lift).",
                w.name,
                format_price(w.price_cents),
                lift
            ),
            None => "No statistically significant winner was found.".to_string(),
        },
        ExperimentStatus::Running | ExperimentStatus::Paused => {
            if can_end_early {
                format!(
                    "Results are statistically significant (p = {:.4}); \
                     ending the experiment early is safe.",
                    p_value.unwrap_or(1.0)
                )
            } else if visitors_needed > 0 {
                format!("Need {visitors_needed} more visitors to reach the minimum sample size.")
            } else {
                "Continue running the experiment to collect more data.".to_string()
            }
        }
    }
}

impl ExperimentEngine {
    /// Full results report for one experiment.
    pub fn get_results(&self, experiment_id: &str) -> Result<ExperimentResults> {
        let experiment = self
            .store
            .get_experiment(experiment_id)?
            .ok_or_else(|| ExperimentError::not_found(experiment_id))?;
        Ok(analyze(&experiment, self.config.winner_metric, now_ms()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
