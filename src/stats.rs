//! # Stage: Statistics Engine
//!
//! ## Responsibility
//! Pure numerical helpers for fixed-horizon, two-proportion hypothesis tests:
//! z-score, two-tailed p-value, Wald confidence interval, required sample size
//! and achieved statistical power.
//!
//! ## Guarantees
//! - Total: every function returns a finite value for every valid input,
//!   including zero-sample edge cases (they collapse to "no evidence yet")
//! - Clamped: probabilities are always in `[0, 1]`
//! - Deterministic: no state, no I/O
//!
//! ## Approximation error
//! The normal tail uses the Abramowitz & Stegun 26.2.17 rational polynomial,
//! whose absolute error is below `7.5e-8` for all `x >= 0`. Near the
//! significance boundary this can move a p-value in the 7th decimal place, which
//! never changes a decision at the 0.10 / 0.05 / 0.01 thresholds in practice.
//! The inverse CDF (used only for `power` -> `z_beta` and power analysis) uses
//! A&S 26.2.23, absolute error below `4.5e-4`.

use serde::{Deserialize, Serialize};

use crate::model::ConfidenceLevel;

/// Default statistical power used for sample-size planning.
pub const DEFAULT_POWER: f64 = 0.8;

/// Baseline conversion rate assumed when the caller has no better estimate.
pub const DEFAULT_BASELINE_RATE: f64 = 0.03;

/// Upper bound returned by [`required_sample_size`] when no finite sample can
/// detect the requested effect (zero or negative effect, degenerate rates).
pub const MAX_SAMPLE_SIZE: u64 = 10_000_000;

// ---------------------------------------------------------------------------
// Normal distribution
// ---------------------------------------------------------------------------

/// Upper tail probability of the standard normal distribution, `P(Z > x)`.
pub fn normal_upper_tail(x: f64) -> f64 {
    if x.is_nan() {
        return 0.5;
    }
    if x < 0.0 {
        return 1.0 - normal_upper_tail(-x);
    }
    if x > 8.0 {
        return 0.0;
    }
    // Abramowitz & Stegun 26.2.17, Horner form
    const B: [f64; 5] = [0.319381530, -0.356563782, 1.781477937, -1.821255978, 1.330274429];
    let t = 1.0 / (1.0 + 0.2316419 * x);
    let poly = t * B.iter().rev().fold(0.0, |acc, b| b + t * acc);
    let pdf = (-0.5 * x * x).exp() / (2.0 * std::f64::consts::PI).sqrt();
    (pdf * poly).clamp(0.0, 1.0)
}

/// Standard normal CDF, `P(Z <= x)`.
pub fn normal_cdf(x: f64) -> f64 {
    (1.0 - normal_upper_tail(x)).clamp(0.0, 1.0)
}

/// Inverse standard normal CDF (quantile function).
///
/// Inputs are clamped into `(0, 1)` so the result is always finite.
pub fn inverse_normal_cdf(p: f64) -> f64 {
    let p = if p.is_nan() {
        0.5
    } else {
        p.clamp(1e-12, 1.0 - 1e-12)
    };
    let q = if p < 0.5 { p } else { 1.0 - p };
    // Abramowitz & Stegun 26.2.23
    let t = (-2.0 * q.ln()).sqrt();
    let x = t
        - (2.515517 + 0.802853 * t + 0.010328 * t * t)
            / (1.0 + 1.432788 * t + 0.189269 * t * t + 0.001308 * t * t * t);
    if p < 0.5 { -x } else { x }
}

// ---------------------------------------------------------------------------
// Two-proportion test
// ---------------------------------------------------------------------------

/// Pooled two-sample z statistic for the difference `p2 - p1`.
///
/// Returns `0.0` when either sample is empty or the pooled standard error is
/// zero: there is no evidence either way yet.
pub fn z_score_for_proportions(p1: f64, n1: u64, p2: f64, n2: u64) -> f64 {
    if n1 == 0 || n2 == 0 {
        return 0.0;
    }
    let (n1, n2) = (n1 as f64, n2 as f64);
    let pooled = (p1 * n1 + p2 * n2) / (n1 + n2);
    let se = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();
    if !se.is_finite() || se <= 0.0 {
        return 0.0;
    }
    let z = (p2 - p1) / se;
    if z.is_finite() { z } else { 0.0 }
}

/// Two-tailed p-value for a z statistic, clamped to `[0, 1]`.
pub fn p_value(z: f64) -> f64 {
    if z.is_nan() {
        return 1.0;
    }
    (2.0 * normal_upper_tail(z.abs())).clamp(0.0, 1.0)
}

/// A two-sided interval on the difference between two proportions.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
}

impl ConfidenceInterval {
    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }
}

/// Wald interval on `p2 - p1` using the un-pooled standard error.
///
/// Collapses to `[0, 0]` when either sample is empty.
pub fn confidence_interval(
    p1: f64,
    n1: u64,
    p2: f64,
    n2: u64,
    level: ConfidenceLevel,
) -> ConfidenceInterval {
    if n1 == 0 || n2 == 0 {
        return ConfidenceInterval::default();
    }
    let se = (p1 * (1.0 - p1) / n1 as f64 + p2 * (1.0 - p2) / n2 as f64).max(0.0).sqrt();
    let diff = p2 - p1;
    let margin = level.z_critical() * se;
    if !diff.is_finite() || !margin.is_finite() {
        return ConfidenceInterval::default();
    }
    ConfidenceInterval { lower: diff - margin, upper: diff + margin }
}

// ---------------------------------------------------------------------------
// Power analysis
// ---------------------------------------------------------------------------

/// Per-variant sample size needed to detect a relative lift of
/// `minimum_detectable_effect` over `baseline_rate`.
///
/// `minimum_detectable_effect` is relative (0.2 = a 20% lift, so a 3% baseline
/// must move to 3.6%). `power` defaults to [`DEFAULT_POWER`] when outside
/// `(0, 1)`; `baseline_rate` defaults to [`DEFAULT_BASELINE_RATE`] when outside
/// `(0, 1)`. The result is in `[1, MAX_SAMPLE_SIZE]`.
pub fn required_sample_size(
    minimum_detectable_effect: f64,
    level: ConfidenceLevel,
    power: f64,
    baseline_rate: f64,
) -> u64 {
    let power = if power > 0.0 && power < 1.0 {
        power
    } else {
        DEFAULT_POWER
    };
    let p1 = if baseline_rate > 0.0 && baseline_rate < 1.0 {
        baseline_rate
    } else {
        DEFAULT_BASELINE_RATE
    };
    if !(minimum_detectable_effect > 0.0) || !minimum_detectable_effect.is_finite() {
        return MAX_SAMPLE_SIZE;
    }
    let p2 = (p1 * (1.0 + minimum_detectable_effect)).min(1.0 - 1e-9);
    let delta = p2 - p1;
    if delta <= 0.0 {
        return MAX_SAMPLE_SIZE;
    }

    let z_alpha = level.z_critical();
    let z_beta = inverse_normal_cdf(power);
    let p_bar = (p1 + p2) / 2.0;
    let numerator = z_alpha * (2.0 * p_bar * (1.0 - p_bar)).sqrt()
        + z_beta * (p1 * (1.0 - p1) + p2 * (1.0 - p2)).sqrt();
    let n = (numerator * numerator) / (delta * delta);
    if !n.is_finite() {
        return MAX_SAMPLE_SIZE;
    }
    (n.ceil() as u64).clamp(1, MAX_SAMPLE_SIZE)
}

/// Approximate achieved power of a two-sided test at significance `alpha`,
/// given the current sample sizes and observed rates.
///
/// Informational only; reported alongside results but never gates a decision.
pub fn statistical_power(n1: u64, n2: u64, p1: f64, p2: f64, alpha: f64) -> f64 {
    if n1 == 0 || n2 == 0 {
        return 0.0;
    }
    let alpha = if alpha > 0.0 && alpha < 1.0 {
        alpha
    } else {
        0.05
    };
    let se = (p1 * (1.0 - p1) / n1 as f64 + p2 * (1.0 - p2) / n2 as f64).max(0.0).sqrt();
    if !se.is_finite() || se <= 0.0 {
        return 0.0;
    }
    let z_alpha = inverse_normal_cdf(1.0 - alpha / 2.0);
    let effect = (p2 - p1).abs() / se;
    normal_cdf(effect - z_alpha).clamp(0.0, 1.0)
}

/// Relative change of `treatment` over `control`, as a percentage.
///
/// `0.0` when the control rate is zero.
pub fn relative_lift_pct(control: f64, treatment: f64) -> f64 {
    if control <= 0.0 || !control.is_finite() || !treatment.is_finite() {
        return 0.0;
    }
    (treatment - control) / control * 100.0
}

/// `numerator / denominator`, or `0.0` when the denominator is zero.
pub fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    // ===== normal distribution =====

    #[test]
    fn test_upper_tail_at_zero_is_half() {
        assert!((normal_upper_tail(0.0) - 0.5).abs() < 1e-7);
    }

    #[test]
    fn test_upper_tail_known_value() {
        // P(Z > 1.96) = 0.0249979
        assert!((normal_upper_tail(1.96) - 0.0249979).abs() < 1e-6);
    }

    #[test]
    fn test_upper_tail_negative_is_complement() {
        let p = normal_upper_tail(-1.0);
        assert!((p - (1.0 - normal_upper_tail(1.0))).abs() < 1e-12);
    }

    #[test]
    fn test_upper_tail_far_tail_is_zero() {
        assert_eq!(normal_upper_tail(9.0), 0.0);
    }

    #[rstest]
    #[case(0.5, 0.0)]
    #[case(0.8, 0.8416)]
    #[case(0.975, 1.96)]
    #[case(0.025, -1.96)]
    fn test_inverse_normal_cdf(#[case] p: f64, #[case] expected: f64) {
        let z = inverse_normal_cdf(p);
        assert!((z - expected).abs() < 1e-3, "p={p} z={z}");
    }

    #[test]
    fn test_inverse_normal_cdf_extremes_finite() {
        assert!(inverse_normal_cdf(0.0).is_finite());
        assert!(inverse_normal_cdf(1.0).is_finite());
    }

    // ===== z-score / p-value =====

    #[test]
    fn test_z_score_three_vs_four_and_a_half_percent() {
        // pooled p = 0.0375, se = 0.0084963
        let z = z_score_for_proportions(0.03, 1000, 0.045, 1000);
        assert!((z - 1.7655).abs() < 1e-3, "z={z}");
        let p = p_value(z);
        assert!((p - 0.0775).abs() < 1e-3, "p={p}");
        assert!(p > 0.05, "30 vs 45 of 1000 is not significant at 95%");
    }

    #[test]
    fn test_z_score_three_vs_five_percent_is_significant() {
        let z = z_score_for_proportions(0.03, 1000, 0.05, 1000);
        assert!((z - 2.2822).abs() < 1e-3, "z={z}");
        let p = p_value(z);
        assert!((p - 0.0225).abs() < 1e-3, "p={p}");
        assert!(p < 0.05);
    }

    #[test]
    fn test_z_score_sign_follows_difference() {
        assert!(z_score_for_proportions(0.05, 1000, 0.03, 1000) < 0.0);
    }

    #[rstest]
    #[case(0.1, 0, 0.2, 100)]
    #[case(0.1, 100, 0.2, 0)]
    #[case(0.0, 100, 0.0, 100)]
    #[case(1.0, 100, 1.0, 100)]
    fn test_z_score_no_evidence_is_zero(
        #[case] p1: f64,
        #[case] n1: u64,
        #[case] p2: f64,
        #[case] n2: u64,
    ) {
        assert_eq!(z_score_for_proportions(p1, n1, p2, n2), 0.0);
    }

    #[test]
    fn test_p_value_at_zero_is_one() {
        assert!((p_value(0.0) - 1.0).abs() < 1e-7);
    }

    #[test]
    fn test_p_value_symmetric() {
        assert!((p_value(2.1) - p_value(-2.1)).abs() < 1e-12);
    }

    #[test]
    fn test_p_value_nan_is_one() {
        assert_eq!(p_value(f64::NAN), 1.0);
    }

    // ===== confidence interval =====

    #[rstest]
    #[case(ConfidenceLevel::Ninety)]
    #[case(ConfidenceLevel::NinetyFive)]
    #[case(ConfidenceLevel::NinetyNine)]
    fn test_confidence_interval_centred_on_difference(#[case] level: ConfidenceLevel) {
        let ci = confidence_interval(0.03, 1000, 0.045, 1000, level);
        let mid = (ci.lower + ci.upper) / 2.0;
        assert!((mid - 0.015).abs() < 1e-12);
        assert!(ci.lower < ci.upper);
    }

    #[test]
    fn test_confidence_interval_widens_with_level() {
        let w = |l| {
            let ci = confidence_interval(0.03, 1000, 0.045, 1000, l);
            ci.upper - ci.lower
        };
        assert!(w(ConfidenceLevel::Ninety) < w(ConfidenceLevel::NinetyFive));
        assert!(w(ConfidenceLevel::NinetyFive) < w(ConfidenceLevel::NinetyNine));
    }

    #[test]
    fn test_confidence_interval_known_bounds() {
        let ci = confidence_interval(0.03, 1000, 0.045, 1000, ConfidenceLevel::NinetyFive);
        assert!((ci.lower - (-0.00164)).abs() < 1e-4, "{ci:?}");
        assert!((ci.upper - 0.03164).abs() < 1e-4, "{ci:?}");
        assert!(ci.contains(0.0));
    }

    #[test]
    fn test_confidence_interval_empty_sample() {
        let ci = confidence_interval(0.03, 0, 0.045, 1000, ConfidenceLevel::NinetyFive);
        assert_eq!(ci, ConfidenceInterval::default());
    }

    // ===== sample size / power =====

    #[test]
    fn test_required_sample_size_default_inputs() {
        // 3% baseline, 20% relative lift, 95% confidence, 80% power
        let n = required_sample_size(0.2, ConfidenceLevel::NinetyFive, 0.8, 0.03);
        assert!((13_850..=13_980).contains(&n), "n={n}");
    }

    #[test]
    fn test_required_sample_size_shrinks_with_larger_effect() {
        let small = required_sample_size(0.2, ConfidenceLevel::NinetyFive, 0.8, 0.03);
        let large = required_sample_size(0.5, ConfidenceLevel::NinetyFive, 0.8, 0.03);
        assert!(large < small);
    }

    #[test]
    fn test_required_sample_size_grows_with_confidence() {
        let n90 = required_sample_size(0.2, ConfidenceLevel::Ninety, 0.8, 0.03);
        let n99 = required_sample_size(0.2, ConfidenceLevel::NinetyNine, 0.8, 0.03);
        assert!(n90 < n99);
    }

    #[test]
    fn test_required_sample_size_unknown_baseline_uses_default() {
        let explicit =
            required_sample_size(0.2, ConfidenceLevel::NinetyFive, 0.8, DEFAULT_BASELINE_RATE);
        let unknown = required_sample_size(0.2, ConfidenceLevel::NinetyFive, 0.8, 0.0);
        assert_eq!(explicit, unknown);
    }

    #[test]
    fn test_required_sample_size_zero_effect_is_capped() {
        assert_eq!(
            required_sample_size(0.0, ConfidenceLevel::NinetyFive, 0.8, 0.03),
            MAX_SAMPLE_SIZE
        );
    }

    #[test]
    fn test_statistical_power_known_value() {
        let power = statistical_power(1000, 1000, 0.03, 0.05, 0.05);
        assert!((power - 0.627).abs() < 0.01, "power={power}");
    }

    #[test]
    fn test_statistical_power_grows_with_sample() {
        let small = statistical_power(500, 500, 0.03, 0.045, 0.05);
        let large = statistical_power(5000, 5000, 0.03, 0.045, 0.05);
        assert!(small < large);
    }

    #[test]
    fn test_statistical_power_empty_is_zero() {
        assert_eq!(statistical_power(0, 100, 0.03, 0.05, 0.05), 0.0);
    }

    // ===== helpers =====

    #[test]
    fn test_relative_lift_pct() {
        assert!((relative_lift_pct(0.03, 0.045) - 50.0).abs() < 1e-9);
        assert_eq!(relative_lift_pct(0.0, 0.045), 0.0);
    }

    #[test]
    fn test_ratio_zero_denominator() {
        assert_eq!(ratio(5, 0), 0.0);
        assert!((ratio(1, 4) - 0.25).abs() < 1e-12);
    }

    // ===== totality =====

    proptest! {
        #[test]
        fn prop_z_and_p_are_finite_and_clamped(
            c1 in 0u64..5_000, extra1 in 0u64..5_000,
            c2 in 0u64..5_000, extra2 in 0u64..5_000,
        ) {
            let (n1, n2) = (c1 + extra1, c2 + extra2);
            let z = z_score_for_proportions(ratio(c1, n1), n1, ratio(c2, n2), n2);
            prop_assert!(z.is_finite());
            let p = p_value(z);
            prop_assert!((0.0..=1.0).contains(&p));
            let power = statistical_power(n1, n2, ratio(c1, n1), ratio(c2, n2), 0.05);
            prop_assert!((0.0..=1.0).contains(&power));
            let ci = confidence_interval(
                ratio(c1, n1),
                n1,
                ratio(c2, n2),
                n2,
                ConfidenceLevel::NinetyFive,
            );
            prop_assert!(ci.lower.is_finite() && ci.upper.is_finite());
        }

        #[test]
        fn prop_required_sample_size_bounded(
            mde in -1.0f64..5.0, power in -0.5f64..1.5, baseline in -0.5f64..1.5,
        ) {
            let n = required_sample_size(mde, ConfidenceLevel::NinetyFive, power, baseline);
            prop_assert!((1..=MAX_SAMPLE_SIZE).contains(&n));
        }
    }
}
