//! Property-based tests for reward derivation and score parsing
//!
//! - Test mathematical invariants of the reward
//! - Test metric normalisation and artifact parsing
//! - Run with ProptestConfig::with_cases(100)

use graphoptima::artifact::parse_score;
use graphoptima::reward::{derive_reward, normalize_metrics, weight_grid, Objective, Reward, Weights};
use proptest::prelude::*;

// ============================================================================
// Property Test Generators (Strategies)
// ============================================================================

/// Seven metric values in the unit interval
fn arb_metrics() -> impl Strategy<Value = Vec<f64>> {
    proptest::collection::vec(0.0f64..=1.0, 7)
}

/// Scalarization weights, not necessarily normalized
fn arb_weights() -> impl Strategy<Value = Weights> {
    (0.0f64..5.0, 0.0f64..5.0, 0.0f64..5.0).prop_map(|(a, b, c)| Weights::scalarized(a, b, c))
}

fn scalar(raw: &[f64], weights: &Weights) -> f64 {
    derive_reward(raw, weights, Objective::Single)
        .unwrap()
        .as_scalar()
        .unwrap()
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    // ========================================================================
    // Reward Properties
    // ========================================================================

    /// Property: the scalar reward is the weighted sum of the per-term rewards
    #[test]
    fn prop_scalar_reward_is_linear_in_weights(raw in arb_metrics(), w in arb_weights()) {
        let terms = [
            scalar(&raw, &Weights::scalarized(1.0, 0.0, 0.0)),
            scalar(&raw, &Weights::scalarized(0.0, 1.0, 0.0)),
            scalar(&raw, &Weights::scalarized(0.0, 0.0, 1.0)),
        ];
        let [a, b, c] = w.group();
        let expected = a * terms[0] + b * terms[1] + c * terms[2];
        prop_assert!((scalar(&raw, &w) - expected).abs() < 1e-9);
    }

    /// Property: a weight group from the grid keeps unit-interval metrics in [0, 1]
    #[test]
    fn prop_grid_rewards_stay_in_unit_interval(raw in arb_metrics(), pick in 0usize..15) {
        let grid = weight_grid(3, 0.25);
        let group = &grid[pick % grid.len()];
        let weights = Weights::scalarized(group[0], group[1], group[2]);
        let value = scalar(&raw, &weights);
        prop_assert!((-1e-12..=1.0 + 1e-12).contains(&value));
    }

    /// Property: the multi-objective reward ignores weights
    #[test]
    fn prop_multi_objective_ignores_weights(raw in arb_metrics(), w in arb_weights()) {
        let weighted = derive_reward(&raw, &w, Objective::Multi).unwrap();
        let default = derive_reward(&raw, &Weights::default(), Objective::Multi).unwrap();
        prop_assert_eq!(weighted, default);
    }

    /// Property: cached metrics re-derive to the same reward under the same weights
    #[test]
    fn prop_rederivation_is_deterministic(raw in arb_metrics(), w in arb_weights()) {
        let first = derive_reward(&raw, &w, Objective::Single).unwrap();
        let second = derive_reward(&raw, &w, Objective::Single).unwrap();
        prop_assert!(matches!((&first, &second), (Reward::Scalar(x), Reward::Scalar(y)) if x.to_bits() == y.to_bits()));
    }

    // ========================================================================
    // Normalisation Properties
    // ========================================================================

    /// Property: exactly seven values pass through untouched, negatives included
    #[test]
    fn prop_seven_values_are_not_folded(raw in proptest::collection::vec(-1.0f64..1.0, 7)) {
        prop_assert_eq!(normalize_metrics(&raw).unwrap().to_vec(), raw);
    }

    /// Property: a split exponent after the sixth value folds into it
    #[test]
    fn prop_split_exponent_folds_into_predecessor(raw in arb_metrics(), exp in 1i32..6) {
        let mut split = raw[..6].to_vec();
        split.push(f64::from(-exp));
        split.push(raw[6]);

        let folded = normalize_metrics(&split).unwrap();
        prop_assert_eq!(&folded[..5], &raw[..5]);
        prop_assert!((folded[5] - raw[5] * 10f64.powi(-exp)).abs() < 1e-12);
        prop_assert_eq!(folded[6], raw[6]);
    }

    /// Property: anything but seven values after folding is rejected
    #[test]
    fn prop_wrong_arity_is_rejected(raw in proptest::collection::vec(0.0f64..1.0, 0..7)) {
        prop_assert!(normalize_metrics(&raw).is_err());
    }

    // ========================================================================
    // Weight Grid Properties
    // ========================================================================

    /// Property: every grid tuple is non-negative and sums to one
    #[test]
    fn prop_weight_grid_tuples_sum_to_one(n in 1usize..5, steps in 1u32..9) {
        let grid = weight_grid(n, 1.0 / f64::from(steps));
        prop_assert!(!grid.is_empty());
        for tuple in &grid {
            prop_assert_eq!(tuple.len(), n);
            prop_assert!(tuple.iter().all(|&w| w >= 0.0));
            prop_assert!((tuple.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        }
    }

    // ========================================================================
    // Score Parsing Properties
    // ========================================================================

    /// Property: preamble tokens never contribute values
    #[test]
    fn prop_preamble_is_skipped(
        preamble in proptest::collection::vec("[a-z0-9:]{1,8}", 5),
        values in proptest::collection::vec(0.0f64..100.0, 7)
    ) {
        let body: Vec<String> = values.iter().map(ToString::to_string).collect();
        let text = format!("{} {}", preamble.join(" "), body.join(" "));
        prop_assert_eq!(parse_score(&text), values);
    }
}
