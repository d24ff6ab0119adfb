//! Reward derivation from raw readability metrics
//!
//! The metric executable reports seven values, always in this order:
//!
//! | Index | Metric |
//! |---|---|
//! | 0 | crosslessness |
//! | 1 | number of edge crossings |
//! | 2 | edge length coefficient of variation |
//! | 3 | normalized CV |
//! | 4 | minimum angle |
//! | 5 | shape (Delaunay) |
//! | 6 | shape (Gabriel) |
//!
//! Rewards are minimized. The scalar reward is the weighted sum
//! `w_cross * (1 - crosslessness) + w_ncv * normalized_cv + w_angle * (1 - min_angle)`;
//! the multi-objective reward is the unweighted triple of those three terms.
//!
//! Raw metrics are what the store and the similarity cache keep. Rewards are
//! always re-derived under the weights in force at lookup time.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Number of values reported by the metric executable.
pub const METRIC_COUNT: usize = 7;

/// Number of objectives in multi-objective mode.
pub const OBJECTIVE_COUNT: usize = 3;

/// Substitute value for every metric when an evaluation cannot be carried out.
pub const PENALTY: f64 = 999_999.0;

/// Metric weights of one scalarization group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Weights {
    /// Weight of `1 - crosslessness`
    pub crosslessness: f64,
    /// Weight of the edge crossing count (recorded, not used by the reward)
    pub num_edge_crossings: f64,
    /// Weight of the edge length CV (recorded, not used by the reward)
    pub edge_length_cv: f64,
    /// Weight of the normalized CV
    pub normalized_cv: f64,
    /// Weight of `1 - min_angle`
    pub min_angle: f64,
    /// Weight of the Delaunay shape metric (recorded, not used by the reward)
    pub shape_delaunay: f64,
    /// Weight of the Gabriel shape metric (recorded, not used by the reward)
    pub shape_gabriel: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self::scalarized(1.0, 0.0, 0.0)
    }
}

impl Weights {
    /// Weights of a scalarization group over the three optimized terms.
    #[must_use]
    pub const fn scalarized(crosslessness: f64, normalized_cv: f64, min_angle: f64) -> Self {
        Self {
            crosslessness,
            num_edge_crossings: 0.0,
            edge_length_cv: 0.0,
            normalized_cv,
            min_angle,
            shape_delaunay: 0.0,
            shape_gabriel: 0.0,
        }
    }

    /// All seven weights in metric order.
    #[must_use]
    pub const fn as_array(&self) -> [f64; METRIC_COUNT] {
        [
            self.crosslessness,
            self.num_edge_crossings,
            self.edge_length_cv,
            self.normalized_cv,
            self.min_angle,
            self.shape_delaunay,
            self.shape_gabriel,
        ]
    }

    /// The three weights that define a scalarization group.
    #[must_use]
    pub const fn group(&self) -> [f64; OBJECTIVE_COUNT] {
        [self.crosslessness, self.normalized_cv, self.min_angle]
    }
}

/// Shape of the value handed back to the optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Objective {
    /// Weighted scalar reward
    Single,
    /// Three-objective vector reward
    Multi,
}

impl Objective {
    /// Objective mode from the `single_objective` flag.
    #[must_use]
    pub const fn from_single_flag(single: bool) -> Self {
        if single {
            Self::Single
        } else {
            Self::Multi
        }
    }
}

/// Derived reward, persisted as a JSON number or array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reward {
    /// Single-objective reward
    Scalar(f64),
    /// Multi-objective reward
    Vector(Vec<f64>),
}

impl Reward {
    /// Maximum penalty in the given objective mode.
    #[must_use]
    pub fn penalty(objective: Objective) -> Self {
        match objective {
            Objective::Single => Self::Scalar(PENALTY),
            Objective::Multi => Self::Vector(vec![PENALTY; OBJECTIVE_COUNT]),
        }
    }

    /// Scalar value, if single-objective.
    #[must_use]
    pub const fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(value) => Some(*value),
            Self::Vector(_) => None,
        }
    }

    /// Reward values as a vector (one element in single-objective mode).
    #[must_use]
    pub fn to_vec(&self) -> Vec<f64> {
        match self {
            Self::Scalar(value) => vec![*value],
            Self::Vector(values) => values.clone(),
        }
    }
}

/// Raw metrics substituted when an evaluation cannot be carried out.
#[must_use]
pub fn penalty_metrics() -> Vec<f64> {
    vec![PENALTY; METRIC_COUNT]
}

/// Whether `raw` is the penalty substitute.
#[must_use]
pub fn is_penalty(raw: &[f64]) -> bool {
    raw.len() == METRIC_COUNT && raw.iter().all(|&v| (v - PENALTY).abs() < f64::EPSILON)
}

/// Fold split scientific-notation values and check the metric count.
///
/// When more than seven values were parsed, every negative value past index 5
/// is an exponent belonging to its predecessor: the predecessor becomes
/// `prev * 10^exp` and the exponent is dropped.
///
/// # Errors
///
/// Returns [`Error::MalformedMetrics`] unless exactly seven values remain.
pub fn normalize_metrics(raw: &[f64]) -> Result<[f64; METRIC_COUNT]> {
    let mut values = raw.to_vec();
    let mut exponent_at = vec![false; values.len()];
    if values.len() != METRIC_COUNT {
        for i in 6..values.len() {
            if values[i] < 0.0 {
                values[i - 1] *= 10f64.powf(values[i]);
                exponent_at[i] = true;
            }
        }
    }
    let folded: Vec<f64> = values
        .into_iter()
        .zip(exponent_at)
        .filter_map(|(value, is_exponent)| (!is_exponent).then_some(value))
        .collect();

    folded.try_into().map_err(|folded: Vec<f64>| {
        Error::MalformedMetrics(format!(
            "got {} values after normalization: {folded:?}",
            folded.len()
        ))
    })
}

/// Derive the reward of `raw` under `weights`.
///
/// The penalty substitute always maps to the maximum penalty.
///
/// # Errors
///
/// Returns [`Error::MalformedMetrics`] if `raw` does not normalize to seven
/// finite values.
pub fn derive_reward(raw: &[f64], weights: &Weights, objective: Objective) -> Result<Reward> {
    if is_penalty(raw) {
        return Ok(Reward::penalty(objective));
    }
    let m = normalize_metrics(raw)?;
    if let Some(bad) = m.iter().find(|v| !v.is_finite()) {
        return Err(Error::MalformedMetrics(format!("non-finite value {bad}")));
    }
    let (crosslessness, normalized_cv, min_angle) = (m[0], m[3], m[4]);
    Ok(match objective {
        Objective::Single => Reward::Scalar(
            weights.crosslessness * (1.0 - crosslessness)
                + weights.normalized_cv * normalized_cv
                + weights.min_angle * (1.0 - min_angle),
        ),
        Objective::Multi => Reward::Vector(vec![1.0 - crosslessness, normalized_cv, 1.0 - min_angle]),
    })
}

/// All `n`-tuples of non-negative multiples of `granularity` summing to one.
///
/// Each tuple is one scalarization group; sweeping them explores the Pareto
/// front with single-objective optimizers.
///
/// ```rust
/// use graphoptima::reward::weight_grid;
///
/// let grid = weight_grid(3, 0.5);
/// assert_eq!(grid.len(), 6);
/// assert!(grid.contains(&vec![0.5, 0.0, 0.5]));
/// ```
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn weight_grid(n: usize, granularity: f64) -> Vec<Vec<f64>> {
    if n == 0 || !(granularity > 0.0 && granularity <= 1.0) {
        return Vec::new();
    }
    let steps = (1.0 / granularity).round() as usize;
    let mut grid = Vec::new();
    let mut current = Vec::with_capacity(n);
    compositions(n, steps, &mut current, &mut grid);
    grid.into_iter()
        .map(|parts| parts.into_iter().map(|p| p as f64 / steps as f64).collect())
        .collect()
}

fn compositions(n: usize, remaining: usize, current: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
    if n == 1 {
        current.push(remaining);
        out.push(current.clone());
        current.pop();
        return;
    }
    for part in 0..=remaining {
        current.push(part);
        compositions(n - 1, remaining - part, current, out);
        current.pop();
    }
}
