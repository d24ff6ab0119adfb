//! Result Record - one evaluation, written once

use serde::{Deserialize, Serialize};

use crate::reward::Reward;

/// Descriptive context persisted with every row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Input graph file name
    pub graph_file_name: String,
    /// Layout algorithm whose parameters are swept
    pub algorithm_being_optimized: String,
    /// Optimization algorithm proposing vectors
    pub optimization_algorithm_used: String,
    /// Readability metric method
    pub readability_calculation_method: String,
    /// All seven metric weights in force when the row was written
    pub readability_calculation_weight_list: Vec<f64>,
}

/// Result Record represents a single completed evaluation.
///
/// Records are append-only: there are no setters, and the store never
/// updates or deletes a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    #[serde(skip)]
    row_id: Option<i64>,
    sequence: u64,
    params: Vec<f64>,
    raw_metrics: Vec<f64>,
    reward: Reward,
    metadata: RunMetadata,
}

impl ResultRecord {
    /// Create a new record with empty metadata.
    ///
    /// # Arguments
    ///
    /// * `sequence` - Evaluation number within the current pass
    /// * `params` - Evaluated parameter vector
    /// * `raw_metrics` - Metric values reported for the layout
    /// * `reward` - Reward derived under the current weights
    #[must_use]
    pub fn new(sequence: u64, params: Vec<f64>, raw_metrics: Vec<f64>, reward: Reward) -> Self {
        Self {
            row_id: None,
            sequence,
            params,
            raw_metrics,
            reward,
            metadata: RunMetadata::default(),
        }
    }

    /// Create a builder for constructing a record with metadata.
    #[must_use]
    pub fn builder(
        sequence: u64,
        params: Vec<f64>,
        raw_metrics: Vec<f64>,
        reward: Reward,
    ) -> ResultRecordBuilder {
        ResultRecordBuilder::new(sequence, params, raw_metrics, reward)
    }

    /// Store row id, once read back from a store.
    #[must_use]
    pub const fn row_id(&self) -> Option<i64> {
        self.row_id
    }

    /// Get the evaluation sequence number.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Get the parameter vector.
    #[must_use]
    pub fn params(&self) -> &[f64] {
        &self.params
    }

    /// Get the raw metric vector.
    #[must_use]
    pub fn raw_metrics(&self) -> &[f64] {
        &self.raw_metrics
    }

    /// Get the derived reward.
    #[must_use]
    pub const fn reward(&self) -> &Reward {
        &self.reward
    }

    /// Get the metadata.
    #[must_use]
    pub const fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    pub(crate) const fn with_row_id(mut self, row_id: i64) -> Self {
        self.row_id = Some(row_id);
        self
    }
}

/// Builder for `ResultRecord`.
#[derive(Debug)]
pub struct ResultRecordBuilder {
    record: ResultRecord,
}

impl ResultRecordBuilder {
    /// Create a new builder with required fields.
    #[must_use]
    pub fn new(sequence: u64, params: Vec<f64>, raw_metrics: Vec<f64>, reward: Reward) -> Self {
        Self {
            record: ResultRecord::new(sequence, params, raw_metrics, reward),
        }
    }

    /// Set the metadata.
    #[must_use]
    pub fn metadata(mut self, metadata: RunMetadata) -> Self {
        self.record.metadata = metadata;
        self
    }

    /// Build the `ResultRecord`.
    #[must_use]
    pub fn build(self) -> ResultRecord {
        self.record
    }
}
