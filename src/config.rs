//! Run configuration
//!
//! Every process role reads the same `config.json`. All sections and fields
//! carry serde defaults so a partial file (or `{}`) is a valid configuration.
//!
//! ```rust
//! use graphoptima::config::Config;
//!
//! let config: Config = serde_json::from_str(r#"{ "cache": { "similarity_threshold": 0.99 } }"#)?;
//! assert!((config.cache.similarity_threshold - 0.99).abs() < f64::EPSILON);
//! assert_eq!(config.optimizer.num_design_params, 3);
//! # Ok::<(), serde_json::Error>(())
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::reward::Weights;
use crate::store::{ResultStore, RunMetadata};
use crate::{Error, Result};

/// Top-level configuration shared by every process role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory layout of the shared working area
    pub workspace: WorkspaceConfig,
    /// Work queue polling and lock policy
    pub queue: QueueConfig,
    /// Result store locations
    pub store: StoreConfig,
    /// Similarity cache tuning
    pub cache: CacheConfig,
    /// Metric weights of the current scalarization group
    pub reward: Weights,
    /// Orchestrator policy
    pub optimizer: OptimizerConfig,
    /// Admission control and worker pool targets
    pub admission: AdmissionConfig,
    /// External layout generator command
    pub generator: CommandConfig,
    /// External readability metric command
    #[serde(default = "CommandConfig::metric_default")]
    pub evaluator: CommandConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: WorkspaceConfig::default(),
            queue: QueueConfig::default(),
            store: StoreConfig::default(),
            cache: CacheConfig::default(),
            reward: Weights::default(),
            optimizer: OptimizerConfig::default(),
            admission: AdmissionConfig::default(),
            generator: CommandConfig::default(),
            evaluator: CommandConfig::metric_default(),
        }
    }
}

impl Config {
    /// Load and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read, parsed, or fails
    /// validation.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.queue.poll_interval_ms == 0 {
            return Err(Error::Config("queue.poll_interval_ms must be positive".into()));
        }
        if !(-1.0..=1.0).contains(&self.cache.similarity_threshold) {
            return Err(Error::Config(format!(
                "cache.similarity_threshold must lie in [-1, 1], got {}",
                self.cache.similarity_threshold
            )));
        }
        if self.cache.max_error_fraction < 0.0 {
            return Err(Error::Config("cache.max_error_fraction must not be negative".into()));
        }
        if self.optimizer.num_design_params == 0 {
            return Err(Error::Config("optimizer.num_design_params must be positive".into()));
        }
        if let Some(&idx) = self
            .optimizer
            .integer_params
            .iter()
            .find(|&&idx| idx >= self.optimizer.num_design_params)
        {
            return Err(Error::Config(format!(
                "optimizer.integer_params index {idx} out of range"
            )));
        }
        if !(self.optimizer.scalarization_granularity > 0.0
            && self.optimizer.scalarization_granularity <= 1.0)
        {
            return Err(Error::Config("optimizer.scalarization_granularity must lie in (0, 1]".into()));
        }
        if self.admission.tick_ms == 0 {
            return Err(Error::Config("admission.tick_ms must be positive".into()));
        }
        Ok(())
    }

    /// Resolve a workspace-relative path against `workspace.work_dir`.
    #[must_use]
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace.work_dir.join(path)
        }
    }

    /// Directory holding score artifacts.
    #[must_use]
    pub fn score_dir(&self) -> PathBuf {
        self.resolve(&self.workspace.score_dir)
    }

    /// Directory holding outbound notification instructions.
    #[must_use]
    pub fn instruction_dir(&self) -> PathBuf {
        self.resolve(&self.workspace.instruction_dir)
    }

    /// Directory receiving archived per-pass stores.
    #[must_use]
    pub fn archive_dir(&self) -> PathBuf {
        self.resolve(&self.workspace.archive_dir)
    }

    /// Path of the completion sentinel.
    #[must_use]
    pub fn sentinel_path(&self) -> PathBuf {
        self.resolve(&self.workspace.completion_sentinel)
    }

    /// Path of the per-run store.
    #[must_use]
    pub fn run_store_path(&self) -> PathBuf {
        self.resolve(&self.store.run_store_path)
    }

    /// Path of the cross-run global store.
    #[must_use]
    pub fn global_store_path(&self) -> PathBuf {
        self.resolve(&self.store.global_store_path)
    }

    /// Metadata attached to every persisted row under the current weights.
    #[must_use]
    pub fn run_metadata(&self) -> RunMetadata {
        let tags = &self.optimizer.metadata;
        RunMetadata {
            graph_file_name: tags.graph_file_name.clone(),
            algorithm_being_optimized: tags.algorithm_being_optimized.clone(),
            optimization_algorithm_used: tags.optimization_algorithm_used.clone(),
            readability_calculation_method: tags.readability_calculation_method.clone(),
            readability_calculation_weight_list: self.reward.as_array().to_vec(),
        }
    }
}

/// Shared working area layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Directory holding `.params` and `.dot` work units
    pub work_dir: PathBuf,
    /// Score artifact directory, relative to `work_dir`
    pub score_dir: PathBuf,
    /// Notification instruction directory, relative to `work_dir`
    pub instruction_dir: PathBuf,
    /// Archive directory for finished passes, relative to `work_dir`
    pub archive_dir: PathBuf,
    /// Completion sentinel file name, relative to `work_dir`
    pub completion_sentinel: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            score_dir: PathBuf::from("readability_score_results"),
            instruction_dir: PathBuf::from("instructions"),
            archive_dir: PathBuf::from("database"),
            completion_sentinel: PathBuf::from("optimization_completed.txt"),
        }
    }
}

/// Work queue polling and lock policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Sleep between scans when no work was found
    pub poll_interval_ms: u64,
    /// Locks older than this are considered abandoned. `None` keeps locks
    /// forever, so a crashed holder leaves its unit stuck until bulk cleanup.
    pub lock_lease_secs: Option<u64>,
}

impl QueueConfig {
    /// Poll interval as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Lock lease as a [`Duration`], if enabled.
    #[must_use]
    pub fn lock_lease(&self) -> Option<Duration> {
        self.lock_lease_secs.map(Duration::from_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            lock_lease_secs: None,
        }
    }
}

/// Result store locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Per-weight-group store, archived at the end of each pass
    pub run_store_path: PathBuf,
    /// Cross-run store used as the similarity cache corpus
    pub global_store_path: PathBuf,
    /// Sleep between retries while the store reports busy
    pub busy_backoff_ms: u64,
    /// Wait inside SQLite before a lock attempt reports busy
    pub busy_timeout_ms: u64,
    /// Rows printed by `graphoptima show`
    pub printout_lines: usize,
}

impl StoreConfig {
    /// Open the store at `path` with the configured busy handling.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the store cannot be opened.
    pub fn open(&self, path: &Path) -> Result<ResultStore> {
        ResultStore::open(path)?
            .with_busy_timeout(Duration::from_millis(self.busy_timeout_ms))
            .map(|store| store.with_busy_backoff(Duration::from_millis(self.busy_backoff_ms)))
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            run_store_path: PathBuf::from("optimization.db"),
            global_store_path: PathBuf::from("global_optimization.db"),
            busy_backoff_ms: 10,
            busy_timeout_ms: 5000,
            printout_lines: 20,
        }
    }
}

/// Similarity cache tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Substitute similar tested parameters for fresh evaluations
    pub enabled: bool,
    /// Minimum (possibly penalized) cosine score for a hit
    pub similarity_threshold: f64,
    /// Per-coordinate tolerance as a fraction of the query's magnitude
    pub max_error_fraction: f64,
    /// Reload the snapshot every N lookups; 0 reloads on every lookup
    pub refresh_interval: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            similarity_threshold: 0.999,
            max_error_fraction: 0.05,
            refresh_interval: 0,
        }
    }
}

/// Descriptive tags persisted with every row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataTags {
    /// Input graph file name
    pub graph_file_name: String,
    /// Layout algorithm whose parameters are swept
    pub algorithm_being_optimized: String,
    /// Optimization algorithm proposing vectors
    pub optimization_algorithm_used: String,
    /// Readability metric method
    pub readability_calculation_method: String,
}

impl Default for MetadataTags {
    fn default() -> Self {
        Self {
            graph_file_name: String::new(),
            algorithm_being_optimized: "force_atlas2".to_string(),
            optimization_algorithm_used: "differential_evolution".to_string(),
            readability_calculation_method: "glam".to_string(),
        }
    }
}

/// Orchestrator policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Scalar reward when true, three-objective vector otherwise
    pub single_objective: bool,
    /// Extra publish attempts before substituting the penalty
    pub max_publish_retries: u32,
    /// Re-evaluations after a reward derivation failure
    pub max_derivation_retries: u32,
    /// Arity of every parameter vector
    pub num_design_params: usize,
    /// Indices truncated to integers before publishing
    pub integer_params: Vec<usize>,
    /// Tags persisted with every row
    pub metadata: MetadataTags,
    /// Step of the weight grid explored by scalarization
    pub scalarization_granularity: f64,
    /// Skip weight groups whose archive already exists
    pub breakpoint_skip: bool,
    /// Reuse the run store row with the next sequence number, if any
    pub sequence_substitution: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            single_objective: true,
            max_publish_retries: 3,
            max_derivation_retries: 3,
            num_design_params: 3,
            integer_params: vec![2],
            metadata: MetadataTags::default(),
            scalarization_granularity: 0.25,
            breakpoint_skip: true,
            sequence_substitution: false,
        }
    }
}

/// One worker role managed by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleConfig {
    /// Job name as listed by the scheduler
    pub name: String,
    /// Number of live jobs to maintain
    pub target: u32,
    /// Batch script submitted for this role
    pub script: String,
}

impl RoleConfig {
    /// Create a role definition.
    #[must_use]
    pub fn new(name: impl Into<String>, target: u32, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target,
            script: script.into(),
        }
    }
}

/// Admission control and worker pool targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Worker roles and their pool targets
    pub roles: Vec<RoleConfig>,
    /// Minimum time a submission lockout lasts
    pub cooldown_secs: u64,
    /// Period of the counter decay
    pub decay_interval_secs: u64,
    /// Period of the scheduler job listing refresh
    pub scheduler_refresh_secs: u64,
    /// Coordinator loop period
    pub tick_ms: u64,
    /// Job owner passed to the scheduler; defaults to `$USER`
    pub owner: Option<String>,
}

impl AdmissionConfig {
    /// Sum of all role targets.
    #[must_use]
    pub fn total_target(&self) -> u64 {
        self.roles.iter().map(|r| u64::from(r.target)).sum()
    }

    /// Configured owner, falling back to the `USER` environment variable.
    #[must_use]
    pub fn owner(&self) -> String {
        self.owner
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_default()
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            roles: vec![
                RoleConfig::new("layout_generator", 1, "sbatch_script_layout_generator.sh"),
                RoleConfig::new("layout_evaluator", 1, "sbatch_script_layout_evaluator.sh"),
                RoleConfig::new("optimizer", 1, "sbatch_script_optimizer.sh"),
            ],
            cooldown_secs: 600,
            decay_interval_secs: 300,
            scheduler_refresh_secs: 5,
            tick_ms: 1000,
            owner: None,
        }
    }
}

/// External command template. `{input}` expands to the claimed artifact path
/// and `{id}` to the work unit identifier; stdout becomes the next artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Executable
    pub program: String,
    /// Arguments with placeholders
    pub args: Vec<String>,
}

impl CommandConfig {
    /// Default invocation of the readability metric executable.
    #[must_use]
    pub fn metric_default() -> Self {
        Self {
            program: "glam".to_string(),
            args: [
                "{input}",
                "-m",
                "crosslessness",
                "edge_length_cv",
                "min_angle",
                "shape_gabriel",
                "shape_delaunay",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            program: "layout_generator".to_string(),
            args: vec!["{input}".to_string()],
        }
    }
}
