//! Evaluation orchestrator
//!
//! The one entry point an optimization algorithm calls per parameter vector:
//!
//! 1. similarity cache lookup against the global store; a hit re-derives the
//!    reward from the cached raw metrics under the current weights
//! 2. on a miss, publish a work unit (bounded retries, then the penalty)
//! 3. wait for the score artifact of that unit, with no timeout
//! 4. derive the reward; malformed metrics re-run the pipeline a bounded
//!    number of times, then fall back to the penalty
//! 5. append the row to the run store and the global store, best effort
//! 6. remove stray crash dumps from the working directory
//!
//! All mutable bookkeeping lives in [`EvaluationState`], owned by the
//! orchestrator. Recovery attempts neither consult the cache nor advance the
//! evaluation counter.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifact::{encode_params, parse_score, PARAMS_SUFFIX, SCORE_SUFFIX};
use crate::cache::SimilarityCache;
use crate::config::{Config, StoreConfig};
use crate::notify::{NotificationKind, Notifier};
use crate::queue::{remove_if_present, WorkQueue};
use crate::reward::{derive_reward, penalty_metrics, Objective, Reward, Weights};
use crate::store::{ResultRecord, ResultStore, RunMetadata};
use crate::{Error, Result};

/// Evaluation bookkeeping of the current pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluationState {
    /// Evaluations counted so far; the next persisted row gets `evaluations + 1`
    pub evaluations: u64,
    /// Set while re-running an evaluation whose metrics were malformed
    pub recovering: bool,
}

/// Where a returned reward came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Freshly generated and evaluated
    Pipeline,
    /// Substituted from a similar cached evaluation
    Cache,
    /// Substituted from the run store row with the same sequence number
    Sequence,
    /// Penalty after exhausted retries
    Penalty,
}

/// Result of one [`Orchestrator::evaluate_detailed`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Reward handed to the optimizer
    pub reward: Reward,
    /// Raw metrics the reward was derived from
    pub raw_metrics: Vec<f64>,
    /// Origin of the reward
    pub source: Source,
}

/// Per-vector evaluation pipeline driver.
pub struct Orchestrator<N> {
    params_queue: WorkQueue,
    score_queue: WorkQueue,
    work_dir: PathBuf,
    run_store_path: PathBuf,
    run_store: ResultStore,
    global_store: ResultStore,
    store_config: StoreConfig,
    cache: Option<SimilarityCache>,
    weights: Weights,
    objective: Objective,
    metadata: RunMetadata,
    num_design_params: usize,
    integer_params: Vec<usize>,
    max_publish_retries: u32,
    max_derivation_retries: u32,
    sequence_substitution: bool,
    poll_interval: Duration,
    notifier: N,
    state: EvaluationState,
}

impl<N: Notifier> Orchestrator<N> {
    /// Build an orchestrator over the configured workspace, opening (and
    /// creating if needed) both stores.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if either store cannot be opened.
    pub fn from_config(config: &Config, notifier: N) -> Result<Self> {
        let lease = config.queue.lock_lease();
        let run_store_path = config.run_store_path();
        let run_store = config.store.open(&run_store_path)?;
        let global_store = config.store.open(&config.global_store_path())?;
        let cache = config
            .cache
            .enabled
            .then(|| SimilarityCache::from_config(&config.cache));

        Ok(Self {
            params_queue: WorkQueue::new(&config.workspace.work_dir, PARAMS_SUFFIX)
                .with_lease(lease),
            score_queue: WorkQueue::new(config.score_dir(), SCORE_SUFFIX).with_lease(lease),
            work_dir: config.workspace.work_dir.clone(),
            run_store_path,
            run_store,
            global_store,
            store_config: config.store.clone(),
            cache,
            weights: config.reward,
            objective: Objective::from_single_flag(config.optimizer.single_objective),
            metadata: config.run_metadata(),
            num_design_params: config.optimizer.num_design_params,
            integer_params: config.optimizer.integer_params.clone(),
            max_publish_retries: config.optimizer.max_publish_retries,
            max_derivation_retries: config.optimizer.max_derivation_retries,
            sequence_substitution: config.optimizer.sequence_substitution,
            poll_interval: config.queue.poll_interval(),
            notifier,
            state: EvaluationState::default(),
        })
    }

    /// Current bookkeeping.
    #[must_use]
    pub const fn state(&self) -> EvaluationState {
        self.state
    }

    /// Weights in force.
    #[must_use]
    pub const fn weights(&self) -> &Weights {
        &self.weights
    }

    /// Objective mode.
    #[must_use]
    pub const fn objective(&self) -> Objective {
        self.objective
    }

    /// Per-run store.
    #[must_use]
    pub const fn run_store(&self) -> &ResultStore {
        &self.run_store
    }

    /// Cross-run store feeding the cache.
    #[must_use]
    pub const fn global_store(&self) -> &ResultStore {
        &self.global_store
    }

    /// Start a scalarization pass under `weights`: the evaluation counter
    /// restarts and new rows carry the new weights.
    pub fn begin_pass(&mut self, weights: Weights) {
        self.weights = weights;
        self.metadata.readability_calculation_weight_list = weights.as_array().to_vec();
        self.state = EvaluationState::default();
        info!(weights = ?weights.group(), "scalarization pass started");
    }

    /// Evaluate `params` and return the reward for the optimizer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] if `params` has the wrong arity.
    /// Pipeline trouble never surfaces as an error; it degrades to the
    /// penalty instead.
    pub fn evaluate(&mut self, params: &[f64]) -> Result<Reward> {
        self.evaluate_detailed(params).map(|evaluation| evaluation.reward)
    }

    /// Like [`Self::evaluate`], also reporting raw metrics and provenance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] if `params` has the wrong arity.
    pub fn evaluate_detailed(&mut self, params: &[f64]) -> Result<Evaluation> {
        if params.len() != self.num_design_params {
            return Err(Error::DimensionMismatch {
                expected: self.num_design_params,
                actual: params.len(),
            });
        }

        if let Some(evaluation) = self.substitute(params) {
            self.state.evaluations += 1;
            return Ok(evaluation);
        }

        let (raw_metrics, reward, source) = self.run_with_recovery(params);

        self.state.evaluations += 1;
        let sequence = self.state.evaluations;
        let submitted = self.submitted_params(params);
        let record = ResultRecord::builder(sequence, submitted, raw_metrics.clone(), reward.clone())
            .metadata(self.metadata.clone())
            .build();
        self.persist(&record);
        self.cleanup_core_dumps();

        info!(sequence, reward = ?reward, ?source, "evaluation complete");
        Ok(Evaluation {
            reward,
            raw_metrics,
            source,
        })
    }

    /// Cache or sequence substitution, skipped during recovery.
    fn substitute(&mut self, params: &[f64]) -> Option<Evaluation> {
        if self.state.recovering {
            return None;
        }

        if self.sequence_substitution {
            let next = self.state.evaluations + 1;
            match self.run_store.read_by_sequence(next) {
                Ok(Some(record)) => {
                    if let Ok(reward) = derive_reward(record.raw_metrics(), &self.weights, self.objective) {
                        info!(sequence = next, "substituted stored evaluation with the same sequence");
                        return Some(Evaluation {
                            reward,
                            raw_metrics: record.raw_metrics().to_vec(),
                            source: Source::Sequence,
                        });
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "sequence lookup failed"),
            }
        }

        let cache = self.cache.as_mut()?;
        let hit = match cache.lookup(&self.global_store, params) {
            Ok(hit) => hit?,
            Err(e) => {
                warn!(error = %e, "cache lookup failed, evaluating instead");
                return None;
            }
        };
        match derive_reward(&hit.raw_metrics, &self.weights, self.objective) {
            Ok(reward) => {
                info!(
                    closest = ?hit.params,
                    similarity = hit.similarity,
                    "similar tested parameters found"
                );
                Some(Evaluation {
                    reward,
                    raw_metrics: hit.raw_metrics,
                    source: Source::Cache,
                })
            }
            Err(e) => {
                warn!(error = %e, "cached metrics unusable, evaluating instead");
                None
            }
        }
    }

    fn run_with_recovery(&mut self, params: &[f64]) -> (Vec<f64>, Reward, Source) {
        let mut outcome = None;
        for attempt in 0..=self.max_derivation_retries {
            if attempt > 0 {
                self.state.recovering = true;
                warn!(attempt, "re-evaluating after malformed metrics");
            }
            let Some(raw) = self.run_pipeline(params) else {
                outcome = Some((penalty_metrics(), Reward::penalty(self.objective), Source::Penalty));
                break;
            };
            match derive_reward(&raw, &self.weights, self.objective) {
                Ok(reward) => {
                    outcome = Some((raw, reward, Source::Pipeline));
                    break;
                }
                Err(e) => warn!(error = %e, raw = ?raw, "reward derivation failed"),
            }
        }
        self.state.recovering = false;

        outcome.unwrap_or_else(|| {
            error!(params = ?params, "metrics malformed on every attempt, returning maximum penalty");
            self.notify(
                "Error encountered too many times!",
                &format!(
                    "Using {params:?} produced malformed metrics {} times, returning maximum penalty.",
                    self.max_derivation_retries + 1
                ),
            );
            (penalty_metrics(), Reward::penalty(self.objective), Source::Penalty)
        })
    }

    /// Publish a work unit and wait for its score. `None` means publishing
    /// failed on every attempt.
    fn run_pipeline(&self, params: &[f64]) -> Option<Vec<f64>> {
        let id = Uuid::new_v4().to_string();
        let payload = encode_params(params, &self.integer_params);

        let mut published = false;
        for attempt in 0..=self.max_publish_retries {
            match self.params_queue.publish(&id, payload.as_bytes()) {
                Ok(_) => {
                    published = true;
                    break;
                }
                Err(e) => warn!(id = %id, attempt, error = %e, "publishing work unit failed"),
            }
        }
        if !published {
            error!(params = ?params, "publish retries exhausted, returning maximum penalty");
            self.notify(
                "Error encountered too many times!",
                &format!(
                    "Using {params:?} has raised too many ({}) errors, returning maximum penalty.",
                    publish_attempts(self.max_publish_retries)
                ),
            );
            return None;
        }

        debug!(id = %id, payload = %payload, "work unit published, waiting for score");
        Some(self.wait_for_score(&id))
    }

    fn wait_for_score(&self, id: &str) -> Vec<f64> {
        loop {
            if self.score_queue.item_path(id).exists() {
                match self.score_queue.take(id) {
                    Ok(Some(content)) => {
                        let text = String::from_utf8_lossy(&content);
                        let raw = parse_score(&text);
                        debug!(id, raw = ?raw, "score retrieved");
                        return raw;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(id, error = %e, "reading score failed, retrying"),
                }
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    fn submitted_params(&self, params: &[f64]) -> Vec<f64> {
        params
            .iter()
            .enumerate()
            .map(|(i, &value)| {
                if self.integer_params.contains(&i) {
                    value.trunc()
                } else {
                    value
                }
            })
            .collect()
    }

    fn persist(&self, record: &ResultRecord) {
        for (name, store) in [("run", &self.run_store), ("global", &self.global_store)] {
            if let Err(e) = store.append(record) {
                error!(store = name, sequence = record.sequence(), error = %e, "persisting evaluation failed");
            }
        }
    }

    fn notify(&self, subject: &str, body: &str) {
        if let Err(e) = self.notifier.enqueue(subject, body, NotificationKind::Email) {
            error!(error = %e, "cannot queue operator notification");
        }
    }

    /// Remove `core.*` files from the working directory. Returns how many
    /// were removed; absence is success.
    pub fn cleanup_core_dumps(&self) -> usize {
        remove_matching(&self.work_dir, |name| name.starts_with("core."))
    }

    fn open_run_store(&self) -> Result<ResultStore> {
        self.store_config.open(&self.run_store_path)
    }

    fn swap_out_run_store(&mut self) -> Result<ResultStore> {
        Ok(std::mem::replace(&mut self.run_store, ResultStore::open_in_memory()?))
    }

    /// Move the run store to `destination` and start a fresh one.
    ///
    /// # Errors
    ///
    /// Returns an error if the move fails or the fresh store cannot be opened.
    pub fn archive_run_store(&mut self, destination: &Path) -> Result<bool> {
        let moved = self.swap_out_run_store()?.archive(destination);
        self.run_store = self.open_run_store()?;
        moved
    }

    /// Replace the run store with a copy of `source`.
    ///
    /// # Errors
    ///
    /// Returns an error if the copy fails or the store cannot be reopened.
    pub fn restore_run_store(&mut self, source: &Path) -> Result<()> {
        drop(self.swap_out_run_store()?);
        let copied = std::fs::copy(source, &self.run_store_path);
        self.run_store = self.open_run_store()?;
        copied?;
        info!(from = %source.display(), "run store restored from archive");
        Ok(())
    }
}

/// Publish attempts made for `max_retries` extra tries after the first.
const fn publish_attempts(max_retries: u32) -> u32 {
    max_retries.saturating_add(1)
}

/// Delete files in `dir` whose name satisfies `matches`. Missing
/// files and a missing directory count as nothing to do.
pub(crate) fn remove_matching(dir: &Path, matches: impl Fn(&str) -> bool) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !matches(name) {
            continue;
        }
        match remove_if_present(&entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => debug!(file = name, error = %e, "could not remove file"),
        }
    }
    removed
}
