//! Weighted-sum scalarization sweep
//!
//! Explores the Pareto front with a single-objective optimizer by running one
//! pass per weight group. Each pass:
//!
//! - is skipped (or resumed from its archive) if `database_<a>_<b>_<c>.db`
//!   already exists in the archive directory
//! - resets the orchestrator to the group's weights and runs the optimizer
//! - appends the best result to `results_<a>_<b>_<c>.txt`
//! - archives the run store and clears crash dumps, stray scores and locks
//!
//! The completion sentinel is removed when the sweep starts and written when
//! it ends, which tells the coordinator to tear the worker pool down.

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::Config;
use crate::notify::Notifier;
use crate::orchestrator::{remove_matching, Orchestrator};
use crate::queue::remove_if_present;
use crate::reward::{Reward, Weights};
use crate::{Error, Result};

/// Best point an optimizer found in one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PassOutcome {
    /// Best parameter vector
    pub best_params: Vec<f64>,
    /// Its reward
    pub best_reward: Reward,
}

/// What happened to one weight group.
#[derive(Debug, Clone, PartialEq)]
pub enum PassReport {
    /// Archive already present and breakpoint skipping enabled
    Skipped {
        /// Weight group
        weights: [f64; 3],
    },
    /// Pass ran to completion
    Completed {
        /// Weight group
        weights: [f64; 3],
        /// Optimizer result
        outcome: PassOutcome,
        /// Whether the run store was resumed from an existing archive
        resumed: bool,
    },
}

/// Scalarization pass lifecycle over one workspace.
#[derive(Debug, Clone)]
pub struct Sweep {
    work_dir: PathBuf,
    score_dir: PathBuf,
    archive_dir: PathBuf,
    sentinel: PathBuf,
    breakpoint_skip: bool,
}

impl Sweep {
    /// Sweep over the configured workspace.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            work_dir: config.workspace.work_dir.clone(),
            score_dir: config.score_dir(),
            archive_dir: config.archive_dir(),
            sentinel: config.sentinel_path(),
            breakpoint_skip: config.optimizer.breakpoint_skip,
        }
    }

    /// Archive location of a weight group's run store.
    #[must_use]
    pub fn archive_path(&self, weights: [f64; 3]) -> PathBuf {
        self.archive_dir.join(format!("database_{}.db", weight_tag(weights)))
    }

    /// Results file of a weight group.
    #[must_use]
    pub fn results_path(&self, weights: [f64; 3]) -> PathBuf {
        self.work_dir.join(format!("results_{}.txt", weight_tag(weights)))
    }

    /// Remove the completion sentinel, absence being the reset state.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the sentinel exists but cannot be removed.
    pub fn clear_sentinel(&self) -> Result<()> {
        remove_if_present(&self.sentinel)
    }

    /// Write the completion sentinel, a zero-length marker file.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the sentinel cannot be written.
    pub fn write_sentinel(&self) -> Result<()> {
        std::fs::write(&self.sentinel, b"")?;
        info!(sentinel = %self.sentinel.display(), "optimization completed");
        Ok(())
    }

    /// Run one pass per entry of `weight_list`, calling `optimize` with the
    /// orchestrator reset to that group.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a weight group that is not a
    /// triple, and propagates optimizer and archive errors.
    pub fn run<N, F>(
        &self,
        orchestrator: &mut Orchestrator<N>,
        weight_list: &[Vec<f64>],
        mut optimize: F,
    ) -> Result<Vec<PassReport>>
    where
        N: Notifier,
        F: FnMut(&mut Orchestrator<N>) -> Result<PassOutcome>,
    {
        self.clear_sentinel()?;
        let mut reports = Vec::with_capacity(weight_list.len());

        for group in weight_list {
            let weights: [f64; 3] = group.as_slice().try_into().map_err(|_| {
                Error::InvalidInput(format!("weight group must have 3 entries, got {group:?}"))
            })?;
            let archive = self.archive_path(weights);

            let resumed = archive.exists();
            if resumed {
                if self.breakpoint_skip {
                    info!(?weights, "weight group already tested, skipping");
                    reports.push(PassReport::Skipped { weights });
                    continue;
                }
                orchestrator.restore_run_store(&archive)?;
                info!(?weights, "previous pass found, verifying with substitution");
            }

            let [crosslessness, normalized_cv, min_angle] = weights;
            orchestrator.begin_pass(Weights::scalarized(crosslessness, normalized_cv, min_angle));
            let outcome = optimize(orchestrator)?;
            info!(
                ?weights,
                best_params = ?outcome.best_params,
                best_reward = ?outcome.best_reward,
                "pass finished"
            );

            self.write_result(weights, &outcome)?;
            if !orchestrator.archive_run_store(&archive)? {
                warn!(archive = %archive.display(), "run store missing, nothing archived");
            }
            self.cleanup_pass(orchestrator.cleanup_core_dumps());

            reports.push(PassReport::Completed {
                weights,
                outcome,
                resumed,
            });
        }

        self.write_sentinel()?;
        Ok(reports)
    }

    fn write_result(&self, weights: [f64; 3], outcome: &PassOutcome) -> Result<()> {
        let mut text = String::new();
        let _ = writeln!(text, "Optimal params: {:?}", outcome.best_params);
        let _ = writeln!(text, "Optimal value: {}", serde_json::to_string(&outcome.best_reward)?);
        let _ = writeln!(text, "Weights: {weights:?}\n");
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.results_path(weights))?;
        file.write_all(text.as_bytes())?;
        Ok(())
    }

    /// Clear what a pass leaves behind: score artifacts nobody consumed and
    /// every lock file, including locks orphaned by killed workers.
    pub fn cleanup_pass(&self, core_dumps: usize) {
        let scores = remove_matching(&self.score_dir, |name| {
            Path::new(name).extension().is_some_and(|ext| ext == "txt")
        });
        let locks = remove_matching(&self.work_dir, |name| name.ends_with(".lock"))
            + remove_matching(&self.score_dir, |name| name.ends_with(".lock"));
        info!(core_dumps, scores, locks, "pass cleanup done");
    }
}

fn weight_tag([a, b, c]: [f64; 3]) -> String {
    format!("{a:?}_{b:?}_{c:?}")
}
