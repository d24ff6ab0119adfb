//! Pipeline stages
//!
//! A stage is two [`WorkQueue`]s and a transformation between them: params to
//! layout, then layout to score. Each worker polls its input queue, claims what
//! it can, publishes the transformed artifact under the same identifier and
//! retires the input.
//!
//! A failed transformation still publishes an empty artifact downstream. The
//! orchestrator then sees malformed metrics for that identifier and applies its
//! own retry policy, instead of waiting forever for a score that never comes.

use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::artifact::{read_text, LAYOUT_SUFFIX, PARAMS_SUFFIX, SCORE_SUFFIX};
use crate::config::{CommandConfig, Config};
use crate::queue::WorkQueue;
use crate::{Error, Result};

/// Transformation from one stage's artifact to the next.
pub trait StageTransform {
    /// Stage name for logs and errors.
    fn name(&self) -> &str;

    /// Produce the next artifact for unit `id` from the claimed `input` file.
    ///
    /// # Errors
    ///
    /// Returns an error if the artifact cannot be produced.
    fn transform(&mut self, id: &str, input: &Path) -> Result<Vec<u8>>;
}

/// Runs an external program; its stdout is the next artifact.
///
/// `{input}` in any argument expands to the claimed file path and `{id}` to
/// the unit identifier.
#[derive(Debug, Clone)]
pub struct CommandTransform {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CommandTransform {
    /// Create a transform running `command`.
    #[must_use]
    pub fn new(name: impl Into<String>, command: &CommandConfig) -> Self {
        Self {
            name: name.into(),
            program: command.program.clone(),
            args: command.args.clone(),
        }
    }

    /// Arguments after placeholder expansion.
    #[must_use]
    pub fn expand_args(&self, id: &str, input: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace("{input}", &input).replace("{id}", id))
            .collect()
    }
}

impl StageTransform for CommandTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn transform(&mut self, id: &str, input: &Path) -> Result<Vec<u8>> {
        let args = self.expand_args(id, input);
        debug!(stage = %self.name, program = %self.program, ?args, "running stage command");
        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|e| Error::Stage {
                stage: self.name.clone(),
                reason: format!("cannot run {}: {e}", self.program),
            })?;
        if !output.status.success() {
            return Err(Error::Stage {
                stage: self.name.clone(),
                reason: format!(
                    "{} exited with {}: {}",
                    self.program,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(output.stdout)
    }
}

/// In-process transform over artifact text.
pub struct FnTransform<F> {
    name: String,
    f: F,
}

impl<F> FnTransform<F>
where
    F: FnMut(&str, &str) -> Result<String>,
{
    /// Wrap `f(id, input_text) -> output_text` as a stage transform.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> StageTransform for FnTransform<F>
where
    F: FnMut(&str, &str) -> Result<String>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn transform(&mut self, id: &str, input: &Path) -> Result<Vec<u8>> {
        let text = read_text(input)?;
        (self.f)(id, &text).map(String::into_bytes)
    }
}

/// Poll-claim-transform-publish-retire loop of one stage.
pub struct StageWorker<T> {
    input: WorkQueue,
    output: WorkQueue,
    transform: T,
    poll_interval: Duration,
}

impl<T: StageTransform> StageWorker<T> {
    /// Create a worker moving units from `input` to `output`.
    pub const fn new(input: WorkQueue, output: WorkQueue, transform: T, poll_interval: Duration) -> Self {
        Self {
            input,
            output,
            transform,
            poll_interval,
        }
    }

    /// Params to layout stage of the configured workspace.
    pub fn generator(config: &Config, transform: T) -> Self {
        let lease = config.queue.lock_lease();
        let dir = &config.workspace.work_dir;
        Self::new(
            WorkQueue::new(dir, PARAMS_SUFFIX).with_lease(lease),
            WorkQueue::new(dir, LAYOUT_SUFFIX).with_lease(lease),
            transform,
            config.queue.poll_interval(),
        )
    }

    /// Layout to score stage of the configured workspace.
    pub fn evaluator(config: &Config, transform: T) -> Self {
        let lease = config.queue.lock_lease();
        Self::new(
            WorkQueue::new(&config.workspace.work_dir, LAYOUT_SUFFIX).with_lease(lease),
            WorkQueue::new(config.score_dir(), SCORE_SUFFIX).with_lease(lease),
            transform,
            config.queue.poll_interval(),
        )
    }

    /// Input queue.
    pub const fn input(&self) -> &WorkQueue {
        &self.input
    }

    /// Output queue.
    pub const fn output(&self) -> &WorkQueue {
        &self.output
    }

    /// Process every claimable unit once, in lexical order. Returns the
    /// number of units retired.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the input cannot be scanned or an output cannot
    /// be published. Transformation failures are not errors here.
    pub fn run_once(&mut self) -> Result<usize> {
        let mut retired = 0;
        for id in self.input.scan()? {
            let Some(claim) = self.input.claim(&id)? else {
                continue;
            };
            let artifact = match self.transform.transform(&id, claim.path()) {
                Ok(artifact) => artifact,
                Err(e) => {
                    warn!(stage = self.transform.name(), id = %id, error = %e, "transform failed, publishing empty artifact");
                    Vec::new()
                }
            };
            self.output.publish(&id, &artifact)?;
            claim.retire()?;
            debug!(stage = self.transform.name(), id = %id, "unit handed downstream");
            retired += 1;
        }
        Ok(retired)
    }

    /// Poll until `stop` is set. Errors are logged and the loop continues.
    ///
    /// # Errors
    ///
    /// Returns an IO error only if the output directory cannot be created.
    pub fn run_until(&mut self, stop: &AtomicBool) -> Result<()> {
        std::fs::create_dir_all(self.output.dir())?;
        info!(
            stage = self.transform.name(),
            input = %self.input.dir().display(),
            output = %self.output.dir().display(),
            "stage worker started"
        );
        while !stop.load(Ordering::Relaxed) {
            match self.run_once() {
                Ok(0) => std::thread::sleep(self.poll_interval),
                Ok(n) => debug!(stage = self.transform.name(), units = n, "scan complete"),
                Err(e) => {
                    error!(stage = self.transform.name(), error = %e, "stage iteration failed");
                    std::thread::sleep(self.poll_interval);
                }
            }
        }
        info!(stage = self.transform.name(), "stage worker stopped");
        Ok(())
    }
}
