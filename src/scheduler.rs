//! Cluster scheduler seam
//!
//! The coordinator only needs three operations from the cluster: submit a job
//! for a role, list the owner's live jobs, and cancel every job of a role.
//! [`SlurmScheduler`] drives the Slurm command-line tools; tests substitute an
//! in-memory implementation.

use std::process::Command;

use tracing::{debug, info};

use crate::config::RoleConfig;
use crate::{Error, Result};

/// One row of the owner's job listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRow {
    /// Scheduler job id
    pub id: String,
    /// Job name (the role name)
    pub name: String,
    /// Scheduler state, e.g. `RUNNING` or `PENDING`
    pub state: String,
}

/// Opaque cluster scheduler API.
pub trait Scheduler {
    /// Submit one job for `role`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Scheduler`] if the submission is rejected.
    fn submit_job(&mut self, role: &RoleConfig) -> Result<()>;

    /// List live jobs owned by `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Scheduler`] if the listing cannot be obtained.
    fn list_jobs(&mut self, owner: &str) -> Result<Vec<JobRow>>;

    /// Cancel every live job named `name`, returning how many were cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Scheduler`] if the listing or a cancellation fails.
    fn cancel_jobs_by_name(&mut self, owner: &str, name: &str) -> Result<usize>;
}

/// Slurm adapter over `sbatch`, `squeue` and `scancel`.
#[derive(Debug, Clone, Default)]
pub struct SlurmScheduler;

impl SlurmScheduler {
    /// Create the adapter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn run(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| Error::Scheduler(format!("cannot run {program}: {e}")))?;
    if !output.status.success() {
        return Err(Error::Scheduler(format!(
            "{program} {} exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `squeue -o %i,%j,%T` output. The header line and malformed rows are
/// skipped.
#[must_use]
pub fn parse_squeue(output: &str) -> Vec<JobRow> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            match fields.as_slice() {
                [id, name, state] if !id.is_empty() => Some(JobRow {
                    id: (*id).to_string(),
                    name: (*name).to_string(),
                    state: (*state).to_string(),
                }),
                _ => None,
            }
        })
        .collect()
}

impl Scheduler for SlurmScheduler {
    fn submit_job(&mut self, role: &RoleConfig) -> Result<()> {
        let out = run("sbatch", &[role.script.as_str()])?;
        info!(role = %role.name, response = out.trim(), "job submitted");
        Ok(())
    }

    fn list_jobs(&mut self, owner: &str) -> Result<Vec<JobRow>> {
        let out = run("squeue", &["-u", owner, "-o", "%i,%j,%T"])?;
        let jobs = parse_squeue(&out);
        debug!(owner, jobs = jobs.len(), "job listing refreshed");
        Ok(jobs)
    }

    fn cancel_jobs_by_name(&mut self, owner: &str, name: &str) -> Result<usize> {
        let mut cancelled = 0;
        for job in self.list_jobs(owner)?.into_iter().filter(|j| j.name == name) {
            run("scancel", &[job.id.as_str()])?;
            cancelled += 1;
        }
        info!(role = name, cancelled, "jobs cancelled");
        Ok(cancelled)
    }
}
