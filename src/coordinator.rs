//! Worker pool coordinator
//!
//! One long-running loop per run. Each tick it:
//!
//! 1. checks the completion sentinel, and on first sight cancels every role's
//!    jobs and stops submitting for good
//! 2. advances the [`AdmissionController`] and notifies the operator once per
//!    lock episode
//! 3. refreshes the scheduler job listing when due
//! 4. submits each role's deficit against its target while admission is open
//!
//! Errors inside a tick are logged and recorded in the event log; they never
//! end the loop.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionController, Transition};
use crate::config::{AdmissionConfig, Config};
use crate::notify::{NotificationKind, Notifier};
use crate::scheduler::{JobRow, Scheduler};

const EVENT_LOG_CAPACITY: usize = 256;

/// Timestamped coordinator event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Wall-clock time of the event
    pub at: DateTime<Utc>,
    /// Human-readable description
    pub message: String,
}

/// Pool reconciliation loop over a [`Scheduler`].
pub struct Coordinator<S, N> {
    settings: AdmissionConfig,
    owner: String,
    sentinel: PathBuf,
    scheduler: S,
    notifier: N,
    admission: AdmissionController,
    jobs: Vec<JobRow>,
    last_refresh: Option<Instant>,
    terminated: bool,
    events: VecDeque<Event>,
}

impl<S: Scheduler, N: Notifier> Coordinator<S, N> {
    /// Create a coordinator from the run configuration.
    #[must_use]
    pub fn new(config: &Config, scheduler: S, notifier: N, now: Instant) -> Self {
        let settings = config.admission.clone();
        let admission = AdmissionController::new(
            settings.total_target(),
            Duration::from_secs(settings.cooldown_secs),
            Duration::from_secs(settings.decay_interval_secs),
            now,
        );
        Self {
            owner: settings.owner(),
            settings,
            sentinel: config.sentinel_path(),
            scheduler,
            notifier,
            admission,
            jobs: Vec::new(),
            last_refresh: None,
            terminated: false,
            events: VecDeque::with_capacity(EVENT_LOG_CAPACITY),
        }
    }

    /// Whether the completion sentinel has been acted on.
    #[must_use]
    pub const fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Admission state machine.
    #[must_use]
    pub const fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Last known job listing.
    #[must_use]
    pub fn jobs(&self) -> &[JobRow] {
        &self.jobs
    }

    /// The scheduler this coordinator drives.
    #[must_use]
    pub const fn scheduler(&self) -> &S {
        &self.scheduler
    }

    /// Most recent `n` events, oldest first.
    #[must_use]
    pub fn recent_events(&self, n: usize) -> Vec<&Event> {
        let skip = self.events.len().saturating_sub(n);
        self.events.iter().skip(skip).collect()
    }

    fn log_event(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!(event = %message, "coordinator event");
        if self.events.len() == EVENT_LOG_CAPACITY {
            self.events.pop_front();
        }
        self.events.push_back(Event {
            at: Utc::now(),
            message,
        });
    }

    /// Run one coordinator iteration at time `now`.
    pub fn tick(&mut self, now: Instant) {
        if self.terminated {
            return;
        }
        if self.sentinel.exists() {
            self.terminate();
            return;
        }

        for transition in self.admission.tick(now) {
            match transition {
                Transition::Locked { counter } => {
                    self.log_event(format!(
                        "{counter} submissions exceed the limit of {}; locking job submission",
                        self.admission.threshold()
                    ));
                    if let Err(e) = self.notifier.enqueue(
                        "Job submission is locked",
                        "Job submission is locked due to too many job failures. \
                         Please check the status of the jobs.",
                        NotificationKind::Email,
                    ) {
                        error!(error = %e, "cannot queue lock notification");
                    }
                }
                Transition::Unlocked => self.log_event("job submission unlocked after cooldown"),
                Transition::Decayed { from, to } => {
                    debug!(from, to, "submission counter decayed");
                }
            }
        }

        let refresh_due = self.last_refresh.map_or(true, |at| {
            now.saturating_duration_since(at) >= Duration::from_secs(self.settings.scheduler_refresh_secs)
        });
        if refresh_due {
            self.refresh_jobs(now);
        }

        if self.reconcile() > 0 {
            self.refresh_jobs(now);
        }
    }

    fn refresh_jobs(&mut self, now: Instant) {
        match self.scheduler.list_jobs(&self.owner) {
            Ok(jobs) => {
                self.jobs = jobs;
                self.last_refresh = Some(now);
            }
            Err(e) => warn!(error = %e, "job listing failed, keeping previous listing"),
        }
    }

    /// Live job count per role name.
    #[must_use]
    pub fn live_counts(&self) -> FxHashMap<&str, u32> {
        let mut counts = FxHashMap::default();
        for job in &self.jobs {
            *counts.entry(job.name.as_str()).or_insert(0) += 1;
        }
        counts
    }

    /// Submit every role's deficit while admission allows. Returns the number
    /// of jobs submitted.
    fn reconcile(&mut self) -> usize {
        let deficits: Vec<(usize, u32)> = {
            let counts = self.live_counts();
            self.settings
                .roles
                .iter()
                .enumerate()
                .filter_map(|(i, role)| {
                    let live = counts.get(role.name.as_str()).copied().unwrap_or(0);
                    let deficit = role.target.saturating_sub(live);
                    (deficit > 0).then_some((i, deficit))
                })
                .collect()
        };

        let mut submitted = 0;
        'roles: for (index, deficit) in deficits {
            let role = self.settings.roles[index].clone();
            for remaining in (0..deficit).rev() {
                if !self.admission.try_admit() {
                    debug!(role = %role.name, "submission locked, deficit left for later");
                    break 'roles;
                }
                match self.scheduler.submit_job(&role) {
                    Ok(()) => {
                        submitted += 1;
                        self.log_event(format!("submitted a {} job, {remaining} left", role.name));
                    }
                    Err(e) => {
                        error!(role = %role.name, error = %e, "job submission failed");
                        self.log_event(format!("submission of a {} job failed: {e}", role.name));
                        continue 'roles;
                    }
                }
            }
        }
        submitted
    }

    fn terminate(&mut self) {
        self.log_event("optimization completed, terminating all jobs");
        let roles: Vec<String> = self.settings.roles.iter().map(|r| r.name.clone()).collect();
        for name in roles {
            match self.scheduler.cancel_jobs_by_name(&self.owner, &name) {
                Ok(n) => debug!(role = %name, cancelled = n, "role terminated"),
                Err(e) => {
                    error!(role = %name, error = %e, "cancelling jobs failed");
                    self.log_event(format!("cancelling {name} jobs failed: {e}"));
                }
            }
        }
        self.terminated = true;
        self.log_event("all jobs terminated");
    }

    /// Tick every `admission.tick_ms` until `stop` is set.
    pub fn run(&mut self, stop: &AtomicBool) {
        let period = Duration::from_millis(self.settings.tick_ms);
        info!(owner = %self.owner, pool = self.settings.total_target(), "coordinator started");
        while !stop.load(Ordering::Relaxed) {
            self.tick(Instant::now());
            std::thread::sleep(period);
        }
        info!("coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoleConfig;
    use crate::notify::RecordingNotifier;
    use crate::Result;

    #[derive(Default)]
    struct FakeScheduler {
        live: Vec<JobRow>,
        submitted: Vec<String>,
        next_id: u32,
    }

    impl Scheduler for FakeScheduler {
        fn submit_job(&mut self, role: &RoleConfig) -> Result<()> {
            self.next_id += 1;
            self.submitted.push(role.name.clone());
            self.live.push(JobRow {
                id: self.next_id.to_string(),
                name: role.name.clone(),
                state: "PENDING".to_string(),
            });
            Ok(())
        }

        fn list_jobs(&mut self, _owner: &str) -> Result<Vec<JobRow>> {
            Ok(self.live.clone())
        }

        fn cancel_jobs_by_name(&mut self, _owner: &str, name: &str) -> Result<usize> {
            let before = self.live.len();
            self.live.retain(|j| j.name != name);
            Ok(before - self.live.len())
        }
    }

    fn config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.workspace.work_dir = dir.to_path_buf();
        config.admission.owner = Some("tester".to_string());
        config.admission.roles = vec![
            RoleConfig::new("layout_generator", 2, "gen.sh"),
            RoleConfig::new("layout_evaluator", 1, "eval.sh"),
        ];
        config
    }

    #[test]
    fn test_fills_pool_to_target() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = RecordingNotifier::new();
        let mut c = Coordinator::new(&config(dir.path()), FakeScheduler::default(), &notifier, Instant::now());

        c.tick(Instant::now());
        assert_eq!(c.scheduler().submitted.len(), 3);
        assert_eq!(c.admission().counter(), 3);

        c.tick(Instant::now());
        assert_eq!(c.scheduler().submitted.len(), 3);
        assert_eq!(c.live_counts().get("layout_generator"), Some(&2));
    }

    #[test]
    fn test_event_log_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = Coordinator::new(
            &config(dir.path()),
            FakeScheduler::default(),
            RecordingNotifier::new(),
            Instant::now(),
        );
        for i in 0..(EVENT_LOG_CAPACITY + 10) {
            c.log_event(format!("event {i}"));
        }
        assert_eq!(c.events.len(), EVENT_LOG_CAPACITY);
        let last = c.recent_events(1);
        assert_eq!(last[0].message, format!("event {}", EVENT_LOG_CAPACITY + 9));
    }
}
