//! End-to-end evaluation through simulated pipeline workers
//!
//! Generator and evaluator workers run on threads with in-process transforms,
//! exchanging real files with the orchestrator in a scratch workspace.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use graphoptima::config::Config;
use graphoptima::notify::RecordingNotifier;
use graphoptima::orchestrator::{Orchestrator, Source};
use graphoptima::reward::{penalty_metrics, Reward, Weights, PENALTY};
use graphoptima::stage::{FnTransform, StageWorker};
use graphoptima::store::{ResultRecord, ResultStore};
use graphoptima::sweep::{PassOutcome, PassReport, Sweep};
use graphoptima::Result;

const SCORE: &str = "Computing metrics for layout done: 0.8 3 0.1 0.05 0.9 0.4 0.6";

fn workspace(dir: &Path) -> Config {
    let mut config = Config::default();
    config.workspace.work_dir = dir.join("work");
    config.store.run_store_path = dir.join("optimization.db");
    config.store.global_store_path = dir.join("global_optimization.db");
    config.queue.poll_interval_ms = 1;
    config.optimizer.max_derivation_retries = 1;
    std::fs::create_dir_all(config.score_dir()).unwrap();
    config
}

/// Generator and evaluator worker threads, stopped on drop.
struct Pipeline {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Pipeline {
    fn start<F>(config: &Config, score: F) -> Self
    where
        F: FnMut(&str, &str) -> Result<String> + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));

        let generator_stop = Arc::clone(&stop);
        let generator_config = config.clone();
        let generator = std::thread::spawn(move || {
            let transform = FnTransform::new("layout_generator", |id: &str, params: &str| {
                Ok(format!("graph \"{id}\" {{ /* {params} */ }}"))
            });
            StageWorker::generator(&generator_config, transform)
                .run_until(&generator_stop)
                .unwrap();
        });

        let evaluator_stop = Arc::clone(&stop);
        let evaluator_config = config.clone();
        let evaluator = std::thread::spawn(move || {
            let transform = FnTransform::new("layout_evaluator", score);
            StageWorker::evaluator(&evaluator_config, transform)
                .run_until(&evaluator_stop)
                .unwrap();
        });

        Self {
            stop,
            handles: vec![generator, evaluator],
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn fixed_score(_: &str, _: &str) -> Result<String> {
    Ok(SCORE.to_string())
}

fn assert_close(reward: &Reward, expected: f64) {
    let value = reward.as_scalar().expect("scalar reward");
    assert!((value - expected).abs() < 1e-12, "{value} != {expected}");
}

#[test]
fn test_end_to_end_scalar_reward_and_persistence() {
    let dir = tempfile::tempdir().unwrap();
    let config = workspace(dir.path());
    let _pipeline = Pipeline::start(&config, fixed_score);
    let mut orchestrator = Orchestrator::from_config(&config, RecordingNotifier::new()).unwrap();

    let evaluation = orchestrator.evaluate_detailed(&[1.0, 2.0, 50.0]).unwrap();
    assert_eq!(evaluation.source, Source::Pipeline);
    assert_close(&evaluation.reward, 0.2);

    for store in [orchestrator.run_store(), orchestrator.global_store()] {
        let rows = store.read_all().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sequence(), 1);
        assert_eq!(rows[0].params(), &[1.0, 2.0, 50.0]);
        assert_eq!(rows[0].raw_metrics(), &[0.8, 3.0, 0.1, 0.05, 0.9, 0.4, 0.6]);
        assert_eq!(rows[0].metadata().readability_calculation_weight_list[0], 1.0);
    }

    // The score was consumed along with its lock.
    assert_eq!(std::fs::read_dir(config.score_dir()).unwrap().count(), 0);
}

#[test]
fn test_cache_hit_rederives_under_new_weights() {
    let dir = tempfile::tempdir().unwrap();
    let config = workspace(dir.path());
    let _pipeline = Pipeline::start(&config, fixed_score);
    let mut orchestrator = Orchestrator::from_config(&config, RecordingNotifier::new()).unwrap();

    orchestrator.evaluate(&[1.0, 2.0, 50.0]).unwrap();

    orchestrator.begin_pass(Weights::scalarized(0.0, 0.0, 1.0));
    let evaluation = orchestrator.evaluate_detailed(&[1.0, 2.0, 50.0]).unwrap();
    assert_eq!(evaluation.source, Source::Cache);
    assert_close(&evaluation.reward, 1.0 - 0.9);

    // Hits advance the counter but write nothing.
    assert_eq!(orchestrator.state().evaluations, 1);
    assert_eq!(orchestrator.global_store().len().unwrap(), 1);
}

#[test]
fn test_multi_objective_reward() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = workspace(dir.path());
    config.optimizer.single_objective = false;
    let _pipeline = Pipeline::start(&config, fixed_score);
    let mut orchestrator = Orchestrator::from_config(&config, RecordingNotifier::new()).unwrap();

    let values = orchestrator.evaluate(&[1.0, 2.0, 50.0]).unwrap().to_vec();
    let expected = [0.2, 0.05, 0.1];
    assert_eq!(values.len(), 3);
    for (v, e) in values.iter().zip(expected) {
        assert!((v - e).abs() < 1e-12);
    }
}

#[test]
fn test_publish_retry_exhaustion_returns_penalty() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    // Work directory never created: every publish attempt fails.
    config.workspace.work_dir = dir.path().join("missing");
    config.store.run_store_path = dir.path().join("optimization.db");
    config.store.global_store_path = dir.path().join("global_optimization.db");
    config.optimizer.max_publish_retries = 2;
    let notifier = RecordingNotifier::new();
    let mut orchestrator = Orchestrator::from_config(&config, &notifier).unwrap();

    let evaluation = orchestrator.evaluate_detailed(&[1.0, 2.0, 50.0]).unwrap();
    assert_eq!(evaluation.source, Source::Penalty);
    assert_eq!(evaluation.reward, Reward::Scalar(PENALTY));

    let rows = orchestrator.run_store().read_all().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].raw_metrics(), penalty_metrics().as_slice());
    assert_eq!(orchestrator.global_store().len().unwrap(), 1);

    // First attempt plus two retries.
    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].body.contains("too many (3) errors"), "{}", sent[0].body);
}

#[test]
fn test_malformed_metrics_recover_on_retry() {
    let dir = tempfile::tempdir().unwrap();
    let config = workspace(dir.path());
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let _pipeline = Pipeline::start(&config, move |_: &str, _: &str| {
        if seen.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok("Segmentation fault (core dumped) while computing 0.8".to_string())
        } else {
            Ok(SCORE.to_string())
        }
    });
    let mut orchestrator = Orchestrator::from_config(&config, RecordingNotifier::new()).unwrap();

    let reward = orchestrator.evaluate(&[1.0, 2.0, 50.0]).unwrap();
    assert_close(&reward, 0.2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let state = orchestrator.state();
    assert_eq!(state.evaluations, 1);
    assert!(!state.recovering);
    assert_eq!(orchestrator.run_store().read_all().unwrap()[0].sequence(), 1);
}

#[test]
fn test_persistently_malformed_metrics_degrade_to_penalty() {
    let dir = tempfile::tempdir().unwrap();
    let config = workspace(dir.path());
    let _pipeline = Pipeline::start(&config, |_: &str, _: &str| -> Result<String> {
        Err(graphoptima::Error::InvalidInput("metric tool crashed".into()))
    });
    let notifier = RecordingNotifier::new();
    let mut orchestrator = Orchestrator::from_config(&config, &notifier).unwrap();

    let evaluation = orchestrator.evaluate_detailed(&[1.0, 2.0, 50.0]).unwrap();
    assert_eq!(evaluation.source, Source::Penalty);
    assert_eq!(evaluation.reward, Reward::Scalar(PENALTY));
    assert_eq!(orchestrator.state().evaluations, 1);
    assert_eq!(notifier.sent().len(), 1);

    // Penalty rows are persisted but never served from the cache.
    assert_eq!(orchestrator.global_store().len().unwrap(), 1);
}

#[test]
fn test_sequence_substitution_reuses_stored_row() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = workspace(dir.path());
    config.cache.enabled = false;
    config.optimizer.sequence_substitution = true;
    {
        let store = ResultStore::open(config.run_store_path()).unwrap();
        store
            .append(&ResultRecord::new(
                1,
                vec![9.0, 9.0, 9.0],
                vec![0.5, 1.0, 0.2, 0.3, 0.6, 0.1, 0.1],
                Reward::Scalar(0.5),
            ))
            .unwrap();
    }
    let mut orchestrator = Orchestrator::from_config(&config, RecordingNotifier::new()).unwrap();

    let evaluation = orchestrator.evaluate_detailed(&[1.0, 2.0, 50.0]).unwrap();
    assert_eq!(evaluation.source, Source::Sequence);
    assert_close(&evaluation.reward, 0.5);
    assert_eq!(orchestrator.state().evaluations, 1);
}

#[test]
fn test_sweep_archives_each_pass_and_skips_on_rerun() {
    let dir = tempfile::tempdir().unwrap();
    let config = workspace(dir.path());
    let _pipeline = Pipeline::start(&config, fixed_score);
    let mut orchestrator = Orchestrator::from_config(&config, RecordingNotifier::new()).unwrap();
    let sweep = Sweep::from_config(&config);
    let groups = vec![vec![1.0, 0.0, 0.0], vec![0.0, 0.0, 1.0]];

    let optimize = |o: &mut Orchestrator<RecordingNotifier>| -> Result<PassOutcome> {
        let params = vec![1.0, 2.0, 50.0];
        let best_reward = o.evaluate(&params)?;
        Ok(PassOutcome {
            best_params: params,
            best_reward,
        })
    };

    let reports = sweep.run(&mut orchestrator, &groups, optimize).unwrap();
    assert_eq!(reports.len(), 2);
    match &reports[1] {
        PassReport::Completed { outcome, .. } => {
            let value = outcome.best_reward.as_scalar().unwrap();
            assert!((value - 0.1).abs() < 1e-12);
        }
        other => panic!("unexpected report {other:?}"),
    }

    let first = ResultStore::open(sweep.archive_path([1.0, 0.0, 0.0])).unwrap();
    assert_eq!(first.len().unwrap(), 1);
    assert!(sweep.archive_path([0.0, 0.0, 1.0]).exists());
    assert!(sweep.results_path([1.0, 0.0, 0.0]).exists());
    assert!(config.sentinel_path().exists());

    let reports = sweep.run(&mut orchestrator, &groups, optimize).unwrap();
    assert!(reports.iter().all(|r| matches!(r, PassReport::Skipped { .. })));
}
