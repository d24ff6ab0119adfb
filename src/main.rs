//! GraphOptima CLI.
//!
//! One subcommand per process role. Every role reads the same `config.json`
//! and talks to the others only through the shared working directory.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use graphoptima::artifact::decode_params;
use graphoptima::config::Config;
use graphoptima::coordinator::Coordinator;
use graphoptima::notify::{FileRelay, NotificationKind};
use graphoptima::orchestrator::Orchestrator;
use graphoptima::reward::{weight_grid, Reward, OBJECTIVE_COUNT};
use graphoptima::scheduler::SlurmScheduler;
use graphoptima::stage::{CommandTransform, StageWorker};
use graphoptima::store::ResultStore;
use graphoptima::sweep::{PassOutcome, Sweep};

/// Never set: worker roles run until the cluster scheduler kills them.
static STOP: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "graphoptima")]
#[command(about = "Distributed graph layout parameter optimization")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(long, short, env = "GRAPHOPTIMA_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// Enable verbose output
    #[arg(long, short)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Keep the worker pool at its targets and watch for completion.
    Coordinate,

    /// Run a layout generator worker (params to layout).
    Generate,

    /// Run a layout evaluator worker (layout to score).
    Evaluate,

    /// Deliver queued operator notifications.
    Relay {
        /// Drain once and exit
        #[arg(long)]
        once: bool,
    },

    /// Print the most recent evaluations.
    Show {
        /// Read the global store instead of the run store
        #[arg(long)]
        global: bool,
        /// Number of rows (defaults to `store.printout_lines`)
        #[arg(short = 'n', long)]
        lines: Option<usize>,
        /// Keep reprinting, reopening the store each time
        #[arg(long)]
        watch: bool,
        /// Seconds between refreshes in watch mode
        #[arg(long, default_value_t = 5)]
        interval: u64,
    },

    /// Evaluate one parameter vector through the pipeline.
    Probe {
        /// Comma-separated parameter vector
        #[arg(short, long)]
        params: String,
    },

    /// Scalarization sweep over a fixed candidate list.
    Sweep {
        /// File with one comma-separated parameter vector per line
        #[arg(long)]
        candidates: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        info!(config = %cli.config.display(), "no configuration file, using defaults");
        Config::default()
    };

    match cli.command {
        Commands::Coordinate => {
            let relay = FileRelay::new(config.instruction_dir());
            let mut coordinator = Coordinator::new(&config, SlurmScheduler::new(), relay, Instant::now());
            coordinator.run(&STOP);
        }

        Commands::Generate => {
            let transform = CommandTransform::new("layout_generator", &config.generator);
            StageWorker::generator(&config, transform).run_until(&STOP)?;
        }

        Commands::Evaluate => {
            let transform = CommandTransform::new("layout_evaluator", &config.evaluator);
            StageWorker::evaluator(&config, transform).run_until(&STOP)?;
        }

        Commands::Relay { once } => {
            let relay = FileRelay::new(config.instruction_dir());
            loop {
                let delivered = relay.drain(NotificationKind::Email, |n| {
                    info!(subject = %n.subject, body = %n.body, "notification");
                    Ok(())
                })?;
                if once {
                    println!("{delivered} notification(s) delivered");
                    break;
                }
                std::thread::sleep(config.queue.poll_interval());
            }
        }

        Commands::Show {
            global,
            lines,
            watch,
            interval,
        } => {
            let path = if global {
                config.global_store_path()
            } else {
                config.run_store_path()
            };
            let lines = lines.unwrap_or(config.store.printout_lines);
            if !watch {
                let store = ResultStore::open_existing(&path)
                    .with_context(|| format!("opening {}", path.display()))?;
                print_tail(&store, lines)?;
                return Ok(());
            }
            // Archiving moves the file away between passes, so reopen every time.
            while !STOP.load(Ordering::Relaxed) {
                match ResultStore::open_existing(&path) {
                    Ok(store) => print_tail(&store, lines)?,
                    Err(e) => warn!(store = %path.display(), error = %e, "store not readable yet"),
                }
                std::thread::sleep(Duration::from_secs(interval));
            }
        }

        Commands::Probe { params } => {
            let params = decode_params(&params)?;
            let relay = FileRelay::new(config.instruction_dir());
            let mut orchestrator = Orchestrator::from_config(&config, relay)?;
            let evaluation = orchestrator.evaluate_detailed(&params)?;
            println!("source:  {:?}", evaluation.source);
            println!("metrics: {:?}", evaluation.raw_metrics);
            println!("reward:  {}", serde_json::to_string(&evaluation.reward)?);
        }

        Commands::Sweep { candidates } => {
            let text = std::fs::read_to_string(&candidates)
                .with_context(|| format!("reading {}", candidates.display()))?;
            let candidates = text
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(decode_params)
                .collect::<graphoptima::Result<Vec<_>>>()?;
            if candidates.is_empty() {
                bail!("no candidate parameter vectors");
            }

            let relay = FileRelay::new(config.instruction_dir());
            let mut orchestrator = Orchestrator::from_config(&config, relay)?;
            let grid = weight_grid(OBJECTIVE_COUNT, config.optimizer.scalarization_granularity);
            let reports = Sweep::from_config(&config).run(&mut orchestrator, &grid, |orchestrator| {
                let mut best: Option<PassOutcome> = None;
                for params in &candidates {
                    let reward = orchestrator.evaluate(params)?;
                    if best.as_ref().map_or(true, |b| total(&reward) < total(&b.best_reward)) {
                        best = Some(PassOutcome {
                            best_params: params.clone(),
                            best_reward: reward,
                        });
                    }
                }
                best.ok_or_else(|| graphoptima::Error::InvalidInput("no candidates".into()))
            })?;
            for report in reports {
                println!("{report:?}");
            }
        }
    }

    Ok(())
}

fn total(reward: &Reward) -> f64 {
    reward.to_vec().iter().sum()
}

fn print_tail(store: &ResultStore, lines: usize) -> Result<()> {
    let rows = store.tail(lines)?;
    println!("{:>6} | {:<28} | {:<24} | metrics", "seq", "params", "reward");
    println!("{}", "-".repeat(80));
    for row in rows {
        println!(
            "{:>6} | {:<28} | {:<24} | {:?}",
            row.sequence(),
            format!("{:?}", row.params()),
            serde_json::to_string(row.reward())?,
            row.raw_metrics()
        );
    }
    Ok(())
}
