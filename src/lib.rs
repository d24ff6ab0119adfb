//! # GraphOptima: distributed layout-parameter optimization
//!
//! Coordination layer for a parameter sweep whose evaluations run in
//! independently scheduled cluster jobs that share nothing but a filesystem.
//! An optimizer proposes parameter vectors; generator workers turn a vector
//! into a graph layout; evaluator workers turn the layout into readability
//! metrics; the orchestrator derives a reward and hands it back.
//!
//! ## Design Principles
//!
//! - **No broker**: every hop is an atomic-publish / lock-claim / retire
//!   handshake over named files ([`queue`])
//! - **Append-only history**: one SQLite row per evaluation ([`store`])
//! - **Reuse before recompute**: similar vectors reuse cached raw metrics,
//!   re-scored under the current weights ([`cache`])
//! - **Backpressure**: a counter-and-cooldown breaker stops crash-looping
//!   jobs from flooding the cluster ([`admission`], [`coordinator`])
//! - **Never stall the optimizer**: failures degrade to a penalty reward
//!   ([`orchestrator`])
//!
//! ## Example
//!
//! ```rust,no_run
//! use graphoptima::config::Config;
//! use graphoptima::notify::FileRelay;
//! use graphoptima::orchestrator::Orchestrator;
//!
//! let config = Config::load("config.json")?;
//! let relay = FileRelay::new(config.instruction_dir());
//! let mut orchestrator = Orchestrator::from_config(&config, relay)?;
//!
//! // Blocks until a generator and an evaluator worker have handled the unit
//! let reward = orchestrator.evaluate(&[1.0, 2.0, 50.0])?;
//! println!("reward: {reward:?}");
//! # Ok::<(), graphoptima::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod admission;
pub mod artifact;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod notify;
pub mod orchestrator;
pub mod queue;
pub mod reward;
pub mod scheduler;
pub mod stage;
pub mod store;
pub mod sweep;

pub use error::{Error, Result};
