//! Deploy Harness - regression testing of software deployment packages in a VM.
//!
//! This crate provides:
//! - A guest control abstraction with a `vmrun` adapter and a scripted guest
//! - Checkpoint snapshot management with re-login after every revert
//! - A per-task deployment state machine with timeout and retry handling
//! - Result persistence to SQLite with a plain-text recovery fallback
//! - GIF evidence compiled from screenshots taken during each deployment
//!
//! # Example
//!
//! ```rust,no_run
//! use deploy_harness::capture::GifEncoder;
//! use deploy_harness::config::Config;
//! use deploy_harness::guest::VmrunGuest;
//! use deploy_harness::orchestrator::{Orchestrator, OrchestratorSettings, RunIo};
//! use deploy_harness::poll::CancelToken;
//! use deploy_harness::store::SqliteStore;
//!
//! let config = Config::load(std::path::Path::new("harness.toml")).unwrap();
//! let tasks_db = SqliteStore::open(&config.database.tasks).unwrap();
//! let mut inventory = SqliteStore::open(&config.database.inventory).unwrap();
//!
//! let orchestrator = Orchestrator::new(OrchestratorSettings::from_config(&config), CancelToken::new());
//! let tasks = orchestrator.preflight(&tasks_db).unwrap();
//!
//! let mut guest = VmrunGuest::new(&config.guest.vmrun, &config.guest.vmx, config.host_connection());
//! let lookup = SqliteStore::open(&config.database.inventory).unwrap();
//! let io = RunIo {
//!     inventory: &lookup,
//!     sink: &mut inventory,
//!     encoder: &GifEncoder,
//! };
//! let summary = orchestrator.run(&mut guest, tasks, io).unwrap();
//! println!("{} passed, {} failed", summary.passed, summary.failed);
//! ```

pub mod capture;
pub mod config;
pub mod guest;
pub mod logging;
pub mod orchestrator;
pub mod policy;
pub mod poll;
pub mod results;
pub mod runner;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod task;

// Re-export the data model
pub use task::{Task, TaskResult};

// Re-export guest control
pub use guest::{Credentials, GuestControl, GuestError, GuestProcessTracker, ScriptedGuest, VmrunGuest};

// Re-export the run machinery
pub use orchestrator::{Orchestrator, OrchestratorError, OrchestratorSettings, RunIo, RunSummary};
pub use policy::PolicyMatcher;
pub use poll::{CancelToken, PollConfig, Poller};
pub use results::{ResultAggregator, select_frames};
pub use runner::{DeploymentRunner, RunContext, Transition};
pub use snapshot::{SnapshotError, SnapshotManager};

// Re-export persistence
pub use store::{InventoryLookup, RecoveryFile, ResultSink, SqliteStore, TaskSource};
