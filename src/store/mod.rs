//! Persistence seams: where tasks come from and where results go.
//!
//! - [`TaskSource`] lists the tasks assigned to a machine
//! - [`InventoryLookup`] answers software inventory questions per task
//! - [`ResultSink`] replaces a task's stored results
//!
//! [`SqliteStore`] implements all three. [`RecoveryFile`] is the plain-text
//! fallback used when the sink is unavailable.

pub mod recovery;
pub mod sqlite;

pub use recovery::RecoveryFile;
pub use sqlite::SqliteStore;

use serde::Serialize;
use thiserror::Error;

use crate::task::{Task, TaskResult};

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from the task, inventory and result stores
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// An executable the inventory expects a package to install
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateExe {
    /// Inventory file identifier
    pub file_id: String,

    /// Full guest path
    pub path: String,
}

/// One persisted result row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultRow {
    pub task_id: String,
    pub image: String,
    pub test_name: String,
    pub result: u8,
    pub message: String,
}

impl ResultRow {
    pub fn new(image: &str, task_id: &str, result: &TaskResult) -> Self {
        Self {
            task_id: task_id.to_string(),
            image: image.to_string(),
            test_name: result.name.clone(),
            result: result.code(),
            message: result.message.clone(),
        }
    }
}

/// Read-only list of the tasks assigned to a machine
pub trait TaskSource {
    /// Tasks in insertion order
    fn load_tasks(&self, machine_id: &str) -> StoreResult<Vec<Task>>;
}

/// Software inventory queries
pub trait InventoryLookup {
    /// Whether the inventory already knows this task's package
    fn entry_exists(&self, task_id: &str) -> StoreResult<bool>;

    /// Executables the package is expected to install
    fn candidate_executables(&self, task_id: &str) -> StoreResult<Vec<CandidateExe>>;
}

/// Destination for finished results
pub trait ResultSink {
    /// Replace every stored row for `(image, task_id)` with `results`
    fn replace_results(&mut self, image: &str, task_id: &str, results: &[TaskResult]) -> StoreResult<()>;

    /// Replace the rows of every task that recorded results.
    ///
    /// Tasks with no results were never attempted and keep their stored rows.
    fn replace_all(&mut self, image: &str, tasks: &[Task]) -> StoreResult<()> {
        for task in tasks.iter().filter(|task| !task.results.is_empty()) {
            self.replace_results(image, &task.id, &task.results)?;
        }
        Ok(())
    }
}
