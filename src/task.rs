//! Task and result records for a deployment test run.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default maximum time a deployment may run before it is considered hung
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(60 * 60);

/// Result category labels, as stored by the result sink
pub mod names {
    pub const ENTRY_EXISTS: &str = "Entry Exists";
    pub const TASK_AVAILABLE: &str = "Task Available";
    pub const TASK_COMPLETED: &str = "Task Completed";
    pub const REGISTRY_KEY_ADDED: &str = "Registry Key Added";
    pub const FILES_INSTALLED: &str = "Files Installed";
    pub const TEST_SUITE_ERROR: &str = "Test Suite Error";

    /// Prefix for per-executable results; the executable's file name follows
    pub const RAN_EXE_PREFIX: &str = "Ran EXE - ";
}

/// A single immutable test outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Category label (see [`names`])
    pub name: String,

    /// Whether the check passed
    pub passed: bool,

    /// Free-text detail, often empty
    pub message: String,
}

impl TaskResult {
    pub fn new(name: impl Into<String>, passed: bool, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed,
            message: message.into(),
        }
    }

    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, true, message)
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, false, message)
    }

    /// Outcome code as persisted (0 or 1)
    pub fn code(&self) -> u8 {
        u8::from(self.passed)
    }
}

/// A deployment package under test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Task identifier from the task source (unique within a run)
    pub id: String,

    /// Package display name
    pub name: String,

    /// Policy artifact bound by the policy matcher; `None` means not deployable
    pub command: Option<String>,

    /// Maximum allowed deployment duration
    pub max_duration: Duration,

    /// Results in production order
    pub results: Vec<TaskResult>,

    /// Frames captured during the deployment, in capture order
    pub frames: Vec<PathBuf>,

    /// Directory the frames were written to
    pub frame_dir: Option<PathBuf>,

    /// Measured deployment duration, set once the deployment completes
    pub elapsed: Option<Duration>,
}

/// Position in a task's append-only records, used to discard an abandoned attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptMark {
    results: usize,
    frames: usize,
}

impl Task {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            command: None,
            max_duration: DEFAULT_MAX_DURATION,
            results: Vec::new(),
            frames: Vec::new(),
            frame_dir: None,
            elapsed: None,
        }
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn is_deployable(&self) -> bool {
        self.command.is_some()
    }

    pub fn record(&mut self, result: TaskResult) {
        self.results.push(result);
    }

    /// Remember where the current attempt starts
    pub fn mark(&self) -> AttemptMark {
        AttemptMark {
            results: self.results.len(),
            frames: self.frames.len(),
        }
    }

    /// Drop everything recorded after `mark`
    ///
    /// Frame files already on disk are left alone; the next attempt overwrites
    /// them by index.
    pub fn rollback(&mut self, mark: AttemptMark) {
        self.results.truncate(mark.results);
        self.frames.truncate(mark.frames);
        self.elapsed = None;
    }

    pub fn passed_count(&self) -> usize {
        self.results.iter().filter(|r| r.passed).count()
    }

    pub fn failed_count(&self) -> usize {
        self.results.len() - self.passed_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_is_not_deployable() {
        let task = Task::new("1234", "7-Zip");
        assert!(!task.is_deployable());
        assert_eq!(task.max_duration, DEFAULT_MAX_DURATION);
        assert!(task.with_command("CP012340.xml").is_deployable());
    }

    #[test]
    fn test_rollback_discards_attempt() {
        let mut task = Task::new("1", "pkg");
        task.record(TaskResult::pass(names::ENTRY_EXISTS, ""));
        let mark = task.mark();
        task.record(TaskResult::pass(names::TASK_AVAILABLE, ""));
        task.frames.push(PathBuf::from("0.png"));
        task.elapsed = Some(Duration::from_secs(3));

        task.rollback(mark);
        assert_eq!(task.results.len(), 1);
        assert!(task.frames.is_empty());
        assert!(task.elapsed.is_none());
    }

    #[test]
    fn test_result_code() {
        assert_eq!(TaskResult::pass("a", "").code(), 1);
        assert_eq!(TaskResult::fail("a", "").code(), 0);
    }
}
