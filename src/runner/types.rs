//! Types shared by the deployment runner and the loop that drives it.

use std::time::Duration;

use thiserror::Error;

use crate::capture::CaptureError;
use crate::guest::tracker::TrackError;
use crate::guest::{GuestControl, GuestError, GuestProcessTracker};
use crate::poll::{CancelToken, PollConfig, PollError};
use crate::session::RunLayout;
use crate::snapshot::{SnapshotError, SnapshotManager};
use crate::store::StoreError;

/// Where a task is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Querying,
    Deploying,
    Completed,
    TimedOut,
    Errored,
    Recorded,
}

/// How a single attempt ended, when it did not fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// No policy artifact was bound to the task
    NotDeployable,

    /// The deployment process exited on its own
    Completed(Duration),

    /// The deployment ran past the task's maximum duration
    TimedOut(Duration),
}

/// What the loop driver does next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Move on to the next task
    Continue,

    /// Run the same task again from the beginning
    Retry,

    /// Stop the run
    Abort(String),
}

/// A fault during a single task attempt
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("inventory lookup failed: {0}")]
    Inventory(#[from] StoreError),

    #[error(transparent)]
    Guest(#[from] GuestError),

    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("launcher exited before {0} started")]
    LaunchFailed(String),

    #[error("cancelled")]
    Cancelled,
}

impl From<TrackError> for RunnerError {
    fn from(err: TrackError) -> Self {
        match err {
            TrackError::Guest(err) => RunnerError::Guest(err),
            TrackError::Poll(PollError::Cancelled) => RunnerError::Cancelled,
            TrackError::Poll(err @ PollError::TimedOut(_)) => {
                RunnerError::Guest(GuestError::command("poll", err.to_string()))
            }
        }
    }
}

/// Knobs for one deployment attempt
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Run directory holding one subdirectory per task
    pub layout: RunLayout,

    /// Guest path of the deployment client
    pub deploy_client: String,

    /// Guest directory holding helper executables and scratch files
    pub helper_dir: String,

    /// Guest path of the registry tool
    pub reg_exe: String,

    /// Registry key whose export length is the fact count
    pub fact_key: String,

    /// Guest path of PowerShell, used to close leftover windows
    pub powershell: String,

    /// Processes closed after a deployment completes
    pub dialog_processes: Vec<String>,

    /// Processes closed after each executable probe
    pub leftover_processes: Vec<String>,

    /// Time between screenshots while a deployment runs
    pub capture_interval: Duration,

    /// Completed tasks per snapshot before a proactive revert
    pub tests_per_snapshot: u32,

    /// How long a launched executable is watched
    pub exe_wait: Duration,

    /// Deadline for best-effort process cleanup
    pub cleanup_wait: Duration,

    /// Spacing of liveness checks
    pub liveness_poll: PollConfig,
}

/// Mutable run state threaded through every attempt
pub struct RunContext<'a> {
    pub guest: &'a mut dyn GuestControl,
    pub snapshots: SnapshotManager,
    pub tracker: GuestProcessTracker,

    /// Tasks completed since the last revert
    pub run_counter: u32,

    pub cancel: CancelToken,
}

impl<'a> RunContext<'a> {
    pub fn new(
        guest: &'a mut dyn GuestControl,
        snapshots: SnapshotManager,
        tracker: GuestProcessTracker,
        cancel: CancelToken,
    ) -> Self {
        Self {
            guest,
            snapshots,
            tracker,
            run_counter: 0,
            cancel,
        }
    }

    /// Revert to the checkpoint and log back in; resets the run counter
    pub fn revert(&mut self) -> Result<(), SnapshotError> {
        self.snapshots
            .revert_and_relogin(&mut *self.guest, &self.tracker, &self.cancel)?;
        self.run_counter = 0;
        Ok(())
    }
}
