//! The run loop: pre-flight, guest preparation, per-task iteration, hand-off.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::capture::{EncodeSettings, ImageEncoder};
use crate::config::Config;
use crate::guest::{GuestControl, GuestError, GuestProcessTracker};
use crate::policy::{MatchReport, PolicyMatcher};
use crate::poll::{CancelToken, PollConfig};
use crate::results::ResultAggregator;
use crate::runner::{DeploymentRunner, RunContext, RunnerSettings, Transition};
use crate::session::RunLayout;
use crate::snapshot::{LoginPolicy, SnapshotError, SnapshotManager};
use crate::store::{InventoryLookup, RecoveryFile, ResultSink, StoreError, TaskSource};
use crate::task::Task;

/// Errors that stop a run before or outside the per-task loop
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("helper file missing: {0}")]
    MissingHelper(PathBuf),

    #[error("task source unavailable: {0}")]
    TaskSource(#[source] StoreError),

    #[error("guest preparation failed: {0}")]
    Guest(#[from] GuestError),

    #[error(transparent)]
    Environment(#[from] SnapshotError),

    #[error("results could not be stored or recovered: {0}")]
    Persistence(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything the loop needs, resolved from configuration
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub machine_id: String,
    pub layout: RunLayout,
    pub snapshot_name: String,
    pub login: LoginPolicy,

    /// Host directory holding the launcher and elevator
    pub host_helper_dir: PathBuf,
    pub guest_helper_dir: String,
    pub launcher: String,
    pub elevator: String,

    pub policy_sync: String,
    pub policy_dir: String,

    /// Maximum deployment duration applied to every task
    pub max_task_duration: Duration,

    /// Retries allowed per task (None = unbounded)
    pub max_task_retries: Option<u32>,

    pub frame_cap: usize,
    pub encode: EncodeSettings,
    pub poll: PollConfig,
    pub runner: RunnerSettings,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        let image = config.image_name();
        let layout = RunLayout::new(&config.paths.results_dir, &image).with_share(config.paths.share_dir.clone());
        let poll = PollConfig {
            interval: Duration::from_millis(config.run.poll_interval_ms),
            max_interval: Duration::from_millis(config.run.poll_max_interval_ms),
            timeout: None,
        };

        let runner = RunnerSettings {
            layout: layout.clone(),
            deploy_client: config.client.deploy_client.clone(),
            helper_dir: config.paths.guest_helper_dir.clone(),
            reg_exe: config.client.reg_exe.clone(),
            fact_key: config.client.fact_key.clone(),
            powershell: config.client.powershell.clone(),
            dialog_processes: config.client.dialog_processes.clone(),
            leftover_processes: config.client.leftover_processes.clone(),
            capture_interval: config.capture_interval(),
            tests_per_snapshot: config.run.tests_per_snapshot,
            exe_wait: Duration::from_secs(config.run.exe_wait_secs),
            cleanup_wait: Duration::from_secs(config.run.cleanup_wait_secs),
            liveness_poll: poll.clone(),
        };

        Self {
            machine_id: config.machine_id.clone(),
            layout,
            snapshot_name: config.run.snapshot_name.clone(),
            login: LoginPolicy {
                credentials: config.credentials(),
                retry_delay: Duration::from_millis(config.run.login_retry_delay_ms),
                max_attempts: config.run.login_max_attempts,
            },
            host_helper_dir: config.paths.host_helper_dir.clone(),
            guest_helper_dir: config.paths.guest_helper_dir.clone(),
            launcher: config.paths.launcher.clone(),
            elevator: config.paths.elevator.clone(),
            policy_sync: config.client.policy_sync.clone(),
            policy_dir: config.client.policy_dir.clone(),
            max_task_duration: config.max_task_duration(),
            max_task_retries: config.run.max_task_retries,
            frame_cap: config.evidence.frame_cap,
            encode: EncodeSettings {
                delay_per_frame: Duration::from_millis(config.evidence.frame_delay_ms),
                ..EncodeSettings::default()
            },
            poll,
            runner,
        }
    }
}

/// What a finished run reports
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub image: String,
    pub tasks: usize,
    pub deployable: usize,
    pub passed: usize,
    pub failed: usize,
    pub reverts: u32,
    pub retries: u32,
    pub gifs: Vec<PathBuf>,

    /// Set when the sink failed and results went to a recovery file
    pub recovery_file: Option<PathBuf>,

    /// Files copied to the share
    pub published: usize,

    /// Why the loop stopped early, if it did
    pub aborted: Option<String>,
}

/// Where a run's data comes from and goes to
pub struct RunIo<'a> {
    pub inventory: &'a dyn InventoryLookup,
    pub sink: &'a mut dyn ResultSink,
    pub encoder: &'a dyn ImageEncoder,
}

/// Sequences a whole run against one guest
#[derive(Debug, Clone)]
pub struct Orchestrator {
    settings: OrchestratorSettings,
    cancel: CancelToken,
}

impl Orchestrator {
    pub fn new(settings: OrchestratorSettings, cancel: CancelToken) -> Self {
        Self { settings, cancel }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Fatal checks before the guest is touched; returns the tasks to run
    pub fn preflight(&self, source: &dyn TaskSource) -> Result<Vec<Task>, OrchestratorError> {
        for helper in [&self.settings.launcher, &self.settings.elevator] {
            let path = self.settings.host_helper_dir.join(helper);
            if !path.is_file() {
                return Err(OrchestratorError::MissingHelper(path));
            }
        }

        let tasks: Vec<Task> = source
            .load_tasks(&self.settings.machine_id)
            .map_err(OrchestratorError::TaskSource)?
            .into_iter()
            .map(|task| task.with_max_duration(self.settings.max_task_duration))
            .collect();
        info!(machine_id = %self.settings.machine_id, tasks = tasks.len(), "tasks loaded");
        Ok(tasks)
    }

    fn tracker(&self) -> GuestProcessTracker {
        GuestProcessTracker::new(
            &self.settings.guest_helper_dir,
            &self.settings.launcher,
            &self.settings.elevator,
            self.settings.poll.clone(),
        )
    }

    /// Bring the guest to the checkpoint state and bind policies to tasks
    fn prepare(&self, ctx: &mut RunContext<'_>, tasks: &mut [Task]) -> Result<MatchReport, OrchestratorError> {
        ctx.guest.power_on()?;
        ctx.guest.wait_for_tools()?;
        ctx.snapshots.login(&mut *ctx.guest, &ctx.cancel)?;

        let helper = &self.settings.guest_helper_dir;
        if ctx.guest.directory_exists(helper)? {
            ctx.guest.delete_directory(helper)?;
        }
        ctx.guest.copy_to_guest(&self.settings.host_helper_dir, helper)?;

        ctx.snapshots.capture(&mut *ctx.guest)?;
        ctx.snapshots.policy_sync(&mut *ctx.guest, &ctx.tracker, &ctx.cancel)?;

        let artifacts = ctx.guest.list_directory(&self.settings.policy_dir)?;
        Ok(PolicyMatcher.bind(&artifacts, tasks))
    }

    /// Run every task once through the state machine, then persist and compile evidence
    pub fn run(
        &self,
        guest: &mut dyn GuestControl,
        mut tasks: Vec<Task>,
        io: RunIo<'_>,
    ) -> Result<RunSummary, OrchestratorError> {
        let layout = &self.settings.layout;
        layout.init(&self.settings.machine_id)?;

        let snapshots = SnapshotManager::new(
            self.settings.snapshot_name.clone(),
            self.settings.login.clone(),
            self.settings.policy_sync.clone(),
        );
        let mut ctx = RunContext::new(guest, snapshots, self.tracker(), self.cancel.clone());

        let report = self.prepare(&mut ctx, &mut tasks)?;
        let runner = DeploymentRunner::new(self.settings.runner.clone());

        let mut summary = RunSummary {
            image: layout.image.clone(),
            deployable: report.bound,
            ..Default::default()
        };

        'tasks: for task in tasks.iter_mut() {
            let mut retries = 0;
            loop {
                let allow_retry = self.settings.max_task_retries.is_none_or(|max| retries < max);
                match runner.run_task(&mut ctx, io.inventory, task, allow_retry) {
                    Transition::Continue => break,
                    Transition::Retry => {
                        retries += 1;
                        summary.retries += 1;
                        info!(task_id = %task.id, attempt = retries + 1, "retrying task");
                    }
                    Transition::Abort(reason) => {
                        error!(task_id = %task.id, reason = %reason, "run aborted");
                        summary.aborted = Some(reason);
                        break 'tasks;
                    }
                }
            }
        }
        summary.reverts = ctx.snapshots.reverts();

        let mut aggregator = ResultAggregator::new(layout.image.clone(), tasks).max_frames(self.settings.frame_cap);
        summary.recovery_file = self.persist(&aggregator, io.sink)?;

        summary.gifs = aggregator.compile_evidence(io.encoder, &self.settings.encode);
        summary.published = match layout.publish() {
            Ok(files) => files,
            Err(err) => {
                warn!(error = %err, "could not publish results");
                0
            }
        };

        let counts = aggregator.counts();
        summary.tasks = counts.tasks;
        summary.passed = counts.passed;
        summary.failed = counts.failed;
        info!(
            tasks = summary.tasks,
            passed = summary.passed,
            failed = summary.failed,
            reverts = summary.reverts,
            "run finished"
        );
        Ok(summary)
    }

    /// Hand results to the sink, falling back to a recovery file
    fn persist(
        &self,
        aggregator: &ResultAggregator,
        sink: &mut dyn ResultSink,
    ) -> Result<Option<PathBuf>, OrchestratorError> {
        info!(rows = aggregator.rows().len(), "sending results to the sink");
        match sink.replace_all(aggregator.image(), aggregator.tasks()) {
            Ok(()) => Ok(None),
            Err(err) => {
                warn!(error = %err, "result sink failed, writing recovery file");
                let recovery = RecoveryFile::in_dir(&self.settings.layout.log_dir());
                recovery
                    .write_all(aggregator.image(), aggregator.tasks())
                    .map_err(OrchestratorError::Persistence)?;
                Ok(Some(recovery.path().to_path_buf()))
            }
        }
    }
}
