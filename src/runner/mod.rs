//! Per-task deployment state machine.
//!
//! One call to [`DeploymentRunner::run_task`] is one attempt:
//! `Pending -> Querying -> Deploying -> {Completed | TimedOut | Errored} -> Recorded`.
//! The attempt ends in a [`Transition`] telling the loop driver whether to move
//! on, retry the same task, or stop.

pub mod types;
pub mod verify;

pub use types::{AttemptOutcome, RunContext, RunnerError, RunnerSettings, TaskState, Transition};

use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::capture::FrameRecorder;
use crate::poll::{PollError, Poller};
use crate::store::InventoryLookup;
use crate::task::{AttemptMark, Task, TaskResult, names};

/// Drives one task at a time through deployment and verification
#[derive(Debug, Clone)]
pub struct DeploymentRunner {
    settings: RunnerSettings,
}

impl DeploymentRunner {
    pub fn new(settings: RunnerSettings) -> Self {
        Self { settings }
    }

    /// Run one attempt of `task` and decide what happens next.
    ///
    /// `allow_retry` is false once the loop driver's retry ceiling is reached;
    /// a fault is then recorded instead of retried.
    pub fn run_task(
        &self,
        ctx: &mut RunContext<'_>,
        inventory: &dyn InventoryLookup,
        task: &mut Task,
        allow_retry: bool,
    ) -> Transition {
        let mark = task.mark();
        enter(task, TaskState::Pending);

        match self.attempt(ctx, inventory, task) {
            Ok(outcome) => self.settle(ctx, task, outcome),
            Err(err) => self.recover(ctx, task, mark, err, allow_retry),
        }
    }

    fn attempt(
        &self,
        ctx: &mut RunContext<'_>,
        inventory: &dyn InventoryLookup,
        task: &mut Task,
    ) -> Result<AttemptOutcome, RunnerError> {
        enter(task, TaskState::Querying);
        let exists = inventory.entry_exists(&task.id)?;
        task.record(TaskResult::new(names::ENTRY_EXISTS, exists, ""));

        let Some(policy) = task.command.clone() else {
            info!(task_id = %task.id, package = %task.name, "cannot deploy, no policy file");
            task.record(TaskResult::fail(names::TASK_AVAILABLE, "Policy file not found"));
            return Ok(AttemptOutcome::NotDeployable);
        };
        task.record(TaskResult::pass(names::TASK_AVAILABLE, ""));

        enter(task, TaskState::Deploying);
        info!(task_id = %task.id, package = %task.name, "deploying");
        let task_dir = self.settings.layout.task_dir(&task.id);
        let mut recorder = FrameRecorder::new(&task_dir)?;
        task.frame_dir = Some(task_dir.clone());

        let before = verify::fact_count(&mut *ctx.guest, &self.settings, &task_dir)?;

        let client_args = format!("/policyfile=\"{}\"", policy);
        let process = ctx
            .tracker
            .launch_privileged(&mut *ctx.guest, &self.settings.deploy_client, &client_args, &ctx.cancel)?
            .ok_or_else(|| RunnerError::LaunchFailed(self.settings.deploy_client.clone()))?;

        // The budget starts once the real process is visible
        let started = Instant::now();
        let mut poller = Poller::new(self.settings.liveness_poll.clone(), &ctx.cancel);
        while ctx.tracker.is_running(&mut *ctx.guest, &process.name)? {
            let elapsed = started.elapsed();
            if elapsed > task.max_duration {
                enter(task, TaskState::TimedOut);
                warn!(task_id = %task.id, elapsed_ms = elapsed.as_millis() as u64, "deployment timed out");
                task.elapsed = Some(elapsed);
                task.record(TaskResult::fail(
                    names::TASK_COMPLETED,
                    format!("exceeded maximum duration of {:?}", task.max_duration),
                ));
                return Ok(AttemptOutcome::TimedOut(elapsed));
            }

            if elapsed >= frame_due(self.settings.capture_interval, recorder.next_index()) {
                let frame = recorder.capture(&mut *ctx.guest)?;
                debug!(task_id = %task.id, frame = %frame.display(), "frame captured");
                task.frames.push(frame);
            }

            match poller.wait() {
                Ok(()) | Err(PollError::TimedOut(_)) => {}
                Err(PollError::Cancelled) => return Err(RunnerError::Cancelled),
            }
        }

        let elapsed = started.elapsed();
        enter(task, TaskState::Completed);
        task.elapsed = Some(elapsed);
        task.record(TaskResult::pass(names::TASK_COMPLETED, elapsed.as_millis().to_string()));
        info!(task_id = %task.id, elapsed_ms = elapsed.as_millis() as u64, "task complete");
        verify::stop_processes(ctx, &self.settings, &self.settings.dialog_processes);

        let after = verify::fact_count(&mut *ctx.guest, &self.settings, &task_dir)?;
        task.record(TaskResult::new(
            names::REGISTRY_KEY_ADDED,
            after > before,
            format!("{} -> {}", before, after),
        ));

        let candidates = inventory.candidate_executables(&task.id)?;
        for result in verify::probe_executables(ctx, &self.settings, &candidates, &task_dir)? {
            task.record(result);
        }

        Ok(AttemptOutcome::Completed(elapsed))
    }

    fn settle(&self, ctx: &mut RunContext<'_>, task: &mut Task, outcome: AttemptOutcome) -> Transition {
        enter(task, TaskState::Recorded);
        match outcome {
            AttemptOutcome::NotDeployable => Transition::Continue,
            AttemptOutcome::TimedOut(_) => revert_then(ctx, Transition::Continue),
            AttemptOutcome::Completed(_) => {
                ctx.run_counter += 1;
                if ctx.run_counter >= self.settings.tests_per_snapshot {
                    info!(completed = ctx.run_counter, "snapshot threshold reached");
                    revert_then(ctx, Transition::Continue)
                } else {
                    Transition::Continue
                }
            }
        }
    }

    fn recover(
        &self,
        ctx: &mut RunContext<'_>,
        task: &mut Task,
        mark: AttemptMark,
        err: RunnerError,
        allow_retry: bool,
    ) -> Transition {
        enter(task, TaskState::Errored);
        if matches!(err, RunnerError::Cancelled) {
            return Transition::Abort("cancelled".to_string());
        }

        if ctx.run_counter > 0 && allow_retry {
            warn!(task_id = %task.id, error = %err, "test suite error, restarting task");
            task.rollback(mark);
            return revert_then(ctx, Transition::Retry);
        }

        error!(task_id = %task.id, error = %err, "test suite error, moving to next task");
        task.record(TaskResult::fail(names::TEST_SUITE_ERROR, err.to_string()));
        enter(task, TaskState::Recorded);
        revert_then(ctx, Transition::Continue)
    }
}

/// Elapsed time at which frame `index` is due
fn frame_due(interval: Duration, index: usize) -> Duration {
    interval.saturating_mul(u32::try_from(index).unwrap_or(u32::MAX))
}

fn revert_then(ctx: &mut RunContext<'_>, next: Transition) -> Transition {
    match ctx.revert() {
        Ok(()) => next,
        Err(err) if err.is_cancelled() => Transition::Abort("cancelled".to_string()),
        Err(err) => {
            error!(error = %err, "could not restore the guest");
            Transition::Abort(err.to_string())
        }
    }
}

fn enter(task: &Task, state: TaskState) {
    debug!(task_id = %task.id, state = ?state, "task state");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_due() {
        let interval = Duration::from_millis(3000);
        assert_eq!(frame_due(interval, 0), Duration::ZERO);
        assert_eq!(frame_due(interval, 3), Duration::from_millis(9000));
    }
}
