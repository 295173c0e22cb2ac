//! Post-deployment evidence: registry fact counts and executable probes.

use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};

use super::types::{RunContext, RunnerError, RunnerSettings};
use crate::capture::save_screen;
use crate::guest::{GuestControl, guest_file_name, guest_join};
use crate::poll::{PollConfig, PollError, Poller};
use crate::store::CandidateExe;
use crate::task::{TaskResult, names};

/// Scratch file the registry export is written to
const EXPORT_FILE: &str = "reg.txt";

/// Number of lines in a registry export.
///
/// `reg.exe export` writes UTF-16LE with a byte order mark; UTF-8 input is
/// accepted too.
pub fn count_export_lines(bytes: &[u8]) -> usize {
    let text = match bytes {
        [0xFF, 0xFE, rest @ ..] => {
            let units: Vec<u16> = rest
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        [0xEF, 0xBB, 0xBF, rest @ ..] => String::from_utf8_lossy(rest).into_owned(),
        _ => String::from_utf8_lossy(bytes).into_owned(),
    };
    text.lines().count()
}

/// Export the tracked registry key and count its lines.
///
/// The export is copied to `scratch` on the host and removed after counting.
pub fn fact_count(
    guest: &mut dyn GuestControl,
    settings: &RunnerSettings,
    scratch: &Path,
) -> Result<usize, RunnerError> {
    let export = guest_join(&settings.helper_dir, EXPORT_FILE);
    if guest.file_exists(&export)? {
        guest.delete_file(&export)?;
    }
    guest.run_and_wait(
        &settings.reg_exe,
        &format!("export \"{}\" \"{}\"", settings.fact_key, export),
    )?;

    let host = scratch.join(EXPORT_FILE);
    guest.copy_from_guest(&export, &host)?;
    let count = count_export_lines(&fs::read(&host)?);
    fs::remove_file(&host)?;

    debug!(count, "registry fact count");
    Ok(count)
}

/// Close processes by name through an elevated PowerShell, ignoring failures
pub fn stop_processes(ctx: &mut RunContext<'_>, settings: &RunnerSettings, processes: &[String]) {
    if processes.is_empty() {
        return;
    }
    let args = stop_process_args(processes);
    let launched = ctx
        .tracker
        .launch_privileged(&mut *ctx.guest, &settings.powershell, &args, &ctx.cancel);
    match launched {
        Ok(Some(process)) => {
            let poll = ctx.tracker.poll_config().clone().timeout(settings.cleanup_wait);
            if let Err(err) = ctx
                .tracker
                .wait_for_exit(&mut *ctx.guest, &process.name, poll, &ctx.cancel)
            {
                warn!(error = %err, "process cleanup did not finish");
            }
        }
        Ok(None) => {}
        Err(err) => warn!(error = %err, processes = ?processes, "process cleanup failed"),
    }
}

/// PowerShell arguments that stop every process in `processes` by name
pub fn stop_process_args(processes: &[String]) -> String {
    let names: Vec<String> = processes
        .iter()
        .map(|name| format!("'{}'", name.replace('\'', "''")))
        .collect();
    format!(
        "-command \"& {{&'Stop-Process' -processname @({})}}\"",
        names.join(", ")
    )
}

/// Launch each candidate present on the guest and record what ran.
///
/// Appends one "Ran EXE" result per executable found, then a single
/// "Files Installed" result.
pub fn probe_executables(
    ctx: &mut RunContext<'_>,
    settings: &RunnerSettings,
    candidates: &[CandidateExe],
    task_dir: &Path,
) -> Result<Vec<TaskResult>, RunnerError> {
    let mut results = Vec::new();

    for candidate in candidates {
        if !ctx.guest.file_exists(&candidate.path)? {
            debug!(path = %candidate.path, "candidate not on guest");
            continue;
        }

        let process = ctx.guest.detach(&candidate.path, "")?;
        let alive = still_running_after(ctx, &process.name, settings.exe_wait, &settings.liveness_poll)?;
        if alive {
            save_screen(
                &mut *ctx.guest,
                &task_dir.join(format!("exescreen_{}.png", candidate.file_id)),
            )?;
            if let Err(err) = ctx.guest.kill_process(&process) {
                debug!(process = %process.name, error = %err, "kill failed");
            }
        }
        stop_processes(ctx, settings, &settings.leftover_processes);

        info!(exe = %process.name, alive, "executable probed");
        results.push(TaskResult::pass(
            format!("{}{}", names::RAN_EXE_PREFIX, guest_file_name(&candidate.path)),
            candidate.file_id.clone(),
        ));
    }

    let files_installed = if candidates.is_empty() {
        TaskResult::fail(names::FILES_INSTALLED, "No executables returned")
    } else if results.is_empty() {
        TaskResult::fail(names::FILES_INSTALLED, "No executables found on guest")
    } else {
        TaskResult::pass(names::FILES_INSTALLED, "")
    };
    results.push(files_installed);
    Ok(results)
}

/// Watch a process for up to `wait`; true if it is still alive at the deadline
fn still_running_after(
    ctx: &mut RunContext<'_>,
    name: &str,
    wait: std::time::Duration,
    poll: &PollConfig,
) -> Result<bool, RunnerError> {
    let mut poller = Poller::new(poll.clone().timeout(wait), &ctx.cancel);
    loop {
        if !ctx.tracker.is_running(&mut *ctx.guest, name)? {
            return Ok(false);
        }
        match poller.wait() {
            Ok(()) => {}
            Err(PollError::TimedOut(_)) => return Ok(ctx.tracker.is_running(&mut *ctx.guest, name)?),
            Err(PollError::Cancelled) => return Err(RunnerError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_utf16_export() {
        let text = "Windows Registry Editor Version 5.00\r\n\r\n[HKEY_LOCAL_MACHINE\\SOFTWARE\\LANdesk]\r\n";
        let mut bytes = vec![0xFF, 0xFE];
        for unit in text.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        assert_eq!(count_export_lines(&bytes), 3);
    }

    #[test]
    fn test_count_utf8_export() {
        assert_eq!(count_export_lines(b"a\nb\nc\n"), 3);
        assert_eq!(count_export_lines(&[0xEF, 0xBB, 0xBF, b'x']), 1);
        assert_eq!(count_export_lines(b""), 0);
    }

    #[test]
    fn test_stop_process_args_quotes_names() {
        assert_eq!(
            stop_process_args(&["htmldialog".to_string()]),
            "-command \"& {&'Stop-Process' -processname @('htmldialog')}\""
        );
        assert_eq!(
            stop_process_args(&["javaw".to_string(), "java".to_string()]),
            "-command \"& {&'Stop-Process' -processname @('javaw', 'java')}\""
        );
    }
}
