//! Process liveness tracking and privileged launches on the guest.

use thiserror::Error;
use tracing::debug;

use super::{GuestControl, GuestError, ProcessHandle, guest_file_name, guest_join};
use crate::poll::{CancelToken, PollConfig, PollError, Poller};

/// Errors from tracking guest processes
#[derive(Debug, Error)]
pub enum TrackError {
    #[error(transparent)]
    Guest(#[from] GuestError),

    #[error(transparent)]
    Poll(#[from] PollError),
}

/// Finds guest processes by name and launches commands as SYSTEM.
///
/// Privileged launches go through a launcher (`hstart64.exe /WAIT`) that runs
/// an elevator (`PsExec.exe -i -s`) that runs the command. The channel only
/// reports the launcher, so the real target is rediscovered by executable name.
#[derive(Debug, Clone)]
pub struct GuestProcessTracker {
    /// Guest path of the launcher executable
    launcher: String,

    /// Guest path of the elevation helper
    elevator: String,

    /// Spacing for launcher discovery
    poll: PollConfig,
}

impl GuestProcessTracker {
    pub fn new(helper_dir: &str, launcher: &str, elevator: &str, poll: PollConfig) -> Self {
        Self {
            launcher: guest_join(helper_dir, launcher),
            elevator: guest_join(helper_dir, elevator),
            poll,
        }
    }

    pub fn poll_config(&self) -> &PollConfig {
        &self.poll
    }

    /// Query the guest once for a process with this executable name
    pub fn is_running(&self, guest: &mut dyn GuestControl, name: &str) -> Result<bool, GuestError> {
        Ok(guest.find_process(name)?.is_some())
    }

    /// Arguments handed to the launcher for `command args`
    pub fn wrapper_args(&self, command: &str, args: &str) -> String {
        let inner = format!(
            "{} /accepteula -i -s \"{}\" {}",
            self.elevator, command, args
        );
        format!("/WAIT /UAC \"{}\"", inner.trim_end())
    }

    /// Launch `command` elevated and return the handle of the real process.
    ///
    /// Returns `None` when the launcher exits before a process named like the
    /// command ever shows up (it finished instantly or failed to start).
    pub fn launch_privileged(
        &self,
        guest: &mut dyn GuestControl,
        command: &str,
        args: &str,
        cancel: &CancelToken,
    ) -> Result<Option<ProcessHandle>, TrackError> {
        let target = guest_file_name(command).to_string();
        let wrapper = guest.detach(&self.launcher, &self.wrapper_args(command, args))?;
        debug!(launcher = %wrapper.name, target = %target, "waiting for privileged launch");

        let mut poller = Poller::new(self.poll.clone(), cancel);
        loop {
            if let Some(process) = guest.find_process(&target)? {
                debug!(target = %target, after_ms = poller.elapsed().as_millis() as u64, "target process discovered");
                return Ok(Some(process));
            }
            if guest.find_process(&wrapper.name)?.is_none() {
                debug!(target = %target, "launcher exited without the target appearing");
                return Ok(None);
            }
            poller.wait()?;
        }
    }

    /// Block until no process named `name` is running
    pub fn wait_for_exit(
        &self,
        guest: &mut dyn GuestControl,
        name: &str,
        poll: PollConfig,
        cancel: &CancelToken,
    ) -> Result<(), TrackError> {
        let mut poller = Poller::new(poll, cancel);
        while self.is_running(guest, name)? {
            poller.wait()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::{Lifetime, ScriptedGuest};
    use std::time::Duration;

    fn tracker() -> GuestProcessTracker {
        GuestProcessTracker::new(
            r"C:\pstemp",
            "hstart64.exe",
            "PsExec.exe",
            PollConfig::fixed(Duration::from_millis(1)),
        )
    }

    #[test]
    fn test_wrapper_args() {
        let args = tracker().wrapper_args(r"C:\LDClient\SDCLIENT.EXE", "/policyfile=\"CP012340.xml\"");
        assert_eq!(
            args,
            r#"/WAIT /UAC "C:\pstemp\PsExec.exe /accepteula -i -s "C:\LDClient\SDCLIENT.EXE" /policyfile="CP012340.xml"""#
        );
    }

    #[test]
    fn test_launch_finds_target() {
        let mut guest = ScriptedGuest::logged_in().with_program("SDCLIENT.EXE", Lifetime::Polls(3));
        let handle = tracker()
            .launch_privileged(&mut guest, r"C:\LDClient\SDCLIENT.EXE", "", &CancelToken::new())
            .unwrap();
        assert_eq!(handle.map(|h| h.name), Some("SDCLIENT.EXE".to_string()));
    }

    #[test]
    fn test_launch_returns_none_when_target_never_appears() {
        let mut guest = ScriptedGuest::logged_in()
            .with_program("SDCLIENT.EXE", Lifetime::Never)
            .with_program("hstart64.exe", Lifetime::Polls(2));
        let handle = tracker()
            .launch_privileged(&mut guest, r"C:\LDClient\SDCLIENT.EXE", "", &CancelToken::new())
            .unwrap();
        assert!(handle.is_none());
    }

    #[test]
    fn test_wait_for_exit() {
        let mut guest = ScriptedGuest::logged_in().with_program("PolicySync.exe", Lifetime::Polls(4));
        guest.detach("PolicySync.exe", "").unwrap();
        let tracker = tracker();
        tracker
            .wait_for_exit(&mut guest, "PolicySync.exe", PollConfig::fixed(Duration::from_millis(1)), &CancelToken::new())
            .unwrap();
        assert!(!tracker.is_running(&mut guest, "PolicySync.exe").unwrap());
    }
}
