//! Checkpoint ownership: capture once, revert on demand, rebuild the session.

use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::guest::tracker::TrackError;
use crate::guest::{Credentials, GuestControl, GuestError, GuestProcessTracker, SnapshotRef};
use crate::poll::{CancelToken, PollConfig, PollError};

/// Errors at the snapshot / session boundary
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Guest(#[from] GuestError),

    #[error(transparent)]
    Track(#[from] TrackError),

    #[error("no checkpoint has been captured")]
    NoSnapshot,

    #[error("login failed after {attempts} attempts: {last}")]
    LoginExhausted { attempts: u32, last: String },

    #[error("cancelled while re-establishing the guest session")]
    Cancelled,
}

impl SnapshotError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            SnapshotError::Cancelled | SnapshotError::Track(TrackError::Poll(PollError::Cancelled))
        )
    }
}

/// How guest logins are retried
#[derive(Debug, Clone)]
pub struct LoginPolicy {
    pub credentials: Credentials,

    /// Pause between failed attempts
    pub retry_delay: Duration,

    /// Give up after this many attempts (None = keep trying until cancelled)
    pub max_attempts: Option<u32>,
}

/// Owns the checkpoint snapshot and the logged-in guest session
#[derive(Debug)]
pub struct SnapshotManager {
    name: String,
    description: String,
    snapshot: Option<SnapshotRef>,
    login: LoginPolicy,
    resync_program: String,
    resync_poll: PollConfig,
    reverts: u32,
}

impl SnapshotManager {
    pub fn new(name: impl Into<String>, login: LoginPolicy, resync_program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: "Start point for deployment tests".to_string(),
            snapshot: None,
            login,
            resync_program: resync_program.into(),
            resync_poll: PollConfig::fixed(Duration::from_secs(1)),
            reverts: 0,
        }
    }

    /// Spacing for the wait on the resync command
    pub fn resync_poll(mut self, poll: PollConfig) -> Self {
        self.resync_poll = poll;
        self
    }

    /// Reverts performed so far
    pub fn reverts(&self) -> u32 {
        self.reverts
    }

    /// Capture the checkpoint, replacing any snapshot with the same name
    pub fn capture(&mut self, guest: &mut dyn GuestControl) -> Result<SnapshotRef, SnapshotError> {
        match guest.remove_snapshot(&self.name) {
            Ok(()) => debug!(snapshot = %self.name, "removed stale snapshot"),
            Err(GuestError::SnapshotNotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let snapshot = guest.create_snapshot(&self.name, &self.description)?;
        info!(snapshot = %snapshot.name, "checkpoint captured");
        self.snapshot = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Log in, retrying with a fixed delay until success, the attempt cap or cancellation
    pub fn login(&self, guest: &mut dyn GuestControl, cancel: &CancelToken) -> Result<u32, SnapshotError> {
        let mut attempts = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(SnapshotError::Cancelled);
            }
            attempts += 1;
            match guest.login(&self.login.credentials) {
                Ok(()) => {
                    info!(user = %self.login.credentials.qualified_user(), attempts, "logged in");
                    return Ok(attempts);
                }
                Err(err) => {
                    if self.login.max_attempts.is_some_and(|max| attempts >= max) {
                        return Err(SnapshotError::LoginExhausted {
                            attempts,
                            last: err.to_string(),
                        });
                    }
                    warn!(attempt = attempts, error = %err, "login failed, retrying");
                    thread::sleep(self.login.retry_delay);
                }
            }
        }
    }

    /// Run the policy resync command and wait for it to finish
    pub fn policy_sync(
        &self,
        guest: &mut dyn GuestControl,
        tracker: &GuestProcessTracker,
        cancel: &CancelToken,
    ) -> Result<(), SnapshotError> {
        if let Some(process) = tracker.launch_privileged(guest, &self.resync_program, "", cancel)? {
            tracker.wait_for_exit(guest, &process.name, self.resync_poll.clone(), cancel)?;
        }
        info!("policy sync complete");
        Ok(())
    }

    /// Revert to the checkpoint, power on, log in and resync.
    ///
    /// On success the guest is logged in and synced again.
    pub fn revert_and_relogin(
        &mut self,
        guest: &mut dyn GuestControl,
        tracker: &GuestProcessTracker,
        cancel: &CancelToken,
    ) -> Result<(), SnapshotError> {
        let snapshot = self.snapshot.clone().ok_or(SnapshotError::NoSnapshot)?;
        info!(snapshot = %snapshot.name, "rolling back");

        guest.revert_snapshot(&snapshot)?;
        self.reverts += 1;
        guest.power_on()?;
        guest.wait_for_tools()?;
        self.login(guest, cancel)?;
        self.policy_sync(guest, tracker, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::{GuestEvent, Lifetime, ScriptedGuest};

    fn manager(max_attempts: Option<u32>) -> SnapshotManager {
        let login = LoginPolicy {
            credentials: Credentials {
                domain: "CAMPUS".to_string(),
                username: "tester".to_string(),
                password: "pw".to_string(),
            },
            retry_delay: Duration::from_millis(1),
            max_attempts,
        };
        SnapshotManager::new("deployPoint", login, r"C:\LDClient\PolicySync.exe")
            .resync_poll(PollConfig::fixed(Duration::from_millis(1)))
    }

    fn tracker() -> GuestProcessTracker {
        GuestProcessTracker::new(r"C:\pstemp", "hstart64.exe", "PsExec.exe", PollConfig::fixed(Duration::from_millis(1)))
    }

    #[test]
    fn test_capture_replaces_existing_snapshot() {
        let mut guest = ScriptedGuest::logged_in().with_snapshot("deployPoint");
        let mut snapshots = manager(None);
        snapshots.capture(&mut guest).unwrap();
        assert_eq!(
            guest.events(),
            &[
                GuestEvent::SnapshotRemoved("deployPoint".to_string()),
                GuestEvent::SnapshotCreated("deployPoint".to_string()),
            ]
        );
    }

    #[test]
    fn test_capture_without_prior_snapshot() {
        let mut guest = ScriptedGuest::logged_in();
        let snapshot = manager(None).capture(&mut guest).unwrap();
        assert_eq!(snapshot.name, "deployPoint");
        assert!(guest.has_snapshot("deployPoint"));
    }

    #[test]
    fn test_revert_requires_snapshot() {
        let mut guest = ScriptedGuest::logged_in();
        let err = manager(None)
            .revert_and_relogin(&mut guest, &tracker(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, SnapshotError::NoSnapshot));
    }

    #[test]
    fn test_revert_logs_back_in_after_failures() {
        let mut guest = ScriptedGuest::logged_in()
            .with_program("PolicySync.exe", Lifetime::Polls(2))
            .with_login_failures(3);
        let mut snapshots = manager(None);
        snapshots.capture(&mut guest).unwrap();

        snapshots
            .revert_and_relogin(&mut guest, &tracker(), &CancelToken::new())
            .unwrap();

        assert!(guest.is_logged_in());
        assert_eq!(snapshots.reverts(), 1);
        let rejected = guest
            .events()
            .iter()
            .filter(|e| **e == GuestEvent::LoginRejected)
            .count();
        assert_eq!(rejected, 3);
    }

    #[test]
    fn test_login_gives_up_at_cap() {
        let mut guest = ScriptedGuest::logged_in().with_login_failures(10);
        let err = manager(Some(2)).login(&mut guest, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, SnapshotError::LoginExhausted { attempts: 2, .. }));
    }

    #[test]
    fn test_login_stops_when_cancelled() {
        let mut guest = ScriptedGuest::logged_in().with_login_failures(u32::MAX);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = manager(None).login(&mut guest, &cancel).unwrap_err();
        assert!(err.is_cancelled());
    }
}
