//! Guest control channel abstraction.
//!
//! The harness never talks to a hypervisor directly. Everything it does to the
//! guest goes through [`GuestControl`]:
//! - [`VmrunGuest`] drives VMware through the `vmrun` command-line tool
//! - [`ScriptedGuest`] is an in-memory guest for tests and dry runs

pub mod mock;
pub mod tracker;
pub mod vmrun;

pub use mock::{GuestEvent, Lifetime, ScriptedGuest};
pub use tracker::GuestProcessTracker;
pub use vmrun::{HostConnection, VmrunGuest};

use std::path::Path;
use std::time::Instant;

use thiserror::Error;

/// Result type for guest operations
pub type GuestResult<T> = Result<T, GuestError>;

/// Errors reported by the guest control channel
#[derive(Debug, Error)]
pub enum GuestError {
    /// The named snapshot does not exist
    #[error("snapshot '{0}' not found")]
    SnapshotNotFound(String),

    /// A guest file or directory does not exist
    #[error("guest path not found: {0}")]
    NotFound(String),

    /// A guest operation was attempted without a logged-in session
    #[error("no guest session; log in first")]
    NotLoggedIn,

    /// The control channel rejected or failed a command
    #[error("{op} failed: {message}")]
    Command { op: &'static str, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GuestError {
    pub fn command(op: &'static str, message: impl Into<String>) -> Self {
        GuestError::Command {
            op,
            message: message.into(),
        }
    }
}

/// Interactive guest account
#[derive(Debug, Clone)]
pub struct Credentials {
    pub domain: String,
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// `DOMAIN\user` form expected by the guest
    pub fn qualified_user(&self) -> String {
        if self.domain.is_empty() {
            self.username.clone()
        } else {
            format!("{}\\{}", self.domain, self.username)
        }
    }
}

/// A guest process found by executable name.
///
/// Identity is the executable name, not a PID: the privileged launcher hides
/// the spawned child, so the harness can only rediscover it by name. Two guest
/// processes with the same executable name are indistinguishable, so results
/// are only well defined while names are unique among running processes.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    /// Executable file name, e.g. `SDCLIENT.EXE`
    pub name: String,

    /// When the harness first saw the process
    pub discovered_at: Instant,

    /// Guest PID when the channel reports one (used only for killing)
    pub pid: Option<u64>,
}

impl ProcessHandle {
    pub fn new(name: impl Into<String>, pid: Option<u64>) -> Self {
        Self {
            name: name.into(),
            discovered_at: Instant::now(),
            pid,
        }
    }
}

/// Opaque reference to a guest checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRef {
    pub name: String,
}

/// Operations the harness needs from the hypervisor and guest tooling
pub trait GuestControl {
    fn power_on(&mut self) -> GuestResult<()>;

    /// Block until the guest tooling answers
    fn wait_for_tools(&mut self) -> GuestResult<()>;

    /// Open an interactive guest session
    fn login(&mut self, credentials: &Credentials) -> GuestResult<()>;

    fn file_exists(&mut self, guest_path: &str) -> GuestResult<bool>;

    fn directory_exists(&mut self, guest_path: &str) -> GuestResult<bool>;

    /// List entry names (not full paths) in a guest directory
    fn list_directory(&mut self, guest_path: &str) -> GuestResult<Vec<String>>;

    fn delete_file(&mut self, guest_path: &str) -> GuestResult<()>;

    fn delete_directory(&mut self, guest_path: &str) -> GuestResult<()>;

    /// Copy a host file or directory tree into the guest
    fn copy_to_guest(&mut self, host_path: &Path, guest_path: &str) -> GuestResult<()>;

    fn copy_from_guest(&mut self, guest_path: &str, host_path: &Path) -> GuestResult<()>;

    /// Run a program and wait for it to exit
    fn run_and_wait(&mut self, program: &str, args: &str) -> GuestResult<()>;

    /// Start a program and return immediately
    fn detach(&mut self, program: &str, args: &str) -> GuestResult<ProcessHandle>;

    /// Look up a running process by executable name
    fn find_process(&mut self, name: &str) -> GuestResult<Option<ProcessHandle>>;

    fn kill_process(&mut self, process: &ProcessHandle) -> GuestResult<()>;

    /// Capture the guest console as PNG bytes
    fn capture_screen(&mut self) -> GuestResult<Vec<u8>>;

    fn create_snapshot(&mut self, name: &str, description: &str) -> GuestResult<SnapshotRef>;

    /// Remove a snapshot; [`GuestError::SnapshotNotFound`] if it does not exist
    fn remove_snapshot(&mut self, name: &str) -> GuestResult<()>;

    /// Revert to a snapshot. The guest session is closed afterwards.
    fn revert_snapshot(&mut self, snapshot: &SnapshotRef) -> GuestResult<()>;
}

/// Final component of a guest path, accepting both separators
pub fn guest_file_name(path: &str) -> &str {
    let trimmed = path.trim().trim_matches('"');
    trimmed
        .rsplit(['\\', '/'])
        .next()
        .unwrap_or(trimmed)
}

/// Join guest path components with the Windows separator
pub fn guest_join(dir: &str, name: &str) -> String {
    format!("{}\\{}", dir.trim_end_matches(['\\', '/']), name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_file_name() {
        assert_eq!(
            guest_file_name(r"C:\Program Files (x86)\LANDesk\LDClient\SDCLIENT.EXE"),
            "SDCLIENT.EXE"
        );
        assert_eq!(guest_file_name("\"C:/tools/app.exe\""), "app.exe");
        assert_eq!(guest_file_name("notepad.exe"), "notepad.exe");
    }

    #[test]
    fn test_guest_join() {
        assert_eq!(guest_join(r"C:\pstemp\", "reg.txt"), r"C:\pstemp\reg.txt");
        assert_eq!(guest_join(r"C:\pstemp", "reg.txt"), r"C:\pstemp\reg.txt");
    }

    #[test]
    fn test_qualified_user() {
        let creds = Credentials {
            domain: "CAMPUS".to_string(),
            username: "tester".to_string(),
            password: "pw".to_string(),
        };
        assert_eq!(creds.qualified_user(), r"CAMPUS\tester");
    }
}
