//! VMware guest control through the `vmrun` command-line tool.
//!
//! `vmrun` has no persistent guest session: every guest operation carries the
//! guest credentials. [`VmrunGuest::login`] therefore only verifies the
//! credentials and remembers them for later calls.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::debug;
use walkdir::WalkDir;

use super::{
    Credentials, GuestControl, GuestError, GuestResult, ProcessHandle, SnapshotRef, guest_join,
};
use crate::poll::{CancelToken, PollConfig, PollError, Poller};

/// How `vmrun` reaches the hypervisor
#[derive(Debug, Clone)]
pub enum HostConnection {
    /// Local VMware Workstation
    Workstation,
    /// vSphere / ESX host
    Server {
        host: String,
        user: String,
        password: String,
    },
}

/// [`GuestControl`] backed by `vmrun`
#[derive(Debug)]
pub struct VmrunGuest {
    vmrun: PathBuf,
    vmx: String,
    host: HostConnection,
    credentials: Option<Credentials>,
    scratch_dir: PathBuf,
    tools_poll: PollConfig,
    cancel: CancelToken,
    captures: u64,
}

impl VmrunGuest {
    pub fn new(vmrun: impl Into<PathBuf>, vmx: impl Into<String>, host: HostConnection) -> Self {
        Self {
            vmrun: vmrun.into(),
            vmx: vmx.into(),
            host,
            credentials: None,
            scratch_dir: std::env::temp_dir(),
            tools_poll: PollConfig::fixed(Duration::from_secs(2)).timeout(Duration::from_secs(600)),
            cancel: CancelToken::new(),
            captures: 0,
        }
    }

    /// Directory used for screenshots before they are read back
    pub fn scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Spacing and deadline for the tools readiness check
    pub fn tools_poll(mut self, poll: PollConfig) -> Self {
        self.tools_poll = poll;
        self
    }

    pub fn cancel_token(mut self, cancel: &CancelToken) -> Self {
        self.cancel = cancel.clone();
        self
    }

    fn host_args(&self) -> Vec<String> {
        match &self.host {
            HostConnection::Workstation => vec!["-T".into(), "ws".into()],
            HostConnection::Server {
                host,
                user,
                password,
            } => vec![
                "-T".into(),
                "vc".into(),
                "-h".into(),
                host.clone(),
                "-u".into(),
                user.clone(),
                "-p".into(),
                password.clone(),
            ],
        }
    }

    fn guest_args(&self) -> GuestResult<Vec<String>> {
        let creds = self.credentials.as_ref().ok_or(GuestError::NotLoggedIn)?;
        Ok(vec![
            "-gu".into(),
            creds.qualified_user(),
            "-gp".into(),
            creds.password.clone(),
        ])
    }

    /// Run `vmrun <host args> [guest args] <command> <vmx> <args...>` and return stdout
    fn vmrun(&self, op: &'static str, command: &str, guest: bool, args: &[&str]) -> GuestResult<String> {
        let mut cmd = Command::new(&self.vmrun);
        cmd.args(self.host_args());
        if guest {
            cmd.args(self.guest_args()?);
        }
        cmd.arg(command).arg(&self.vmx).args(args);
        debug!(command, ?args, "vmrun");

        let output = cmd.output()?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = format!("{} {}", stdout.trim(), stderr.trim());
            return Err(GuestError::command(op, message.trim()));
        }
        Ok(stdout)
    }
}

impl GuestControl for VmrunGuest {
    fn power_on(&mut self) -> GuestResult<()> {
        self.vmrun("power_on", "start", false, &["gui"])?;
        Ok(())
    }

    fn wait_for_tools(&mut self) -> GuestResult<()> {
        let mut poller = Poller::new(self.tools_poll.clone(), &self.cancel);
        loop {
            let state = self.vmrun("wait_for_tools", "checkToolsState", false, &[])?;
            if state.trim().eq_ignore_ascii_case("running") {
                return Ok(());
            }
            poller.wait().map_err(|e| match e {
                PollError::Cancelled => GuestError::command("wait_for_tools", "cancelled"),
                PollError::TimedOut(after) => {
                    GuestError::command("wait_for_tools", format!("tools not running after {:?}", after))
                }
            })?;
        }
    }

    fn login(&mut self, credentials: &Credentials) -> GuestResult<()> {
        let previous = self.credentials.replace(credentials.clone());
        match self.vmrun("login", "directoryExistsInGuest", true, &["C:\\"]) {
            Ok(_) => Ok(()),
            Err(err) => {
                self.credentials = previous;
                Err(err)
            }
        }
    }

    fn file_exists(&mut self, guest_path: &str) -> GuestResult<bool> {
        let out = self.vmrun("file_exists", "fileExistsInGuest", true, &[guest_path])?;
        Ok(parse_exists(&out))
    }

    fn directory_exists(&mut self, guest_path: &str) -> GuestResult<bool> {
        let out = self.vmrun("directory_exists", "directoryExistsInGuest", true, &[guest_path])?;
        Ok(parse_exists(&out))
    }

    fn list_directory(&mut self, guest_path: &str) -> GuestResult<Vec<String>> {
        let out = self.vmrun("list_directory", "listDirectoryInGuest", true, &[guest_path])?;
        Ok(parse_directory_listing(&out))
    }

    fn delete_file(&mut self, guest_path: &str) -> GuestResult<()> {
        self.vmrun("delete_file", "deleteFileInGuest", true, &[guest_path])?;
        Ok(())
    }

    fn delete_directory(&mut self, guest_path: &str) -> GuestResult<()> {
        self.vmrun("delete_directory", "deleteDirectoryInGuest", true, &[guest_path])?;
        Ok(())
    }

    fn copy_to_guest(&mut self, host_path: &Path, guest_path: &str) -> GuestResult<()> {
        if !host_path.is_dir() {
            let host = host_path.to_string_lossy();
            self.vmrun("copy_to_guest", "CopyFileFromHostToGuest", true, &[&*host, guest_path])?;
            return Ok(());
        }

        // vmrun copies single files, so recreate the tree entry by entry
        for entry in WalkDir::new(host_path).sort_by_file_name() {
            let entry = entry.map_err(|e| GuestError::command("copy_to_guest", e.to_string()))?;
            let relative = entry
                .path()
                .strip_prefix(host_path)
                .map_err(|e| GuestError::command("copy_to_guest", e.to_string()))?;
            let target = relative
                .components()
                .fold(guest_path.to_string(), |acc, c| {
                    guest_join(&acc, &c.as_os_str().to_string_lossy())
                });
            if entry.file_type().is_dir() {
                self.vmrun("copy_to_guest", "createDirectoryInGuest", true, &[target.as_str()])?;
            } else {
                let host = entry.path().to_string_lossy();
                self.vmrun("copy_to_guest", "CopyFileFromHostToGuest", true, &[&*host, target.as_str()])?;
            }
        }
        Ok(())
    }

    fn copy_from_guest(&mut self, guest_path: &str, host_path: &Path) -> GuestResult<()> {
        let host = host_path.to_string_lossy();
        self.vmrun("copy_from_guest", "CopyFileFromGuestToHost", true, &[guest_path, &*host])?;
        Ok(())
    }

    fn run_and_wait(&mut self, program: &str, args: &str) -> GuestResult<()> {
        let mut argv = vec!["-activeWindow", "-interactive", program];
        if !args.trim().is_empty() {
            argv.push(args);
        }
        self.vmrun("run_and_wait", "runProgramInGuest", true, &argv)?;
        Ok(())
    }

    fn detach(&mut self, program: &str, args: &str) -> GuestResult<ProcessHandle> {
        let mut argv = vec!["-noWait", "-activeWindow", "-interactive", program];
        if !args.trim().is_empty() {
            argv.push(args);
        }
        self.vmrun("detach", "runProgramInGuest", true, &argv)?;
        Ok(ProcessHandle::new(super::guest_file_name(program), None))
    }

    fn find_process(&mut self, name: &str) -> GuestResult<Option<ProcessHandle>> {
        let out = self.vmrun("find_process", "listProcessesInGuest", true, &[])?;
        Ok(find_in_listing(&out, name).map(|pid| ProcessHandle::new(name, Some(pid))))
    }

    fn kill_process(&mut self, process: &ProcessHandle) -> GuestResult<()> {
        let pid = match process.pid {
            Some(pid) => pid,
            None => self
                .find_process(&process.name)?
                .and_then(|p| p.pid)
                .ok_or_else(|| GuestError::NotFound(process.name.clone()))?,
        };
        self.vmrun("kill_process", "killProcessInGuest", true, &[pid.to_string().as_str()])?;
        Ok(())
    }

    fn capture_screen(&mut self) -> GuestResult<Vec<u8>> {
        self.captures += 1;
        let path = self
            .scratch_dir
            .join(format!("vmrun_capture_{}_{}.png", std::process::id(), self.captures));
        std::fs::create_dir_all(&self.scratch_dir)?;
        let host = path.to_string_lossy().to_string();
        self.vmrun("capture_screen", "captureScreen", true, &[host.as_str()])?;
        let bytes = std::fs::read(&path)?;
        if let Err(err) = std::fs::remove_file(&path) {
            debug!(path = %path.display(), error = %err, "could not remove capture scratch file");
        }
        Ok(bytes)
    }

    fn create_snapshot(&mut self, name: &str, _description: &str) -> GuestResult<SnapshotRef> {
        self.vmrun("create_snapshot", "snapshot", false, &[name])?;
        Ok(SnapshotRef {
            name: name.to_string(),
        })
    }

    fn remove_snapshot(&mut self, name: &str) -> GuestResult<()> {
        match self.vmrun("remove_snapshot", "deleteSnapshot", false, &[name]) {
            Err(GuestError::Command { message, .. }) if is_missing_snapshot(&message) => {
                Err(GuestError::SnapshotNotFound(name.to_string()))
            }
            other => other.map(|_| ()),
        }
    }

    fn revert_snapshot(&mut self, snapshot: &SnapshotRef) -> GuestResult<()> {
        match self.vmrun("revert_snapshot", "revertToSnapshot", false, &[snapshot.name.as_str()]) {
            Err(GuestError::Command { message, .. }) if is_missing_snapshot(&message) => {
                Err(GuestError::SnapshotNotFound(snapshot.name.clone()))
            }
            Err(err) => Err(err),
            Ok(_) => {
                self.credentials = None;
                Ok(())
            }
        }
    }
}

fn parse_exists(output: &str) -> bool {
    let lowered = output.to_ascii_lowercase();
    lowered.contains("exists") && !lowered.contains("does not exist")
}

fn is_missing_snapshot(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("does not exist") || lowered.contains("invalid snapshot name")
}

/// Parse `listDirectoryInGuest` output: a `Directory list: N` header then one name per line
fn parse_directory_listing(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("Directory list:"))
        .map(str::to_string)
        .collect()
}

/// Find the PID of a process named `name` in `listProcessesInGuest` output.
///
/// Lines look like `pid=1234, owner=NT AUTHORITY\SYSTEM, cmd="C:\Program Files\x.exe" -arg`.
fn find_in_listing(output: &str, name: &str) -> Option<u64> {
    let needle = name.to_ascii_lowercase();
    output.lines().find_map(|line| {
        let pid = line
            .trim()
            .strip_prefix("pid=")?
            .split(',')
            .next()?
            .trim()
            .parse()
            .ok()?;
        let cmd = line.split_once("cmd=")?.1.trim().to_ascii_lowercase();
        runs_executable(&cmd, &needle).then_some(pid)
    })
}

/// Whether a lowercased command line starts the executable `name`
fn runs_executable(cmd: &str, name: &str) -> bool {
    let program = match cmd.strip_prefix('"') {
        Some(rest) => rest.split('"').next().unwrap_or(rest),
        None => {
            // Unquoted paths may contain spaces; cut after the first `.exe`
            match cmd.find(".exe") {
                Some(end) => &cmd[..end + 4],
                None => cmd.split_whitespace().next().unwrap_or(cmd),
            }
        }
    };
    super::guest_file_name(program) == name
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "Process list: 3\n\
        pid=4, owner=NT AUTHORITY\\SYSTEM, cmd=System\n\
        pid=2210, owner=CAMPUS\\tester, cmd=C:\\Program Files (x86)\\LANDesk\\LDClient\\SDCLIENT.EXE /policyfile=\"CP012340.xml\"\n\
        pid=3120, owner=CAMPUS\\tester, cmd=\"C:\\pstemp\\hstart64.exe\" /WAIT /UAC\n";

    #[test]
    fn test_find_in_listing() {
        assert_eq!(find_in_listing(LISTING, "SDCLIENT.EXE"), Some(2210));
        assert_eq!(find_in_listing(LISTING, "hstart64.exe"), Some(3120));
        assert_eq!(find_in_listing(LISTING, "PsExec.exe"), None);
    }

    #[test]
    fn test_parse_directory_listing() {
        let out = "Directory list: 2\nCP012340.xml\nCP056780.xml\n";
        assert_eq!(
            parse_directory_listing(out),
            vec!["CP012340.xml".to_string(), "CP056780.xml".to_string()]
        );
    }

    #[test]
    fn test_parse_exists() {
        assert!(parse_exists("The file exists.\n"));
        assert!(!parse_exists("The file does not exist.\n"));
    }

    #[test]
    fn test_host_args_server_mode() {
        let guest = VmrunGuest::new(
            "vmrun",
            "[ds1] win10/win10.vmx",
            HostConnection::Server {
                host: "https://vcenter/sdk".to_string(),
                user: "svc".to_string(),
                password: "secret".to_string(),
            },
        );
        assert_eq!(&guest.host_args()[..2], &["-T".to_string(), "vc".to_string()]);
        assert!(matches!(guest.guest_args(), Err(GuestError::NotLoggedIn)));
    }

    /// A stand-in `vmrun` that writes fixed bytes to its last argument
    #[cfg(unix)]
    fn fake_vmrun(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("vmrun");
        std::fs::write(&script, "#!/bin/sh\nfor last; do :; done\nprintf 'PNGDATA' > \"$last\"\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[cfg(unix)]
    #[test]
    fn test_capture_screen_creates_scratch_dir() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("results/win10/.scratch");
        let mut guest = VmrunGuest::new(fake_vmrun(dir.path()), "/vms/win10.vmx", HostConnection::Workstation)
            .scratch_dir(&scratch);
        guest.credentials = Some(Credentials {
            domain: "CAMPUS".to_string(),
            username: "tester".to_string(),
            password: "pw".to_string(),
        });

        assert_eq!(guest.capture_screen().unwrap(), b"PNGDATA".to_vec());
        assert_eq!(guest.capture_screen().unwrap(), b"PNGDATA".to_vec());
        assert!(scratch.is_dir());
        assert_eq!(std::fs::read_dir(&scratch).unwrap().count(), 0);
    }
}
