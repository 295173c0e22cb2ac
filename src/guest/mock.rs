//! In-memory guest for tests and dry runs.
//!
//! `ScriptedGuest` models just enough of a Windows guest to exercise the
//! orchestrator: processes that live for a scripted number of liveness checks,
//! a small file system, snapshots that restore that file system, a session that
//! is closed by every revert, and registry exports with scripted line counts.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;

use super::{
    Credentials, GuestControl, GuestError, GuestResult, ProcessHandle, SnapshotRef, guest_file_name,
    guest_join,
};
use crate::capture::canvas::Canvas;

/// How long a scripted program stays visible once started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// Visible for this many `find_process` lookups, then gone
    Polls(u32),
    /// Never exits on its own
    Forever,
    /// Never becomes visible
    Never,
}

/// Observable side effects, in the order they happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestEvent {
    PoweredOn,
    LoggedIn,
    LoginRejected,
    SnapshotCreated(String),
    SnapshotRemoved(String),
    Reverted(String),
    Detached { program: String, args: String },
    Ran { program: String, args: String },
    Killed(String),
}

#[derive(Debug, Clone)]
struct RunningProcess {
    name: String,
    remaining: Option<u32>,
    pid: u64,
}

#[derive(Debug, Clone, Default)]
struct FileSystem {
    files: HashMap<String, String>,
    directories: HashMap<String, Vec<String>>,
}

/// Scripted guest implementing [`GuestControl`]
#[derive(Debug, Default)]
pub struct ScriptedGuest {
    programs: HashMap<String, (String, Lifetime)>,
    running: Vec<RunningProcess>,
    fs: FileSystem,
    snapshots: HashMap<String, FileSystem>,
    fact_counts: VecDeque<usize>,
    last_fact_count: usize,
    faults: HashMap<&'static str, u32>,
    login_failures: u32,
    powered_on: bool,
    tools_ready: bool,
    logged_in: bool,
    next_pid: u64,
    frames_captured: u32,
    events: Vec<GuestEvent>,
}

fn key(s: &str) -> String {
    s.trim_matches('"').to_ascii_lowercase()
}

impl ScriptedGuest {
    /// A powered-off guest
    pub fn new() -> Self {
        Self {
            next_pid: 1000,
            ..Default::default()
        }
    }

    /// A guest that is already powered on with an open session
    pub fn logged_in() -> Self {
        let mut guest = Self::new();
        guest.powered_on = true;
        guest.tools_ready = true;
        guest.logged_in = true;
        guest
    }

    /// Script how long `name` stays alive whenever it is started
    pub fn with_program(mut self, name: &str, lifetime: Lifetime) -> Self {
        self.programs.insert(key(name), (name.to_string(), lifetime));
        self
    }

    pub fn with_file(mut self, guest_path: &str) -> Self {
        self.fs.files.insert(key(guest_path), String::new());
        self
    }

    pub fn with_directory(mut self, guest_path: &str, entries: &[&str]) -> Self {
        self.fs.directories.insert(
            key(guest_path),
            entries.iter().map(|e| e.to_string()).collect(),
        );
        self
    }

    /// Line counts returned by successive registry exports; the last one repeats
    pub fn with_fact_counts(mut self, counts: impl IntoIterator<Item = usize>) -> Self {
        self.fact_counts.extend(counts);
        self
    }

    pub fn with_snapshot(mut self, name: &str) -> Self {
        self.snapshots.insert(name.to_string(), self.fs.clone());
        self
    }

    /// Reject the next `count` login attempts
    pub fn with_login_failures(mut self, count: u32) -> Self {
        self.login_failures = count;
        self
    }

    /// Make the next `count` calls of operation `op` fail
    pub fn with_fault(mut self, op: &'static str, count: u32) -> Self {
        self.faults.insert(op, count);
        self
    }

    pub fn events(&self) -> &[GuestEvent] {
        &self.events
    }

    pub fn revert_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, GuestEvent::Reverted(_)))
            .count()
    }

    pub fn is_powered_on(&self) -> bool {
        self.powered_on
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    pub fn frames_captured(&self) -> u32 {
        self.frames_captured
    }

    pub fn has_snapshot(&self, name: &str) -> bool {
        self.snapshots.contains_key(name)
    }

    fn take_fault(&mut self, op: &'static str) -> GuestResult<()> {
        if let Some(count) = self.faults.get_mut(op) {
            if *count > 0 {
                *count -= 1;
                return Err(GuestError::command(op, "injected fault"));
            }
        }
        Ok(())
    }

    fn require_session(&mut self, op: &'static str) -> GuestResult<()> {
        if !self.logged_in {
            return Err(GuestError::NotLoggedIn);
        }
        self.take_fault(op)
    }

    fn spawn(&mut self, name: &str) -> Option<u64> {
        let lifetime = self
            .programs
            .get(&key(name))
            .map(|(_, lifetime)| *lifetime)
            .unwrap_or(Lifetime::Polls(1));
        let remaining = match lifetime {
            Lifetime::Never => return None,
            Lifetime::Forever => None,
            Lifetime::Polls(n) => Some(n),
        };
        self.next_pid += 1;
        self.running.push(RunningProcess {
            name: name.to_string(),
            remaining,
            pid: self.next_pid,
        });
        Some(self.next_pid)
    }

    fn next_fact_count(&mut self) -> usize {
        if let Some(count) = self.fact_counts.pop_front() {
            self.last_fact_count = count;
        }
        self.last_fact_count
    }
}

impl GuestControl for ScriptedGuest {
    fn power_on(&mut self) -> GuestResult<()> {
        self.take_fault("power_on")?;
        self.powered_on = true;
        self.events.push(GuestEvent::PoweredOn);
        Ok(())
    }

    fn wait_for_tools(&mut self) -> GuestResult<()> {
        if !self.powered_on {
            return Err(GuestError::command("wait_for_tools", "guest is powered off"));
        }
        self.take_fault("wait_for_tools")?;
        self.tools_ready = true;
        Ok(())
    }

    fn login(&mut self, _credentials: &Credentials) -> GuestResult<()> {
        if !self.tools_ready {
            return Err(GuestError::command("login", "guest tools not running"));
        }
        if self.login_failures > 0 {
            self.login_failures -= 1;
            self.events.push(GuestEvent::LoginRejected);
            return Err(GuestError::command("login", "logon failure"));
        }
        self.logged_in = true;
        self.events.push(GuestEvent::LoggedIn);
        Ok(())
    }

    fn file_exists(&mut self, guest_path: &str) -> GuestResult<bool> {
        self.require_session("file_exists")?;
        Ok(self.fs.files.contains_key(&key(guest_path)))
    }

    fn directory_exists(&mut self, guest_path: &str) -> GuestResult<bool> {
        self.require_session("directory_exists")?;
        Ok(self.fs.directories.contains_key(&key(guest_path)))
    }

    fn list_directory(&mut self, guest_path: &str) -> GuestResult<Vec<String>> {
        self.require_session("list_directory")?;
        self.fs
            .directories
            .get(&key(guest_path))
            .cloned()
            .ok_or_else(|| GuestError::NotFound(guest_path.to_string()))
    }

    fn delete_file(&mut self, guest_path: &str) -> GuestResult<()> {
        self.require_session("delete_file")?;
        self.fs
            .files
            .remove(&key(guest_path))
            .map(|_| ())
            .ok_or_else(|| GuestError::NotFound(guest_path.to_string()))
    }

    fn delete_directory(&mut self, guest_path: &str) -> GuestResult<()> {
        self.require_session("delete_directory")?;
        let dir = key(guest_path);
        if self.fs.directories.remove(&dir).is_none() {
            return Err(GuestError::NotFound(guest_path.to_string()));
        }
        let prefix = format!("{}\\", dir.trim_end_matches('\\'));
        self.fs.files.retain(|path, _| !path.starts_with(&prefix));
        Ok(())
    }

    fn copy_to_guest(&mut self, host_path: &Path, guest_path: &str) -> GuestResult<()> {
        self.require_session("copy_to_guest")?;
        if host_path.is_dir() {
            let mut entries = Vec::new();
            for entry in fs::read_dir(host_path)? {
                let name = entry?.file_name().to_string_lossy().to_string();
                self.fs
                    .files
                    .insert(key(&guest_join(guest_path, &name)), String::new());
                entries.push(name);
            }
            entries.sort();
            self.fs.directories.insert(key(guest_path), entries);
        } else {
            let contents = fs::read_to_string(host_path)?;
            self.fs.files.insert(key(guest_path), contents);
        }
        Ok(())
    }

    fn copy_from_guest(&mut self, guest_path: &str, host_path: &Path) -> GuestResult<()> {
        self.require_session("copy_from_guest")?;
        let contents = self
            .fs
            .files
            .get(&key(guest_path))
            .ok_or_else(|| GuestError::NotFound(guest_path.to_string()))?;
        fs::write(host_path, contents)?;
        Ok(())
    }

    fn run_and_wait(&mut self, program: &str, args: &str) -> GuestResult<()> {
        self.require_session("run_and_wait")?;
        self.events.push(GuestEvent::Ran {
            program: program.to_string(),
            args: args.to_string(),
        });

        let is_export = guest_file_name(program).eq_ignore_ascii_case("reg.exe")
            && args.trim_start().starts_with("export");
        if is_export {
            let target = args.rsplit(' ').next().unwrap_or_default().to_string();
            let lines = self.next_fact_count();
            let contents: String = (0..lines).map(|i| format!("\"entry{}\"=\"\"\n", i)).collect();
            self.fs.files.insert(key(&target), contents);
        }
        Ok(())
    }

    fn detach(&mut self, program: &str, args: &str) -> GuestResult<ProcessHandle> {
        self.require_session("detach")?;
        self.events.push(GuestEvent::Detached {
            program: program.to_string(),
            args: args.to_string(),
        });

        let name = guest_file_name(program).to_string();
        let pid = self.spawn(&name);

        // Anything scripted that appears in the arguments is a child of the launch
        let lowered_args = args.to_ascii_lowercase();
        let children: Vec<String> = self
            .programs
            .iter()
            .filter(|(k, _)| **k != key(&name) && lowered_args.contains(k.as_str()))
            .map(|(_, (display, _))| display.clone())
            .collect();
        for child in children {
            self.spawn(&child);
        }

        Ok(ProcessHandle::new(name, pid))
    }

    fn find_process(&mut self, name: &str) -> GuestResult<Option<ProcessHandle>> {
        self.require_session("find_process")?;
        while let Some(idx) = self
            .running
            .iter()
            .position(|p| p.name.eq_ignore_ascii_case(name))
        {
            if self.running[idx].remaining == Some(0) {
                self.running.remove(idx);
                continue;
            }
            let process = &mut self.running[idx];
            if let Some(n) = process.remaining.as_mut() {
                *n -= 1;
            }
            return Ok(Some(ProcessHandle::new(process.name.clone(), Some(process.pid))));
        }
        Ok(None)
    }

    fn kill_process(&mut self, process: &ProcessHandle) -> GuestResult<()> {
        self.require_session("kill_process")?;
        let before = self.running.len();
        self.running
            .retain(|p| !p.name.eq_ignore_ascii_case(&process.name));
        if self.running.len() == before {
            return Err(GuestError::NotFound(process.name.clone()));
        }
        self.events.push(GuestEvent::Killed(process.name.clone()));
        Ok(())
    }

    fn capture_screen(&mut self) -> GuestResult<Vec<u8>> {
        if !self.powered_on {
            return Err(GuestError::command("capture_screen", "guest is powered off"));
        }
        self.take_fault("capture_screen")?;
        self.frames_captured += 1;

        let mut canvas = Canvas::with_color(64, 32, [0, 64, 128]);
        canvas.draw_text(2, 2, &format!("#{}", self.frames_captured), [255, 255, 255], [0, 64, 128]);
        canvas
            .to_png()
            .map_err(|e| GuestError::command("capture_screen", e.to_string()))
    }

    fn create_snapshot(&mut self, name: &str, _description: &str) -> GuestResult<SnapshotRef> {
        self.take_fault("create_snapshot")?;
        self.snapshots.insert(name.to_string(), self.fs.clone());
        self.events.push(GuestEvent::SnapshotCreated(name.to_string()));
        Ok(SnapshotRef {
            name: name.to_string(),
        })
    }

    fn remove_snapshot(&mut self, name: &str) -> GuestResult<()> {
        self.take_fault("remove_snapshot")?;
        if self.snapshots.remove(name).is_none() {
            return Err(GuestError::SnapshotNotFound(name.to_string()));
        }
        self.events.push(GuestEvent::SnapshotRemoved(name.to_string()));
        Ok(())
    }

    fn revert_snapshot(&mut self, snapshot: &SnapshotRef) -> GuestResult<()> {
        self.take_fault("revert_snapshot")?;
        let state = self
            .snapshots
            .get(&snapshot.name)
            .cloned()
            .ok_or_else(|| GuestError::SnapshotNotFound(snapshot.name.clone()))?;
        self.fs = state;
        self.running.clear();
        self.powered_on = false;
        self.tools_ready = false;
        self.logged_in = false;
        self.events.push(GuestEvent::Reverted(snapshot.name.clone()));
        Ok(())
    }
}
