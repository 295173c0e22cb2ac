//! Run configuration: a TOML file plus environment overrides.
//!
//! # Environment Variables
//!
//! | Variable | Description |
//! |----------|-------------|
//! | `DEPLOY_HARNESS_CONFIG` | Config file path when `--config` is not given |
//! | `DEPLOY_HARNESS_PASSWORD` | Guest account password |
//! | `DEPLOY_HARNESS_HOST_PASSWORD` | Hypervisor host password (server mode) |
//! | `DEPLOY_HARNESS_RESULTS_DIR` | Local results directory |
//! | `DEPLOY_HARNESS_SHARE_DIR` | Share the results are published to |
//!
//! # Example
//!
//! ```toml
//! machine_id = "4711"
//!
//! [guest]
//! domain = "CAMPUS"
//! username = "deploytest"
//! vmx = "/vms/win10/win10.vmx"
//!
//! [database]
//! tasks = "/srv/harness/tasks.db"
//! inventory = "/srv/harness/inventory.db"
//!
//! [run]
//! tests_per_snapshot = 5
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::guest::{Credentials, HostConnection};

// ============================================================================
// Default Values
// ============================================================================

/// Checkpoint snapshot name
pub const DEFAULT_SNAPSHOT_NAME: &str = "deployPoint";

/// Screenshot interval while a deployment runs (milliseconds)
pub const DEFAULT_CAPTURE_INTERVAL_MS: u64 = 3000;

/// Maximum deployment duration (seconds)
pub const DEFAULT_MAX_TASK_DURATION_SECS: u64 = 60 * 60;

/// How long a probed executable is watched (seconds)
pub const DEFAULT_EXE_WAIT_SECS: u64 = 60;

/// How long process cleanup may take before it is abandoned (seconds)
pub const DEFAULT_CLEANUP_WAIT_SECS: u64 = 30;

/// Completed tasks per snapshot before a proactive revert
pub const DEFAULT_TESTS_PER_SNAPSHOT: u32 = 5;

/// Pause between failed login attempts (milliseconds)
pub const DEFAULT_LOGIN_RETRY_DELAY_MS: u64 = 1000;

/// Liveness check spacing (milliseconds)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Upper bound for liveness check backoff (milliseconds)
pub const DEFAULT_POLL_MAX_INTERVAL_MS: u64 = 500;

/// Most frames per GIF
pub const DEFAULT_FRAME_CAP: usize = 250;

/// Display time per GIF frame (milliseconds)
pub const DEFAULT_FRAME_DELAY_MS: u64 = 100;

/// Local results directory
pub const DEFAULT_RESULTS_DIR: &str = "results";

/// Host directory holding the launcher and elevator
pub const DEFAULT_HOST_HELPER_DIR: &str = "pstemp";

/// Guest directory the helpers are copied to
pub const DEFAULT_GUEST_HELPER_DIR: &str = r"C:\pstemp";

pub const DEFAULT_LAUNCHER: &str = "hstart64.exe";
pub const DEFAULT_ELEVATOR: &str = "PsExec.exe";

pub const DEFAULT_VMRUN: &str = "vmrun";

pub const DEFAULT_DEPLOY_CLIENT: &str = r"C:\Program Files (x86)\LANDesk\LDClient\SDCLIENT.EXE";
pub const DEFAULT_POLICY_SYNC: &str = r"C:\Program Files (x86)\LANDesk\LDClient\PolicySync.exe";
pub const DEFAULT_POLICY_DIR: &str = r"C:\ProgramData\LANDesk\Policies";
pub const DEFAULT_REG_EXE: &str = r"C:\Windows\System32\Reg.exe";
pub const DEFAULT_FACT_KEY: &str = r"HKEY_LOCAL_MACHINE\SOFTWARE\LANdesk\SOFTWARE";
pub const DEFAULT_POWERSHELL: &str = r"C:\Windows\System32\WindowsPowerShell\v1.0\powershell.exe";

// ============================================================================
// Environment Variable Names
// ============================================================================

/// Environment variable for the config file path
pub const ENV_CONFIG: &str = "DEPLOY_HARNESS_CONFIG";

/// Environment variable for the guest password
pub const ENV_PASSWORD: &str = "DEPLOY_HARNESS_PASSWORD";

/// Environment variable for the host password
pub const ENV_HOST_PASSWORD: &str = "DEPLOY_HARNESS_HOST_PASSWORD";

/// Environment variable for the results directory
pub const ENV_RESULTS_DIR: &str = "DEPLOY_HARNESS_RESULTS_DIR";

/// Environment variable for the share directory
pub const ENV_SHARE_DIR: &str = "DEPLOY_HARNESS_SHARE_DIR";

/// Errors loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("missing required setting '{0}'")]
    Missing(&'static str),

    #[error("invalid setting '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Full run configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Machine whose assigned tasks are tested
    pub machine_id: String,

    /// Name results are stored under (defaults to the vmx file stem)
    pub image_name: Option<String>,

    pub guest: GuestSettings,
    pub host: HostSettings,
    pub database: DatabaseSettings,
    pub paths: PathSettings,
    pub client: ClientSettings,
    pub run: RunSettings,
    pub evidence: EvidenceSettings,
}

/// Guest account and VM location
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuestSettings {
    pub domain: String,
    pub username: String,
    pub password: String,

    /// Path to the VM's .vmx file
    pub vmx: String,

    /// vmrun executable
    pub vmrun: String,
}

/// Hypervisor host; only used in server mode
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    /// Connect to a server host instead of local Workstation
    pub use_server: bool,
    pub hostname: String,
    pub user: String,
    pub password: String,
}

/// SQLite databases
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Task assignments
    pub tasks: PathBuf,

    /// Software inventory; results are written here too
    pub inventory: PathBuf,
}

/// Host and guest directories
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub results_dir: PathBuf,

    /// Share the results directory is published to
    pub share_dir: Option<PathBuf>,

    /// Host directory with the launcher and elevator
    pub host_helper_dir: PathBuf,

    pub guest_helper_dir: String,
    pub launcher: String,
    pub elevator: String,
}

/// Deployment client locations on the guest
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub deploy_client: String,
    pub policy_sync: String,
    pub policy_dir: String,
    pub reg_exe: String,
    pub fact_key: String,
    pub powershell: String,

    /// Closed after each completed deployment
    pub dialog_processes: Vec<String>,

    /// Closed after each executable probe
    pub leftover_processes: Vec<String>,
}

/// Timing and retry policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub snapshot_name: String,
    pub tests_per_snapshot: u32,
    pub capture_interval_ms: u64,
    pub max_task_duration_secs: u64,
    pub exe_wait_secs: u64,
    pub cleanup_wait_secs: u64,
    pub poll_interval_ms: u64,
    pub poll_max_interval_ms: u64,
    pub login_retry_delay_ms: u64,

    /// Give up logging in after this many attempts (absent = never)
    pub login_max_attempts: Option<u32>,

    /// Give up retrying a task after this many retries (absent = never)
    pub max_task_retries: Option<u32>,
}

/// GIF evidence settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvidenceSettings {
    pub frame_cap: usize,
    pub frame_delay_ms: u64,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from(DEFAULT_RESULTS_DIR),
            share_dir: None,
            host_helper_dir: PathBuf::from(DEFAULT_HOST_HELPER_DIR),
            guest_helper_dir: DEFAULT_GUEST_HELPER_DIR.to_string(),
            launcher: DEFAULT_LAUNCHER.to_string(),
            elevator: DEFAULT_ELEVATOR.to_string(),
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            deploy_client: DEFAULT_DEPLOY_CLIENT.to_string(),
            policy_sync: DEFAULT_POLICY_SYNC.to_string(),
            policy_dir: DEFAULT_POLICY_DIR.to_string(),
            reg_exe: DEFAULT_REG_EXE.to_string(),
            fact_key: DEFAULT_FACT_KEY.to_string(),
            powershell: DEFAULT_POWERSHELL.to_string(),
            dialog_processes: vec!["htmldialog".to_string()],
            leftover_processes: vec!["javaw".to_string(), "java".to_string()],
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            snapshot_name: DEFAULT_SNAPSHOT_NAME.to_string(),
            tests_per_snapshot: DEFAULT_TESTS_PER_SNAPSHOT,
            capture_interval_ms: DEFAULT_CAPTURE_INTERVAL_MS,
            max_task_duration_secs: DEFAULT_MAX_TASK_DURATION_SECS,
            exe_wait_secs: DEFAULT_EXE_WAIT_SECS,
            cleanup_wait_secs: DEFAULT_CLEANUP_WAIT_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            poll_max_interval_ms: DEFAULT_POLL_MAX_INTERVAL_MS,
            login_retry_delay_ms: DEFAULT_LOGIN_RETRY_DELAY_MS,
            login_max_attempts: None,
            max_task_retries: None,
        }
    }
}

impl Default for EvidenceSettings {
    fn default() -> Self {
        Self {
            frame_cap: DEFAULT_FRAME_CAP,
            frame_delay_ms: DEFAULT_FRAME_DELAY_MS,
        }
    }
}

impl Default for GuestSettings {
    fn default() -> Self {
        Self {
            domain: String::new(),
            username: String::new(),
            password: String::new(),
            vmx: String::new(),
            vmrun: DEFAULT_VMRUN.to_string(),
        }
    }
}

impl Config {
    /// Parse TOML text without touching the environment
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Read a config file, apply environment overrides and validate
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&text)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Let the environment override secrets and directories
    pub fn apply_env(&mut self) {
        if let Ok(password) = env::var(ENV_PASSWORD) {
            self.guest.password = password;
        }
        if let Ok(password) = env::var(ENV_HOST_PASSWORD) {
            self.host.password = password;
        }
        if let Ok(dir) = env::var(ENV_RESULTS_DIR) {
            self.paths.results_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = env::var(ENV_SHARE_DIR) {
            self.paths.share_dir = Some(PathBuf::from(dir));
        }
    }

    /// Check required settings and value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        require(&self.machine_id, "machine_id")?;
        require(&self.guest.domain, "guest.domain")?;
        require(&self.guest.username, "guest.username")?;
        require(&self.guest.password, "guest.password")?;
        require(&self.guest.vmx, "guest.vmx")?;
        if self.database.tasks.as_os_str().is_empty() {
            return Err(ConfigError::Missing("database.tasks"));
        }
        if self.database.inventory.as_os_str().is_empty() {
            return Err(ConfigError::Missing("database.inventory"));
        }
        if self.host.use_server {
            require(&self.host.hostname, "host.hostname")?;
            require(&self.host.user, "host.user")?;
            require(&self.host.password, "host.password")?;
        }

        if self.run.tests_per_snapshot == 0 {
            return Err(invalid("run.tests_per_snapshot", "must be at least 1"));
        }
        if self.run.capture_interval_ms == 0 {
            return Err(invalid("run.capture_interval_ms", "must be positive"));
        }
        if self.run.poll_interval_ms == 0 || self.run.poll_max_interval_ms < self.run.poll_interval_ms {
            return Err(invalid(
                "run.poll_interval_ms",
                "must be positive and not above run.poll_max_interval_ms",
            ));
        }
        if self.run.login_max_attempts == Some(0) {
            return Err(invalid("run.login_max_attempts", "must be at least 1"));
        }
        if self.evidence.frame_cap == 0 {
            return Err(invalid("evidence.frame_cap", "must be at least 1"));
        }
        if self.evidence.frame_delay_ms == 0 {
            return Err(invalid("evidence.frame_delay_ms", "must be positive"));
        }
        Ok(())
    }

    /// Image name results are stored under
    pub fn image_name(&self) -> String {
        if let Some(name) = self.image_name.as_ref().filter(|n| !n.is_empty()) {
            return name.clone();
        }
        // vmx paths may come from either platform
        let file = self.guest.vmx.rsplit(['/', '\\']).next().unwrap_or_default();
        file.strip_suffix(".vmx").unwrap_or(file).to_string()
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            domain: self.guest.domain.clone(),
            username: self.guest.username.clone(),
            password: self.guest.password.clone(),
        }
    }

    pub fn host_connection(&self) -> HostConnection {
        if self.host.use_server {
            HostConnection::Server {
                host: self.host.hostname.clone(),
                user: self.host.user.clone(),
                password: self.host.password.clone(),
            }
        } else {
            HostConnection::Workstation
        }
    }

    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.run.capture_interval_ms)
    }

    pub fn max_task_duration(&self) -> Duration {
        Duration::from_secs(self.run.max_task_duration_secs)
    }
}

fn require(value: &str, key: &'static str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        Err(ConfigError::Missing(key))
    } else {
        Ok(())
    }
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
machine_id = "4711"

[guest]
domain = "CAMPUS"
username = "deploytest"
password = "secret"
vmx = '/vms/win10/Win10-x64.vmx'

[database]
tasks = "tasks.db"
inventory = "inventory.db"
"#;

    #[test]
    fn test_defaults_fill_unset_sections() {
        let config = Config::from_toml(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.run.snapshot_name, DEFAULT_SNAPSHOT_NAME);
        assert_eq!(config.capture_interval(), Duration::from_millis(3000));
        assert_eq!(config.max_task_duration(), Duration::from_secs(3600));
        assert_eq!(config.evidence.frame_cap, 250);
        assert_eq!(config.paths.guest_helper_dir, r"C:\pstemp");
        assert_eq!(config.client.leftover_processes, vec!["javaw", "java"]);
        assert!(config.run.login_max_attempts.is_none());
        assert!(matches!(config.host_connection(), HostConnection::Workstation));
        assert_eq!(config.guest.vmrun, DEFAULT_VMRUN);
        assert_eq!(GuestSettings::default().vmrun, DEFAULT_VMRUN);
        assert_eq!(config.run.cleanup_wait_secs, DEFAULT_CLEANUP_WAIT_SECS);
    }

    #[test]
    fn test_image_name_defaults_to_vmx_stem() {
        let mut config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.image_name(), "Win10-x64");
        config.guest.vmx = r"D:\VMs\Win7\Win7.vmx".to_string();
        assert_eq!(config.image_name(), "Win7");
        config.image_name = Some("custom".to_string());
        assert_eq!(config.image_name(), "custom");
    }

    #[test]
    fn test_missing_required_key() {
        let text = MINIMAL.replace("password = \"secret\"", "");
        let err = Config::from_toml(&text).unwrap().validate().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("guest.password")));
    }

    #[test]
    fn test_server_mode_requires_host_credentials() {
        let text = format!("{}\n[host]\nuse_server = true\nhostname = \"esx01\"\n", MINIMAL);
        let err = Config::from_toml(&text).unwrap().validate().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("host.user")));
    }

    #[test]
    fn test_rejects_zero_threshold() {
        let text = format!("{}\n[run]\ntests_per_snapshot = 0\n", MINIMAL);
        let err = Config::from_toml(&text).unwrap().validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "run.tests_per_snapshot", .. }));
    }

    #[test]
    fn test_load_reports_missing_file() {
        let err = Config::load(Path::new("/nonexistent/harness.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
