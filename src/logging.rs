//! tracing subscriber setup for the binary.

use std::fs::{self, File};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "deploy_harness=info";

/// Log file for a run started now: `<dir>/<YYYY-MM-DD_hh-mm-ss-AM>.txt`
pub fn log_file_path(dir: &Path) -> PathBuf {
    dir.join(format!("{}.txt", chrono::Local::now().format("%Y-%m-%d_%I-%M-%S-%p")))
}

/// Install the global subscriber, writing to stderr or to `log_file`.
///
/// Fails if a subscriber is already installed.
pub fn init(log_file: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = File::create(path)?;
            let layer = fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(false);
            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
        None => {
            let layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(std::io::stderr().is_terminal())
                .with_target(false);
            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_path_is_timestamped() {
        let path = log_file_path(Path::new("/share/log"));
        assert_eq!(path.parent(), Some(Path::new("/share/log")));
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with("M.txt"));
        assert_eq!(name.len(), "2024-01-01_01-02-03-PM.txt".len());
    }
}
