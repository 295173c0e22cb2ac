//! On-disk layout of a run's results and publishing them to a share.
//!
//! Each run writes under `<results>/<image>/`:
//! - `.run.json` with run metadata
//! - one directory per deployed task holding its frames and GIF
//! - `log/` for recovery files when no share is configured

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;
use walkdir::WalkDir;

/// Result directory for one run against one guest image
#[derive(Debug, Clone)]
pub struct RunLayout {
    /// Image name the results belong to
    pub image: String,

    /// `<results>/<image>`
    pub dir: PathBuf,

    /// Optional share the finished directory is copied to
    pub share: Option<PathBuf>,
}

impl RunLayout {
    pub fn new(results_dir: &Path, image: &str) -> Self {
        Self {
            image: image.to_string(),
            dir: results_dir.join(sanitize_name(image)),
            share: None,
        }
    }

    pub fn with_share(mut self, share: Option<PathBuf>) -> Self {
        self.share = share;
        self
    }

    /// Create the run directory and write its metadata
    pub fn init(&self, machine_id: &str) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        let metadata = serde_json::json!({
            "image": self.image,
            "machine_id": machine_id,
            "host": hostname::get().map(|h| h.to_string_lossy().into_owned()).unwrap_or_default(),
            "started": chrono::Utc::now().to_rfc3339(),
        });
        fs::write(self.dir.join(".run.json"), serde_json::to_string_pretty(&metadata)?)?;
        Ok(())
    }

    /// Directory holding a task's frames and GIF
    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.dir.join(sanitize_name(task_id))
    }

    /// Where recovery files and log files go: the share's `log/` if configured
    pub fn log_dir(&self) -> PathBuf {
        match &self.share {
            Some(share) => share.join("log"),
            None => self.dir.join("log"),
        }
    }

    /// Copy the run directory into `<share>/<image>`; returns files copied
    pub fn publish(&self) -> std::io::Result<usize> {
        let Some(share) = &self.share else {
            return Ok(0);
        };
        let target = share.join(sanitize_name(&self.image));
        let copied = copy_tree(&self.dir, &target)?;
        info!(target = %target.display(), files = copied, "results published");
        Ok(copied)
    }
}

/// Recursively copy `src` into `dst`, overwriting existing files
pub fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(std::io::Error::other)?;
        let Ok(relative) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Sanitize a name for use as a directory name
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = RunLayout::new(Path::new("/results"), "Win 10 x64");
        assert_eq!(layout.dir, PathBuf::from("/results/Win_10_x64"));
        assert_eq!(layout.task_dir("1234"), PathBuf::from("/results/Win_10_x64/1234"));
        assert_eq!(layout.log_dir(), PathBuf::from("/results/Win_10_x64/log"));

        let shared = layout.with_share(Some(PathBuf::from("/share")));
        assert_eq!(shared.log_dir(), PathBuf::from("/share/log"));
    }

    #[test]
    fn test_publish_copies_tree() {
        let results = tempfile::tempdir().unwrap();
        let share = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(results.path(), "win10").with_share(Some(share.path().to_path_buf()));
        layout.init("PC-7").unwrap();
        fs::create_dir_all(layout.task_dir("100")).unwrap();
        fs::write(layout.task_dir("100").join("install_100.gif"), b"GIF89a").unwrap();

        let copied = layout.publish().unwrap();
        assert_eq!(copied, 2);
        assert!(share.path().join("win10/100/install_100.gif").exists());
        assert!(share.path().join("win10/.run.json").exists());
    }

    #[test]
    fn test_publish_without_share_is_noop() {
        let results = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(results.path(), "win10");
        assert_eq!(layout.publish().unwrap(), 0);
    }
}
