//! Plain-text fallback for results the sink could not take.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use super::ResultRow;
use crate::task::Task;

/// Recovery file named after the local time it was written
#[derive(Debug, Clone)]
pub struct RecoveryFile {
    path: PathBuf,
}

impl RecoveryFile {
    /// `<dir>/<YYYY-MM-DD_hh-mm-ss-AM>.txt`
    pub fn in_dir(dir: &Path) -> Self {
        let stamp = chrono::Local::now().format("%Y-%m-%d_%I-%M-%S-%p");
        Self {
            path: dir.join(format!("{}.txt", stamp)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one `taskId,image,resultName,resultCode,message` line per result
    pub fn write_all(&self, image: &str, tasks: &[Task]) -> std::io::Result<usize> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(File::create(&self.path)?);
        let mut lines = 0;
        for task in tasks {
            for result in &task.results {
                writeln!(out, "{}", format_line(&ResultRow::new(image, &task.id, result)))?;
                lines += 1;
            }
        }
        out.flush()?;
        warn!(path = %self.path.display(), lines, "results written to recovery file");
        Ok(lines)
    }
}

fn format_line(row: &ResultRow) -> String {
    // One record per line
    let message = row.message.replace(['\r', '\n'], " ");
    format!("{},{},{},{},{}", row.task_id, row.image, row.test_name, row.result, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskResult, names};

    #[test]
    fn test_writes_one_line_per_result() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = Task::new("100", "Alpha");
        task.record(TaskResult::pass(names::ENTRY_EXISTS, ""));
        task.record(TaskResult::fail(names::TEST_SUITE_ERROR, "guest went away\nhard"));

        let file = RecoveryFile::in_dir(&dir.path().join("log"));
        assert_eq!(file.write_all("win10", &[task]).unwrap(), 2);

        let text = fs::read_to_string(file.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["100,win10,Entry Exists,1,", "100,win10,Test Suite Error,0,guest went away hard"]);
        assert!(file.path().extension().is_some_and(|e| e == "txt"));
    }
}
