//! Run-wide result collection and evidence compilation.

use std::fs;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::capture::{EncodeSettings, ImageEncoder};
use crate::store::ResultRow;
use crate::task::Task;

/// Most frames handed to the encoder per task
pub const DEFAULT_MAX_FRAMES: usize = 250;

/// Thin a frame list to at most `max` entries.
///
/// Above the cap every `ceil(len / max)`-th frame is kept, starting with the
/// first, so relative order is preserved.
pub fn select_frames<T: Clone>(frames: &[T], max: usize) -> Vec<T> {
    if max == 0 {
        return Vec::new();
    }
    if frames.len() <= max {
        return frames.to_vec();
    }
    let stride = frames.len().div_ceil(max);
    frames.iter().step_by(stride).cloned().collect()
}

/// Per-run counts reported at the end of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResultCounts {
    pub tasks: usize,
    pub passed: usize,
    pub failed: usize,
}

/// Owns every task's results and frames for one guest image
#[derive(Debug)]
pub struct ResultAggregator {
    image: String,
    tasks: Vec<Task>,
    max_frames: usize,
}

impl ResultAggregator {
    pub fn new(image: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            image: image.into(),
            tasks,
            max_frames: DEFAULT_MAX_FRAMES,
        }
    }

    pub fn max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// One row per (task, result), in task then production order
    pub fn rows(&self) -> Vec<ResultRow> {
        self.tasks
            .iter()
            .flat_map(|task| {
                task.results
                    .iter()
                    .map(|result| ResultRow::new(&self.image, &task.id, result))
            })
            .collect()
    }

    pub fn counts(&self) -> ResultCounts {
        ResultCounts {
            tasks: self.tasks.len(),
            passed: self.tasks.iter().map(Task::passed_count).sum(),
            failed: self.tasks.iter().map(Task::failed_count).sum(),
        }
    }

    /// Encode each task's frames into `install_<task>.gif` and delete the frames.
    ///
    /// Tasks without frames or a frame directory are skipped. A failed encode is
    /// logged and leaves that task's frames in place. Returns the artifacts
    /// written.
    pub fn compile_evidence(&mut self, encoder: &dyn ImageEncoder, settings: &EncodeSettings) -> Vec<PathBuf> {
        let mut artifacts = Vec::new();

        for task in &mut self.tasks {
            let Some(dir) = task.frame_dir.clone() else {
                continue;
            };
            if task.frames.is_empty() {
                continue;
            }

            let selected = select_frames(&task.frames, self.max_frames);
            let output = dir.join(format!("install_{}.gif", task.id));
            if let Err(err) = encoder.encode(&selected, &output, settings) {
                warn!(task_id = %task.id, error = %err, "gif creation failed");
                continue;
            }

            for frame in task.frames.drain(..) {
                if let Err(err) = fs::remove_file(&frame) {
                    debug!(frame = %frame.display(), error = %err, "could not delete frame");
                }
            }
            info!(task_id = %task.id, frames = selected.len(), output = %output.display(), "gif created");
            artifacts.push(output);
        }
        artifacts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Canvas, GifEncoder};
    use crate::task::{TaskResult, names};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_select_frames_caps_and_keeps_order() {
        for count in [0usize, 1, 250, 251, 500, 10000] {
            let frames: Vec<usize> = (0..count).collect();
            let selected = select_frames(&frames, DEFAULT_MAX_FRAMES);
            assert!(selected.len() <= DEFAULT_MAX_FRAMES, "count {}", count);
            assert!(selected.windows(2).all(|w| w[0] < w[1]), "count {}", count);
            if count <= DEFAULT_MAX_FRAMES {
                assert_eq!(selected.len(), count);
            }
        }
    }

    #[test]
    fn test_select_frames_stride() {
        let frames: Vec<usize> = (0..251).collect();
        let selected = select_frames(&frames, 250);
        assert_eq!(selected.len(), 126);
        assert_eq!(selected[1], 2);
        assert_eq!(select_frames(&(0..10000).collect::<Vec<_>>(), 250).len(), 250);
    }

    #[test]
    fn test_rows_and_counts() {
        let mut task = Task::new("100", "Alpha");
        task.record(TaskResult::pass(names::ENTRY_EXISTS, ""));
        task.record(TaskResult::fail(names::TASK_AVAILABLE, "Policy file not found"));
        let aggregator = ResultAggregator::new("win10", vec![task, Task::new("200", "Beta")]);

        let rows = aggregator.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].test_name, names::TASK_AVAILABLE);
        assert_eq!(
            aggregator.counts(),
            ResultCounts {
                tasks: 2,
                passed: 1,
                failed: 1,
            }
        );
    }

    #[test]
    fn test_compile_evidence_replaces_frames_with_gif() {
        let dir = tempfile::tempdir().unwrap();
        let task_dir = dir.path().join("100");
        fs::create_dir_all(&task_dir).unwrap();

        let mut task = Task::new("100", "Alpha");
        for i in 0..4 {
            let path = task_dir.join(format!("{}.png", i));
            fs::write(&path, Canvas::with_color(8, 8, [i * 40, 0, 0]).to_png().unwrap()).unwrap();
            task.frames.push(path);
        }
        task.frame_dir = Some(task_dir.clone());

        let mut aggregator = ResultAggregator::new("win10", vec![task, Task::new("200", "Beta")]);
        let artifacts = aggregator.compile_evidence(&GifEncoder, &EncodeSettings::default());

        assert_eq!(artifacts, vec![task_dir.join("install_100.gif")]);
        assert!(artifacts[0].exists());
        assert!(!task_dir.join("0.png").exists());
        assert!(aggregator.tasks()[0].frames.is_empty());
    }
}
