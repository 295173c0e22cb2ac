//! Visual evidence: guest screenshots and their compilation into a GIF.

pub mod canvas;
pub mod encoder;

pub use canvas::Canvas;
pub use encoder::{EncodeSettings, GifEncoder, ImageEncoder};

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::guest::{GuestControl, GuestError};

/// Result type for capture and encoding
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Errors from capturing or encoding frames
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("screen capture failed: {0}")]
    Guest(#[from] GuestError),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid encoder settings: {0}")]
    Settings(String),
}

/// Saves guest screenshots as numbered frames under one directory
#[derive(Debug)]
pub struct FrameRecorder {
    dir: PathBuf,
    next_index: usize,
}

impl FrameRecorder {
    /// Start recording into `dir`, creating it if needed
    pub fn new(dir: impl Into<PathBuf>) -> CaptureResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, next_index: 0 })
    }

    /// Index the next frame will get
    pub fn next_index(&self) -> usize {
        self.next_index
    }

    /// Capture one frame named `<index>.png` and return its path
    pub fn capture(&mut self, guest: &mut dyn GuestControl) -> CaptureResult<PathBuf> {
        let path = self.dir.join(format!("{}.png", self.next_index));
        save_screen(guest, &path)?;
        self.next_index += 1;
        Ok(path)
    }
}

/// Capture the guest screen to `path`
pub fn save_screen(guest: &mut dyn GuestControl, path: &Path) -> CaptureResult<()> {
    let png = guest.capture_screen()?;
    fs::write(path, png)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::ScriptedGuest;

    #[test]
    fn test_frames_are_numbered_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut guest = ScriptedGuest::logged_in();
        let mut recorder = FrameRecorder::new(dir.path().join("1234")).unwrap();

        let frames: Vec<PathBuf> = (0..3).map(|_| recorder.capture(&mut guest).unwrap()).collect();

        let names: Vec<String> = frames
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["0.png", "1.png", "2.png"]);
        assert!(frames.iter().all(|p| p.starts_with(dir.path().join("1234")) && p.exists()));
        assert_eq!(recorder.next_index(), 3);
    }
}
