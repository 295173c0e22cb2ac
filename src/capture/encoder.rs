//! Animated GIF encoding of captured frames.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;

use image::codecs::gif::{GifEncoder as GifWriter, Repeat};
use image::{Delay, Frame};
use tracing::debug;

use super::{CaptureError, CaptureResult};

/// Largest palette a GIF frame can carry
pub const GIF_PALETTE_SIZE: u16 = 256;

/// Playback and quantization settings for an encoded artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeSettings {
    /// How long each frame is shown
    pub delay_per_frame: Duration,

    /// Number of times the animation plays (0 = forever)
    pub loop_count: u16,

    /// Colors per frame after quantization
    pub palette_size: u16,

    /// Spend more effort on quantization
    pub optimize: bool,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            delay_per_frame: Duration::from_millis(100),
            loop_count: 1,
            palette_size: GIF_PALETTE_SIZE,
            optimize: true,
        }
    }
}

impl EncodeSettings {
    pub fn validate(&self) -> CaptureResult<()> {
        if self.palette_size != GIF_PALETTE_SIZE {
            return Err(CaptureError::Settings(format!(
                "palette size {} unsupported; frames are quantized to {} colors",
                self.palette_size, GIF_PALETTE_SIZE
            )));
        }
        if self.delay_per_frame.is_zero() {
            return Err(CaptureError::Settings("frame delay must be positive".to_string()));
        }
        Ok(())
    }
}

/// Turns an ordered frame list into one artifact
pub trait ImageEncoder {
    fn encode(&self, frames: &[PathBuf], output: &Path, settings: &EncodeSettings) -> CaptureResult<()>;
}

/// [`ImageEncoder`] producing animated GIFs with the `image` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct GifEncoder;

impl ImageEncoder for GifEncoder {
    fn encode(&self, frames: &[PathBuf], output: &Path, settings: &EncodeSettings) -> CaptureResult<()> {
        settings.validate()?;
        if frames.is_empty() {
            return Err(CaptureError::Settings("no frames to encode".to_string()));
        }

        // NeuQuant speed: 1 is slowest and best, 30 fastest
        let speed = if settings.optimize { 10 } else { 30 };
        let writer = BufWriter::new(File::create(output)?);
        let mut gif = GifWriter::new_with_speed(writer, speed);

        // Without a loop extension the animation plays exactly once
        match settings.loop_count {
            1 => {}
            0 => gif.set_repeat(Repeat::Infinite)?,
            n => gif.set_repeat(Repeat::Finite(n - 1))?,
        }

        let delay_ms = u32::try_from(settings.delay_per_frame.as_millis()).unwrap_or(u32::MAX);
        let delay = Delay::from_numer_denom_ms(delay_ms, 1);
        for path in frames {
            let rgba = image::open(path)?.to_rgba8();
            gif.encode_frame(Frame::from_parts(rgba, 0, 0, delay))?;
        }

        debug!(frames = frames.len(), output = %output.display(), "gif written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Canvas;

    fn write_frames(dir: &Path, count: usize) -> Vec<PathBuf> {
        (0..count)
            .map(|i| {
                let path = dir.join(format!("{}.png", i));
                let mut canvas = Canvas::with_color(16, 16, [0, 0, 0]);
                canvas.fill_rect(0, 0, 4 * i as u32, 4, [255, 0, 0]);
                std::fs::write(&path, canvas.to_png().unwrap()).unwrap();
                path
            })
            .collect()
    }

    #[test]
    fn test_encode_writes_gif() {
        let dir = tempfile::tempdir().unwrap();
        let frames = write_frames(dir.path(), 3);
        let output = dir.path().join("install_1234.gif");

        GifEncoder
            .encode(&frames, &output, &EncodeSettings::default())
            .unwrap();

        let bytes = std::fs::read(&output).unwrap();
        assert_eq!(&bytes[0..6], b"GIF89a");
    }

    #[test]
    fn test_rejects_unsupported_palette() {
        let settings = EncodeSettings {
            palette_size: 16,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(CaptureError::Settings(_))));
    }

    #[test]
    fn test_rejects_empty_frame_list() {
        let dir = tempfile::tempdir().unwrap();
        let result = GifEncoder.encode(&[], &dir.path().join("x.gif"), &EncodeSettings::default());
        assert!(result.is_err());
        assert!(!dir.path().join("x.gif").exists());
    }
}
