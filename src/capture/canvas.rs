//! Small RGB drawing surface used to render synthetic guest screens.

use font8x8::{BASIC_FONTS, UnicodeFonts};
use image::{ImageOutputFormat, Rgb, RgbImage};
use std::io::Cursor;

use super::CaptureResult;

/// Width and height of one font8x8 glyph
const GLYPH: u32 = 8;

/// An RGB image with rectangle and text primitives
#[derive(Debug, Clone)]
pub struct Canvas {
    image: RgbImage,
}

impl Canvas {
    /// Black canvas
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbImage::new(width, height),
        }
    }

    pub fn with_color(width: u32, height: u32, color: [u8; 3]) -> Self {
        Self {
            image: RgbImage::from_pixel(width, height, Rgb(color)),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Pixel color, black outside the canvas
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        if x >= self.width() || y >= self.height() {
            return [0, 0, 0];
        }
        self.image.get_pixel(x, y).0
    }

    /// Fill a rectangle, clipped to the canvas
    pub fn fill_rect(&mut self, x: u32, y: u32, w: u32, h: u32, color: [u8; 3]) {
        for py in y..(y + h).min(self.height()) {
            for px in x..(x + w).min(self.width()) {
                self.image.put_pixel(px, py, Rgb(color));
            }
        }
    }

    /// Draw a single line of text; glyphs past the right edge are dropped
    pub fn draw_text(&mut self, x: u32, y: u32, text: &str, fg: [u8; 3], bg: [u8; 3]) {
        for (i, ch) in text.chars().enumerate() {
            let gx = x + i as u32 * GLYPH;
            if gx >= self.width() {
                break;
            }
            let glyph = BASIC_FONTS.get(ch).unwrap_or([0u8; 8]);
            for (row, bits) in glyph.iter().enumerate() {
                for bit in 0..GLYPH {
                    // font8x8 stores the leftmost pixel in the lowest bit
                    let color = if (bits >> bit) & 1 == 1 { fg } else { bg };
                    let (px, py) = (gx + bit, y + row as u32);
                    if px < self.width() && py < self.height() {
                        self.image.put_pixel(px, py, Rgb(color));
                    }
                }
            }
        }
    }

    /// Encode as PNG
    pub fn to_png(&self) -> CaptureResult<Vec<u8>> {
        let mut bytes = Vec::new();
        self.image
            .write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_rect_is_clipped() {
        let mut canvas = Canvas::new(10, 10);
        canvas.fill_rect(5, 5, 20, 20, [255, 0, 0]);
        assert_eq!(canvas.pixel(4, 4), [0, 0, 0]);
        assert_eq!(canvas.pixel(9, 9), [255, 0, 0]);
        assert_eq!(canvas.pixel(50, 50), [0, 0, 0]);
    }

    #[test]
    fn test_draw_text_sets_foreground() {
        let mut canvas = Canvas::new(16, 8);
        canvas.draw_text(0, 0, "H", [255, 255, 255], [0, 0, 0]);
        let lit = (0..8)
            .flat_map(|y| (0..8).map(move |x| (x, y)))
            .filter(|&(x, y)| canvas.pixel(x, y) == [255, 255, 255])
            .count();
        assert!(lit > 0);
    }

    #[test]
    fn test_png_magic() {
        let png = Canvas::with_color(4, 4, [1, 2, 3]).to_png().unwrap();
        assert_eq!(&png[0..4], &[0x89, 0x50, 0x4E, 0x47]);
    }
}
