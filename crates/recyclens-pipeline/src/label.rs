//! Label text measuring and drawing.
//!
//! # Strategy pattern
//!
//! The visualizer only needs two things from a font: how big a string
//! will be and how to put it on a canvas. [`LabelPainter`] captures
//! that, and [`LabelFont`] selects between a loaded outline font and a
//! small built-in bitmap face that needs no font file.

use std::fmt;

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

use crate::types::PipelineError;

/// Measures and draws label text.
pub trait LabelPainter {
    /// Width and height of `text` in pixels.
    fn measure(&self, text: &str) -> (u32, u32);

    /// Draw `text` with its top-left corner at `(x, y)`. Pixels outside
    /// the canvas are clipped.
    fn paint(&self, canvas: &mut RgbImage, x: i32, y: i32, text: &str, color: Rgb<u8>);
}

/// Font used for class labels.
#[derive(Clone)]
pub enum LabelFont {
    /// An outline font rendered through `imageproc` at a pixel scale.
    Glyph {
        /// Parsed font.
        font: FontArc,
        /// Pixel height.
        scale: PxScale,
    },
    /// Built-in 5x7 bitmap face, each dot drawn as a `scale` x `scale`
    /// square.
    Bitmap {
        /// Integer magnification.
        scale: u32,
    },
}

impl LabelFont {
    /// Magnification of the default bitmap face.
    pub const DEFAULT_BITMAP_SCALE: u32 = 2;

    /// Parse a TrueType/OpenType font from owned bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if the bytes are not a
    /// usable font.
    pub fn from_bytes(bytes: Vec<u8>, scale: f32) -> Result<Self, PipelineError> {
        let font = FontArc::try_from_vec(bytes)
            .map_err(|e| PipelineError::InvalidConfig(format!("invalid label font: {e}")))?;
        Ok(Self::Glyph {
            font,
            scale: PxScale::from(scale),
        })
    }
}

impl Default for LabelFont {
    fn default() -> Self {
        Self::Bitmap {
            scale: Self::DEFAULT_BITMAP_SCALE,
        }
    }
}

impl fmt::Debug for LabelFont {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Glyph { scale, .. } => f
                .debug_struct("Glyph")
                .field("scale", &scale.y)
                .finish_non_exhaustive(),
            Self::Bitmap { scale } => f.debug_struct("Bitmap").field("scale", scale).finish(),
        }
    }
}

impl LabelPainter for LabelFont {
    fn measure(&self, text: &str) -> (u32, u32) {
        match self {
            Self::Glyph { font, scale } => text_size(*scale, font, text),
            Self::Bitmap { scale } => bitmap_size(text, *scale),
        }
    }

    fn paint(&self, canvas: &mut RgbImage, x: i32, y: i32, text: &str, color: Rgb<u8>) {
        match self {
            Self::Glyph { font, scale } => draw_text_mut(canvas, color, x, y, *scale, font, text),
            Self::Bitmap { scale } => paint_bitmap(canvas, x, y, text, *scale, color),
        }
    }
}

const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;
const GLYPH_ADVANCE: u32 = GLYPH_WIDTH + 1;

fn bitmap_size(text: &str, scale: u32) -> (u32, u32) {
    let count = u32::try_from(text.chars().count()).unwrap_or(u32::MAX);
    if count == 0 {
        return (0, 0);
    }
    let width = count.saturating_mul(GLYPH_ADVANCE).saturating_sub(1);
    (width.saturating_mul(scale), GLYPH_HEIGHT * scale)
}

#[allow(clippy::cast_possible_wrap)]
fn paint_bitmap(canvas: &mut RgbImage, x: i32, y: i32, text: &str, scale: u32, color: Rgb<u8>) {
    // A zero-sized dot is not a valid rect.
    if scale == 0 {
        return;
    }
    let step = scale as i32;
    for (i, ch) in text.chars().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let origin_x = x + (i as i32) * (GLYPH_ADVANCE as i32) * step;
        for (row, bits) in glyph(ch).iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if bits & (1 << (GLYPH_WIDTH - 1 - col)) == 0 {
                    continue;
                }
                #[allow(clippy::cast_possible_truncation)]
                let dot = Rect::at(origin_x + col as i32 * step, y + row as i32 * step)
                    .of_size(scale, scale);
                draw_filled_rect_mut(canvas, dot, color);
            }
        }
    }
}

/// Rows of a 5x7 glyph, most significant of the low five bits leftmost.
/// Letters render in upper case; unsupported characters render as `?`.
const fn glyph(ch: char) -> [u8; 7] {
    match ch.to_ascii_uppercase() {
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1E],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x0A, 0x04, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        '_' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        ' ' => [0x00; 7],
        _ => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x00, 0x04],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_measure_scales_with_length() {
        let font = LabelFont::Bitmap { scale: 1 };
        assert_eq!(font.measure(""), (0, 0));
        assert_eq!(font.measure("a"), (5, 7));
        assert_eq!(font.measure("can"), (17, 7));
        let font = LabelFont::Bitmap { scale: 2 };
        assert_eq!(font.measure("can"), (34, 14));
    }

    #[test]
    fn bitmap_paint_stays_within_measured_bounds() {
        let font = LabelFont::Bitmap { scale: 2 };
        let mut canvas = RgbImage::new(60, 30);
        let (w, h) = font.measure("glass");
        font.paint(&mut canvas, 3, 4, "glass", Rgb([255, 255, 255]));
        let mut painted = 0;
        for (x, y, p) in canvas.enumerate_pixels() {
            if p.0 == [255, 255, 255] {
                painted += 1;
                assert!(x >= 3 && x < 3 + w, "x={x} outside label");
                assert!(y >= 4 && y < 4 + h, "y={y} outside label");
            }
        }
        assert!(painted > 0);
    }

    #[test]
    fn bitmap_paint_clips_at_canvas_edge() {
        let font = LabelFont::Bitmap { scale: 3 };
        let mut canvas = RgbImage::new(10, 10);
        font.paint(&mut canvas, -5, -5, "paper", Rgb([1, 2, 3]));
        font.paint(&mut canvas, 8, 8, "vinyl", Rgb([1, 2, 3]));
    }

    #[test]
    fn zero_scale_measures_and_paints_nothing() {
        let font = LabelFont::Bitmap { scale: 0 };
        assert_eq!(font.measure("glass"), (0, 0));
        let mut canvas = RgbImage::new(20, 20);
        font.paint(&mut canvas, 2, 2, "glass", Rgb([9, 9, 9]));
        assert!(canvas.pixels().all(|p| p.0 == [0, 0, 0]));
    }

    #[test]
    fn space_paints_nothing() {
        let font = LabelFont::default();
        let mut canvas = RgbImage::new(20, 20);
        font.paint(&mut canvas, 0, 0, "  ", Rgb([9, 9, 9]));
        assert!(canvas.pixels().all(|p| p.0 == [0, 0, 0]));
    }

    #[test]
    fn invalid_font_bytes_rejected() {
        let result = LabelFont::from_bytes(vec![0, 1, 2, 3], 18.0);
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn debug_hides_font_data() {
        let text = format!("{:?}", LabelFont::default());
        assert_eq!(text, "Bitmap { scale: 2 }");
    }
}
