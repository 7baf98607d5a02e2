//! Photo quality adjustments applied to the model input.
//!
//! Each adjustment is a linear interpolation between the image and a
//! "degenerate" version of it: `degenerate * (1 - f) + image * f`,
//! rounded and clamped to `[0, 255]`. A factor of 1.0 returns the image unchanged,
//! 0.0 returns the degenerate image, and values above 1.0 extrapolate
//! away from it.
//!
//! | Adjustment | Degenerate image                               |
//! |------------|------------------------------------------------|
//! | contrast   | uniform gray at the image's mean luma           |
//! | sharpness  | 3x3 smoothed image, border pixels left as-is    |
//! | saturation | luma-only grayscale                             |

use image::{Rgb, RgbImage};
use imageproc::filter::filter3x3;

/// Luma of an RGB pixel using ITU-R 601 weights, rounded.
#[must_use]
pub fn luma(pixel: Rgb<u8>) -> u8 {
    let [r, g, b] = pixel.0;
    let weighted = u32::from(r) * 299 + u32::from(g) * 587 + u32::from(b) * 114;
    // Max is 255_000, so the rounded quotient always fits in a u8.
    #[allow(clippy::cast_possible_truncation)]
    let value = ((weighted + 500) / 1000) as u8;
    value
}

/// Scale contrast around the mean luma.
#[must_use = "returns the adjusted image"]
pub fn contrast(image: &RgbImage, factor: f32) -> RgbImage {
    let count = u64::from(image.width()) * u64::from(image.height());
    if count == 0 {
        return image.clone();
    }
    let total: u64 = image.pixels().map(|p| u64::from(luma(*p))).sum();
    #[allow(clippy::cast_precision_loss)]
    let mean = (total as f64 / count as f64 + 0.5).floor();
    #[allow(clippy::cast_possible_truncation)]
    let mean = mean as f32;
    blend_with(image, factor, |_, _| [mean; 3])
}

/// Scale sharpness relative to a smoothed copy.
#[must_use = "returns the adjusted image"]
pub fn sharpness(image: &RgbImage, factor: f32) -> RgbImage {
    let smoothed = smooth(image);
    blend_with(image, factor, |x, y| {
        smoothed.get_pixel(x, y).0.map(f32::from)
    })
}

/// Scale color saturation relative to the grayscale image.
#[must_use = "returns the adjusted image"]
pub fn saturation(image: &RgbImage, factor: f32) -> RgbImage {
    blend_with(image, factor, |x, y| {
        [f32::from(luma(*image.get_pixel(x, y))); 3]
    })
}

/// Interpolate every pixel between `degenerate(x, y)` and the image.
fn blend_with(
    image: &RgbImage,
    factor: f32,
    degenerate: impl Fn(u32, u32) -> [f32; 3],
) -> RgbImage {
    if (factor - 1.0).abs() < f32::EPSILON {
        return image.clone();
    }
    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let source = image.get_pixel(x, y).0;
        let base = degenerate(x, y);
        Rgb(std::array::from_fn(|c| {
            let value = (f32::from(source[c]) - base[c]).mul_add(factor, base[c]);
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let out = value.round().clamp(0.0, 255.0) as u8;
            out
        }))
    })
}

/// 3x3 smoothing with kernel `[1 1 1; 1 5 1; 1 1 1] / 13`.
///
/// The outermost row and column on each side are copied unchanged.
fn smooth(image: &RgbImage) -> RgbImage {
    const W: f32 = 1.0 / 13.0;
    const KERNEL: [f32; 9] = [W, W, W, W, 5.0 * W, W, W, W, W];

    let (w, h) = image.dimensions();
    if w < 3 || h < 3 {
        return image.clone();
    }
    let filtered = filter3x3::<_, f32, f32>(image, &KERNEL);
    RgbImage::from_fn(w, h, |x, y| {
        if x == 0 || y == 0 || x == w - 1 || y == h - 1 {
            return *image.get_pixel(x, y);
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let px = filtered
            .get_pixel(x, y)
            .0
            .map(|v| v.round().clamp(0.0, 255.0) as u8);
        Rgb(px)
    })
}
