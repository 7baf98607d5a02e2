//! Geometric normalization of arbitrary photos into the model input.
//!
//! Phone photos arrive at any resolution and aspect ratio. This module
//! turns one into a fixed-size square, channel-first `f32` tensor and
//! records where in the source that square came from, so results can be
//! mapped back onto the original photo.
//!
//! # Steps
//!
//! 1. Proportional Lanczos downscale if the longest side exceeds
//!    `max_dimension`.
//! 2. Square crop of side `min(w, h)`, horizontally centered. Portrait
//!    crops are shifted up by `side / portrait_shift_divisor` (clamped
//!    at the top edge) since handheld shots tend to frame the item above
//!    center. [`CropMode::Stretch`] skips the crop.
//! 3. Lanczos resize to `model_input_size` squared.
//! 4. Contrast, sharpness, then saturation adjustment.
//! 5. Channel-first tensor with values in `[0, 1]`.
//!
//! Steps 1 and 2 are pure geometry and are exposed separately as
//! [`plan_geometry`].

use image::imageops::{self, FilterType};
use ndarray::Array3;
use serde::{Deserialize, Serialize};

use crate::config::{CropMode, PreprocessParams};
use crate::enhance;
use crate::types::{ClassMask, Dimensions, PipelineError, RgbImage};

/// Decode raw image bytes (PNG, JPEG, BMP, WebP) into an RGB raster.
///
/// # Errors
///
/// Returns [`PipelineError::EmptyInput`] if `bytes` is empty.
/// Returns [`PipelineError::DecodeError`] if the image format is
/// unrecognized or the data is corrupt.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, PipelineError> {
    if bytes.is_empty() {
        return Err(PipelineError::EmptyInput);
    }
    let img = image::load_from_memory(bytes)?;
    Ok(img.to_rgb8())
}

/// An axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRegion {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl CropRegion {
    /// The whole of an image.
    #[must_use]
    pub const fn full(dimensions: Dimensions) -> Self {
        Self {
            x: 0,
            y: 0,
            width: dimensions.width,
            height: dimensions.height,
        }
    }

    /// Map a region from a scaled image back to its source.
    #[must_use]
    fn scale_to(self, from: Dimensions, to: Dimensions) -> Self {
        let sx = f64::from(to.width) / f64::from(from.width);
        let sy = f64::from(to.height) / f64::from(from.height);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let scale = |v: u32, s: f64, limit: u32| ((f64::from(v) * s).round() as u32).min(limit);
        let x = scale(self.x, sx, to.width);
        let y = scale(self.y, sy, to.height);
        let right = scale(self.x + self.width, sx, to.width);
        let bottom = scale(self.y + self.height, sy, to.height);
        Self {
            x,
            y,
            width: right.saturating_sub(x).max(1),
            height: bottom.saturating_sub(y).max(1),
        }
    }
}

/// Resolution changes and crop decided for one photo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryPlan {
    /// Size after the initial downscale (equal to the source size when
    /// no downscale is needed).
    pub scaled: Dimensions,
    /// Crop within the downscaled image.
    pub crop: CropRegion,
    /// The same crop expressed in source-image pixels.
    pub source_crop: CropRegion,
}

/// Decide the downscale and crop for a `width` x `height` photo.
#[must_use]
pub fn plan_geometry(width: u32, height: u32, params: &PreprocessParams) -> GeometryPlan {
    let source = Dimensions::new(width, height);
    let longest = width.max(height);
    let scaled = if longest > params.max_dimension {
        let scale = f64::from(params.max_dimension) / f64::from(longest);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let shrink = |v: u32| ((f64::from(v) * scale) as u32).max(1);
        Dimensions::new(shrink(width), shrink(height))
    } else {
        source
    };

    let crop = match params.crop_mode {
        CropMode::Stretch => CropRegion::full(scaled),
        CropMode::CenterSquare => {
            let side = scaled.width.min(scaled.height);
            let left = (scaled.width - side) / 2;
            let mut top = (scaled.height - side) / 2;
            if scaled.height > scaled.width && params.portrait_shift_divisor > 0 {
                top = top.saturating_sub(side / params.portrait_shift_divisor);
            }
            CropRegion {
                x: left,
                y: top,
                width: side,
                height: side,
            }
        }
    };

    let source_crop = if scaled == source {
        crop
    } else {
        crop.scale_to(scaled, source)
    };

    GeometryPlan {
        scaled,
        crop,
        source_crop,
    }
}

/// Output of [`preprocess`].
#[derive(Debug, Clone)]
pub struct Preprocessed {
    /// Model input, shape `[3, S, S]`, values in `[0, 1]`.
    pub tensor: Array3<f32>,
    /// The enhanced `S x S` raster the tensor was built from.
    pub model_view: RgbImage,
    /// Size of the photo before any processing.
    pub original_size: Dimensions,
    /// Region of the original photo the model sees.
    pub crop: CropRegion,
}

/// Normalize a decoded photo into the fixed-size model input.
#[must_use]
pub fn preprocess(image: &RgbImage, params: &PreprocessParams) -> Preprocessed {
    let original_size = Dimensions::new(image.width(), image.height());
    let plan = plan_geometry(image.width(), image.height(), params);
    tracing::debug!(
        original = %original_size,
        scaled = %plan.scaled,
        crop = ?plan.crop,
        "planned preprocessing geometry",
    );

    let scaled = if plan.scaled == original_size {
        image.clone()
    } else {
        imageops::resize(
            image,
            plan.scaled.width,
            plan.scaled.height,
            FilterType::Lanczos3,
        )
    };

    let crop = plan.crop;
    let cropped = if crop == CropRegion::full(plan.scaled) {
        scaled
    } else {
        imageops::crop_imm(&scaled, crop.x, crop.y, crop.width, crop.height).to_image()
    };

    let size = params.model_input_size;
    let resized = if cropped.dimensions() == (size, size) {
        cropped
    } else {
        imageops::resize(&cropped, size, size, FilterType::Lanczos3)
    };

    let enhanced = enhance::contrast(&resized, params.contrast);
    let enhanced = enhance::sharpness(&enhanced, params.sharpness);
    let enhanced = enhance::saturation(&enhanced, params.saturation);

    Preprocessed {
        tensor: to_tensor(&enhanced),
        model_view: enhanced,
        original_size,
        crop: plan.source_crop,
    }
}

/// Channel-first `[3, H, W]` tensor with values scaled to `[0, 1]`.
#[must_use]
pub fn to_tensor(image: &RgbImage) -> Array3<f32> {
    let (w, h) = image.dimensions();
    Array3::from_shape_fn((3, h as usize, w as usize), |(c, y, x)| {
        #[allow(clippy::cast_possible_truncation)]
        let p = image.get_pixel(x as u32, y as u32);
        f32::from(p.0[c]) / 255.0
    })
}

/// Resize a mask to `original_size` with nearest-neighbor sampling.
///
/// Class ids are labels, not intensities, so they are never
/// interpolated.
#[must_use]
pub fn rescale_mask(mask: &ClassMask, original_size: Dimensions) -> ClassMask {
    if mask.dimensions() == original_size {
        return mask.clone();
    }
    ClassMask::from_image(imageops::resize(
        mask.as_image(),
        original_size.width,
        original_size.height,
        FilterType::Nearest,
    ))
}

/// Place a model-resolution mask back onto the source canvas.
///
/// The mask is stretched over `crop` and everything outside the crop is
/// background.
#[must_use]
pub fn restore_mask(mask: &ClassMask, crop: CropRegion, original_size: Dimensions) -> ClassMask {
    let inner = rescale_mask(mask, Dimensions::new(crop.width, crop.height));
    let mut canvas = ClassMask::new(original_size.width, original_size.height);
    for (x, y, pixel) in inner.as_image().enumerate_pixels() {
        let (cx, cy) = (crop.x + x, crop.y + y);
        if cx < original_size.width && cy < original_size.height {
            canvas.set(cx, cy, pixel.0[0]);
        }
    }
    canvas
}
