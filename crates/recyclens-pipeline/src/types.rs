//! Shared types for the recyclens segmentation pipeline.

use std::fmt;

use ndarray::{Array3, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

/// Re-export `GrayImage` so downstream crates can reference the raw
/// label raster behind a [`ClassMask`] without depending on `image`.
pub use image::GrayImage;

/// Re-export `RgbImage` so downstream crates can reference source photos
/// and rendered artifacts without depending on `image` directly.
pub use image::RgbImage;

/// Class id reserved for background pixels.
pub const BACKGROUND: u8 = 0;

/// An RGB color triple.
pub type Color = [u8; 3];

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Create a new dimensions value.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Total pixel count (`width * height`).
    #[must_use]
    pub const fn pixel_count(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Per-pixel class probabilities with shape `[C, H, W]`.
///
/// Channel 0 is background. Each pixel's values across the class axis
/// sum to 1 (softmax output).
#[derive(Debug, Clone, PartialEq)]
pub struct ProbabilityTensor(Array3<f32>);

impl ProbabilityTensor {
    /// Wrap an already-softmaxed `[C, H, W]` array.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::DimensionMismatch`] if any axis is empty
    /// or there are more classes than a [`ClassMask`] can hold.
    pub fn new(probabilities: Array3<f32>) -> Result<Self, PipelineError> {
        let (classes, height, width) = probabilities.dim();
        if classes == 0 || classes > MAX_CLASSES || height == 0 || width == 0 {
            return Err(PipelineError::DimensionMismatch {
                expected: format!("1..={MAX_CLASSES} classes over a non-empty grid"),
                actual: format!("{classes}x{height}x{width}"),
            });
        }
        Ok(Self(probabilities))
    }

    /// Build a tensor from raw logits by applying softmax along the
    /// class axis.
    ///
    /// # Errors
    ///
    /// Same as [`ProbabilityTensor::new`].
    pub fn from_logits(mut logits: Array3<f32>) -> Result<Self, PipelineError> {
        for mut lane in logits.lanes_mut(Axis(0)) {
            let max = lane.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            lane.mapv_inplace(|v| (v - max).exp());
            let sum: f32 = lane.sum();
            if sum > 0.0 {
                lane.mapv_inplace(|v| v / sum);
            }
        }
        Self::new(logits)
    }

    /// Decode a tensor from little-endian `f32` bytes laid out
    /// class-major (`[C, H, W]`, row-major within each class plane).
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::DimensionMismatch`] if the byte length
    /// does not equal `classes * height * width * 4`.
    pub fn from_le_bytes(
        bytes: &[u8],
        classes: usize,
        height: usize,
        width: usize,
    ) -> Result<Self, PipelineError> {
        Self::new(array_from_le_bytes(bytes, classes, height, width)?)
    }

    /// Like [`ProbabilityTensor::from_le_bytes`], but the bytes hold raw
    /// logits and softmax is applied.
    ///
    /// # Errors
    ///
    /// Same as [`ProbabilityTensor::from_le_bytes`].
    pub fn from_le_logit_bytes(
        bytes: &[u8],
        classes: usize,
        height: usize,
        width: usize,
    ) -> Result<Self, PipelineError> {
        Self::from_logits(array_from_le_bytes(bytes, classes, height, width)?)
    }

    /// Number of classes (including background).
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.0.dim().0
    }

    /// Spatial dimensions of the tensor.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn dimensions(&self) -> Dimensions {
        let (_, height, width) = self.0.dim();
        Dimensions::new(width as u32, height as u32)
    }

    /// Probability of `class_id` at pixel `(x, y)`.
    #[must_use]
    pub fn confidence(&self, class_id: u8, x: u32, y: u32) -> f32 {
        self.0[[usize::from(class_id), y as usize, x as usize]]
    }

    /// Borrow the underlying array.
    #[must_use]
    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.0.view()
    }
}

/// Maximum number of classes representable by a [`ClassMask`].
pub const MAX_CLASSES: usize = 256;

fn array_from_le_bytes(
    bytes: &[u8],
    classes: usize,
    height: usize,
    width: usize,
) -> Result<Array3<f32>, PipelineError> {
    let expected = classes * height * width * 4;
    if bytes.len() != expected {
        return Err(PipelineError::DimensionMismatch {
            expected: format!("{expected} bytes for {classes}x{height}x{width} f32"),
            actual: format!("{} bytes", bytes.len()),
        });
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Array3::from_shape_vec((classes, height, width), values).map_err(|e| {
        PipelineError::DimensionMismatch {
            expected: format!("{classes}x{height}x{width}"),
            actual: e.to_string(),
        }
    })
}

/// Per-pixel class assignment, one `u8` class id per pixel.
///
/// Backed by a [`GrayImage`] so the label raster can flow directly
/// through `image` and `imageproc` operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassMask(GrayImage);

impl ClassMask {
    /// An all-background mask.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self(GrayImage::new(width, height))
    }

    /// Wrap an existing label raster.
    #[must_use]
    pub const fn from_image(image: GrayImage) -> Self {
        Self(image)
    }

    /// Build a mask by evaluating `f(x, y)` for every pixel.
    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> u8) -> Self {
        Self(GrayImage::from_fn(width, height, |x, y| image::Luma([f(x, y)])))
    }

    /// Per-pixel argmax over the class axis.
    ///
    /// Ties resolve to the lowest class id.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_probabilities(probabilities: &ProbabilityTensor) -> Self {
        let view = probabilities.view();
        let Dimensions { width, height } = probabilities.dimensions();
        Self::from_fn(width, height, |x, y| {
            let lane = view.slice(ndarray::s![.., y as usize, x as usize]);
            let mut best = 0usize;
            let mut best_value = f32::NEG_INFINITY;
            for (class, &value) in lane.iter().enumerate() {
                if value > best_value {
                    best = class;
                    best_value = value;
                }
            }
            best as u8
        })
    }

    /// Class id at `(x, y)`.
    #[must_use]
    pub fn class_at(&self, x: u32, y: u32) -> u8 {
        self.0.get_pixel(x, y).0[0]
    }

    /// Assign `class_id` to `(x, y)`.
    pub fn set(&mut self, x: u32, y: u32, class_id: u8) {
        self.0.put_pixel(x, y, image::Luma([class_id]));
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.0.width()
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.0.height()
    }

    /// Mask dimensions.
    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.0.width(), self.0.height())
    }

    /// Borrow the label raster.
    #[must_use]
    pub const fn as_image(&self) -> &GrayImage {
        &self.0
    }

    /// Consume the mask and return the label raster.
    #[must_use]
    pub fn into_image(self) -> GrayImage {
        self.0
    }

    /// Binary sub-mask for one class: 255 where the pixel is `class_id`,
    /// 0 everywhere else.
    #[must_use]
    pub fn binary(&self, class_id: u8) -> GrayImage {
        GrayImage::from_fn(self.0.width(), self.0.height(), |x, y| {
            image::Luma([if self.class_at(x, y) == class_id { 255 } else { 0 }])
        })
    }

    /// Returns `true` if every pixel is background.
    #[must_use]
    pub fn is_all_background(&self) -> bool {
        self.0.pixels().all(|p| p.0[0] == BACKGROUND)
    }
}

/// Aggregated footprint of one class in the final mask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    /// Class id in the catalog.
    pub class_id: u8,
    /// Human-readable class name.
    pub class_name: String,
    /// Number of mask pixels assigned to this class.
    pub pixel_count: u64,
    /// `pixel_count / total_pixels * 100`.
    pub percentage: f64,
}

impl DetectionRecord {
    /// Percentage rounded to one decimal place, for display.
    #[must_use]
    pub fn rounded_percentage(&self) -> f64 {
        (self.percentage * 10.0).round() / 10.0
    }
}

/// Errors that can occur during pipeline processing.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The input image bytes were empty.
    #[error("input image data is empty")]
    EmptyInput,

    /// Failed to decode the input image.
    #[error("failed to decode image: {0}")]
    DecodeError(#[from] image::ImageError),

    /// A tensor's shape does not match what the pipeline expects.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// What the pipeline expected.
        expected: String,
        /// What it received.
        actual: String,
    },

    /// The segmentation model is absent or failed.
    #[error("inference unavailable: {0}")]
    InferenceUnavailable(String),

    /// Pipeline configuration is invalid.
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),
}
