//! Pipeline configuration: class catalog, numeric parameters, presets.
//!
//! Everything here is built once before serving traffic and then only
//! read. [`PipelineConfig::new`] is the single validation point; the
//! per-request stages assume a validated config and never re-check it.

use serde::{Deserialize, Serialize};

use crate::label::LabelFont;
use crate::types::{Color, MAX_CLASSES, PipelineError};

/// Ordered class names and their palette colors, indexed by class id.
///
/// Index 0 is background. Its palette entry is unused by the renderer,
/// which draws background with [`RenderParams::background_color`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassCatalog {
    /// Class names, index 0 = background.
    pub names: Vec<String>,
    /// One RGB color per class id.
    pub palette: Vec<Color>,
}

/// Class names shared by both presets.
const CLASS_NAMES: [&str; 7] = [
    "background",
    "can",
    "glass",
    "paper",
    "plastic",
    "styrofoam",
    "vinyl",
];

impl ClassCatalog {
    /// Saturated palette used for uncontrolled handheld photos.
    #[must_use]
    pub fn photo() -> Self {
        Self::with_palette(vec![
            [0, 0, 0],
            [255, 69, 0],
            [50, 205, 50],
            [30, 144, 255],
            [255, 20, 147],
            [255, 215, 0],
            [138, 43, 226],
        ])
    }

    /// Palette used for photos that arrive already cropped to the item.
    #[must_use]
    pub fn cropped() -> Self {
        Self::with_palette(vec![
            [0, 0, 0],
            [220, 20, 60],
            [0, 128, 0],
            [0, 0, 205],
            [255, 140, 0],
            [0, 206, 209],
            [148, 0, 211],
        ])
    }

    fn with_palette(palette: Vec<Color>) -> Self {
        Self {
            names: CLASS_NAMES.iter().map(|s| (*s).to_string()).collect(),
            palette,
        }
    }

    /// Number of classes, including background.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns `true` if the catalog has no classes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Name of `class_id`, or `"unknown"` for ids outside the catalog.
    #[must_use]
    pub fn name(&self, class_id: u8) -> &str {
        self.names
            .get(usize::from(class_id))
            .map_or("unknown", String::as_str)
    }

    /// Palette color of `class_id`, black for ids outside the catalog.
    #[must_use]
    pub fn color(&self, class_id: u8) -> Color {
        self.palette
            .get(usize::from(class_id))
            .copied()
            .unwrap_or([0, 0, 0])
    }

    /// Check the catalog's structural invariants.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if the catalog is empty,
    /// names and palette differ in length, or it holds more classes than
    /// a `u8` mask can address.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.names.is_empty() {
            return Err(invalid("class catalog is empty"));
        }
        if self.names.len() != self.palette.len() {
            return Err(invalid(format!(
                "{} class names but {} palette colors",
                self.names.len(),
                self.palette.len()
            )));
        }
        if self.names.len() > MAX_CLASSES {
            return Err(invalid(format!(
                "{} classes exceeds the maximum of {MAX_CLASSES}",
                self.names.len()
            )));
        }
        Ok(())
    }
}

impl Default for ClassCatalog {
    fn default() -> Self {
        Self::photo()
    }
}

/// How the photo is squared off before resizing to the model input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CropMode {
    /// Crop the largest centered square, nudged upward for portraits.
    #[default]
    CenterSquare,
    /// Resize the full frame without cropping.
    Stretch,
}

/// Geometric normalization and quality adjustment before inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessParams {
    /// Longest side allowed before the initial proportional downscale.
    pub max_dimension: u32,
    /// Side of the square model input (and expected model output).
    pub model_input_size: u32,
    /// Squaring strategy.
    pub crop_mode: CropMode,
    /// Portrait crops move up by `crop_side / portrait_shift_divisor`.
    /// Zero disables the shift.
    pub portrait_shift_divisor: u32,
    /// Contrast enhancement factor (1.0 = unchanged).
    pub contrast: f32,
    /// Sharpness enhancement factor (1.0 = unchanged).
    pub sharpness: f32,
    /// Saturation enhancement factor (1.0 = unchanged).
    pub saturation: f32,
}

impl PreprocessParams {
    /// Default ceiling for the longest side.
    pub const DEFAULT_MAX_DIMENSION: u32 = 2048;
    /// Default model input side.
    pub const DEFAULT_MODEL_INPUT_SIZE: u32 = 512;
    /// Default portrait shift divisor.
    pub const DEFAULT_PORTRAIT_SHIFT_DIVISOR: u32 = 6;
    /// Default contrast factor.
    pub const DEFAULT_CONTRAST: f32 = 1.2;
    /// Default sharpness factor.
    pub const DEFAULT_SHARPNESS: f32 = 1.1;
    /// Default saturation factor.
    pub const DEFAULT_SATURATION: f32 = 1.1;

    fn validate(&self) -> Result<(), PipelineError> {
        if self.max_dimension == 0 {
            return Err(invalid("max_dimension must be positive"));
        }
        if self.model_input_size == 0 {
            return Err(invalid("model_input_size must be positive"));
        }
        for (name, value) in [
            ("contrast", self.contrast),
            ("sharpness", self.sharpness),
            ("saturation", self.saturation),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(format!(
                    "{name} must be a finite non-negative factor, got {value}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for PreprocessParams {
    fn default() -> Self {
        Self {
            max_dimension: Self::DEFAULT_MAX_DIMENSION,
            model_input_size: Self::DEFAULT_MODEL_INPUT_SIZE,
            crop_mode: CropMode::default(),
            portrait_shift_divisor: Self::DEFAULT_PORTRAIT_SHIFT_DIVISOR,
            contrast: Self::DEFAULT_CONTRAST,
            sharpness: Self::DEFAULT_SHARPNESS,
            saturation: Self::DEFAULT_SATURATION,
        }
    }
}

/// Confidence-adaptive component filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterParams {
    /// Components covering at least this fraction of the image are kept
    /// regardless of confidence (inclusive).
    pub min_area_ratio: f64,
    /// Floor of every class's adaptive threshold.
    pub base_confidence_threshold: f32,
    /// Percentile (0-100) of a class's pixel confidences used as its
    /// adaptive threshold.
    pub confidence_percentile: f64,
}

impl FilterParams {
    /// Default minimum area ratio.
    pub const DEFAULT_MIN_AREA_RATIO: f64 = 0.002;
    /// Default base confidence threshold.
    pub const DEFAULT_BASE_CONFIDENCE_THRESHOLD: f32 = 0.25;
    /// Default confidence percentile.
    pub const DEFAULT_CONFIDENCE_PERCENTILE: f64 = 70.0;

    fn validate(&self) -> Result<(), PipelineError> {
        if !(0.0..=1.0).contains(&self.min_area_ratio) {
            return Err(invalid(format!(
                "min_area_ratio must be within [0, 1], got {}",
                self.min_area_ratio
            )));
        }
        if !(0.0..=1.0).contains(&self.base_confidence_threshold) {
            return Err(invalid(format!(
                "base_confidence_threshold must be within [0, 1], got {}",
                self.base_confidence_threshold
            )));
        }
        if !(0.0..=100.0).contains(&self.confidence_percentile) {
            return Err(invalid(format!(
                "confidence_percentile must be within [0, 100], got {}",
                self.confidence_percentile
            )));
        }
        Ok(())
    }
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            min_area_ratio: Self::DEFAULT_MIN_AREA_RATIO,
            base_confidence_threshold: Self::DEFAULT_BASE_CONFIDENCE_THRESHOLD,
            confidence_percentile: Self::DEFAULT_CONFIDENCE_PERCENTILE,
        }
    }
}

/// Per-class morphological cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineParams {
    /// Side of the elliptical structuring element. Must be odd.
    pub kernel_size: u32,
    /// Classes with fewer refined pixels than this are dropped.
    /// Zero disables the check.
    pub min_refined_pixels: u64,
}

impl RefineParams {
    /// Default structuring element side.
    pub const DEFAULT_KERNEL_SIZE: u32 = 3;
    /// Largest supported structuring element side.
    pub const MAX_KERNEL_SIZE: u32 = 255;

    fn validate(&self) -> Result<(), PipelineError> {
        if self.kernel_size == 0 || self.kernel_size % 2 == 0 {
            return Err(invalid(format!(
                "kernel_size must be a positive odd number, got {}",
                self.kernel_size
            )));
        }
        if self.kernel_size > Self::MAX_KERNEL_SIZE {
            return Err(invalid(format!(
                "kernel_size must be at most {}, got {}",
                Self::MAX_KERNEL_SIZE,
                self.kernel_size
            )));
        }
        Ok(())
    }
}

impl Default for RefineParams {
    fn default() -> Self {
        Self {
            kernel_size: Self::DEFAULT_KERNEL_SIZE,
            min_refined_pixels: 0,
        }
    }
}

/// Rendering of the flat mask, the overlay and their labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderParams {
    /// Weight of the original pixel in the overlay blend; the class
    /// color receives `1 - overlay_blend_weight`.
    pub overlay_blend_weight: f32,
    /// Color of background pixels in the flat mask.
    pub background_color: Color,
    /// Fill of the box behind each label.
    pub label_box_color: Color,
    /// Label text color.
    pub label_text_color: Color,
    /// Padding between label text bounds and its box, in pixels.
    pub label_padding: u32,
    /// Pixel height used for glyph fonts.
    pub label_scale: f32,
    /// Classes smaller than this are not labelled.
    pub min_label_pixel_count: u64,
}

impl RenderParams {
    /// Default overlay weight for handheld photos.
    pub const DEFAULT_OVERLAY_BLEND_WEIGHT: f32 = 0.6;
    /// Overlay weight for pre-cropped photos.
    pub const CROPPED_OVERLAY_BLEND_WEIGHT: f32 = 0.3;
    /// Default label padding.
    pub const DEFAULT_LABEL_PADDING: u32 = 4;
    /// Default glyph scale.
    pub const DEFAULT_LABEL_SCALE: f32 = 18.0;
    /// Default minimum labelled class size.
    pub const DEFAULT_MIN_LABEL_PIXEL_COUNT: u64 = 100;

    fn validate(&self) -> Result<(), PipelineError> {
        if !(0.0..=1.0).contains(&self.overlay_blend_weight) {
            return Err(invalid(format!(
                "overlay_blend_weight must be within [0, 1], got {}",
                self.overlay_blend_weight
            )));
        }
        if !self.label_scale.is_finite() || self.label_scale <= 0.0 {
            return Err(invalid(format!(
                "label_scale must be positive, got {}",
                self.label_scale
            )));
        }
        Ok(())
    }
}

impl Default for RenderParams {
    fn default() -> Self {
        Self {
            overlay_blend_weight: Self::DEFAULT_OVERLAY_BLEND_WEIGHT,
            background_color: [0, 0, 0],
            label_box_color: [0, 0, 0],
            label_text_color: [255, 255, 255],
            label_padding: Self::DEFAULT_LABEL_PADDING,
            label_scale: Self::DEFAULT_LABEL_SCALE,
            min_label_pixel_count: Self::DEFAULT_MIN_LABEL_PIXEL_COUNT,
        }
    }
}

/// All numeric pipeline parameters.
///
/// Serializes to a nested JSON object; every section and field is
/// optional on input and falls back to its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineParams {
    /// Geometric preprocessing.
    pub preprocess: PreprocessParams,
    /// Confidence-adaptive filtering.
    pub filter: FilterParams,
    /// Morphological refinement.
    pub refine: RefineParams,
    /// Classes covering less than this percentage of the image are not
    /// reported.
    pub min_detection_percentage: f64,
    /// Rendering.
    pub render: RenderParams,
}

impl PipelineParams {
    /// Default minimum detection percentage.
    pub const DEFAULT_MIN_DETECTION_PERCENTAGE: f64 = 0.5;

    /// Check every numeric parameter.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] naming the first
    /// out-of-range value.
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.preprocess.validate()?;
        self.filter.validate()?;
        self.refine.validate()?;
        if !(0.0..=100.0).contains(&self.min_detection_percentage) {
            return Err(invalid(format!(
                "min_detection_percentage must be within [0, 100], got {}",
                self.min_detection_percentage
            )));
        }
        self.render.validate()
    }
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            preprocess: PreprocessParams::default(),
            filter: FilterParams::default(),
            refine: RefineParams::default(),
            min_detection_percentage: Self::DEFAULT_MIN_DETECTION_PERCENTAGE,
            render: RenderParams::default(),
        }
    }
}

/// The two pipeline variants, expressed as data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigPreset {
    /// Uncontrolled handheld photos: smart square crop, light overlay.
    #[default]
    Photo,
    /// Photos already framed on the item: no crop, strong overlay.
    Cropped,
}

impl ConfigPreset {
    /// Parameters for this preset.
    #[must_use]
    pub fn params(self) -> PipelineParams {
        match self {
            Self::Photo => PipelineParams::default(),
            Self::Cropped => PipelineParams {
                preprocess: PreprocessParams {
                    crop_mode: CropMode::Stretch,
                    ..PreprocessParams::default()
                },
                render: RenderParams {
                    overlay_blend_weight: RenderParams::CROPPED_OVERLAY_BLEND_WEIGHT,
                    ..RenderParams::default()
                },
                ..PipelineParams::default()
            },
        }
    }

    /// Class catalog for this preset.
    #[must_use]
    pub fn catalog(self) -> ClassCatalog {
        match self {
            Self::Photo => ClassCatalog::photo(),
            Self::Cropped => ClassCatalog::cropped(),
        }
    }
}

/// Validated, immutable configuration handed to every pipeline call.
///
/// Holds no interior mutability, so one instance can be shared across
/// worker threads behind an `Arc`.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    catalog: ClassCatalog,
    params: PipelineParams,
    font: LabelFont,
}

impl PipelineConfig {
    /// Validate and assemble a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if the catalog or any
    /// parameter is out of range.
    pub fn new(
        catalog: ClassCatalog,
        params: PipelineParams,
        font: LabelFont,
    ) -> Result<Self, PipelineError> {
        catalog.validate()?;
        params.validate()?;
        Ok(Self {
            catalog,
            params,
            font,
        })
    }

    /// Configuration for a preset with the built-in bitmap label font.
    #[must_use]
    pub fn from_preset(preset: ConfigPreset) -> Self {
        Self {
            catalog: preset.catalog(),
            params: preset.params(),
            font: LabelFont::default(),
        }
    }

    /// Class names and palette.
    #[must_use]
    pub const fn catalog(&self) -> &ClassCatalog {
        &self.catalog
    }

    /// Numeric parameters.
    #[must_use]
    pub const fn params(&self) -> &PipelineParams {
        &self.params
    }

    /// Label font.
    #[must_use]
    pub const fn font(&self) -> &LabelFont {
        &self.font
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_preset(ConfigPreset::Photo)
    }
}

fn invalid(message: impl Into<String>) -> PipelineError {
    PipelineError::InvalidConfig(message.into())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let params = PipelineParams::default();
        assert_eq!(params.preprocess.max_dimension, 2048);
        assert_eq!(params.preprocess.model_input_size, 512);
        assert_eq!(params.preprocess.crop_mode, CropMode::CenterSquare);
        assert!((params.filter.min_area_ratio - 0.002).abs() < f64::EPSILON);
        assert!((params.filter.base_confidence_threshold - 0.25).abs() < f32::EPSILON);
        assert!((params.filter.confidence_percentile - 70.0).abs() < f64::EPSILON);
        assert_eq!(params.refine.kernel_size, 3);
        assert_eq!(params.render.min_label_pixel_count, 100);
        assert_eq!(params.render.label_padding, 4);
        assert!((params.min_detection_percentage - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn presets_are_valid() {
        for preset in [ConfigPreset::Photo, ConfigPreset::Cropped] {
            preset.params().validate().unwrap();
            preset.catalog().validate().unwrap();
        }
    }

    #[test]
    fn presets_differ_only_in_data() {
        let photo = ConfigPreset::Photo.params();
        let cropped = ConfigPreset::Cropped.params();
        assert_eq!(cropped.preprocess.crop_mode, CropMode::Stretch);
        assert!((photo.render.overlay_blend_weight - 0.6).abs() < f32::EPSILON);
        assert!((cropped.render.overlay_blend_weight - 0.3).abs() < f32::EPSILON);
        assert_eq!(photo.filter, cropped.filter);
        assert_eq!(
            ConfigPreset::Photo.catalog().names,
            ConfigPreset::Cropped.catalog().names
        );
        assert_ne!(
            ConfigPreset::Photo.catalog().palette,
            ConfigPreset::Cropped.catalog().palette
        );
    }

    #[test]
    fn negative_threshold_rejected() {
        let params = PipelineParams {
            filter: FilterParams {
                base_confidence_threshold: -0.1,
                ..FilterParams::default()
            },
            ..PipelineParams::default()
        };
        let result = PipelineConfig::new(ClassCatalog::photo(), params, LabelFont::default());
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn even_kernel_rejected() {
        let params = PipelineParams {
            refine: RefineParams {
                kernel_size: 4,
                ..RefineParams::default()
            },
            ..PipelineParams::default()
        };
        assert!(matches!(
            params.validate(),
            Err(PipelineError::InvalidConfig(ref msg)) if msg.contains("kernel_size")
        ));
    }

    #[test]
    fn palette_length_mismatch_rejected() {
        let mut catalog = ClassCatalog::photo();
        catalog.palette.pop();
        assert!(matches!(
            catalog.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn empty_catalog_rejected() {
        let catalog = ClassCatalog {
            names: vec![],
            palette: vec![],
        };
        assert!(catalog.validate().is_err());
    }

    #[test]
    fn catalog_lookups_fall_back_outside_range() {
        let catalog = ClassCatalog::photo();
        assert_eq!(catalog.name(2), "glass");
        assert_eq!(catalog.color(1), [255, 69, 0]);
        assert_eq!(catalog.name(200), "unknown");
        assert_eq!(catalog.color(200), [0, 0, 0]);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{"filter": {"min_area_ratio": 0.01}, "render": {"label_padding": 2}}"#;
        let params: PipelineParams = serde_json::from_str(json).unwrap();
        assert!((params.filter.min_area_ratio - 0.01).abs() < f64::EPSILON);
        assert!((params.filter.base_confidence_threshold - 0.25).abs() < f32::EPSILON);
        assert_eq!(params.render.label_padding, 2);
        assert_eq!(params.preprocess, PreprocessParams::default());
    }

    #[test]
    fn crop_mode_serializes_snake_case() {
        let json = serde_json::to_string(&CropMode::CenterSquare).unwrap();
        assert_eq!(json, "\"center_square\"");
    }

    #[test]
    fn params_serde_round_trip() {
        let params = ConfigPreset::Cropped.params();
        let json = serde_json::to_string(&params).unwrap();
        let back: PipelineParams = serde_json::from_str(&json).unwrap();
        assert_eq!(params, back);
    }
}
