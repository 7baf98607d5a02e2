//! recyclens-pipeline: post-inference refinement and visualization for
//! recyclable-material segmentation (sans-IO).
//!
//! Turns a segmentation model's per-pixel class probabilities into a
//! cleaned class mask, per-class detection records, and two annotated
//! renderings of the photo:
//!
//! argmax -> confidence-adaptive filter -> morphological refinement ->
//! aggregation -> flat mask + overlay with labels.
//!
//! [`segment`] runs the whole request: decode -> preprocess -> model ->
//! the steps above. The model itself sits behind [`SegmentationModel`].
//!
//! This crate has **no I/O dependencies**: it operates on in-memory
//! rasters, tensors, and byte slices. Reading files, loading fonts, and
//! hosting models live in the caller.

pub mod aggregate;
pub mod components;
pub mod config;
pub mod diagnostics;
pub mod enhance;
pub mod filter;
pub mod label;
pub mod morphology;
pub mod preprocess;
pub mod types;
pub mod visualize;

use std::time::Duration;

use ndarray::Array3;
use web_time::Instant;

pub use aggregate::Detections;
pub use config::{
    ClassCatalog, ConfigPreset, CropMode, FilterParams, PipelineConfig, PipelineParams,
    PreprocessParams, RefineParams, RenderParams,
};
pub use diagnostics::PipelineDiagnostics;
pub use label::{LabelFont, LabelPainter};
pub use types::{
    BACKGROUND, ClassMask, DetectionRecord, Dimensions, GrayImage, PipelineError,
    ProbabilityTensor, RgbImage,
};

use diagnostics::{PipelineSummary, StageDiagnostics, StageMetrics};
use preprocess::CropRegion;

/// Everything produced for one photo.
#[derive(Debug, Clone)]
pub struct Segmentation {
    /// Palette colors on a background fill, labelled.
    pub flat_mask: RgbImage,
    /// Class colors blended into the photo, labelled.
    pub overlay: RgbImage,
    /// Detected class names, largest first.
    pub names: Vec<String>,
    /// Detection records in the same order as `names`.
    pub records: Vec<DetectionRecord>,
    /// Final class mask at the rendered image's resolution.
    pub mask: ClassMask,
}

impl Segmentation {
    /// The largest detected class, if any.
    #[must_use]
    pub fn primary(&self) -> Option<&DetectionRecord> {
        self.records.first()
    }
}

/// What a [`SegmentationModel`] returns for one input.
#[derive(Debug, Clone)]
pub struct InferenceOutput {
    /// Softmaxed class probabilities, `[C, S, S]`.
    pub probabilities: ProbabilityTensor,
}

/// A loaded segmentation network.
///
/// Implementations wrap whatever runtime hosts the weights. They must
/// be shareable across worker threads.
pub trait SegmentationModel: Send + Sync {
    /// Run a forward pass over a `[3, S, S]` input with values in `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Any failure of the underlying runtime.
    fn infer(
        &self,
        input: &Array3<f32>,
    ) -> Result<InferenceOutput, Box<dyn std::error::Error + Send + Sync>>;
}

/// Refine a probability tensor into a mask and render it over `image`.
///
/// If `image` and the tensor differ in size, the refined mask is
/// resized to the image with nearest-neighbor sampling before
/// aggregation and rendering.
///
/// # Errors
///
/// Returns [`PipelineError::DimensionMismatch`] if the tensor is not
/// `model_input_size` square or its channel count differs from the
/// catalog length.
pub fn refine_and_visualize(
    image: &RgbImage,
    probabilities: &ProbabilityTensor,
    config: &PipelineConfig,
) -> Result<Segmentation, PipelineError> {
    refine_and_visualize_with_diagnostics(image, probabilities, config).map(|(s, _)| s)
}

/// Same as [`refine_and_visualize`], also returning per-stage diagnostics.
///
/// # Errors
///
/// Same as [`refine_and_visualize`].
pub fn refine_and_visualize_with_diagnostics(
    image: &RgbImage,
    probabilities: &ProbabilityTensor,
    config: &PipelineConfig,
) -> Result<(Segmentation, PipelineDiagnostics), PipelineError> {
    let start = Instant::now();
    let refined = refine_stages(probabilities, config)?;
    finish(image, refined, Placement::Stretch, config, start)
}

/// Run the full request: decode, preprocess, infer, refine, render.
///
/// The model sees a square crop of the photo (see
/// [`preprocess::preprocess`]). Detection percentages describe that
/// model view; the renderings cover the whole photo, with everything
/// outside the crop left as background.
///
/// # Errors
///
/// Returns [`PipelineError::InferenceUnavailable`] if `model` is `None`
/// or the forward pass fails, [`PipelineError::EmptyInput`] or
/// [`PipelineError::DecodeError`] for unusable bytes, and
/// [`PipelineError::DimensionMismatch`] if the model output has the
/// wrong shape.
pub fn segment(
    image_bytes: &[u8],
    model: Option<&dyn SegmentationModel>,
    config: &PipelineConfig,
) -> Result<Segmentation, PipelineError> {
    segment_with_diagnostics(image_bytes, model, config).map(|(s, _)| s)
}

/// Same as [`segment`], also returning per-stage diagnostics.
///
/// # Errors
///
/// Same as [`segment`].
pub fn segment_with_diagnostics(
    image_bytes: &[u8],
    model: Option<&dyn SegmentationModel>,
    config: &PipelineConfig,
) -> Result<(Segmentation, PipelineDiagnostics), PipelineError> {
    let model = model.ok_or_else(|| {
        PipelineError::InferenceUnavailable("no segmentation model loaded".to_string())
    })?;
    let start = Instant::now();

    let (image, decode_time) = timed(|| preprocess::decode_rgb(image_bytes));
    let image = image?;
    let decode = StageDiagnostics {
        duration: decode_time,
        metrics: StageMetrics::Decode {
            input_bytes: image_bytes.len(),
            width: image.width(),
            height: image.height(),
        },
    };

    let preprocess_params = &config.params().preprocess;
    let (prepared, preprocess_time) = timed(|| preprocess::preprocess(&image, preprocess_params));
    let preprocess = StageDiagnostics {
        duration: preprocess_time,
        metrics: StageMetrics::Preprocess {
            crop: prepared.crop,
            input_size: preprocess_params.model_input_size,
        },
    };

    let (output, inference_time) = timed(|| model.infer(&prepared.tensor));
    let output = output.map_err(|e| PipelineError::InferenceUnavailable(e.to_string()))?;
    let output_size = output.probabilities.dimensions();
    let inference = StageDiagnostics {
        duration: inference_time,
        metrics: StageMetrics::Inference {
            classes: output.probabilities.num_classes(),
            width: output_size.width,
            height: output_size.height,
        },
    };
    tracing::debug!(?inference_time, "model inference finished");

    let refined = refine_stages(&output.probabilities, config)?;
    let (segmentation, mut diagnostics) =
        finish(&image, refined, Placement::Crop(prepared.crop), config, start)?;
    diagnostics.decode = Some(decode);
    diagnostics.preprocess = Some(preprocess);
    diagnostics.inference = Some(inference);
    diagnostics.total_duration = start.elapsed();
    Ok((segmentation, diagnostics))
}

/// How a model-resolution mask maps onto the rendered image.
#[derive(Debug, Clone, Copy)]
enum Placement {
    /// The mask covers the whole image.
    Stretch,
    /// The mask covers only this region of the image.
    Crop(CropRegion),
}

/// The mask-producing stages and their diagnostics.
struct Refined {
    mask: ClassMask,
    validate: StageDiagnostics,
    argmax: StageDiagnostics,
    filter: StageDiagnostics,
    refine: StageDiagnostics,
}

fn timed<T>(f: impl FnOnce() -> T) -> (T, Duration) {
    let start = Instant::now();
    let out = f();
    (out, start.elapsed())
}

/// Check the tensor against the configured model resolution and catalog.
fn validate_tensor(
    probabilities: &ProbabilityTensor,
    config: &PipelineConfig,
) -> Result<(), PipelineError> {
    let size = config.params().preprocess.model_input_size;
    let expected = Dimensions::new(size, size);
    let actual = probabilities.dimensions();
    let classes = probabilities.num_classes();
    let catalog_len = config.catalog().len();
    if actual != expected || classes != catalog_len {
        return Err(PipelineError::DimensionMismatch {
            expected: format!("{catalog_len} classes x {expected}"),
            actual: format!("{classes} classes x {actual}"),
        });
    }
    Ok(())
}

/// Validate, argmax, filter, and refine.
fn refine_stages(
    probabilities: &ProbabilityTensor,
    config: &PipelineConfig,
) -> Result<Refined, PipelineError> {
    let params = config.params();
    let size = probabilities.dimensions();
    let classes = probabilities.num_classes();

    let (valid, validate_time) = timed(|| validate_tensor(probabilities, config));
    valid?;
    let validate = StageDiagnostics {
        duration: validate_time,
        metrics: StageMetrics::Validate {
            classes,
            width: size.width,
            height: size.height,
        },
    };

    let (raw, argmax_time) = timed(|| ClassMask::from_probabilities(probabilities));
    let argmax = StageDiagnostics {
        duration: argmax_time,
        metrics: StageMetrics::Argmax {
            foreground_pixels: diagnostics::foreground_pixels(&raw),
            classes_present: diagnostics::classes_present(&raw),
        },
    };

    let (filtered, filter_time) =
        timed(|| filter::filter_by_confidence(&raw, probabilities, &params.filter));
    let filtered = filtered?;
    let filter = StageDiagnostics {
        duration: filter_time,
        metrics: StageMetrics::Filter {
            components: filtered.stats.iter().map(|s| s.components).sum(),
            components_removed: filtered.stats.iter().map(|s| s.components_removed).sum(),
            pixels_removed: filtered.stats.iter().map(|s| s.pixels_removed).sum(),
            classes: filtered.stats.clone(),
        },
    };
    tracing::debug!(
        classes = filtered.stats.len(),
        ?filter_time,
        "confidence filter applied",
    );

    let (refined, refine_time) = timed(|| morphology::refine(&filtered.mask, &params.refine));
    let refine = StageDiagnostics {
        duration: refine_time,
        metrics: StageMetrics::Refine {
            kernel_size: params.refine.kernel_size,
            pixels_before: diagnostics::foreground_pixels(&filtered.mask),
            pixels_after: diagnostics::foreground_pixels(&refined.mask),
            classes: refined.stats,
        },
    };

    Ok(Refined {
        mask: refined.mask,
        validate,
        argmax,
        filter,
        refine,
    })
}

/// Place the mask on the image, aggregate, render, and assemble
/// diagnostics.
fn finish(
    image: &RgbImage,
    refined: Refined,
    placement: Placement,
    config: &PipelineConfig,
    start: Instant,
) -> Result<(Segmentation, PipelineDiagnostics), PipelineError> {
    let params = config.params();
    let catalog = config.catalog();
    let model_size = refined.mask.dimensions();
    let image_size = Dimensions::new(image.width(), image.height());

    let (render_mask, rescale) = if image_size == model_size
        && matches!(placement, Placement::Stretch)
    {
        (None, None)
    } else {
        let (mask, rescale_time) = timed(|| match placement {
            Placement::Stretch => preprocess::rescale_mask(&refined.mask, image_size),
            Placement::Crop(crop) => preprocess::restore_mask(&refined.mask, crop, image_size),
        });
        let diag = StageDiagnostics {
            duration: rescale_time,
            metrics: StageMetrics::Rescale {
                from_width: model_size.width,
                from_height: model_size.height,
                to_width: image_size.width,
                to_height: image_size.height,
            },
        };
        (Some(mask), Some(diag))
    };
    let render_mask = render_mask.unwrap_or_else(|| refined.mask.clone());

    // A cropped placement reports what the model saw; a stretched one
    // reports the image as rendered.
    let aggregate_mask = match placement {
        Placement::Stretch => &render_mask,
        Placement::Crop(_) => &refined.mask,
    };
    let (detections, aggregate_time) = timed(|| {
        aggregate::aggregate(aggregate_mask, catalog, params.min_detection_percentage)
    });
    let aggregate = StageDiagnostics {
        duration: aggregate_time,
        metrics: StageMetrics::Aggregate {
            detected: detections.records.len(),
            primary: detections.primary().map(|r| r.class_name.clone()),
        },
    };

    let (rendered, render_time) = timed(|| {
        visualize::visualize(image, &render_mask, catalog, &params.render, config.font())
    });
    let rendered = rendered?;
    let render = StageDiagnostics {
        duration: render_time,
        metrics: StageMetrics::Render {
            labels: rendered.labels.len(),
            width: image_size.width,
            height: image_size.height,
        },
    };

    tracing::debug!(detected = ?detections.names, "segmentation complete");

    let diagnostics = PipelineDiagnostics {
        decode: None,
        preprocess: None,
        inference: None,
        validate: refined.validate,
        argmax: refined.argmax,
        filter: refined.filter,
        refine: refined.refine,
        rescale,
        aggregate,
        render,
        total_duration: start.elapsed(),
        summary: PipelineSummary {
            image_width: image_size.width,
            image_height: image_size.height,
            mask_width: model_size.width,
            mask_height: model_size.height,
            class_count: catalog.len(),
            detected: detections.names.clone(),
        },
    };

    let Detections { records, names } = detections;
    Ok((
        Segmentation {
            flat_mask: rendered.flat_mask,
            overlay: rendered.overlay,
            names,
            records,
            mask: render_mask,
        },
        diagnostics,
    ))
}
