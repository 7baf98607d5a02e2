//! Pipeline diagnostics: timing, counts, and other metrics for each stage.
//!
//! Every call to
//! [`refine_and_visualize_with_diagnostics`](crate::refine_and_visualize_with_diagnostics)
//! or [`segment_with_diagnostics`](crate::segment_with_diagnostics)
//! collects these alongside the results, for threshold tuning and
//! latency tracking.
//!
//! Timestamps are captured via the `web-time` crate, which uses
//! `performance.now()` on WASM and `std::time::Instant` on native.
//! Durations are serialized as fractional seconds (`f64`) since
//! `std::time::Duration` does not implement serde traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::filter::ClassFilterStats;
use crate::morphology::ClassRefineStats;
use crate::preprocess::CropRegion;
use crate::types::{BACKGROUND, ClassMask};

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Diagnostics collected from a single pipeline run.
///
/// The request-side stages (decode, preprocess, inference) only run
/// under [`segment`](crate::segment); `rescale` only runs when the mask
/// and the rendered image differ in size. Those are `None` otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDiagnostics {
    /// Image decoding.
    pub decode: Option<StageDiagnostics>,
    /// Geometric normalization and enhancement.
    pub preprocess: Option<StageDiagnostics>,
    /// Model forward pass.
    pub inference: Option<StageDiagnostics>,
    /// Probability tensor shape check.
    pub validate: StageDiagnostics,
    /// Per-pixel argmax.
    pub argmax: StageDiagnostics,
    /// Confidence-adaptive component filtering.
    pub filter: StageDiagnostics,
    /// Morphological refinement.
    pub refine: StageDiagnostics,
    /// Mask resize onto the rendered image.
    pub rescale: Option<StageDiagnostics>,
    /// Detection aggregation.
    pub aggregate: StageDiagnostics,
    /// Flat mask, overlay, and label rendering.
    pub render: StageDiagnostics,
    /// Total wall-clock duration of the run (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Summary counts across all stages.
    pub summary: PipelineSummary,
}

/// Diagnostics for a single pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics.
    pub metrics: StageMetrics,
}

/// Stage-specific metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Image decoding metrics.
    Decode {
        /// Size of the input image bytes.
        input_bytes: usize,
        /// Decoded width in pixels.
        width: u32,
        /// Decoded height in pixels.
        height: u32,
    },
    /// Preprocessing metrics.
    Preprocess {
        /// Region of the source photo fed to the model.
        crop: CropRegion,
        /// Side of the square model input.
        input_size: u32,
    },
    /// Inference metrics.
    Inference {
        /// Channels in the returned tensor.
        classes: usize,
        /// Output width.
        width: u32,
        /// Output height.
        height: u32,
    },
    /// Tensor validation metrics.
    Validate {
        /// Channels in the tensor.
        classes: usize,
        /// Tensor width.
        width: u32,
        /// Tensor height.
        height: u32,
    },
    /// Argmax metrics.
    Argmax {
        /// Non-background pixels in the raw mask.
        foreground_pixels: u64,
        /// Distinct non-background classes present.
        classes_present: usize,
    },
    /// Filter metrics.
    Filter {
        /// Components examined across all classes.
        components: usize,
        /// Components reverted to background.
        components_removed: usize,
        /// Pixels reverted to background.
        pixels_removed: u64,
        /// Per-class breakdown.
        classes: Vec<ClassFilterStats>,
    },
    /// Refinement metrics.
    Refine {
        /// Structuring element side.
        kernel_size: u32,
        /// Non-background pixels before refinement.
        pixels_before: u64,
        /// Non-background pixels after refinement.
        pixels_after: u64,
        /// Per-class breakdown.
        classes: Vec<ClassRefineStats>,
    },
    /// Mask rescale metrics.
    Rescale {
        /// Mask width before resizing.
        from_width: u32,
        /// Mask height before resizing.
        from_height: u32,
        /// Mask width after resizing.
        to_width: u32,
        /// Mask height after resizing.
        to_height: u32,
    },
    /// Aggregation metrics.
    Aggregate {
        /// Number of reported classes.
        detected: usize,
        /// Name of the largest class, if any.
        primary: Option<String>,
    },
    /// Rendering metrics.
    Render {
        /// Labels drawn on each image.
        labels: usize,
        /// Rendered width.
        width: u32,
        /// Rendered height.
        height: u32,
    },
}

/// High-level summary of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    /// Rendered image width in pixels.
    pub image_width: u32,
    /// Rendered image height in pixels.
    pub image_height: u32,
    /// Width of the model-resolution mask.
    pub mask_width: u32,
    /// Height of the model-resolution mask.
    pub mask_height: u32,
    /// Classes in the catalog, including background.
    pub class_count: usize,
    /// Names of reported classes, largest first.
    pub detected: Vec<String>,
}

impl PipelineDiagnostics {
    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Pipeline Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Image: {}x{}  |  Mask: {}x{}  |  Classes: {}",
            self.summary.image_width,
            self.summary.image_height,
            self.summary.mask_width,
            self.summary.mask_height,
            self.summary.class_count,
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<24} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        for (name, diag) in self.stages() {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            lines.push(format!("{name:<24} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.push(String::new());
        let detected = if self.summary.detected.is_empty() {
            "none".to_string()
        } else {
            self.summary.detected.join(", ")
        };
        lines.push(format!("Detected: {detected}"));

        lines.join("\n")
    }

    /// Stages that ran, in execution order.
    #[must_use]
    pub fn stages(&self) -> Vec<(&'static str, &StageDiagnostics)> {
        let mut stages = Vec::new();
        if let Some(ref d) = self.decode {
            stages.push(("Decode", d));
        }
        if let Some(ref p) = self.preprocess {
            stages.push(("Preprocess", p));
        }
        if let Some(ref i) = self.inference {
            stages.push(("Inference", i));
        }
        stages.push(("Validate", &self.validate));
        stages.push(("Argmax", &self.argmax));
        stages.push(("Filter", &self.filter));
        stages.push(("Refine", &self.refine));
        if let Some(ref r) = self.rescale {
            stages.push(("Rescale", r));
        }
        stages.push(("Aggregate", &self.aggregate));
        stages.push(("Render", &self.render));
        stages
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Format stage metrics into a compact detail string.
fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Decode {
            input_bytes,
            width,
            height,
        } => format!("{input_bytes} bytes -> {width}x{height}"),
        StageMetrics::Preprocess { crop, input_size } => format!(
            "crop {}x{}+{}+{} -> {input_size}x{input_size}",
            crop.width, crop.height, crop.x, crop.y,
        ),
        StageMetrics::Inference {
            classes,
            width,
            height,
        }
        | StageMetrics::Validate {
            classes,
            width,
            height,
        } => format!("{classes} classes x {width}x{height}"),
        StageMetrics::Argmax {
            foreground_pixels,
            classes_present,
        } => format!("{foreground_pixels} fg px, {classes_present} classes"),
        StageMetrics::Filter {
            components,
            components_removed,
            pixels_removed,
            ..
        } => format!("{components_removed}/{components} components removed ({pixels_removed} px)"),
        StageMetrics::Refine {
            kernel_size,
            pixels_before,
            pixels_after,
            classes,
        } => {
            let dropped = classes.iter().filter(|c| c.dropped).count();
            format!("k={kernel_size} {pixels_before}->{pixels_after} fg px, {dropped} dropped")
        }
        StageMetrics::Rescale {
            from_width,
            from_height,
            to_width,
            to_height,
        } => format!("{from_width}x{from_height} -> {to_width}x{to_height}"),
        StageMetrics::Aggregate { detected, primary } => match primary {
            Some(name) => format!("{detected} classes, primary={name}"),
            None => format!("{detected} classes"),
        },
        StageMetrics::Render {
            labels,
            width,
            height,
        } => format!("{width}x{height}, {labels} labels"),
    }
}

/// Count non-background pixels.
pub(crate) fn foreground_pixels(mask: &ClassMask) -> u64 {
    mask.as_image()
        .pixels()
        .map(|p| u64::from(p.0[0] != BACKGROUND))
        .sum()
}

/// Count distinct non-background classes present.
pub(crate) fn classes_present(mask: &ClassMask) -> usize {
    let mut seen = [false; 256];
    for p in mask.as_image().pixels() {
        seen[usize::from(p.0[0])] = true;
    }
    seen.iter().skip(1).filter(|s| **s).count()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn stage(ms: u64, metrics: StageMetrics) -> StageDiagnostics {
        StageDiagnostics {
            duration: Duration::from_millis(ms),
            metrics,
        }
    }

    fn sample(with_request_stages: bool) -> PipelineDiagnostics {
        PipelineDiagnostics {
            decode: with_request_stages.then(|| {
                stage(
                    4,
                    StageMetrics::Decode {
                        input_bytes: 5000,
                        width: 640,
                        height: 480,
                    },
                )
            }),
            preprocess: with_request_stages.then(|| {
                stage(
                    12,
                    StageMetrics::Preprocess {
                        crop: CropRegion {
                            x: 80,
                            y: 0,
                            width: 480,
                            height: 480,
                        },
                        input_size: 512,
                    },
                )
            }),
            inference: None,
            validate: stage(
                0,
                StageMetrics::Validate {
                    classes: 7,
                    width: 512,
                    height: 512,
                },
            ),
            argmax: stage(
                3,
                StageMetrics::Argmax {
                    foreground_pixels: 1200,
                    classes_present: 2,
                },
            ),
            filter: stage(
                6,
                StageMetrics::Filter {
                    components: 5,
                    components_removed: 3,
                    pixels_removed: 20,
                    classes: Vec::new(),
                },
            ),
            refine: stage(
                8,
                StageMetrics::Refine {
                    kernel_size: 3,
                    pixels_before: 1180,
                    pixels_after: 1150,
                    classes: Vec::new(),
                },
            ),
            rescale: None,
            aggregate: stage(
                1,
                StageMetrics::Aggregate {
                    detected: 2,
                    primary: Some("glass".to_string()),
                },
            ),
            render: stage(
                5,
                StageMetrics::Render {
                    labels: 2,
                    width: 512,
                    height: 512,
                },
            ),
            total_duration: Duration::from_millis(39),
            summary: PipelineSummary {
                image_width: 512,
                image_height: 512,
                mask_width: 512,
                mask_height: 512,
                class_count: 7,
                detected: vec!["glass".to_string(), "can".to_string()],
            },
        }
    }

    #[test]
    fn duration_ms_converts_correctly() {
        let ms = duration_ms(Duration::from_millis(1234));
        assert!((ms - 1234.0).abs() < 0.01);
    }

    #[test]
    fn foreground_and_class_counts() {
        let mask = ClassMask::from_fn(4, 4, |x, y| match (x, y) {
            (0, _) => 2,
            (1, 0) => 5,
            _ => BACKGROUND,
        });
        assert_eq!(foreground_pixels(&mask), 5);
        assert_eq!(classes_present(&mask), 2);
    }

    #[test]
    fn optional_stages_only_listed_when_run() {
        let names: Vec<_> = sample(false).stages().iter().map(|(n, _)| *n).collect();
        assert_eq!(
            names,
            ["Validate", "Argmax", "Filter", "Refine", "Aggregate", "Render"]
        );
        let names: Vec<_> = sample(true).stages().iter().map(|(n, _)| *n).collect();
        assert_eq!(names[..2], ["Decode", "Preprocess"]);
    }

    #[test]
    fn report_lists_stages_and_detections() {
        let report = sample(true).report();
        assert!(report.contains("Pipeline Diagnostics Report"));
        assert!(report.contains("Preprocess"));
        assert!(report.contains("crop 480x480+80+0 -> 512x512"));
        assert!(report.contains("3/5 components removed"));
        assert!(report.contains("Detected: glass, can"));
    }

    #[test]
    fn durations_serialize_as_seconds() {
        let json = serde_json::to_value(sample(false)).unwrap();
        let total = json["total_duration"].as_f64().unwrap();
        assert!((total - 0.039).abs() < 1e-9);
        assert!(json["decode"].is_null());
    }
}
