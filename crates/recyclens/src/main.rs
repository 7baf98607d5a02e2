//! recyclens: run segmentation refinement and rendering on a photo.
//!
//! Takes a photo and the segmentation model's output for it (a raw
//! little-endian `f32` tensor, `[C, S, S]`, either probabilities or
//! logits), runs the full request flow, writes the flat mask and overlay
//! as PNGs, and prints the detections with per-stage diagnostics.
//!
//! Useful for:
//!
//! - Tuning filter thresholds against saved model outputs
//! - Comparing the `photo` and `cropped` presets
//! - Measuring per-stage durations
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin recyclens -- [OPTIONS] --probs <FILE> <IMAGE_PATH>
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use ndarray::Array3;
use recyclens_pipeline::{
    ClassCatalog, ConfigPreset, DetectionRecord, InferenceOutput, LabelFont, PipelineConfig,
    PipelineDiagnostics, PipelineParams, ProbabilityTensor, Segmentation, SegmentationModel,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// Segment recyclable materials in a photo from a saved model output.
///
/// Writes `<stem>_predict.png` and `<stem>_overlay.png` to the output
/// directory and prints the detected classes and stage diagnostics.
#[derive(Parser)]
#[command(name = "recyclens", version)]
struct Cli {
    /// Path to the input photo (PNG, JPEG, BMP, WebP).
    image_path: PathBuf,

    /// Model output for the photo: raw little-endian `f32`, `[C, S, S]`,
    /// where C is the class count and S the model input size.
    #[arg(long)]
    probs: PathBuf,

    /// Treat `--probs` as raw logits and apply softmax.
    #[arg(long)]
    logits: bool,

    /// Parameter and palette preset.
    #[arg(long, value_enum, default_value_t = Preset::Photo)]
    preset: Preset,

    /// Pipeline parameters as a JSON file (partial files fall back to
    /// defaults). Replaces the preset's parameters; the preset still
    /// picks the palette.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Class catalog as a JSON file (`{"names": [...], "palette": [...]}`).
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// TrueType/OpenType font for labels. Defaults to a built-in bitmap face.
    #[arg(long)]
    font: Option<PathBuf>,

    /// Override the minimum component area ratio.
    #[arg(long)]
    min_area_ratio: Option<f64>,

    /// Override the base confidence threshold.
    #[arg(long)]
    base_confidence: Option<f32>,

    /// Override the confidence percentile.
    #[arg(long)]
    confidence_percentile: Option<f64>,

    /// Override the minimum reported detection percentage.
    #[arg(long)]
    min_detection_percentage: Option<f64>,

    /// Directory for the rendered PNGs.
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    /// Number of runs for averaging.
    #[arg(long, default_value_t = 1, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    runs: usize,

    /// Output JSON instead of a human-readable report.
    #[arg(long)]
    json: bool,
}

/// Preset selection.
#[derive(Clone, Copy, ValueEnum)]
enum Preset {
    /// Handheld photos: centered square crop, light overlay.
    Photo,
    /// Photos already framed on the item: no crop, strong overlay.
    Cropped,
}

impl From<Preset> for ConfigPreset {
    fn from(preset: Preset) -> Self {
        match preset {
            Preset::Photo => Self::Photo,
            Preset::Cropped => Self::Cropped,
        }
    }
}

/// Replays a saved model output instead of running a network.
struct SavedOutput(ProbabilityTensor);

impl SegmentationModel for SavedOutput {
    fn infer(
        &self,
        _input: &Array3<f32>,
    ) -> Result<InferenceOutput, Box<dyn std::error::Error + Send + Sync>> {
        Ok(InferenceOutput {
            probabilities: self.0.clone(),
        })
    }
}

/// JSON output for one run.
#[derive(Serialize)]
struct RunReport<'a> {
    names: &'a [String],
    records: &'a [DetectionRecord],
    diagnostics: &'a PipelineDiagnostics,
}

/// Build a [`PipelineConfig`] from CLI arguments.
///
/// Parameters come from `--config` if given, else from the preset; the
/// individual threshold flags then override either source.
fn config_from_cli(cli: &Cli) -> Result<PipelineConfig, String> {
    let preset = ConfigPreset::from(cli.preset);

    let mut params: PipelineParams = match cli.config {
        Some(ref path) => {
            let text = read_to_string(path)?;
            serde_json::from_str(&text)
                .map_err(|e| format!("Error parsing {}: {e}", path.display()))?
        }
        None => preset.params(),
    };
    if let Some(v) = cli.min_area_ratio {
        params.filter.min_area_ratio = v;
    }
    if let Some(v) = cli.base_confidence {
        params.filter.base_confidence_threshold = v;
    }
    if let Some(v) = cli.confidence_percentile {
        params.filter.confidence_percentile = v;
    }
    if let Some(v) = cli.min_detection_percentage {
        params.min_detection_percentage = v;
    }

    let catalog: ClassCatalog = match cli.catalog {
        Some(ref path) => {
            let text = read_to_string(path)?;
            serde_json::from_str(&text)
                .map_err(|e| format!("Error parsing {}: {e}", path.display()))?
        }
        None => preset.catalog(),
    };

    let font = match cli.font {
        Some(ref path) => {
            let bytes = std::fs::read(path)
                .map_err(|e| format!("Error reading {}: {e}", path.display()))?;
            LabelFont::from_bytes(bytes, params.render.label_scale).map_err(|e| e.to_string())?
        }
        None => LabelFont::default(),
    };

    PipelineConfig::new(catalog, params, font).map_err(|e| e.to_string())
}

fn read_to_string(path: &Path) -> Result<String, String> {
    std::fs::read_to_string(path).map_err(|e| format!("Error reading {}: {e}", path.display()))
}

/// Load the saved model output with the shape the config expects.
fn load_output(cli: &Cli, config: &PipelineConfig) -> Result<ProbabilityTensor, String> {
    let bytes = std::fs::read(&cli.probs)
        .map_err(|e| format!("Error reading {}: {e}", cli.probs.display()))?;
    let classes = config.catalog().len();
    let size = config.params().preprocess.model_input_size as usize;
    let tensor = if cli.logits {
        ProbabilityTensor::from_le_logit_bytes(&bytes, classes, size, size)
    } else {
        ProbabilityTensor::from_le_bytes(&bytes, classes, size, size)
    };
    tensor.map_err(|e| format!("Error loading {}: {e}", cli.probs.display()))
}

/// Write both renderings next to each other in `out_dir`.
fn write_images(cli: &Cli, segmentation: &Segmentation) -> Result<(), String> {
    let stem = cli
        .image_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("recyclens");
    std::fs::create_dir_all(&cli.out_dir)
        .map_err(|e| format!("Error creating {}: {e}", cli.out_dir.display()))?;
    for (suffix, image) in [
        ("predict", &segmentation.flat_mask),
        ("overlay", &segmentation.overlay),
    ] {
        let path = cli.out_dir.join(format!("{stem}_{suffix}.png"));
        image
            .save(&path)
            .map_err(|e| format!("Error writing {}: {e}", path.display()))?;
        tracing::info!(path = %path.display(), "wrote {suffix} image");
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = match config_from_cli(&cli) {
        Ok(c) => c,
        Err(msg) => {
            tracing::error!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let image_bytes = match std::fs::read(&cli.image_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!("Error reading {}: {e}", cli.image_path.display());
            return ExitCode::FAILURE;
        }
    };

    let model = match load_output(&cli, &config) {
        Ok(tensor) => SavedOutput(tensor),
        Err(msg) => {
            tracing::error!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        image = %cli.image_path.display(),
        bytes = image_bytes.len(),
        runs = cli.runs,
        "starting",
    );
    tracing::debug!("config: {config:#?}");

    let mut all_diagnostics = Vec::with_capacity(cli.runs);

    for run in 0..cli.runs {
        let (segmentation, diagnostics) =
            match recyclens_pipeline::segment_with_diagnostics(&image_bytes, Some(&model), &config)
            {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!("Pipeline error: {e}");
                    return ExitCode::FAILURE;
                }
            };

        if cli.json {
            let report = RunReport {
                names: &segmentation.names,
                records: &segmentation.records,
                diagnostics: &diagnostics,
            };
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    tracing::error!("Error serializing report: {e}");
                    return ExitCode::FAILURE;
                }
            }
        } else {
            println!("{}", diagnostics.report());
            for record in &segmentation.records {
                println!(
                    "  {:<12} {:>9} px  {:>5.1}%",
                    record.class_name,
                    record.pixel_count,
                    record.rounded_percentage(),
                );
            }
        }

        // Write images on the first run only.
        if run == 0
            && let Err(msg) = write_images(&cli, &segmentation)
        {
            tracing::error!("{msg}");
            return ExitCode::FAILURE;
        }

        all_diagnostics.push(diagnostics);
    }

    if cli.runs > 1 {
        print_multi_run_summary(&all_diagnostics);
    }

    ExitCode::SUCCESS
}

/// Print mean and min/max stage durations across runs.
#[allow(clippy::cast_precision_loss)]
fn print_multi_run_summary(all_diagnostics: &[PipelineDiagnostics]) {
    println!();
    println!(
        "Summary ({} runs)\n{}",
        all_diagnostics.len(),
        "=".repeat(60),
    );
    println!(
        "{:<16} {:>12} {:>12} {:>12}",
        "Stage", "Mean", "Min", "Max"
    );
    println!("{}", "-".repeat(56));

    let Some(first) = all_diagnostics.first() else {
        return;
    };
    let names: Vec<&str> = first.stages().iter().map(|(name, _)| *name).collect();
    for name in names {
        let times: Vec<f64> = all_diagnostics
            .iter()
            .filter_map(|d| {
                d.stages()
                    .into_iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, s)| s.duration.as_secs_f64() * 1000.0)
            })
            .collect();
        print_row(name, &times);
    }
    let totals: Vec<f64> = all_diagnostics
        .iter()
        .map(|d| d.total_duration.as_secs_f64() * 1000.0)
        .collect();
    print_row("Total", &totals);
}

#[allow(clippy::cast_precision_loss)]
fn print_row(name: &str, times_ms: &[f64]) {
    if times_ms.is_empty() {
        return;
    }
    let mean = times_ms.iter().sum::<f64>() / times_ms.len() as f64;
    let min = times_ms.iter().copied().fold(f64::INFINITY, f64::min);
    let max = times_ms.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    println!("{name:<16} {mean:>10.3}ms {min:>10.3}ms {max:>10.3}ms");
}
