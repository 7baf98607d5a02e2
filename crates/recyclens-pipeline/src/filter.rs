//! Confidence-adaptive removal of spurious small detections.
//!
//! The raw argmax mask is noisy: small specks of a class appear wherever
//! that class narrowly wins. A single fixed confidence cutoff either keeps
//! the noise or throws away small but genuine objects, so each class gets
//! its own threshold derived from how confident the model is about that
//! class across the whole image.
//!
//! For every non-background class present:
//!
//! 1. threshold = `max(base_confidence_threshold, P-th percentile)` of the
//!    class's per-pixel probabilities over all of its pixels.
//! 2. Each 4-connected component covering at least `min_area_ratio` of
//!    the image is kept as-is.
//! 3. Smaller components survive only if their most confident pixel
//!    reaches the threshold; otherwise they revert to background.
//!
//! Classes are filtered independently: a class only ever loses its own
//! pixels, and only to background.

use serde::{Deserialize, Serialize};

use crate::components::class_components;
use crate::config::FilterParams;
use crate::types::{BACKGROUND, ClassMask, PipelineError, ProbabilityTensor};

/// What the filter did to one class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassFilterStats {
    /// Class id.
    pub class_id: u8,
    /// Adaptive threshold applied to small components.
    pub threshold: f32,
    /// Class pixels before filtering.
    pub pixels_before: u64,
    /// Number of connected components found.
    pub components: usize,
    /// Components reverted to background.
    pub components_removed: usize,
    /// Pixels reverted to background.
    pub pixels_removed: u64,
}

/// Filtered mask plus per-class statistics.
#[derive(Debug, Clone)]
pub struct FilterOutcome {
    /// The filtered mask.
    pub mask: ClassMask,
    /// One entry per non-background class present, ascending class id.
    pub stats: Vec<ClassFilterStats>,
}

/// Apply confidence-adaptive component filtering to an argmax mask.
///
/// Class ids in `mask` with no channel in `probabilities` are left
/// untouched.
///
/// # Errors
///
/// Returns [`PipelineError::DimensionMismatch`] if `mask` and
/// `probabilities` differ in spatial size.
pub fn filter_by_confidence(
    mask: &ClassMask,
    probabilities: &ProbabilityTensor,
    params: &FilterParams,
) -> Result<FilterOutcome, PipelineError> {
    if mask.dimensions() != probabilities.dimensions() {
        return Err(PipelineError::DimensionMismatch {
            expected: probabilities.dimensions().to_string(),
            actual: mask.dimensions().to_string(),
        });
    }
    let num_classes = probabilities.num_classes();
    let total_pixels = mask.dimensions().pixel_count();

    // Per-class confidence samples, indexed by class id.
    let mut confidences: Vec<Vec<f32>> = vec![Vec::new(); num_classes];
    for (x, y, pixel) in mask.as_image().enumerate_pixels() {
        let class_id = pixel.0[0];
        if class_id != BACKGROUND && usize::from(class_id) < num_classes {
            confidences[usize::from(class_id)].push(probabilities.confidence(class_id, x, y));
        }
    }

    let mut filtered = mask.clone();
    let mut stats = Vec::new();

    for (class_index, samples) in confidences.iter_mut().enumerate() {
        if samples.is_empty() {
            continue;
        }
        #[allow(clippy::cast_possible_truncation)]
        let class_id = class_index as u8;
        let pixels_before = samples.len() as u64;
        let threshold = params
            .base_confidence_threshold
            .max(percentile(samples, params.confidence_percentile));

        let components = class_components(mask, class_id);
        let mut class_stats = ClassFilterStats {
            class_id,
            threshold,
            pixels_before,
            components: components.len(),
            components_removed: 0,
            pixels_removed: 0,
        };

        for component in &components {
            #[allow(clippy::cast_precision_loss)]
            let area_ratio = component.len() as f64 / total_pixels as f64;
            if area_ratio >= params.min_area_ratio {
                continue;
            }
            let peak = component
                .iter()
                .map(|&(x, y)| probabilities.confidence(class_id, x, y))
                .fold(f32::NEG_INFINITY, f32::max);
            if peak >= threshold {
                continue;
            }
            for &(x, y) in component {
                filtered.set(x, y, BACKGROUND);
            }
            class_stats.components_removed += 1;
            class_stats.pixels_removed += component.len() as u64;
        }

        tracing::trace!(
            class_id,
            threshold,
            components = class_stats.components,
            removed = class_stats.components_removed,
            "filtered class",
        );
        stats.push(class_stats);
    }

    Ok(FilterOutcome {
        mask: filtered,
        stats,
    })
}

/// The `pct`-th percentile of `values` using linear interpolation
/// between the two closest ranks.
///
/// Sorts `values` in place. Returns `NaN` for an empty slice.
#[must_use]
pub fn percentile(values: &mut [f32], pct: f64) -> f32 {
    if values.is_empty() {
        return f32::NAN;
    }
    values.sort_by(f32::total_cmp);
    #[allow(clippy::cast_precision_loss)]
    let rank = (pct / 100.0).clamp(0.0, 1.0) * (values.len() - 1) as f64;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let (lo, hi) = (rank.floor() as usize, rank.ceil() as usize);
    #[allow(clippy::cast_possible_truncation)]
    let fraction = (rank - rank.floor()) as f32;
    (values[hi] - values[lo]).mul_add(fraction, values[lo])
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use ndarray::Array3;

    use super::*;

    const CLASSES: usize = 7;

    /// Build a tensor where each pixel's winning class and its
    /// probability come from `f`; the remainder is split evenly across
    /// the other classes.
    fn tensor(w: u32, h: u32, f: impl Fn(u32, u32) -> (u8, f32)) -> ProbabilityTensor {
        #[allow(clippy::cast_precision_loss)]
        let others = (CLASSES - 1) as f32;
        let array = Array3::from_shape_fn((CLASSES, h as usize, w as usize), |(c, y, x)| {
            #[allow(clippy::cast_possible_truncation)]
            let (class, p) = f(x as u32, y as u32);
            if c == usize::from(class) {
                p
            } else {
                (1.0 - p) / others
            }
        });
        ProbabilityTensor::new(array).unwrap()
    }

    fn count(mask: &ClassMask, class_id: u8) -> usize {
        mask.as_image().pixels().filter(|p| p.0[0] == class_id).count()
    }

    /// 64x64 image: a 10x10 class-3 region at confidence 0.20 (large
    /// enough to keep unconditionally) and a 2x2 class-3 blob at
    /// `blob_confidence` far from it.
    fn blob_scene(blob_confidence: f32) -> ProbabilityTensor {
        tensor(64, 64, |x, y| {
            if x < 10 && y < 10 {
                (3, 0.20)
            } else if (40..42).contains(&x) && (40..42).contains(&y) {
                (3, blob_confidence)
            } else {
                (0, 0.94)
            }
        })
    }

    #[test]
    fn percentile_interpolates_linearly() {
        let mut values = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert!((percentile(&mut values, 70.0) - 3.8).abs() < 1e-6);
        assert!((percentile(&mut values, 0.0) - 1.0).abs() < f32::EPSILON);
        assert!((percentile(&mut values, 100.0) - 5.0).abs() < f32::EPSILON);
    }

    #[test]
    fn percentile_of_single_value() {
        let mut values = [0.42];
        assert!((percentile(&mut values, 70.0) - 0.42).abs() < f32::EPSILON);
    }

    #[test]
    fn percentile_sorts_unordered_input() {
        let mut values = [5.0, 1.0, 4.0, 2.0, 3.0];
        assert!((percentile(&mut values, 50.0) - 3.0).abs() < f32::EPSILON);
    }

    #[test]
    fn small_confident_blob_is_retained() {
        let probs = blob_scene(0.26);
        let mask = ClassMask::from_probabilities(&probs);
        let outcome = filter_by_confidence(&mask, &probs, &FilterParams::default()).unwrap();

        let stats = &outcome.stats[0];
        assert_eq!(stats.class_id, 3);
        // The 70th percentile of 100 x 0.20 and 4 x 0.26 is 0.20, below
        // the 0.25 floor.
        assert!((stats.threshold - 0.25).abs() < f32::EPSILON);
        assert_eq!(outcome.mask.class_at(40, 40), 3);
        assert_eq!(count(&outcome.mask, 3), 104);
    }

    #[test]
    fn small_unconfident_blob_is_removed() {
        let probs = blob_scene(0.20);
        let mask = ClassMask::from_probabilities(&probs);
        let outcome = filter_by_confidence(&mask, &probs, &FilterParams::default()).unwrap();

        assert_eq!(outcome.mask.class_at(40, 40), BACKGROUND);
        assert_eq!(outcome.mask.class_at(41, 41), BACKGROUND);
        // The large region is kept regardless of its low confidence.
        assert_eq!(count(&outcome.mask, 3), 100);
        assert_eq!(outcome.stats[0].components_removed, 1);
        assert_eq!(outcome.stats[0].pixels_removed, 4);
    }

    #[test]
    fn area_ratio_boundary_is_inclusive() {
        // A 2x2 component in a 64x64 image has ratio exactly 4/4096.
        let probs = tensor(64, 64, |x, y| {
            if (10..12).contains(&x) && (10..12).contains(&y) {
                (2, 0.15)
            } else {
                (0, 0.94)
            }
        });
        let mask = ClassMask::from_probabilities(&probs);
        let at_boundary = FilterParams {
            min_area_ratio: 4.0 / 4096.0,
            ..FilterParams::default()
        };
        let kept = filter_by_confidence(&mask, &probs, &at_boundary).unwrap();
        assert_eq!(count(&kept.mask, 2), 4);

        let just_above = FilterParams {
            min_area_ratio: 5.0 / 4096.0,
            ..FilterParams::default()
        };
        let removed = filter_by_confidence(&mask, &probs, &just_above).unwrap();
        assert_eq!(count(&removed.mask, 2), 0);
    }

    #[test]
    fn adaptive_threshold_rises_above_floor() {
        // Mostly very confident class-1 pixels push the 70th percentile
        // to 0.9, so a small component at 0.5 is dropped even though it
        // clears the 0.25 floor.
        let probs = tensor(64, 64, |x, y| {
            if y < 20 {
                (1, 0.9)
            } else if x == 50 && y == 50 {
                (1, 0.5)
            } else {
                (0, 0.94)
            }
        });
        let mask = ClassMask::from_probabilities(&probs);
        let outcome = filter_by_confidence(&mask, &probs, &FilterParams::default()).unwrap();
        assert!((outcome.stats[0].threshold - 0.9).abs() < 1e-6);
        assert_eq!(outcome.mask.class_at(50, 50), BACKGROUND);
        assert_eq!(count(&outcome.mask, 1), 64 * 20);
    }

    #[test]
    fn filtering_never_touches_other_classes() {
        let probs = tensor(32, 32, |x, y| match (x, y) {
            (0..=1, 0..=1) => (4, 0.2),
            (20..=29, 20..=29) => (5, 0.3),
            (5, 5) => (6, 0.9),
            _ => (0, 0.94),
        });
        let raw = ClassMask::from_probabilities(&probs);
        let outcome = filter_by_confidence(&raw, &probs, &FilterParams::default()).unwrap();
        for (x, y, p) in outcome.mask.as_image().enumerate_pixels() {
            let before = raw.class_at(x, y);
            assert!(
                p.0[0] == before || p.0[0] == BACKGROUND,
                "pixel ({x},{y}) changed from {before} to {}",
                p.0[0],
            );
        }
        for class_id in 0..7u8 {
            if class_id != BACKGROUND {
                assert!(count(&outcome.mask, class_id) <= count(&raw, class_id));
            }
        }
    }

    #[test]
    fn all_background_mask_is_unchanged() {
        let probs = tensor(8, 8, |_, _| (0, 0.99));
        let mask = ClassMask::from_probabilities(&probs);
        let outcome = filter_by_confidence(&mask, &probs, &FilterParams::default()).unwrap();
        assert_eq!(outcome.mask, mask);
        assert!(outcome.stats.is_empty());
    }

    #[test]
    fn mismatched_tensor_size_rejected() {
        let probs = tensor(16, 16, |_, _| (0, 0.99));
        let mask = ClassMask::new(16, 12);
        let result = filter_by_confidence(&mask, &probs, &FilterParams::default());
        assert!(matches!(
            result,
            Err(PipelineError::DimensionMismatch { .. })
        ));
    }
}
