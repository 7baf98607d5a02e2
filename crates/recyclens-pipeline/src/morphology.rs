//! Per-class morphological cleanup of a filtered mask.
//!
//! Each non-background class is pulled out as a binary sub-mask, opened
//! (erode then dilate) to shave off specks and thin spurs, and closed
//! (dilate then erode) to fill pinholes and hairline gaps. Both use the
//! same elliptical structuring element, via
//! [`imageproc::morphology::grayscale_open`] and
//! [`imageproc::morphology::grayscale_close`].
//!
//! Writing the results back into one mask follows two rules:
//!
//! - a class may only occupy pixels that were its own or background
//!   before refinement, so refinement never steals from another class;
//! - classes are written in ascending id order and never overwrite a
//!   pixel already claimed during this pass, so when two closings reach
//!   the same background pixel the lower class id keeps it.
//!
//! Pixels a class loses to opening become background.

use image::{GrayImage, Luma};
use imageproc::morphology::{Mask, grayscale_close, grayscale_open};
use serde::{Deserialize, Serialize};

use crate::config::RefineParams;
use crate::types::{BACKGROUND, ClassMask};

/// What refinement did to one class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRefineStats {
    /// Class id.
    pub class_id: u8,
    /// Class pixels entering refinement.
    pub pixels_before: u64,
    /// Class pixels after refinement (0 if dropped).
    pub pixels_after: u64,
    /// Whether the class fell below `min_refined_pixels` and was removed.
    pub dropped: bool,
}

/// Refined mask plus per-class statistics.
#[derive(Debug, Clone)]
pub struct RefineOutcome {
    /// The refined mask.
    pub mask: ClassMask,
    /// One entry per non-background class present, ascending class id.
    pub stats: Vec<ClassRefineStats>,
}

/// Rasterize an elliptical structuring element of side `size`.
///
/// Row `i` spans `c - dx ..= c + dx` where `r = c = size / 2`,
/// `dy = i - r` and `dx = round(c * sqrt(1 - dy² / r²))`. Side 3 gives
/// a plus shape; side 1 gives a single pixel.
#[must_use]
pub fn ellipse_raster(size: u32) -> GrayImage {
    let r = size / 2;
    let mut raster = GrayImage::new(size, size);
    for i in 0..size {
        let dy = f64::from(i) - f64::from(r);
        let dx = if r == 0 {
            0.0
        } else {
            let rr = f64::from(r) * f64::from(r);
            (f64::from(r) * ((rr - dy * dy) / rr).max(0.0).sqrt()).round_ties_even()
        };
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let dx = dx as u32;
        let start = r.saturating_sub(dx);
        let end = (r + dx).min(size - 1);
        for j in start..=end {
            raster.put_pixel(j, i, Luma([255]));
        }
    }
    raster
}

/// Elliptical structuring element of side `size`, anchored at its center.
///
/// `size` must be odd and at most
/// [`RefineParams::MAX_KERNEL_SIZE`].
#[must_use]
pub fn elliptical_mask(size: u32) -> Mask {
    let center = u8::try_from(size / 2).unwrap_or(u8::MAX);
    Mask::from_image(&ellipse_raster(size), center, center)
}

/// Open then close every non-background class, writing results back
/// under the isolation rules described in the module docs.
#[must_use]
pub fn refine(mask: &ClassMask, params: &RefineParams) -> RefineOutcome {
    let kernel = elliptical_mask(params.kernel_size);

    let mut counts = [0u64; 256];
    for pixel in mask.as_image().pixels() {
        counts[usize::from(pixel.0[0])] += 1;
    }

    let mut refined = ClassMask::new(mask.width(), mask.height());
    let mut stats = Vec::new();

    for class_id in 1..=u8::MAX {
        let pixels_before = counts[usize::from(class_id)];
        if pixels_before == 0 {
            continue;
        }

        let binary = mask.binary(class_id);
        let closed = grayscale_close(&grayscale_open(&binary, &kernel), &kernel);

        let mut claimed = Vec::new();
        for (x, y, pixel) in closed.enumerate_pixels() {
            if pixel.0[0] == 0 {
                continue;
            }
            let original = mask.class_at(x, y);
            let allowed = original == class_id
                || (original == BACKGROUND && refined.class_at(x, y) == BACKGROUND);
            if allowed {
                refined.set(x, y, class_id);
                claimed.push((x, y));
            }
        }

        let pixels_after = claimed.len() as u64;
        let dropped = params.min_refined_pixels > 0 && pixels_after < params.min_refined_pixels;
        if dropped {
            for (x, y) in claimed {
                refined.set(x, y, BACKGROUND);
            }
            tracing::debug!(class_id, pixels_after, "dropped class after refinement");
        }

        stats.push(ClassRefineStats {
            class_id,
            pixels_before,
            pixels_after: if dropped { 0 } else { pixels_after },
            dropped,
        });
    }

    RefineOutcome {
        mask: refined,
        stats,
    }
}
