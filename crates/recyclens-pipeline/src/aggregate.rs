//! Turn a final mask into reportable per-class detections.

use serde::{Deserialize, Serialize};

use crate::config::ClassCatalog;
use crate::types::{BACKGROUND, ClassMask, DetectionRecord};

/// Detected classes, largest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Detections {
    /// Records sorted by pixel count descending, ties by ascending id.
    pub records: Vec<DetectionRecord>,
    /// Class names in the same order as `records`.
    pub names: Vec<String>,
}

impl Detections {
    /// The largest detected class, if any.
    #[must_use]
    pub fn primary(&self) -> Option<&DetectionRecord> {
        self.records.first()
    }

    /// Returns `true` if nothing was detected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Pixel count for every class id in `0..num_classes`.
///
/// Ids in the mask at or above `num_classes` are not counted, so the
/// sum equals the pixel count only when every id is in range.
#[must_use]
pub fn class_histogram(mask: &ClassMask, num_classes: usize) -> Vec<u64> {
    let mut counts = vec![0u64; num_classes];
    for pixel in mask.as_image().pixels() {
        if let Some(count) = counts.get_mut(usize::from(pixel.0[0])) {
            *count += 1;
        }
    }
    counts
}

/// Summarize a mask into detection records.
///
/// Classes covering less than `min_percentage` percent of the image
/// are left out. Background is never reported.
#[must_use]
pub fn aggregate(mask: &ClassMask, catalog: &ClassCatalog, min_percentage: f64) -> Detections {
    let total = mask.dimensions().pixel_count();
    if total == 0 {
        return Detections::default();
    }

    let histogram = class_histogram(mask, catalog.len());
    let mut records: Vec<DetectionRecord> = histogram
        .iter()
        .enumerate()
        .filter_map(|(id, &pixel_count)| {
            let class_id = u8::try_from(id).ok()?;
            if class_id == BACKGROUND || pixel_count == 0 {
                return None;
            }
            #[allow(clippy::cast_precision_loss)]
            let percentage = pixel_count as f64 / total as f64 * 100.0;
            (percentage >= min_percentage).then(|| DetectionRecord {
                class_id,
                class_name: catalog.name(class_id).to_string(),
                pixel_count,
                percentage,
            })
        })
        .collect();

    records.sort_by(|a, b| {
        b.pixel_count
            .cmp(&a.pixel_count)
            .then(a.class_id.cmp(&b.class_id))
    });
    let names = records.iter().map(|r| r.class_name.clone()).collect();

    Detections { records, names }
}
