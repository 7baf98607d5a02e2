//! 4-connected components of a single class in a [`ClassMask`].

use image::Luma;
use imageproc::region_labelling::{Connectivity, connected_components};

use crate::types::ClassMask;

/// Pixels of one connected component, in row-major scan order.
pub type Component = Vec<(u32, u32)>;

/// Partition the pixels of `class_id` into 4-connected components.
///
/// Components are returned in the order their first pixel appears in a
/// row-major scan, so the result is deterministic for a given mask.
#[must_use]
pub fn class_components(mask: &ClassMask, class_id: u8) -> Vec<Component> {
    let binary = mask.binary(class_id);
    let labels = connected_components(&binary, Connectivity::Four, Luma([0u8]));

    let mut components: Vec<Component> = Vec::new();
    // imageproc hands out labels in scan order but may leave gaps, so
    // remap them densely as they are first seen.
    let mut slots: Vec<Option<usize>> = Vec::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label.0[0] as usize;
        if label == 0 {
            continue;
        }
        if slots.len() <= label {
            slots.resize(label + 1, None);
        }
        let slot = *slots[label].get_or_insert_with(|| {
            components.push(Vec::new());
            components.len() - 1
        });
        components[slot].push((x, y));
    }
    components
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_class_has_no_components() {
        let mask = ClassMask::new(5, 5);
        assert!(class_components(&mask, 2).is_empty());
    }

    #[test]
    fn diagonal_neighbors_are_separate_components() {
        let mut mask = ClassMask::new(4, 4);
        mask.set(0, 0, 1);
        mask.set(1, 1, 1);
        let components = class_components(&mask, 1);
        assert_eq!(components.len(), 2);
        assert_eq!(components[0], vec![(0, 0)]);
        assert_eq!(components[1], vec![(1, 1)]);
    }

    #[test]
    fn orthogonal_neighbors_join() {
        let mut mask = ClassMask::new(4, 4);
        for (x, y) in [(0, 0), (1, 0), (1, 1), (1, 2)] {
            mask.set(x, y, 3);
        }
        let components = class_components(&mask, 3);
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].len(), 4);
    }

    #[test]
    fn other_classes_split_components() {
        // 1 2 1 -> class 1 has two components separated by class 2.
        let mask = ClassMask::from_fn(3, 1, |x, _| if x == 1 { 2 } else { 1 });
        assert_eq!(class_components(&mask, 1).len(), 2);
        assert_eq!(class_components(&mask, 2).len(), 1);
    }

    #[test]
    fn components_cover_every_class_pixel_once() {
        let mask = ClassMask::from_fn(8, 8, |x, y| u8::from((x / 2 + y / 3) % 2 == 0));
        let components = class_components(&mask, 1);
        let total: usize = components.iter().map(Vec::len).sum();
        let expected = mask.as_image().pixels().filter(|p| p.0[0] == 1).count();
        assert_eq!(total, expected);
    }
}
