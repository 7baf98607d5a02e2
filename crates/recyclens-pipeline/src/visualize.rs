//! Render a class mask as a flat color map and as a blended overlay,
//! both annotated with class name labels.

use image::Rgb;
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};

use crate::config::{ClassCatalog, RenderParams};
use crate::label::LabelPainter;
use crate::types::{BACKGROUND, ClassMask, Color, Dimensions, PipelineError, RgbImage};

/// Where one class label goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelPlacement {
    /// Class id being labelled.
    pub class_id: u8,
    /// Label text.
    pub text: String,
    /// Centroid of the class's pixels, floored.
    pub center: (u32, u32),
    /// Pixels the class covers.
    pub pixel_count: u64,
}

/// Both rendered artifacts.
#[derive(Debug, Clone)]
pub struct Rendered {
    /// Palette colors on a background fill.
    pub flat_mask: RgbImage,
    /// Class colors blended into the original photo.
    pub overlay: RgbImage,
    /// Labels drawn on both images, ascending class id.
    pub labels: Vec<LabelPlacement>,
}

/// Paint every pixel with its class color; background gets
/// `background_color`.
#[must_use]
pub fn render_flat_mask(mask: &ClassMask, catalog: &ClassCatalog, background: Color) -> RgbImage {
    RgbImage::from_fn(mask.width(), mask.height(), |x, y| {
        match mask.class_at(x, y) {
            BACKGROUND => Rgb(background),
            class_id => Rgb(catalog.color(class_id)),
        }
    })
}

/// Blend class colors into `image`: `round(orig * weight + color * (1 - weight))`.
///
/// Background pixels are copied unchanged. `image` and `mask` must have
/// the same dimensions.
#[must_use]
pub fn render_overlay(
    image: &RgbImage,
    mask: &ClassMask,
    catalog: &ClassCatalog,
    weight: f32,
) -> RgbImage {
    let mut overlay = image.clone();
    for (x, y, pixel) in overlay.enumerate_pixels_mut() {
        let class_id = mask.class_at(x, y);
        if class_id == BACKGROUND {
            continue;
        }
        let color = catalog.color(class_id);
        for (channel, &tint) in pixel.0.iter_mut().zip(&color) {
            let value = f32::from(*channel).mul_add(weight, f32::from(tint) * (1.0 - weight));
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let blended = value.round().clamp(0.0, 255.0) as u8;
            *channel = blended;
        }
    }
    overlay
}

/// One label per class with at least `min_pixel_count` pixels, placed at
/// the floored mean of the class's pixel coordinates.
#[must_use]
pub fn label_placements(
    mask: &ClassMask,
    catalog: &ClassCatalog,
    min_pixel_count: u64,
) -> Vec<LabelPlacement> {
    // (count, sum x, sum y) per class id.
    let mut sums = [(0u64, 0u64, 0u64); 256];
    for (x, y, pixel) in mask.as_image().enumerate_pixels() {
        let entry = &mut sums[usize::from(pixel.0[0])];
        entry.0 += 1;
        entry.1 += u64::from(x);
        entry.2 += u64::from(y);
    }

    sums.iter()
        .enumerate()
        .skip(1)
        .filter(|(_, (count, _, _))| *count > 0 && *count >= min_pixel_count)
        .filter_map(|(id, &(count, sx, sy))| {
            let class_id = u8::try_from(id).ok()?;
            let cx = u32::try_from(sx / count).ok()?;
            let cy = u32::try_from(sy / count).ok()?;
            Some(LabelPlacement {
                class_id,
                text: catalog.name(class_id).to_string(),
                center: (cx, cy),
                pixel_count: count,
            })
        })
        .collect()
}

/// Draw each label as text on a filled box centered on its placement.
///
/// The box spans `center ± (text_size / 2 + padding)` inclusive. Labels
/// may overlap; later ones draw on top.
pub fn draw_labels(
    canvas: &mut RgbImage,
    labels: &[LabelPlacement],
    painter: &dyn LabelPainter,
    params: &RenderParams,
) {
    let pad = i64::from(params.label_padding);
    for label in labels {
        let (tw, th) = painter.measure(&label.text);
        let (half_w, half_h) = (i64::from(tw / 2), i64::from(th / 2));
        let (cx, cy) = (i64::from(label.center.0), i64::from(label.center.1));

        let left = cx - half_w - pad;
        let top = cy - half_h - pad;
        let right = cx + half_w + pad;
        let bottom = cy + half_h + pad;
        let (Ok(left), Ok(top), Ok(width), Ok(height)) = (
            i32::try_from(left),
            i32::try_from(top),
            u32::try_from(right - left + 1),
            u32::try_from(bottom - top + 1),
        ) else {
            continue;
        };
        draw_filled_rect_mut(
            canvas,
            Rect::at(left, top).of_size(width, height),
            Rgb(params.label_box_color),
        );

        let (Ok(text_x), Ok(text_y)) = (i32::try_from(cx - half_w), i32::try_from(cy - half_h))
        else {
            continue;
        };
        painter.paint(
            canvas,
            text_x,
            text_y,
            &label.text,
            Rgb(params.label_text_color),
        );
    }
}

/// Render the flat mask and overlay for `mask` over `image`, labelled.
///
/// # Errors
///
/// Returns [`PipelineError::DimensionMismatch`] if `image` and `mask`
/// differ in size.
pub fn visualize(
    image: &RgbImage,
    mask: &ClassMask,
    catalog: &ClassCatalog,
    params: &RenderParams,
    painter: &dyn LabelPainter,
) -> Result<Rendered, PipelineError> {
    let image_size = Dimensions::new(image.width(), image.height());
    if image_size != mask.dimensions() {
        return Err(PipelineError::DimensionMismatch {
            expected: mask.dimensions().to_string(),
            actual: image_size.to_string(),
        });
    }

    let labels = label_placements(mask, catalog, params.min_label_pixel_count);

    let mut flat_mask = render_flat_mask(mask, catalog, params.background_color);
    let mut overlay = render_overlay(image, mask, catalog, params.overlay_blend_weight);
    draw_labels(&mut flat_mask, &labels, painter, params);
    draw_labels(&mut overlay, &labels, painter, params);

    tracing::debug!(size = %image_size, labels = labels.len(), "rendered segmentation");
    Ok(Rendered {
        flat_mask,
        overlay,
        labels,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::label::LabelFont;

    const GRAY: Rgb<u8> = Rgb([100, 100, 100]);

    fn catalog() -> ClassCatalog {
        ClassCatalog {
            names: vec!["background".into(), "thing".into(), "other".into()],
            palette: vec![[0, 0, 0], [200, 200, 200], [0, 0, 255]],
        }
    }

    fn block_mask(w: u32, h: u32, x0: u32, y0: u32, side: u32, class_id: u8) -> ClassMask {
        ClassMask::from_fn(w, h, |x, y| {
            if (x0..x0 + side).contains(&x) && (y0..y0 + side).contains(&y) {
                class_id
            } else {
                BACKGROUND
            }
        })
    }

    #[test]
    fn all_background_leaves_image_untouched() {
        let image = RgbImage::from_fn(16, 12, |x, y| {
            #[allow(clippy::cast_possible_truncation)]
            let v = (x * 10 + y) as u8;
            Rgb([v, 255 - v, 7])
        });
        let mask = ClassMask::new(16, 12);
        let params = RenderParams::default();
        let rendered =
            visualize(&image, &mask, &catalog(), &params, &LabelFont::default()).unwrap();
        assert_eq!(rendered.overlay, image);
        assert!(rendered.flat_mask.pixels().all(|p| p.0 == params.background_color));
        assert!(rendered.labels.is_empty());
    }

    #[test]
    fn overlay_blends_with_weight() {
        let image = RgbImage::from_pixel(10, 10, GRAY);
        let mut mask = ClassMask::new(10, 10);
        mask.set(3, 3, 1);
        let overlay = render_overlay(&image, &mask, &catalog(), 0.6);
        // 100 * 0.6 + 200 * 0.4
        assert_eq!(overlay.get_pixel(3, 3).0, [140, 140, 140]);
        assert_eq!(*overlay.get_pixel(4, 3), GRAY);
    }

    #[test]
    fn flat_mask_uses_palette() {
        let mut mask = ClassMask::new(4, 4);
        mask.set(1, 2, 2);
        let flat = render_flat_mask(&mask, &catalog(), [9, 9, 9]);
        assert_eq!(flat.get_pixel(1, 2).0, [0, 0, 255]);
        assert_eq!(flat.get_pixel(0, 0).0, [9, 9, 9]);
    }

    #[test]
    fn only_large_classes_are_labelled() {
        let mut mask = block_mask(40, 40, 0, 0, 10, 1);
        // 99 pixels of class 2.
        for i in 0..99 {
            mask.set(20 + i % 10, 20 + i / 10, 2);
        }
        let labels = label_placements(&mask, &catalog(), 100);
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].class_id, 1);
        assert_eq!(labels[0].text, "thing");
        // Mean of 0..10 is 4.5, floored.
        assert_eq!(labels[0].center, (4, 4));
        assert_eq!(labels[0].pixel_count, 100);
    }

    #[test]
    fn label_box_spans_padded_text_bounds() {
        let image = RgbImage::from_pixel(60, 60, GRAY);
        let mask = block_mask(60, 60, 20, 20, 20, 1);
        let params = RenderParams::default();
        let font = LabelFont::Bitmap { scale: 1 };
        let rendered = visualize(&image, &mask, &catalog(), &params, &font).unwrap();

        // Centroid (29, 29); "thing" measures 29x7 -> half extents 14, 3;
        // box spans x 11..=47, y 22..=36.
        let black = [0, 0, 0];
        assert_eq!(rendered.overlay.get_pixel(11, 22).0, black);
        assert_eq!(rendered.overlay.get_pixel(47, 36).0, black);
        assert_eq!(*rendered.overlay.get_pixel(10, 22), GRAY);
        assert_eq!(*rendered.overlay.get_pixel(48, 36), GRAY);
        assert_eq!(rendered.flat_mask.get_pixel(11, 22).0, black);
        assert!(rendered.overlay.pixels().any(|p| p.0 == [255, 255, 255]));
    }

    #[test]
    fn mismatched_sizes_rejected() {
        let image = RgbImage::new(10, 10);
        let mask = ClassMask::new(10, 11);
        let result = visualize(
            &image,
            &mask,
            &catalog(),
            &RenderParams::default(),
            &LabelFont::default(),
        );
        assert!(matches!(
            result,
            Err(PipelineError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn labels_near_edge_are_clipped_not_dropped() {
        let image = RgbImage::from_pixel(20, 20, GRAY);
        let mask = block_mask(20, 20, 0, 0, 12, 1);
        let rendered = visualize(
            &image,
            &mask,
            &catalog(),
            &RenderParams::default(),
            &LabelFont::default(),
        )
        .unwrap();
        assert_eq!(rendered.labels.len(), 1);
        assert_eq!(rendered.overlay.get_pixel(0, 0).0, [0, 0, 0]);
    }
}
