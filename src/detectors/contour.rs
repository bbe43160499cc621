//! Multi-pass contour detector ("ultra").
//!
//! Each pass binarizes the working image its own way, closes small gaps,
//! traces outer contours and keeps the ones that simplify to a polygon with at
//! least four corners. A box found by several passes is more trustworthy, so
//! confidence grows with the number of passes that agree on it.

use image::GrayImage;
use imageproc::{
    contours::{BorderType, find_contours},
    contrast::otsu_level,
    distance_transform::Norm,
    edges::canny,
    filter::{gaussian_blur_f32, median_filter},
    geometry::{approximate_polygon_dp, arc_length},
    morphology::{close, dilate},
};

use super::{CandidateRegion, Detector, DetectorKind, WorkingImage, suppress_overlaps};
use crate::{
    geometry::BBox,
    imaging::{adaptive_mask, clahe, gradient_magnitude, ink_fraction, otsu_mask, threshold_mask},
    prelude::*,
};

/// Accepted width/height ratios.
const MIN_ASPECT: f64 = 0.1;
const MAX_ASPECT: f64 = 10.0;

/// Boxes from different passes with at least this IoU count as agreeing.
const AGREEMENT_IOU: f64 = 0.5;

/// Masks with more ink than this are degenerate (typically a uniform page
/// that thresholding flipped entirely).
const MAX_MASK_INK: f64 = 0.9;

/// How a pass turns the grayscale page into a binary mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Preprocess {
    /// CLAHE, then Otsu.
    Clahe,
    /// Edge-preserving denoise (median + light blur), then Otsu.
    Denoise,
    /// Sobel gradient magnitude, then Otsu on the gradient.
    Gradient,
    /// Local-mean adaptive threshold.
    Adaptive,
    /// Canny edges.
    Edges,
    /// Anything clearly darker than paper.
    Paper,
}

/// One pass of the detector.
#[derive(Clone, Copy, Debug)]
pub struct Pass {
    pub name: &'static str,
    pub preprocess: Preprocess,
    /// Minimum contour area is `image_area / area_divisor`.
    pub area_divisor: u32,
}

/// The default pass list.
pub const DEFAULT_PASSES: &[Pass] = &[
    Pass {
        name: "clahe",
        preprocess: Preprocess::Clahe,
        area_divisor: 50,
    },
    Pass {
        name: "denoise",
        preprocess: Preprocess::Denoise,
        area_divisor: 40,
    },
    Pass {
        name: "gradient",
        preprocess: Preprocess::Gradient,
        area_divisor: 60,
    },
    Pass {
        name: "adaptive",
        preprocess: Preprocess::Adaptive,
        area_divisor: 50,
    },
    Pass {
        name: "edges",
        preprocess: Preprocess::Edges,
        area_divisor: 80,
    },
    Pass {
        name: "paper",
        preprocess: Preprocess::Paper,
        area_divisor: 30,
    },
];

/// The multi-pass contour detector.
pub struct ContourDetector {
    passes: Vec<Pass>,
}

impl Default for ContourDetector {
    fn default() -> Self {
        Self {
            passes: DEFAULT_PASSES.to_vec(),
        }
    }
}

impl Detector for ContourDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Ultra
    }

    fn detect(&self, image: &WorkingImage) -> Result<Vec<CandidateRegion>> {
        let close_radius = (image.width().max(image.height()) / 150).clamp(2, 8) as u8;

        let mut per_pass: Vec<Vec<BBox>> = Vec::with_capacity(self.passes.len());
        for pass in &self.passes {
            let mask = pass_mask(&image.gray, pass.preprocess, close_radius);
            if ink_fraction(&mask) > MAX_MASK_INK {
                trace!(pass = pass.name, "Skipping degenerate mask");
                per_pass.push(vec![]);
                continue;
            }
            let mut boxes = quadrilateral_boxes(&mask, image.min_area(pass.area_divisor));
            boxes.retain(|b| !image.too_small(b));
            trace!(pass = pass.name, count = boxes.len(), "Pass finished");
            per_pass.push(boxes);
        }

        let mut candidates = vec![];
        for boxes in &per_pass {
            for bbox in boxes {
                let agreeing = per_pass
                    .iter()
                    .filter(|other| other.iter().any(|b| b.iou(bbox) >= AGREEMENT_IOU))
                    .count();
                candidates.push(CandidateRegion {
                    bbox: *bbox,
                    detector: DetectorKind::Ultra,
                    confidence: pass_confidence(agreeing),
                });
            }
        }
        Ok(suppress_overlaps(candidates, AGREEMENT_IOU))
    }
}

/// `0.5 + 0.1` per agreeing pass, capped at 1.
pub fn pass_confidence(agreeing_passes: usize) -> f64 {
    (0.5 + 0.1 * agreeing_passes as f64).min(1.0)
}

/// Build the binary mask for one pass. Foreground is 255.
fn pass_mask(gray: &GrayImage, preprocess: Preprocess, close_radius: u8) -> GrayImage {
    match preprocess {
        Preprocess::Clahe => {
            let equalized = clahe(gray, 2.0, 8);
            close(&otsu_mask(&equalized, true), Norm::LInf, close_radius)
        }
        Preprocess::Denoise => {
            let smoothed = gaussian_blur_f32(&median_filter(gray, 2, 2), 1.0);
            close(&otsu_mask(&smoothed, true), Norm::LInf, close_radius)
        }
        Preprocess::Gradient => {
            let gradient = gradient_magnitude(gray);
            let level = otsu_level(&gradient).max(16);
            close(
                &threshold_mask(&gradient, level, false),
                Norm::LInf,
                close_radius,
            )
        }
        Preprocess::Adaptive => {
            let radius = (gray.width().max(gray.height()) / 60).max(3);
            close(&adaptive_mask(gray, radius, 10.0), Norm::LInf, close_radius)
        }
        Preprocess::Edges => dilate(&canny(gray, 30.0, 90.0), Norm::LInf, close_radius),
        Preprocess::Paper => close(
            &threshold_mask(gray, 200, true),
            Norm::LInf,
            close_radius,
        ),
    }
}

/// Trace outer contours, keep the ones that simplify to exactly four
/// corners, and return their bounding boxes.
pub fn quadrilateral_boxes(mask: &GrayImage, min_area: u64) -> Vec<BBox> {
    let image_area = u64::from(mask.width()) * u64::from(mask.height());
    let mut boxes = vec![];
    for contour in find_contours::<u32>(mask) {
        if contour.border_type != BorderType::Outer || contour.points.len() < 4 {
            continue;
        }
        let Some(bbox) = BBox::enclosing(contour.points.iter().map(|p| (p.x, p.y))) else {
            continue;
        };
        if bbox.area() < min_area || bbox.area() >= image_area {
            continue;
        }
        let aspect = bbox.aspect_ratio();
        if !(MIN_ASPECT..=MAX_ASPECT).contains(&aspect) {
            continue;
        }
        let epsilon = 0.02 * arc_length(&contour.points, true);
        let polygon = approximate_polygon_dp(&contour.points, epsilon, true);
        if polygon.len() != 4 {
            trace!(?bbox, corners = polygon.len(), "Not a quadrilateral");
            continue;
        }
        boxes.push(bbox);
    }
    boxes
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;
    use crate::detectors::test_pages::{found, page_with};

    #[test]
    fn confidence_grows_with_agreement() {
        assert!((pass_confidence(1) - 0.6).abs() < 1e-9);
        assert!((pass_confidence(3) - 0.8).abs() < 1e-9);
        assert_eq!(pass_confidence(6), 1.0);
    }

    #[test]
    fn rectangles_survive_thin_lines_do_not() {
        let mut mask = GrayImage::new(200, 200);
        for y in 20..80 {
            for x in 30..120 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        // A rule line: aspect far outside [0.1, 10].
        for x in 10..190 {
            mask.put_pixel(x, 150, Luma([255]));
            mask.put_pixel(x, 151, Luma([255]));
        }
        let boxes = quadrilateral_boxes(&mask, 400);
        assert_eq!(boxes, vec![BBox::new(30, 20, 90, 60)]);
    }

    #[test]
    fn round_and_l_shaped_blobs_are_not_plates() {
        let mut mask = GrayImage::new(300, 300);
        // A filled disc.
        for y in 0..120u32 {
            for x in 0..120u32 {
                let (dx, dy) = (x as i64 - 60, y as i64 - 60);
                if dx * dx + dy * dy <= 50 * 50 {
                    mask.put_pixel(x, y, Luma([255]));
                }
            }
        }
        // An L: a 100 x 30 bar with a 30 x 100 bar hanging from its left end.
        for y in 160..260 {
            for x in 160..260 {
                if y < 190 || x < 190 {
                    mask.put_pixel(x, y, Luma([255]));
                }
            }
        }
        assert!(quadrilateral_boxes(&mask, 400).is_empty());
    }

    #[test]
    fn finds_two_plates_with_full_agreement() {
        let top = BBox::new(150, 120, 500, 380);
        let bottom = BBox::new(200, 700, 420, 300);
        let raster = page_with(
            800,
            1100,
            &[(top, [30, 30, 30]), (bottom, [90, 70, 50])],
        );
        let working = WorkingImage::new(&raster);
        let candidates = ContourDetector::default().detect(&working).unwrap();
        let boxes = candidates
            .iter()
            .filter_map(|c| working.to_raster(&c.bbox))
            .collect::<Vec<_>>();
        assert!(found(&boxes, &top, 0.9), "{boxes:?}");
        assert!(found(&boxes, &bottom, 0.9), "{boxes:?}");
        let best = candidates
            .iter()
            .filter(|c| {
                working
                    .to_raster(&c.bbox)
                    .is_some_and(|b| b.iou(&top) >= 0.9)
            })
            .map(|c| c.confidence)
            .fold(0.0, f64::max);
        assert!(best >= 0.8, "confidence {best}");
    }
}
