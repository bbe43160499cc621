//! Template detector: slides prototype rectangles over a coarse ink map.
//!
//! A prototype scores well when its inside is mostly ink and a thin ring
//! around it is mostly paper. This rescues plates whose edges are too soft
//! for the contour passes, so its confidence stays low.

use image::{GrayImage, imageops};
use imageproc::integral_image::integral_image;

use super::{CandidateRegion, Detector, DetectorKind, WorkingImage, suppress_overlaps};
use crate::{
    geometry::BBox,
    imaging::{INK, otsu_mask},
    prelude::*,
};

/// Longest side of the ink map.
const MAP_MAX_SIDE: u32 = 160;

/// Prototype aspect ratios (width / height).
const ASPECTS: &[f64] = &[1.0, 0.75, 1.333, 0.667, 1.5];

/// Prototype widths, as fractions of the page width.
const WIDTH_FRACTIONS: &[f64] = &[0.3, 0.45, 0.65];

/// Minimum `inside - ring` ink difference.
const MIN_SCORE: f64 = 0.6;

/// Highest confidence this detector reports.
const MAX_CONFIDENCE: f64 = 0.45;

/// Keep at most this many matches per page.
const MAX_MATCHES: usize = 12;

/// The prototype-matching detector.
pub struct TemplateDetector {
    aspects: Vec<f64>,
    width_fractions: Vec<f64>,
}

impl Default for TemplateDetector {
    fn default() -> Self {
        Self {
            aspects: ASPECTS.to_vec(),
            width_fractions: WIDTH_FRACTIONS.to_vec(),
        }
    }
}

/// Summed-area table over a 0/1 ink map.
struct InkTable {
    sums: image::ImageBuffer<image::Luma<u32>, Vec<u32>>,
    width: u32,
    height: u32,
}

impl InkTable {
    fn new(mask: &GrayImage) -> Self {
        let ones = GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
            image::Luma([u8::from(mask.get_pixel(x, y)[0] == INK)])
        });
        Self {
            sums: integral_image::<_, u32>(&ones),
            width: mask.width(),
            height: mask.height(),
        }
    }

    /// Ink pixels in `[x0, x1) x [y0, y1)`, clipped to the map.
    fn ink(&self, x0: i64, y0: i64, x1: i64, y1: i64) -> u64 {
        let clip_x = |v: i64| v.clamp(0, i64::from(self.width)) as u32;
        let clip_y = |v: i64| v.clamp(0, i64::from(self.height)) as u32;
        let (x0, x1, y0, y1) = (clip_x(x0), clip_x(x1), clip_y(y0), clip_y(y1));
        if x1 <= x0 || y1 <= y0 {
            return 0;
        }
        let at = |x: u32, y: u32| i64::from(self.sums.get_pixel(x, y)[0]);
        (at(x1, y1) - at(x0, y1) - at(x1, y0) + at(x0, y0)).max(0) as u64
    }

    fn area(&self, x0: i64, y0: i64, x1: i64, y1: i64) -> u64 {
        let w = (x1.min(i64::from(self.width)) - x0.max(0)).max(0);
        let h = (y1.min(i64::from(self.height)) - y0.max(0)).max(0);
        (w * h) as u64
    }

    /// `inside ink fraction - ring ink fraction` for a box with a ring of
    /// width `ring`.
    fn score(&self, bbox: &BBox, ring: i64) -> f64 {
        let (x0, y0) = (i64::from(bbox.x), i64::from(bbox.y));
        let (x1, y1) = (i64::from(bbox.right()), i64::from(bbox.bottom()));
        let inside_area = self.area(x0, y0, x1, y1);
        if inside_area == 0 {
            return 0.0;
        }
        let inside = self.ink(x0, y0, x1, y1);
        let outer_area = self.area(x0 - ring, y0 - ring, x1 + ring, y1 + ring);
        let outer = self.ink(x0 - ring, y0 - ring, x1 + ring, y1 + ring);
        let ring_area = outer_area.saturating_sub(inside_area);
        let inside_fraction = inside as f64 / inside_area as f64;
        let ring_fraction = if ring_area == 0 {
            0.0
        } else {
            outer.saturating_sub(inside) as f64 / ring_area as f64
        };
        inside_fraction - ring_fraction
    }
}

impl Detector for TemplateDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Template
    }

    fn detect(&self, image: &WorkingImage) -> Result<Vec<CandidateRegion>> {
        let (width, height) = image.gray.dimensions();
        let longest = width.max(height);
        if longest == 0 {
            return Ok(vec![]);
        }
        let factor = (f64::from(longest) / f64::from(MAP_MAX_SIDE)).max(1.0);
        let map_w = ((f64::from(width) / factor).round() as u32).max(1);
        let map_h = ((f64::from(height) / factor).round() as u32).max(1);
        let small = imageops::resize(&image.gray, map_w, map_h, imageops::FilterType::Triangle);
        let table = InkTable::new(&otsu_mask(&small, true));

        let mut matches = vec![];
        for &fraction in &self.width_fractions {
            for &aspect in &self.aspects {
                let w = (f64::from(map_w) * fraction).round() as u32;
                let h = (f64::from(w) / aspect).round() as u32;
                if w < 4 || h < 4 || w > map_w || h > map_h {
                    continue;
                }
                let ring = i64::from((w / 10).max(2));
                let stride = (w / 8).max(2) as usize;
                for y in (0..=map_h - h).step_by(stride) {
                    for x in (0..=map_w - w).step_by(stride) {
                        let bbox = BBox::new(x, y, w, h);
                        let score = table.score(&bbox, ring);
                        let scaled = bbox.scaled(factor);
                        if score >= MIN_SCORE && !image.too_small(&scaled) {
                            matches.push(CandidateRegion {
                                bbox: scaled,
                                detector: DetectorKind::Template,
                                confidence: (0.2 + 0.25 * score).min(MAX_CONFIDENCE),
                            });
                        }
                    }
                }
            }
        }
        trace!(count = matches.len(), "Template matches before suppression");
        let mut kept = suppress_overlaps(matches, 0.3);
        kept.truncate(MAX_MATCHES);
        Ok(kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::test_pages::page_with;

    #[test]
    fn ink_table_counts_rectangles() {
        let mut mask = GrayImage::new(20, 10);
        for y in 2..6 {
            for x in 3..8 {
                mask.put_pixel(x, y, image::Luma([INK]));
            }
        }
        let table = InkTable::new(&mask);
        assert_eq!(table.ink(0, 0, 20, 10), 20);
        assert_eq!(table.ink(3, 2, 8, 6), 20);
        assert_eq!(table.ink(-5, -5, 5, 5), 6);
        let score = table.score(&BBox::new(3, 2, 5, 4), 2);
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn matches_stay_low_confidence() {
        let plate = BBox::new(200, 300, 600, 600);
        let raster = page_with(1000, 1400, &[(plate, [20, 20, 20])]);
        let working = WorkingImage::new(&raster);
        let found = TemplateDetector::default().detect(&working).unwrap();
        assert!(!found.is_empty());
        assert!(found.iter().all(|c| c.confidence <= MAX_CONFIDENCE));
        let best = found
            .iter()
            .filter_map(|c| working.to_raster(&c.bbox))
            .map(|b| b.iou(&plate))
            .fold(0.0, f64::max);
        assert!(best > 0.5, "best IoU {best}");
    }
}
