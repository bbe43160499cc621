//! Saturation detector, for colour plates printed on light paper.

use imageproc::{
    contours::{BorderType, find_contours},
    distance_transform::Norm,
    morphology::close,
};

use super::{CandidateRegion, Detector, DetectorKind, WorkingImage, suppress_overlaps};
use crate::{
    geometry::BBox,
    imaging::{INK, saturation, threshold_mask},
    prelude::*,
};

/// Saturation above which a pixel is considered colour.
const SATURATION_LEVEL: u8 = 60;

/// Minimum share of coloured pixels inside a box.
const MIN_FILL: f64 = 0.35;

/// Minimum box area, as a divisor of the working-image area.
const AREA_DIVISOR: u32 = 100;

/// The HSV saturation detector.
#[derive(Default)]
pub struct ColorDetector;

impl Detector for ColorDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Color
    }

    fn detect(&self, image: &WorkingImage) -> Result<Vec<CandidateRegion>> {
        let sat = saturation(&image.rgb);
        let radius = (image.width().max(image.height()) / 120).clamp(2, 10) as u8;
        let mask = close(
            &threshold_mask(&sat, SATURATION_LEVEL, false),
            Norm::LInf,
            radius,
        );
        let min_area = image.min_area(AREA_DIVISOR);

        let mut found = vec![];
        for contour in find_contours::<u32>(&mask) {
            if contour.border_type != BorderType::Outer {
                continue;
            }
            let Some(bbox) = BBox::enclosing(contour.points.iter().map(|p| (p.x, p.y)))
            else {
                continue;
            };
            if bbox.area() < min_area
                || image.too_small(&bbox)
                || !(0.1..=10.0).contains(&bbox.aspect_ratio())
            {
                continue;
            }
            let fill = fill_fraction(&mask, &bbox);
            if fill < MIN_FILL {
                continue;
            }
            found.push(CandidateRegion {
                bbox,
                detector: DetectorKind::Color,
                confidence: 0.4 + 0.4 * fill,
            });
        }
        trace!(count = found.len(), "Saturated regions");
        Ok(suppress_overlaps(found, 0.5))
    }
}

/// Share of mask pixels set inside `bbox`.
fn fill_fraction(mask: &image::GrayImage, bbox: &BBox) -> f64 {
    let mut ink = 0u64;
    for y in bbox.y..bbox.bottom() {
        for x in bbox.x..bbox.right() {
            if mask.get_pixel(x, y)[0] == INK {
                ink += 1;
            }
        }
    }
    ink as f64 / bbox.area().max(1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::test_pages::{found, page_with};

    #[test]
    fn gray_plates_are_invisible_to_saturation() {
        let plate = BBox::new(100, 100, 400, 300);
        let raster = page_with(800, 1000, &[(plate, [60, 60, 60])]);
        let working = WorkingImage::new(&raster);
        assert!(ColorDetector.detect(&working).unwrap().is_empty());
    }

    #[test]
    fn colour_plate_is_found_with_high_fill() {
        let plate = BBox::new(100, 150, 500, 350);
        let raster = page_with(800, 1000, &[(plate, [200, 40, 40])]);
        let working = WorkingImage::new(&raster);
        let candidates = ColorDetector.detect(&working).unwrap();
        let boxes = candidates
            .iter()
            .filter_map(|c| working.to_raster(&c.bbox))
            .collect::<Vec<_>>();
        assert!(found(&boxes, &plate, 0.9), "{boxes:?}");
        assert!(candidates[0].confidence > 0.75);
    }
}
