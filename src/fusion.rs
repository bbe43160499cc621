//! Fusion of detector candidates into one non-overlapping region set.

use std::collections::BTreeSet;

use crate::{
    detectors::{CandidateRegion, DetectorKind},
    geometry::BBox,
    prelude::*,
};

/// Centers closer than this fraction of the larger box's longest side are
/// "the same place".
pub const CENTER_DISTANCE_FRACTION: f64 = 0.15;

/// Minimum width and height ratios for two boxes to be "the same size".
pub const SIZE_RATIO: f64 = 0.8;

/// Intersection, as a fraction of the smaller area, that makes two boxes
/// duplicates.
pub const OVERLAP_FRACTION: f64 = 0.7;

/// Confidence bonus for each extra detector that agreed.
const AGREEMENT_BONUS: f64 = 0.1;

/// An accepted region.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Region {
    pub bbox: BBox,
    pub confidence: f64,
    pub detectors: BTreeSet<DetectorKind>,
}

impl Region {
    /// Detector names, in a stable order.
    pub fn detection_methods(&self) -> Vec<String> {
        self.detectors.iter().map(|d| d.name().to_owned()).collect()
    }
}

/// Same position and similar size.
fn same_place_and_size(a: &BBox, b: &BBox) -> bool {
    let larger = if a.area() >= b.area() { a } else { b };
    let limit = CENTER_DISTANCE_FRACTION * f64::from(larger.width.max(larger.height));
    let ratio = |x: u32, y: u32| {
        let (lo, hi) = (x.min(y), x.max(y));
        if hi == 0 { 1.0 } else { f64::from(lo) / f64::from(hi) }
    };
    a.center_distance(b) < limit
        && ratio(a.width, b.width) >= SIZE_RATIO
        && ratio(a.height, b.height) >= SIZE_RATIO
}

/// Would `a` and `b` be considered the same artwork?
pub fn is_duplicate(a: &BBox, b: &BBox) -> bool {
    same_place_and_size(a, b) || a.overlap_of_smaller(b) >= OVERLAP_FRACTION
}

/// Fuse candidates from all detectors.
///
/// Candidates are visited by descending confidence. A candidate that
/// duplicates an accepted region is dropped, and its detector joins that
/// region's set. Output is in reading order.
#[instrument(level = "debug", skip_all, fields(candidates = candidates.len()))]
pub fn fuse(mut candidates: Vec<CandidateRegion>) -> Vec<Region> {
    candidates.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.bbox.reading_order(&b.bbox))
    });

    let mut accepted: Vec<Region> = vec![];
    for candidate in candidates {
        match accepted
            .iter_mut()
            .find(|region| is_duplicate(&region.bbox, &candidate.bbox))
        {
            Some(region) => {
                region.detectors.insert(candidate.detector);
            }
            None => accepted.push(Region {
                bbox: candidate.bbox,
                confidence: candidate.confidence,
                detectors: BTreeSet::from([candidate.detector]),
            }),
        }
    }

    for region in &mut accepted {
        let extra = region.detectors.len().saturating_sub(1) as f64;
        region.confidence = (region.confidence + AGREEMENT_BONUS * extra).min(1.0);
    }
    accepted.sort_by(|a, b| a.bbox.reading_order(&b.bbox));
    debug!(regions = accepted.len(), "Fused candidates");
    accepted
}
