//! Region detectors: independent algorithms that each propose rectangles
//! which might hold an artwork reproduction.
//!
//! Detectors work on a downscaled copy of the page (see [`WorkingImage`]) and
//! report boxes in working coordinates. [`run_detectors`] runs the enabled
//! detectors in parallel on the blocking pool, maps their boxes back onto the
//! full raster and applies the preset's area bounds. Boxes smaller than a
//! plate can physically be, at the page's [`RasterPlan`], never leave a
//! detector.

use std::{collections::BTreeSet, fmt, str::FromStr, sync::Arc};

use futures::future::join_all;
use image::{GrayImage, RgbImage, imageops};

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    cpu_limit::with_cpu_semaphore,
    geometry::BBox,
    imaging::downscale_rgb,
    prelude::*,
    presets::AreaBounds,
    raster::RasterPlan,
};

pub mod color;
pub mod contour;
pub mod template;

/// Longest side of the working image, in pixels.
pub const WORKING_MAX_SIDE: u32 = 1000;

/// Our detector algorithms.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    /// Multi-pass contour detector.
    Ultra,
    /// Prototype rectangle matcher.
    Template,
    /// HSV saturation detector.
    Color,
}

impl DetectorKind {
    pub fn name(self) -> &'static str {
        match self {
            DetectorKind::Ultra => "ultra",
            DetectorKind::Template => "template",
            DetectorKind::Color => "color",
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DetectorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ultra" => Ok(DetectorKind::Ultra),
            "template" => Ok(DetectorKind::Template),
            "color" => Ok(DetectorKind::Color),
            other => Err(anyhow!(
                "unknown detector {other:?} (expected ultra, template or color)"
            )),
        }
    }
}

/// A box proposed by one detector.
#[derive(Clone, Debug, PartialEq)]
pub struct CandidateRegion {
    pub bbox: BBox,
    pub detector: DetectorKind,
    /// Raw confidence in `[0, 1]`.
    pub confidence: f64,
}

/// A downscaled copy of the page raster that detectors share.
pub struct WorkingImage {
    pub rgb: RgbImage,
    pub gray: GrayImage,
    /// Multiply working coordinates by this to get raster coordinates.
    pub back_factor: f64,
    pub raster_width: u32,
    pub raster_height: u32,
    /// Shortest plate side in working pixels. Zero means no limit.
    pub min_side: u32,
}

impl WorkingImage {
    pub fn new(raster: &RgbImage) -> Self {
        let (rgb, back_factor) = downscale_rgb(raster, WORKING_MAX_SIDE);
        let gray = imageops::grayscale(&rgb);
        Self {
            rgb,
            gray,
            back_factor,
            raster_width: raster.width(),
            raster_height: raster.height(),
            min_side: 0,
        }
    }

    /// Reject plates whose shorter side is under `raster_px` raster pixels.
    pub fn with_min_plate_side(mut self, raster_px: u32) -> Self {
        self.min_side = (f64::from(raster_px) / self.back_factor).floor() as u32;
        self
    }

    /// Smallest box area worth tracing: `1 / divisor` of the image, and never
    /// less than a square of [`Self::min_side`].
    pub fn min_area(&self, divisor: u32) -> u64 {
        let side = u64::from(self.min_side);
        (self.area() / u64::from(divisor.max(1))).max(side * side)
    }

    /// Is either side of `bbox` shorter than a plate can be?
    pub fn too_small(&self, bbox: &BBox) -> bool {
        bbox.width.min(bbox.height) < self.min_side
    }

    pub fn width(&self) -> u32 {
        self.gray.width()
    }

    pub fn height(&self) -> u32 {
        self.gray.height()
    }

    /// Working-image area in pixels.
    pub fn area(&self) -> u64 {
        u64::from(self.width()) * u64::from(self.height())
    }

    /// Map a working box onto the full raster.
    pub fn to_raster(&self, bbox: &BBox) -> Option<BBox> {
        bbox.scaled(self.back_factor)
            .clamped(self.raster_width, self.raster_height)
    }
}

/// Interface to a region detector.
pub trait Detector: Send + Sync + 'static {
    fn kind(&self) -> DetectorKind;

    /// Propose candidate boxes in working-image coordinates.
    fn detect(&self, image: &WorkingImage) -> Result<Vec<CandidateRegion>>;
}

/// Build the detector for `kind`.
pub fn detector_for(kind: DetectorKind) -> Arc<dyn Detector> {
    match kind {
        DetectorKind::Ultra => Arc::new(contour::ContourDetector::default()),
        DetectorKind::Template => Arc::new(template::TemplateDetector::default()),
        DetectorKind::Color => Arc::new(color::ColorDetector::default()),
    }
}

/// Candidates from every detector that ran, plus a note for each one that
/// failed.
#[derive(Debug, Default)]
pub struct DetectionOutcome {
    pub candidates: Vec<CandidateRegion>,
    pub warnings: Vec<String>,
}

/// Run the enabled detectors in parallel over one page raster.
///
/// A detector that errors or panics is skipped and noted in the outcome's
/// warnings. Boxes are returned in raster coordinates, filtered to
/// `area_bounds` of the raster area and to the plan's minimum plate side.
#[instrument(level = "debug", skip_all, fields(detectors = kinds.len(), dpi = plan.dpi))]
pub async fn run_detectors(
    raster: Arc<RgbImage>,
    plan: RasterPlan,
    kinds: &BTreeSet<DetectorKind>,
    area_bounds: AreaBounds,
) -> DetectionOutcome {
    let min_side = plan.min_plate_side_px();
    let working = Arc::new(
        spawn_blocking_propagating_panics(move || {
            WorkingImage::new(&raster).with_min_plate_side(min_side)
        })
        .await,
    );

    let runs = kinds.iter().map(|&kind| {
        let detector = detector_for(kind);
        let working = working.clone();
        async move {
            let joined = with_cpu_semaphore(move || async move {
                Ok(tokio::task::spawn_blocking(move || detector.detect(&working)).await)
            })
            .await;
            (kind, joined)
        }
    });

    let mut outcome = DetectionOutcome::default();
    for (kind, joined) in join_all(runs).await {
        let found = match joined {
            Ok(Ok(Ok(found))) => found,
            Ok(Ok(Err(err))) => {
                warn!(detector = %kind, "Detector failed: {err:#}");
                outcome.warnings.push(format!("detector {kind} failed: {err:#}"));
                continue;
            }
            Ok(Err(join_err)) => {
                warn!(detector = %kind, "Detector crashed: {join_err}");
                outcome.warnings.push(format!("detector {kind} crashed"));
                continue;
            }
            Err(err) => {
                outcome.warnings.push(format!("detector {kind} not run: {err:#}"));
                continue;
            }
        };
        debug!(detector = %kind, count = found.len(), "Detector finished");
        outcome
            .candidates
            .extend(to_raster_candidates(&working, found, area_bounds, min_side));
    }
    outcome
}

/// Map working-image candidates to raster space and apply the area bounds.
fn to_raster_candidates(
    working: &WorkingImage,
    found: Vec<CandidateRegion>,
    area_bounds: AreaBounds,
    min_side: u32,
) -> Vec<CandidateRegion> {
    let raster_area =
        u64::from(working.raster_width) * u64::from(working.raster_height);
    found
        .into_iter()
        .filter_map(|candidate| {
            let bbox = working.to_raster(&candidate.bbox)?;
            let fraction = bbox.area() as f64 / raster_area.max(1) as f64;
            if fraction < area_bounds.min || fraction > area_bounds.max {
                trace!(?bbox, fraction, "Candidate outside area bounds");
                return None;
            }
            if bbox.width.min(bbox.height) < min_side {
                trace!(?bbox, min_side, "Candidate smaller than a plate");
                return None;
            }
            Some(CandidateRegion {
                bbox,
                confidence: candidate.confidence.clamp(0.0, 1.0),
                ..candidate
            })
        })
        .collect()
}

/// Greedy non-maximum suppression within one detector's output: keep the
/// most confident box of each group whose IoU reaches `iou`.
pub(crate) fn suppress_overlaps(
    mut candidates: Vec<CandidateRegion>,
    iou: f64,
) -> Vec<CandidateRegion> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<CandidateRegion> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| k.bbox.iou(&candidate.bbox) < iou) {
            kept.push(candidate);
        }
    }
    kept
}


#[cfg(test)]
mod tests {
    use super::{test_pages::page_with, *};

    fn a4() -> RasterPlan {
        RasterPlan::for_page_size((210.0, 297.0))
    }

    #[test]
    fn detector_names_round_trip() {
        for kind in [DetectorKind::Ultra, DetectorKind::Template, DetectorKind::Color] {
            assert_eq!(kind.name().parse::<DetectorKind>().unwrap(), kind);
        }
        assert!("sobel".parse::<DetectorKind>().is_err());
    }

    #[test]
    fn working_image_maps_back_to_raster() {
        let raster = RgbImage::new(3000, 2000);
        let working = WorkingImage::new(&raster);
        assert_eq!(working.width(), WORKING_MAX_SIDE);
        let back = working.to_raster(&BBox::new(100, 100, 200, 100)).unwrap();
        assert_eq!(back, BBox::new(300, 300, 600, 300));
    }

    #[test]
    fn suppression_keeps_most_confident() {
        let a = CandidateRegion {
            bbox: BBox::new(0, 0, 100, 100),
            detector: DetectorKind::Ultra,
            confidence: 0.6,
        };
        let b = CandidateRegion {
            bbox: BBox::new(5, 5, 100, 100),
            confidence: 0.9,
            ..a.clone()
        };
        let kept = suppress_overlaps(vec![a, b], 0.5);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].confidence, 0.9);
    }

    #[tokio::test]
    async fn all_detectors_find_a_dark_plate() {
        let plate = BBox::new(300, 400, 900, 700);
        let raster = Arc::new(page_with(1600, 2200, &[(plate, [40, 60, 90])]));
        let kinds =
            BTreeSet::from([DetectorKind::Ultra, DetectorKind::Template, DetectorKind::Color]);
        let bounds = AreaBounds {
            min: 0.005,
            max: 0.95,
        };
        let outcome = run_detectors(raster, a4(), &kinds, bounds).await;
        assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);
        for kind in [DetectorKind::Ultra, DetectorKind::Color] {
            let boxes = outcome
                .candidates
                .iter()
                .filter(|c| c.detector == kind)
                .map(|c| c.bbox)
                .collect::<Vec<_>>();
            assert!(
                test_pages::found(&boxes, &plate, 0.8),
                "{kind} missed the plate: {boxes:?}"
            );
        }
    }

    #[tokio::test]
    async fn blank_page_yields_no_candidates() {
        let raster = Arc::new(page_with(800, 1100, &[]));
        let kinds = BTreeSet::from([DetectorKind::Ultra, DetectorKind::Color]);
        let bounds = AreaBounds {
            min: 0.005,
            max: 0.95,
        };
        let outcome = run_detectors(raster, a4(), &kinds, bounds).await;
        assert!(outcome.candidates.is_empty(), "{:?}", outcome.candidates);
    }

    #[tokio::test]
    async fn plates_below_physical_minimum_are_dropped() {
        // At 300 DPI a 15 mm side is 177 px. The small plate is 120 px tall.
        let small = BBox::new(100, 100, 400, 120);
        let large = BBox::new(300, 600, 800, 700);
        let raster = Arc::new(page_with(
            1600,
            2200,
            &[(small, [40, 60, 90]), (large, [40, 60, 90])],
        ));
        let kinds = BTreeSet::from([DetectorKind::Ultra]);
        let bounds = AreaBounds {
            min: 0.005,
            max: 0.95,
        };
        let outcome = run_detectors(raster, a4(), &kinds, bounds).await;
        let boxes = outcome.candidates.iter().map(|c| c.bbox).collect::<Vec<_>>();
        assert!(test_pages::found(&boxes, &large, 0.8), "{boxes:?}");
        assert!(boxes.iter().all(|b| b.width.min(b.height) >= 177), "{boxes:?}");
    }

    #[test]
    fn min_area_respects_plate_side() {
        let raster = RgbImage::new(2000, 3000);
        let working = WorkingImage::new(&raster).with_min_plate_side(177);
        // Working image is 667 x 1000, so 177 raster px are 59 working px.
        assert_eq!(working.min_side, 59);
        assert_eq!(working.min_area(1000), 59 * 59);
        assert!(working.too_small(&BBox::new(0, 0, 200, 50)));
        assert!(!working.too_small(&BBox::new(0, 0, 200, 60)));
    }
}
