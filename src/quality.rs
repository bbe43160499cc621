//! Quality gate: decides whether an extracted artwork goes to the confident
//! set or to `qualite_DOUTEUSE/`.

use std::fmt;

use crate::{geometry::BBox, prelude::*};

/// Directory, inside each page directory, for doubtful crops.
pub const DOUBTFUL_DIR: &str = "qualite_DOUTEUSE";

/// Region confidence below this is doubtful.
pub const MIN_REGION_CONFIDENCE: f64 = 0.4;

/// Allowed region area, as fractions of the page.
pub const MIN_AREA_FRACTION: f64 = 0.02;
pub const MAX_AREA_FRACTION: f64 = 0.90;

/// Allowed width/height ratio.
pub const MIN_ASPECT: f64 = 0.2;
pub const MAX_ASPECT: f64 = 8.0;

/// OCR confidence below this needs a second probe to agree.
pub const MIN_OCR_CONFIDENCE: f64 = 0.5;

/// Why a region was flagged.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DoubtReason {
    NoNumberRead,
    LowConfidence,
    AreaTooSmall,
    AreaTooLarge,
    BadAspectRatio,
    WeakOcr,
    DuplicateNumber,
}

impl DoubtReason {
    pub fn name(self) -> &'static str {
        match self {
            DoubtReason::NoNumberRead => "no_number_read",
            DoubtReason::LowConfidence => "low_confidence",
            DoubtReason::AreaTooSmall => "area_too_small",
            DoubtReason::AreaTooLarge => "area_too_large",
            DoubtReason::BadAspectRatio => "bad_aspect_ratio",
            DoubtReason::WeakOcr => "weak_ocr",
            DoubtReason::DuplicateNumber => "duplicate_number",
        }
    }
}

impl fmt::Display for DoubtReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything the gate looks at for one region.
#[derive(Clone, Debug)]
pub struct QualityFacts {
    pub bbox: BBox,
    pub page_width: u32,
    pub page_height: u32,
    pub region_confidence: f64,
    pub catalog_number: Option<u32>,
    pub ocr_confidence: f64,
    pub agreeing_probes: usize,
    /// Coherence left this region sharing its number with an earlier one.
    pub unresolved_duplicate: bool,
}

/// List every reason `facts` describe a doubtful region. An empty list means
/// the region is confident.
pub fn assess(facts: &QualityFacts) -> Vec<DoubtReason> {
    let mut reasons = vec![];
    if facts.unresolved_duplicate {
        reasons.push(DoubtReason::DuplicateNumber);
    } else if facts.catalog_number.is_none() {
        reasons.push(DoubtReason::NoNumberRead);
    }
    if facts.region_confidence < MIN_REGION_CONFIDENCE {
        reasons.push(DoubtReason::LowConfidence);
    }

    let page_area = u64::from(facts.page_width) * u64::from(facts.page_height);
    let fraction = facts.bbox.area() as f64 / page_area.max(1) as f64;
    if fraction < MIN_AREA_FRACTION {
        reasons.push(DoubtReason::AreaTooSmall);
    } else if fraction > MAX_AREA_FRACTION {
        reasons.push(DoubtReason::AreaTooLarge);
    }

    if !(MIN_ASPECT..=MAX_ASPECT).contains(&facts.bbox.aspect_ratio()) {
        reasons.push(DoubtReason::BadAspectRatio);
    }

    if facts.catalog_number.is_some()
        && facts.ocr_confidence < MIN_OCR_CONFIDENCE
        && facts.agreeing_probes == 0
    {
        reasons.push(DoubtReason::WeakOcr);
    }
    reasons.sort();
    reasons
}
