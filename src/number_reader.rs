//! Reading printed catalogue numbers next to each region.
//!
//! OCR over a whole reproduction fails far more often than OCR over the small
//! strip where the publisher prints the number, so we probe each of the
//! preset's zones in turn and keep the best-scoring reading.

use std::{sync::Arc, time::Duration};

use image::{GrayImage, RgbImage, imageops};

use crate::{
    async_utils::{spawn_blocking_propagating_panics, with_timeout},
    geometry::BBox,
    imaging::{clahe, threshold_mask},
    ocr::{OcrEngine, psm},
    prelude::*,
    presets::ProbeZone,
};

/// Characters tesseract may emit while reading a number zone.
pub const NUMBER_WHITELIST: &str = "0123456789Nn°figFIGPlpl.:";

/// Segmentation modes tried on each zone, in order.
pub const ZONE_PSMS: &[u8] = &[psm::LINE, psm::WORD, psm::BLOCK];

/// Wall-clock budget for all OCR passes over one zone.
pub const DEFAULT_ZONE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upscaling applied to zone crops before OCR.
const UPSCALE: u32 = 3;

/// Longest accepted number, in digits.
const MAX_DIGITS: usize = 4;

/// One OCR attempt on one zone.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct NumberProbe {
    pub zone: String,
    /// Zone rectangle on the raster, or `None` if it fell off the page.
    pub zone_box: Option<BBox>,
    /// Segmentation mode of the reading we kept.
    pub psm: Option<u8>,
    pub raw_text: String,
    pub number: Option<u32>,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The reader's verdict for one region.
#[derive(Clone, Debug, PartialEq)]
pub struct NumberReading {
    pub number: Option<u32>,
    pub confidence: f64,
    /// Probes other than the winner that read the same number.
    pub agreeing_probes: usize,
    pub probes: Vec<NumberProbe>,
}

/// Confidence for a number printed with `digits` digits.
pub fn digit_confidence(digits: usize) -> f64 {
    match digits {
        1 => 0.9,
        2 => 0.8,
        3 => 0.7,
        4 => 0.3,
        _ => 0.0,
    }
}

/// Find the longest run of 1 to 4 ASCII digits in `text`. Returns the value
/// and the run length. Runs longer than four digits are not numbers we
/// accept, and a zero value is not a catalogue number.
pub fn extract_number(text: &str) -> Option<(u32, usize)> {
    let mut best: Option<(u32, usize)> = None;
    let mut consider = |run: &str| {
        let len = run.len();
        if !(1..=MAX_DIGITS).contains(&len) {
            return;
        }
        let Ok(value) = run.parse::<u32>() else {
            return;
        };
        if value == 0 {
            return;
        }
        if best.is_none_or(|(_, best_len)| len > best_len) {
            best = Some((value, len));
        }
    };
    let mut start = None;
    for (i, c) in text.char_indices() {
        match (c.is_ascii_digit(), start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                consider(&text[s..i]);
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        consider(&text[s..]);
    }
    best
}

/// Crop a zone and prepare it for OCR: grayscale, CLAHE, Otsu with dark text
/// on white, then a 3x cubic upscale.
pub fn prepare_zone(raster: &RgbImage, zone: &BBox) -> GrayImage {
    let crop = imageops::crop_imm(raster, zone.x, zone.y, zone.width, zone.height).to_image();
    let gray = imageops::grayscale(&crop);
    let equalized = clahe(&gray, 2.0, 4);
    let level = imageproc::contrast::otsu_level(&equalized);
    let binary = threshold_mask(&equalized, level, false);
    imageops::resize(
        &binary,
        binary.width() * UPSCALE,
        binary.height() * UPSCALE,
        imageops::FilterType::CatmullRom,
    )
}

/// Reads catalogue numbers with an injected OCR engine.
pub struct NumberReader {
    engine: Arc<dyn OcrEngine>,
    zones: Vec<ProbeZone>,
    zone_timeout: Duration,
}

impl NumberReader {
    pub fn new(engine: Arc<dyn OcrEngine>, zones: Vec<ProbeZone>, zone_timeout: Duration) -> Self {
        Self {
            engine,
            zones,
            zone_timeout,
        }
    }

    /// Probe every zone around `region` and pick the best reading. Zones are
    /// tried in preset order, and ties go to the earlier zone.
    #[instrument(level = "debug", skip_all, fields(region = ?region))]
    pub async fn read(&self, raster: &Arc<RgbImage>, region: &BBox) -> NumberReading {
        let mut probes = Vec::with_capacity(self.zones.len());
        for zone in &self.zones {
            probes.push(self.probe(raster, region, zone).await);
        }
        choose_reading(probes)
    }

    async fn probe(&self, raster: &Arc<RgbImage>, region: &BBox, zone: &ProbeZone) -> NumberProbe {
        let mut probe = NumberProbe {
            zone: zone.name.clone(),
            zone_box: zone.rect.resolve(region, raster.width(), raster.height()),
            psm: None,
            raw_text: String::new(),
            number: None,
            confidence: 0.0,
            error: None,
        };
        let Some(zone_box) = probe.zone_box else {
            probe.error = Some("zone outside page".to_owned());
            return probe;
        };

        let raster = raster.clone();
        let prepared =
            spawn_blocking_propagating_panics(move || prepare_zone(&raster, &zone_box)).await;

        // Readings finished before the budget ran out still count.
        let mut readings = Vec::with_capacity(ZONE_PSMS.len());
        let result = with_timeout(&format!("OCR of zone {}", zone.name), self.zone_timeout, async {
            for &psm in ZONE_PSMS {
                match self
                    .engine
                    .recognize(&prepared, psm, Some(NUMBER_WHITELIST))
                    .await
                {
                    Ok(text) => readings.push((psm, text)),
                    Err(err) => debug!(zone = %zone.name, psm, "OCR failed: {err:#}"),
                }
            }
            Ok(())
        })
        .await;
        if let Err(err) = result {
            warn!(zone = %zone.name, completed = readings.len(), "Cutting zone short: {err:#}");
            probe.error = Some(format!("{err:#}"));
        }

        for (psm, text) in readings {
            let found = extract_number(&text);
            let confidence = found.map(|(_, len)| digit_confidence(len)).unwrap_or(0.0);
            if probe.psm.is_none() || confidence > probe.confidence {
                probe.psm = Some(psm);
                probe.raw_text = text.trim().to_owned();
                probe.number = found.map(|(value, _)| value);
                probe.confidence = confidence;
            }
        }
        trace!(zone = %zone.name, number = ?probe.number, confidence = probe.confidence, "Probe");
        probe
    }
}

/// Pick the best probe: highest confidence, earliest zone on ties.
pub fn choose_reading(probes: Vec<NumberProbe>) -> NumberReading {
    let mut best: Option<&NumberProbe> = None;
    for probe in probes.iter().filter(|p| p.number.is_some()) {
        if best.is_none_or(|b| probe.confidence > b.confidence) {
            best = Some(probe);
        }
    }
    let (number, confidence) = match best {
        Some(probe) => (probe.number, probe.confidence),
        None => (None, 0.0),
    };
    let agreeing_probes = match number {
        Some(n) => probes.iter().filter(|p| p.number == Some(n)).count() - 1,
        None => 0,
    };
    NumberReading {
        number,
        confidence,
        agreeing_probes,
        probes,
    }
}
