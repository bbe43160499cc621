//! The per-page extraction pipeline, and the page loop around it.
//!
//! Raster, detectors, fusion, number reading, coherence, quality gate,
//! then the page is written. Pages run one after another. A page that fails
//! is recorded and the loop moves on.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use image::{RgbImage, imageops};

use crate::{
    assembly::{
        PageArtifacts, PageDetails, RegionDetails, RunDir, catalogue::FailedPage,
        naming::assign_file_names, page_dir_name,
    },
    async_utils::spawn_blocking_propagating_panics,
    coherence::{RegionNumber, reconcile},
    detectors::run_detectors,
    document::PageSource,
    fusion::fuse,
    geometry::BBox,
    llm::Llm,
    number_reader::NumberReader,
    prelude::*,
    presets::CollectionPreset,
    quality::{QualityFacts, assess},
    ui::{ProgressConfig, Ui},
};

/// Set when the user asks us to stop. Checked between pages.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of running the page loop.
#[derive(Debug, Default)]
pub struct RunOutcome {
    /// Processed or resumed pages, ascending.
    pub pages: Vec<PageDetails>,
    pub failed_pages: Vec<FailedPage>,
    pub cancelled: bool,
}

/// Extracts artworks from pages, one page at a time.
pub struct Extractor {
    pub preset: CollectionPreset,
    pub reader: NumberReader,
    pub llm: Option<Llm>,
}

impl Extractor {
    /// Process `pages` in order, writing each into `run_dir`. With `resume`,
    /// pages that already have a `page_details.json` are loaded instead.
    pub async fn run(
        &self,
        ui: &Ui,
        source: &dyn PageSource,
        run_dir: &RunDir,
        pages: &[usize],
        resume: bool,
        cancel: &CancelFlag,
    ) -> RunOutcome {
        let progress = ui.new_progress_bar(
            &ProgressConfig {
                emoji: "🖼️",
                msg: "Extracting pages",
                done_msg: "Extracted pages",
            },
            pages.len() as u64,
        );

        let mut outcome = RunOutcome::default();
        for &page in pages {
            if cancel.is_cancelled() {
                warn!(page, "Cancelled, stopping before page");
                outcome.cancelled = true;
                break;
            }

            if resume && run_dir.has_page(page).await {
                match run_dir.load_page(page).await {
                    Ok(details) => {
                        debug!(page, "Reusing page from earlier run");
                        outcome.pages.push(details);
                        progress.inc(1);
                        continue;
                    }
                    Err(err) => warn!(page, "Cannot reuse page, reprocessing: {err:#}"),
                }
            }

            match self.process_page(source, run_dir, page).await {
                Ok(details) => outcome.pages.push(details),
                Err(err) => {
                    error!(page, "Page failed: {err:#}");
                    outcome.failed_pages.push(FailedPage {
                        page,
                        error: format!("{err:#}"),
                    });
                }
            }
            progress.inc(1);
        }
        outcome
    }

    /// Run the whole pipeline on one page and write its artifacts.
    #[instrument(level = "info", skip_all, fields(page = page))]
    pub async fn process_page(
        &self,
        source: &dyn PageSource,
        run_dir: &RunDir,
        page: usize,
    ) -> Result<PageDetails> {
        let plan = source.raster_plan(page);
        let raster = Arc::new(source.rasterize(page, plan.dpi).await?);
        let (width, height) = raster.dimensions();
        debug!(dpi = plan.dpi, width, height, "Rasterized page");

        let detection = run_detectors(
            raster.clone(),
            plan,
            &self.preset.detector_set,
            self.preset.area_bounds,
        )
        .await;
        let mut warnings = detection.warnings;
        if detection.candidates.is_empty() {
            return Err(anyhow!("no candidate regions found on page {page}"));
        }
        let regions = fuse(detection.candidates);

        let mut readings = Vec::with_capacity(regions.len());
        for region in &regions {
            readings.push(self.reader.read(&raster, &region.bbox).await);
        }
        for (i, reading) in readings.iter().enumerate() {
            for probe in &reading.probes {
                if let Some(error) = &probe.error {
                    warnings.push(format!("region {}: zone {}: {error}", i + 1, probe.zone));
                }
            }
        }

        let crops = crop_regions(raster.clone(), regions.iter().map(|r| r.bbox).collect()).await;

        let mut numbers = readings
            .iter()
            .map(|r| RegionNumber {
                number: r.number,
                confidence: r.confidence,
            })
            .collect::<Vec<_>>();
        let coherence = reconcile(&mut numbers, &crops, self.llm.as_ref()).await;

        let verdicts = regions
            .iter()
            .zip(&readings)
            .zip(&numbers)
            .enumerate()
            .map(|(i, ((region, reading), number))| {
                assess(&QualityFacts {
                    bbox: region.bbox,
                    page_width: width,
                    page_height: height,
                    region_confidence: region.confidence,
                    catalog_number: number.number,
                    ocr_confidence: reading.confidence,
                    agreeing_probes: reading.agreeing_probes,
                    unresolved_duplicate: coherence.unresolved_duplicates.contains(&i),
                })
            })
            .collect::<Vec<_>>();

        let names = assign_file_names(
            &numbers
                .iter()
                .zip(&verdicts)
                .map(|(n, reasons)| (n.number, !reasons.is_empty()))
                .collect::<Vec<_>>(),
        );
        let page_dir = page_dir_name(page);
        let region_details = regions
            .into_iter()
            .zip(readings)
            .zip(numbers)
            .zip(verdicts)
            .zip(names)
            .enumerate()
            .map(
                |(i, ((((region, reading), number), doubt_reasons), name))| RegionDetails {
                    id: uuid::Uuid::new_v4().to_string(),
                    ordinal: i + 1,
                    bbox: region.bbox,
                    area: region.bbox.area(),
                    confidence: region.confidence,
                    detection_methods: region.detection_methods(),
                    catalog_number: number.number,
                    ocr_confidence: reading.confidence,
                    agreeing_probes: reading.agreeing_probes,
                    probes: reading.probes,
                    is_doubtful: !doubt_reasons.is_empty(),
                    doubt_reasons,
                    image_path: format!("{page_dir}/{name}"),
                },
            )
            .collect::<Vec<_>>();

        let doubtful = region_details.iter().filter(|r| r.is_doubtful).count();
        info!(
            regions = region_details.len(),
            doubtful,
            sequential = coherence.is_sequential,
            "Processed page"
        );

        let details = PageDetails {
            page,
            dpi: plan.dpi,
            page_size_mm: [plan.page_size_mm.0, plan.page_size_mm.1],
            raster_size_px: [width, height],
            regions: region_details,
            coherence,
            warnings,
        };
        // The raster is no longer shared once detectors and crops are done.
        let raster = Arc::try_unwrap(raster).unwrap_or_else(|shared| (*shared).clone());
        run_dir
            .write_page(PageArtifacts {
                details: details.clone(),
                raster,
                crops,
            })
            .await?;
        Ok(details)
    }
}

/// Cut each box out of the raster.
async fn crop_regions(raster: Arc<RgbImage>, boxes: Vec<BBox>) -> Vec<RgbImage> {
    spawn_blocking_propagating_panics(move || {
        boxes
            .iter()
            .map(|b| imageops::crop_imm(raster.as_ref(), b.x, b.y, b.width, b.height).to_image())
            .collect()
    })
    .await
}
