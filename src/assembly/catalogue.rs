//! `final_artworks.json`, `individual_artworks/` and `plate_index.json`.

use super::{
    FINAL_ARTWORKS_FILE, INDIVIDUAL_DIR, PLATE_INDEX_FILE, PageDetails, REPORT_FILE, RunDir,
    report::render_report,
};
use crate::{
    async_utils::io::write_json,
    geometry::BBox,
    number_reader::NumberProbe,
    plate_index::{PlateIndex, PlateRecord},
    prelude::*,
    quality::DoubtReason,
};

/// A page that could not be processed.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct FailedPage {
    pub page: usize,
    pub error: String,
}

/// Summary counts.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Counts {
    pub pages_processed: usize,
    pub pages_failed: usize,
    pub artworks: usize,
    pub confident: usize,
    pub doubtful: usize,
    pub with_plate_metadata: usize,
}

/// Top-level run description.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SessionInfo {
    pub document: String,
    /// ISO 8601 time the consolidated files were written.
    pub timestamp: String,
    /// `full` or `fast`.
    pub mode: String,
    pub collection: String,
    pub llm_enabled: bool,
    pub counts: Counts,
    pub failed_pages: Vec<FailedPage>,
    /// The run was interrupted before every requested page was processed.
    pub cancelled: bool,
}

/// Per-artwork extraction metadata.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ArtworkMetadata {
    pub is_doubtful: bool,
    pub doubt_reasons: Vec<DoubtReason>,
    pub confidence: f64,
    pub ocr_confidence: f64,
    pub detection_methods: Vec<String>,
    pub bbox: BBox,
    pub area: u64,
    pub probes: Vec<NumberProbe>,
}

/// One catalogue entry.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Artwork {
    pub id: String,
    pub catalog_number: Option<u32>,
    pub page: usize,
    pub image_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plate_metadata: Option<PlateRecord>,
    pub metadata: ArtworkMetadata,
}

/// The consolidated catalogue.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Catalogue {
    pub session_info: SessionInfo,
    pub artworks: Vec<Artwork>,
}

/// What the caller knows about the run, apart from the pages.
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub document: String,
    pub timestamp: String,
    pub mode: String,
    pub collection: String,
    pub llm_enabled: bool,
    pub failed_pages: Vec<FailedPage>,
    pub cancelled: bool,
}

/// Join pages and the plate index into a catalogue, in reading order.
pub fn build_catalogue(
    summary: RunSummary,
    pages: &[PageDetails],
    index: Option<&PlateIndex>,
) -> Catalogue {
    let mut pages = pages.iter().collect::<Vec<_>>();
    pages.sort_by_key(|p| p.page);

    let mut artworks = vec![];
    for page in &pages {
        let mut regions = page.regions.iter().collect::<Vec<_>>();
        regions.sort_by(|a, b| a.bbox.reading_order(&b.bbox));
        for region in regions {
            let plate_metadata = region
                .catalog_number
                .and_then(|n| index.and_then(|index| index.get(n)))
                .cloned();
            artworks.push(Artwork {
                id: region.id.clone(),
                catalog_number: region.catalog_number,
                page: page.page,
                image_path: region.image_path.clone(),
                plate_metadata,
                metadata: ArtworkMetadata {
                    is_doubtful: region.is_doubtful,
                    doubt_reasons: region.doubt_reasons.clone(),
                    confidence: region.confidence,
                    ocr_confidence: region.ocr_confidence,
                    detection_methods: region.detection_methods.clone(),
                    bbox: region.bbox,
                    area: region.area,
                    probes: region.probes.clone(),
                },
            });
        }
    }

    let doubtful = artworks.iter().filter(|a| a.metadata.is_doubtful).count();
    let counts = Counts {
        pages_processed: pages.len(),
        pages_failed: summary.failed_pages.len(),
        artworks: artworks.len(),
        confident: artworks.len() - doubtful,
        doubtful,
        with_plate_metadata: artworks.iter().filter(|a| a.plate_metadata.is_some()).count(),
    };
    Catalogue {
        session_info: SessionInfo {
            document: summary.document,
            timestamp: summary.timestamp,
            mode: summary.mode,
            collection: summary.collection,
            llm_enabled: summary.llm_enabled,
            counts,
            failed_pages: summary.failed_pages,
            cancelled: summary.cancelled,
        },
        artworks,
    }
}

/// Write every consolidated file. `individual_artworks/` is rebuilt from
/// scratch so it matches the catalogue exactly.
#[instrument(level = "debug", skip_all)]
pub async fn write_consolidated(
    run_dir: &RunDir,
    catalogue: &Catalogue,
    pages: &[PageDetails],
    index: Option<&PlateIndex>,
) -> Result<()> {
    write_json(&run_dir.root.join(FINAL_ARTWORKS_FILE), catalogue).await?;

    let individual = run_dir.root.join(INDIVIDUAL_DIR);
    if tokio::fs::try_exists(&individual).await.unwrap_or(false) {
        tokio::fs::remove_dir_all(&individual)
            .await
            .with_context(|| format!("cannot clear {:?}", individual))?;
    }
    tokio::fs::create_dir_all(&individual)
        .await
        .with_context(|| format!("cannot create {:?}", individual))?;
    for artwork in &catalogue.artworks {
        write_json(&individual.join(format!("{}.json", artwork.id)), artwork).await?;
    }

    if let Some(index) = index {
        write_json(&run_dir.root.join(PLATE_INDEX_FILE), index).await?;
    }

    let report = render_report(catalogue, pages, index);
    tokio::fs::write(run_dir.root.join(REPORT_FILE), report)
        .await
        .context("cannot write extraction report")?;
    info!(
        artworks = catalogue.artworks.len(),
        run_dir = %run_dir.root.display(),
        "Wrote catalogue"
    );
    Ok(())
}
