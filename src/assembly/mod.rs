//! The run directory: per-page artifacts and the consolidated catalogue.
//!
//! ```text
//! <output_root>/<clean_doc_name>_<timestamp>/
//!   page_001/
//!     page_full_image.jpg
//!     7.png, 02.png, ...
//!     qualite_DOUTEUSE/
//!     page_details.json
//!   plate_index.json
//!   final_artworks.json
//!   individual_artworks/<uuid>.json
//!   extraction_report.md
//! ```
//!
//! Paths inside JSON are relative to the run directory.

use chrono::{DateTime, Local};
use image::RgbImage;

use crate::{
    async_utils::io::{read_json, write_jpeg, write_json, write_png},
    coherence::CoherenceReport,
    error::ExtractError,
    geometry::BBox,
    number_reader::NumberProbe,
    prelude::*,
    quality::{DOUBTFUL_DIR, DoubtReason},
};

pub mod catalogue;
pub mod naming;
pub mod report;

pub const PAGE_DETAILS_FILE: &str = "page_details.json";
pub const FULL_PAGE_IMAGE: &str = "page_full_image.jpg";
pub const FINAL_ARTWORKS_FILE: &str = "final_artworks.json";
pub const PLATE_INDEX_FILE: &str = "plate_index.json";
pub const REPORT_FILE: &str = "extraction_report.md";
pub const INDIVIDUAL_DIR: &str = "individual_artworks";

/// JPEG quality of the full-page image.
const FULL_PAGE_QUALITY: u8 = 85;

/// One extracted artwork, as recorded in `page_details.json`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RegionDetails {
    /// Stable UUID, kept across resumed runs.
    pub id: String,
    /// 1-based position in reading order.
    pub ordinal: usize,
    pub bbox: BBox,
    pub area: u64,
    pub confidence: f64,
    pub detection_methods: Vec<String>,
    pub catalog_number: Option<u32>,
    pub ocr_confidence: f64,
    pub agreeing_probes: usize,
    pub probes: Vec<NumberProbe>,
    pub is_doubtful: bool,
    pub doubt_reasons: Vec<DoubtReason>,
    /// Crop file, relative to the run directory.
    pub image_path: String,
}

/// Everything we know about one processed page.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PageDetails {
    pub page: usize,
    pub dpi: u32,
    pub page_size_mm: [f64; 2],
    pub raster_size_px: [u32; 2],
    pub regions: Vec<RegionDetails>,
    pub coherence: CoherenceReport,
    pub warnings: Vec<String>,
}

/// A page ready to be written: details plus pixels.
pub struct PageArtifacts {
    pub details: PageDetails,
    pub raster: RgbImage,
    /// Crops, parallel to `details.regions`.
    pub crops: Vec<RgbImage>,
}

/// Directory name for a 1-based page.
pub fn page_dir_name(page: usize) -> String {
    format!("page_{page:03}")
}

/// A run directory.
#[derive(Clone, Debug)]
pub struct RunDir {
    pub root: PathBuf,
}

impl RunDir {
    /// Create `<output_root>/<clean_name>_<YYYYmmdd_HHMMSS>`.
    pub async fn create(output_root: &Path, clean_name: &str, now: DateTime<Local>) -> Result<Self> {
        let root = output_root.join(format!("{clean_name}_{}", now.format("%Y%m%d_%H%M%S")));
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("cannot create run directory {:?}", root))?;
        info!(run_dir = %root.display(), "Created run directory");
        Ok(Self { root })
    }

    /// Reuse an existing run directory.
    pub async fn resume(root: &Path) -> Result<Self> {
        match tokio::fs::metadata(root).await {
            Ok(meta) if meta.is_dir() => {
                info!(run_dir = %root.display(), "Resuming run");
                Ok(Self {
                    root: root.to_owned(),
                })
            }
            _ => Err(ExtractError::usage(format!(
                "--resume: {} is not a directory",
                root.display()
            ))
            .into()),
        }
    }

    pub fn page_dir(&self, page: usize) -> PathBuf {
        self.root.join(page_dir_name(page))
    }

    /// Has this page been completely written?
    pub async fn has_page(&self, page: usize) -> bool {
        tokio::fs::try_exists(self.page_dir(page).join(PAGE_DETAILS_FILE))
            .await
            .unwrap_or(false)
    }

    pub async fn load_page(&self, page: usize) -> Result<PageDetails> {
        read_json(&self.page_dir(page).join(PAGE_DETAILS_FILE)).await
    }

    /// Write a page's images, then its `page_details.json`. Any earlier
    /// partial output for the page is removed first.
    #[instrument(level = "debug", skip_all, fields(page = artifacts.details.page))]
    pub async fn write_page(&self, artifacts: PageArtifacts) -> Result<()> {
        let PageArtifacts {
            details,
            raster,
            crops,
        } = artifacts;
        let dir = self.page_dir(details.page);
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&dir)
                .await
                .with_context(|| format!("cannot clear {:?}", dir))?;
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("cannot create {:?}", dir))?;
        if details.regions.iter().any(|r| r.is_doubtful) {
            tokio::fs::create_dir_all(dir.join(DOUBTFUL_DIR))
                .await
                .with_context(|| format!("cannot create doubtful directory in {:?}", dir))?;
        }

        write_jpeg(&dir.join(FULL_PAGE_IMAGE), raster, FULL_PAGE_QUALITY).await?;
        for (region, crop) in details.regions.iter().zip(crops) {
            write_png(&self.root.join(&region.image_path), crop).await?;
        }
        write_json(&dir.join(PAGE_DETAILS_FILE), &details).await?;
        debug!(dir = %dir.display(), regions = details.regions.len(), "Wrote page");
        Ok(())
    }
}
