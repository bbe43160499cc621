//! The input document: a PDF plus what we learned about it on opening.

use std::collections::BTreeMap;

use image::RgbImage;

use crate::{
    error::ExtractError,
    prelude::*,
    raster::{PdfInfo, Poppler, RasterPlan},
};

/// Source of page rasters and page text. The pipeline and plate-index
/// locator only talk to documents through this trait.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Number of pages.
    fn page_count(&self) -> usize;

    /// Physical size of a 1-based page, in millimetres.
    fn page_size_mm(&self, page: usize) -> Option<(f64, f64)>;

    /// Render a 1-based page at `dpi`.
    async fn rasterize(&self, page: usize, dpi: u32) -> Result<RgbImage>;

    /// Embedded text layer of a 1-based page. May be empty.
    async fn embedded_text(&self, page: usize) -> Result<String>;

    /// How we will rasterize `page`.
    fn raster_plan(&self, page: usize) -> RasterPlan {
        plan_for(self.page_size_mm(page))
    }
}

/// Pages of unknown size are treated as A4.
fn plan_for(page_size_mm: Option<(f64, f64)>) -> RasterPlan {
    RasterPlan::for_page_size(page_size_mm.unwrap_or((210.0, 297.0)))
}

/// An opened PDF.
#[derive(Debug)]
pub struct Document {
    pub path: PathBuf,
    pub info: PdfInfo,
    /// Chosen once per page when the document is opened.
    plans: BTreeMap<usize, RasterPlan>,
    poppler: Poppler,
}

impl Document {
    /// Check that `path` is a readable PDF and read its page sizes.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn open(path: &Path, poppler: Poppler) -> Result<Self> {
        check_is_pdf(path).await?;
        let info = poppler.inspect(path).await.map_err(|err| {
            ExtractError::document_unreadable(format!(
                "cannot read {}: {err:#}",
                path.display()
            ))
        })?;
        if info.page_count == 0 {
            return Err(ExtractError::document_unreadable(format!(
                "{} has no pages",
                path.display()
            ))
            .into());
        }
        let plans = (1..=info.page_count)
            .map(|page| (page, plan_for(info.page_size_mm(page))))
            .collect();
        info!(pages = info.page_count, "Opened document");
        Ok(Self {
            path: path.to_owned(),
            info,
            plans,
            poppler,
        })
    }

    /// Document name usable in a directory name: the file stem with anything
    /// other than ASCII letters, digits, `-` and `_` replaced by `_`.
    pub fn clean_name(&self) -> String {
        clean_name(&self.path)
    }
}

#[async_trait]
impl PageSource for Document {
    fn page_count(&self) -> usize {
        self.info.page_count
    }

    fn page_size_mm(&self, page: usize) -> Option<(f64, f64)> {
        self.info.page_size_mm(page)
    }

    fn raster_plan(&self, page: usize) -> RasterPlan {
        self.plans
            .get(&page)
            .copied()
            .unwrap_or_else(|| plan_for(self.page_size_mm(page)))
    }

    async fn rasterize(&self, page: usize, dpi: u32) -> Result<RgbImage> {
        self.poppler.rasterize(&self.path, page, dpi).await
    }

    async fn embedded_text(&self, page: usize) -> Result<String> {
        self.poppler.extract_text(&self.path, page).await
    }
}

/// Fail with a "document unreadable" error unless `path` holds a PDF.
async fn check_is_pdf(path: &Path) -> Result<()> {
    let metadata = tokio::fs::metadata(path).await.map_err(|err| {
        ExtractError::document_unreadable(format!("cannot open {}: {err}", path.display()))
    })?;
    if !metadata.is_file() {
        return Err(
            ExtractError::document_unreadable(format!("{} is not a file", path.display()))
                .into(),
        );
    }
    let probe_path = path.to_owned();
    let kind = tokio::task::spawn_blocking(move || infer::get_from_path(&probe_path))
        .await
        .context("MIME check panicked")?
        .map_err(|err| {
            ExtractError::document_unreadable(format!("cannot read {}: {err}", path.display()))
        })?;
    match kind {
        Some(kind) if kind.mime_type() == "application/pdf" => Ok(()),
        Some(kind) => Err(ExtractError::document_unreadable(format!(
            "{} is {}, not a PDF",
            path.display(),
            kind.mime_type()
        ))
        .into()),
        None => Err(ExtractError::document_unreadable(format!(
            "{} is not a PDF",
            path.display()
        ))
        .into()),
    }
}

/// See [`Document::clean_name`].
pub fn clean_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cleaned = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();
    let trimmed = cleaned.trim_matches('_');
    if trimmed.is_empty() {
        "document".to_owned()
    } else {
        trimmed.to_owned()
    }
}

#[cfg(test)]
pub mod fake {
    //! In-memory documents for pipeline tests.

    use super::*;

    /// Pages are pre-rendered images plus optional text.
    #[derive(Default)]
    pub struct FakeDocument {
        pub pages: Vec<RgbImage>,
        pub texts: BTreeMap<usize, String>,
        /// Pages that fail to rasterize.
        pub broken: Vec<usize>,
    }

    #[async_trait]
    impl PageSource for FakeDocument {
        fn page_count(&self) -> usize {
            self.pages.len()
        }

        fn page_size_mm(&self, _page: usize) -> Option<(f64, f64)> {
            Some((210.0, 297.0))
        }

        async fn rasterize(&self, page: usize, _dpi: u32) -> Result<RgbImage> {
            if self.broken.contains(&page) {
                return Err(anyhow!("page {page} is broken"));
            }
            self.pages
                .get(page - 1)
                .cloned()
                .ok_or_else(|| anyhow!("no page {page}"))
        }

        async fn embedded_text(&self, page: usize) -> Result<String> {
            Ok(self.texts.get(&page).cloned().unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, exit_code_for};

    #[test]
    fn clean_names() {
        assert_eq!(clean_name(Path::new("/a/Picasso Vol. 3.pdf")), "Picasso_Vol__3");
        assert_eq!(clean_name(Path::new("catalogue-1920_ok.pdf")), "catalogue-1920_ok");
        assert_eq!(clean_name(Path::new("/tmp/é.pdf")), "document");
    }

    #[tokio::test]
    async fn non_pdf_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.pdf");
        std::fs::write(&path, "just some text").unwrap();
        let poppler = Poppler {
            pdfinfo: "pdfinfo".into(),
            pdftocairo: "pdftocairo".into(),
            pdftotext: "pdftotext".into(),
            raster_timeout: std::time::Duration::from_secs(5),
        };
        let err = Document::open(&path, poppler.clone()).await.unwrap_err();
        assert_eq!(exit_code_for(&err), ErrorKind::DocumentUnreadable.exit_code());

        let missing = Document::open(&dir.path().join("missing.pdf"), poppler)
            .await
            .unwrap_err();
        assert!(format!("{missing:#}").contains("cannot open"));
    }
}
