//! Page rasterization and PDF inspection, using Poppler's CLI tools.
//!
//! We shell out to `pdfinfo`, `pdftocairo` and `pdftotext` rather than linking
//! a PDF library. Each call runs in its own temporary directory and is killed
//! if it runs past its time budget.

use std::{collections::BTreeMap, error, fmt, sync::LazyLock, time::Duration};

use image::RgbImage;
use regex::Regex;
use tokio::process::Command;

use crate::{
    async_utils::{check_for_command_failure, spawn_blocking_propagating_panics, with_timeout},
    cpu_limit::with_cpu_semaphore,
    prelude::*,
};

/// Wall-clock budget for rasterizing one page.
pub const DEFAULT_RASTER_TIMEOUT: Duration = Duration::from_secs(60);

/// Millimetres per PostScript point.
const MM_PER_PT: f64 = 25.4 / 72.0;

/// Plates with a printed side shorter than this are thumbnails or ornaments.
pub const MIN_PLATE_SIDE_MM: f64 = 15.0;

/// Slack allowed when comparing a page against ISO sizes, in millimetres.
const ISO_TOLERANCE_MM: f64 = 5.0;

/// A4 and A3 as (short side, long side) in millimetres.
const A4_MM: (f64, f64) = (210.0, 297.0);
const A3_MM: (f64, f64) = (297.0, 420.0);

/// Matches `pdfinfo` per-page lines like `Page    3 size: 595.28 x 841.89 pts (A4)`.
static PAGE_SIZE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Page\s+(\d+)\s+size:\s+([\d.]+)\s+x\s+([\d.]+)\s+pts")
        .expect("failed to compile regex")
});

/// Matches the document-wide `Page size:` line, used when per-page sizes are
/// missing.
static DEFAULT_SIZE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Page size:\s+([\d.]+)\s+x\s+([\d.]+)\s+pts")
        .expect("failed to compile regex")
});

/// A page could not be turned into pixels. Fatal to that page only.
#[derive(Debug)]
pub struct PageRasterFailure {
    pub page: usize,
    pub reason: String,
}

impl fmt::Display for PageRasterFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not rasterize page {}: {}", self.page, self.reason)
    }
}

impl error::Error for PageRasterFailure {}

/// Physical page sizes reported by `pdfinfo`.
#[derive(Clone, Debug, PartialEq)]
pub struct PdfInfo {
    pub page_count: usize,
    /// 1-based page number to (width, height) in millimetres.
    pub page_sizes_mm: BTreeMap<usize, (f64, f64)>,
}

impl PdfInfo {
    /// Size of one page, falling back to the first known size.
    pub fn page_size_mm(&self, page: usize) -> Option<(f64, f64)> {
        self.page_sizes_mm
            .get(&page)
            .or_else(|| self.page_sizes_mm.values().next())
            .copied()
    }
}

/// Rasterization settings chosen for one page. Detectors take their
/// physical size limits from it.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct RasterPlan {
    pub dpi: u32,
    pub page_size_mm: (f64, f64),
}

impl RasterPlan {
    pub fn for_page_size(page_size_mm: (f64, f64)) -> Self {
        Self {
            dpi: dpi_for_page_size(page_size_mm),
            page_size_mm,
        }
    }

    /// Pixels covering `mm` millimetres at our DPI.
    pub fn px_for_mm(&self, mm: f64) -> u32 {
        (mm / 25.4 * f64::from(self.dpi)).round() as u32
    }

    /// Shortest side, in raster pixels, that a plate may have.
    pub fn min_plate_side_px(&self) -> u32 {
        self.px_for_mm(MIN_PLATE_SIDE_MM)
    }
}

/// Pick a DPI from the physical page size: 300 up to A4, 450 up to A3, 600
/// beyond that.
pub fn dpi_for_page_size((width_mm, height_mm): (f64, f64)) -> u32 {
    let short = width_mm.min(height_mm);
    let long = width_mm.max(height_mm);
    let fits = |(max_short, max_long): (f64, f64)| {
        short <= max_short + ISO_TOLERANCE_MM && long <= max_long + ISO_TOLERANCE_MM
    };
    if fits(A4_MM) {
        300
    } else if fits(A3_MM) {
        450
    } else {
        600
    }
}

/// Paths to the Poppler tools, plus the rasterization budget.
#[derive(Clone, Debug)]
pub struct Poppler {
    pub pdfinfo: PathBuf,
    pub pdftocairo: PathBuf,
    pub pdftotext: PathBuf,
    pub raster_timeout: Duration,
}

impl Poppler {
    /// Read the page count and page sizes of a PDF.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn inspect(&self, path: &Path) -> Result<PdfInfo> {
        let summary = self.run_pdfinfo(path, None).await?;
        let page_count = parse_page_count(&summary)?;
        let detailed = self.run_pdfinfo(path, Some(page_count)).await?;
        let mut info = parse_pdfinfo(&detailed, page_count);
        if info.page_sizes_mm.is_empty() {
            info = parse_pdfinfo(&summary, page_count);
        }
        debug!(
            page_count,
            sizes = info.page_sizes_mm.len(),
            "Inspected PDF"
        );
        Ok(info)
    }

    async fn run_pdfinfo(&self, path: &Path, last_page: Option<usize>) -> Result<String> {
        let mut cmd = Command::new(&self.pdfinfo);
        if let Some(last_page) = last_page {
            cmd.arg("-f").arg("1").arg("-l").arg(last_page.to_string());
        }
        let output = cmd.arg(path).kill_on_drop(true).output().await.with_context(|| {
            format!(
                "failed to run {} on {:?}",
                self.pdfinfo.display(),
                path.display()
            )
        })?;
        check_for_command_failure("pdfinfo", &output)?;
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")
    }

    /// Render one 1-based page to RGB at `dpi`.
    #[instrument(level = "debug", skip(self, path), fields(path = %path.display()))]
    pub async fn rasterize(&self, path: &Path, page: usize, dpi: u32) -> Result<RgbImage> {
        let result = with_timeout(
            "pdftocairo",
            self.raster_timeout,
            self.rasterize_inner(path, page, dpi),
        )
        .await;
        result.map_err(|err| {
            anyhow::Error::new(PageRasterFailure {
                page,
                reason: format!("{err:#}"),
            })
        })
    }

    async fn rasterize_inner(&self, path: &Path, page: usize, dpi: u32) -> Result<RgbImage> {
        let tmpdir = tempfile::TempDir::with_prefix("raster")?;
        let out_base = tmpdir.path().join("page");
        let page_arg = page.to_string();

        let mut cmd = Command::new(&self.pdftocairo);
        cmd.arg("-png")
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-f")
            .arg(&page_arg)
            .arg("-l")
            .arg(&page_arg)
            .arg("-singlefile")
            .arg(path)
            .arg(&out_base)
            .kill_on_drop(true);
        let output = with_cpu_semaphore(|| async {
            cmd.output().await.with_context(|| {
                format!(
                    "failed to run {} on {:?}",
                    self.pdftocairo.display(),
                    path.display()
                )
            })
        })
        .await?;
        check_for_command_failure("pdftocairo", &output)?;

        let png_path = out_base.with_extension("png");
        let image = spawn_blocking_propagating_panics(move || -> Result<RgbImage> {
            let decoded = image::open(&png_path)
                .with_context(|| format!("failed to decode {:?}", png_path.display()))?;
            Ok(decoded.to_rgb8())
        })
        .await?;
        drop(tmpdir);

        if image.width() == 0 || image.height() == 0 {
            return Err(anyhow!("pdftocairo produced an empty image"));
        }
        Ok(image)
    }

    /// Extract the embedded text layer of one page, keeping the layout.
    #[instrument(level = "debug", skip(self, path))]
    pub async fn extract_text(&self, path: &Path, page: usize) -> Result<String> {
        let page_arg = page.to_string();
        let mut cmd = Command::new(&self.pdftotext);
        cmd.arg("-f")
            .arg(&page_arg)
            .arg("-l")
            .arg(&page_arg)
            .arg("-layout")
            .arg("-enc")
            .arg("UTF-8")
            .arg(path)
            .arg("-")
            .kill_on_drop(true);
        let output = with_timeout("pdftotext", self.raster_timeout, async {
            cmd.output().await.with_context(|| {
                format!(
                    "failed to run {} on {:?}",
                    self.pdftotext.display(),
                    path.display()
                )
            })
        })
        .await?;
        check_for_command_failure("pdftotext", &output)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Get the `Pages:` count from `pdfinfo` output.
pub fn parse_page_count(output: &str) -> Result<usize> {
    let mut properties = BTreeMap::new();
    for line in output.lines() {
        let mut parts = line.splitn(2, ':');
        let key = parts.next().unwrap_or("").trim();
        let value = parts.next().unwrap_or("").trim();
        properties.insert(key, value);
    }
    let page_count_str = properties
        .get("Pages")
        .ok_or_else(|| anyhow!("failed to find page count in pdfinfo output"))?;
    page_count_str
        .parse::<usize>()
        .with_context(|| format!("failed to parse page count {page_count_str:?}"))
}

/// Parse page sizes out of `pdfinfo` output. Per-page lines win; a single
/// document-wide `Page size:` line applies to every page.
pub fn parse_pdfinfo(output: &str, page_count: usize) -> PdfInfo {
    let mut page_sizes_mm = BTreeMap::new();
    let mut default_size = None;
    for line in output.lines() {
        if let Some(caps) = PAGE_SIZE_LINE.captures(line) {
            let page = caps[1].parse::<usize>();
            let width = caps[2].parse::<f64>();
            let height = caps[3].parse::<f64>();
            if let (Ok(page), Ok(width), Ok(height)) = (page, width, height) {
                page_sizes_mm.insert(page, (width * MM_PER_PT, height * MM_PER_PT));
            }
        } else if let Some(caps) = DEFAULT_SIZE_LINE.captures(line)
            && let (Ok(width), Ok(height)) = (caps[1].parse::<f64>(), caps[2].parse::<f64>())
        {
            default_size = Some((width * MM_PER_PT, height * MM_PER_PT));
        }
    }
    if page_sizes_mm.is_empty()
        && let Some(size) = default_size
    {
        for page in 1..=page_count {
            page_sizes_mm.insert(page, size);
        }
    }
    PdfInfo {
        page_count,
        page_sizes_mm,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PDFINFO_OUTPUT: &str = "\
Producer:        ScanSoft
Pages:           3
Encrypted:       no
Page    1 size: 595.276 x 841.89 pts (A4)
Page    1 rot:  0
Page    2 size: 841.89 x 1190.55 pts (A3)
Page    2 rot:  0
Page    3 size: 1683.78 x 2383.94 pts (A1)
File size:       1234567 bytes
";

    #[test]
    fn dpi_steps_with_paper_size() {
        assert_eq!(dpi_for_page_size(A4_MM), 300);
        assert_eq!(dpi_for_page_size((297.0, 210.0)), 300);
        assert_eq!(dpi_for_page_size((250.0, 330.0)), 450);
        assert_eq!(dpi_for_page_size(A3_MM), 450);
        assert_eq!(dpi_for_page_size((594.0, 841.0)), 600);
    }

    #[test]
    fn parses_per_page_sizes() {
        assert_eq!(parse_page_count(PDFINFO_OUTPUT).unwrap(), 3);
        let info = parse_pdfinfo(PDFINFO_OUTPUT, 3);
        assert_eq!(info.page_sizes_mm.len(), 3);
        let (w, h) = info.page_size_mm(1).unwrap();
        assert!((w - 210.0).abs() < 0.5 && (h - 297.0).abs() < 0.5);
        assert_eq!(dpi_for_page_size(info.page_size_mm(2).unwrap()), 450);
        assert_eq!(dpi_for_page_size(info.page_size_mm(3).unwrap()), 600);
    }

    #[test]
    fn falls_back_to_document_page_size() {
        let output = "Pages:           2\nPage size:       595 x 842 pts (A4)\n";
        let info = parse_pdfinfo(output, 2);
        assert_eq!(info.page_sizes_mm.len(), 2);
        assert_eq!(dpi_for_page_size(info.page_size_mm(2).unwrap()), 300);
    }

    #[test]
    fn missing_page_count_is_an_error() {
        assert!(parse_page_count("Producer: nobody\n").is_err());
    }

    #[test]
    fn plan_converts_millimetres() {
        let plan = RasterPlan::for_page_size(A4_MM);
        assert_eq!(plan.dpi, 300);
        assert_eq!(plan.px_for_mm(A4_MM.0), 2480);
        assert_eq!(plan.min_plate_side_px(), 177);
        let large = RasterPlan::for_page_size(A3_MM);
        assert_eq!(large.min_plate_side_px(), 266);
    }

    #[tokio::test]
    #[ignore = "Requires poppler-utils to be installed"]
    async fn missing_pdf_fails_inspection() {
        let poppler = Poppler {
            pdfinfo: "pdfinfo".into(),
            pdftocairo: "pdftocairo".into(),
            pdftotext: "pdftotext".into(),
            raster_timeout: Duration::from_secs(60),
        };
        assert!(poppler.inspect(Path::new("/nonexistent.pdf")).await.is_err());
    }
}
