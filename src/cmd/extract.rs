//! The extraction command.

use std::{ops::RangeInclusive, process, sync::Arc};

use chrono::Local;
use clap::Args;
use tokio::task::JoinHandle;

use crate::{
    assembly::{
        REPORT_FILE, RunDir,
        catalogue::{RunSummary, build_catalogue, write_consolidated},
    },
    document::{Document, PageSource as _},
    error::{ErrorKind, ExtractError, PARTIAL_EXIT_CODE},
    llm::{
        DEFAULT_LLM_URL, Llm, LlmModels,
        ollama::{DEFAULT_LLM_TIMEOUT, OllamaClient},
    },
    number_reader::{DEFAULT_ZONE_TIMEOUT, NumberReader},
    ocr::create_engine,
    pipeline::{CancelFlag, Extractor},
    plate_index::locate::{DEFAULT_MIN_ENTRIES, DEFAULT_SCAN_PAGES, IndexExtractor, IndexScan},
    prelude::*,
    presets::{self, CollectionPreset},
    raster::{DEFAULT_RASTER_TIMEOUT, Poppler},
    ui::Ui,
};

/// Options for extracting artworks from one catalogue.
#[derive(Debug, Clone, Args)]
pub struct ExtractOpts {
    /// The PDF catalogue to process.
    pub document: PathBuf,

    /// First page to process (1-based).
    #[clap(long, default_value = "1", value_parser = clap::value_parser!(u32).range(1..))]
    pub start_page: u32,

    /// Process at most this many pages.
    #[clap(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_pages: Option<u32>,

    /// Built-in collection preset (`picasso`, `dubuffet`, or their aliases
    /// `preset-with-index` and `preset-without-index`).
    #[clap(long, default_value = "picasso")]
    pub collection: String,

    /// Load the collection preset from a TOML file instead.
    #[clap(long, conflicts_with = "collection")]
    pub collection_file: Option<PathBuf>,

    /// Directory in which to create the run directory.
    #[clap(long, default_value = "output")]
    pub output_root: PathBuf,

    /// Contour detector only, no table of plates, shorter OCR timeouts.
    #[clap(long)]
    pub fast: bool,

    /// Never call the LLM.
    #[clap(long)]
    pub no_llm: bool,

    /// Continue an earlier run in this directory, skipping finished pages.
    #[clap(long, value_name = "RUN_DIR")]
    pub resume: Option<PathBuf>,

    /// Read the table of plates from these pages, e.g. `120-124`.
    #[clap(long, value_name = "A-B", value_parser = parse_page_range)]
    pub index_pages: Option<RangeInclusive<usize>>,

    /// Number of trailing pages to search for the table of plates.
    #[clap(long, value_name = "N", default_value_t = DEFAULT_SCAN_PAGES)]
    pub index_scan_pages: usize,

    /// Hide progress bars.
    #[clap(long)]
    pub quiet: bool,

    #[clap(flatten)]
    pub env: EnvOpts,
}

/// Settings normally taken from the environment or a `.env` file.
#[derive(Debug, Clone, Args)]
pub struct EnvOpts {
    /// Tesseract binary.
    #[clap(long, env = "OCR_BINARY", default_value = "tesseract", hide = true)]
    pub ocr_binary: PathBuf,

    /// Tesseract language.
    #[clap(long, env = "OCR_LANG", default_value = "eng", hide = true)]
    pub ocr_lang: String,

    /// Ollama `generate` endpoint.
    #[clap(long, env = "LLM_URL", default_value = DEFAULT_LLM_URL, hide = true)]
    pub llm_url: String,

    /// Model used to re-read numbers from crops.
    #[clap(long, env = "LLM_MODEL_VISION", default_value = "llava:7b", hide = true)]
    pub llm_model_vision: String,

    /// Model used to parse plate-index entries.
    #[clap(long, env = "LLM_MODEL_TEXT", default_value = "llama3.1:8b", hide = true)]
    pub llm_model_text: String,

    #[clap(long, env = "PDFTOCAIRO_BINARY", default_value = "pdftocairo", hide = true)]
    pub pdftocairo_binary: PathBuf,

    #[clap(long, env = "PDFINFO_BINARY", default_value = "pdfinfo", hide = true)]
    pub pdfinfo_binary: PathBuf,

    #[clap(long, env = "PDFTOTEXT_BINARY", default_value = "pdftotext", hide = true)]
    pub pdftotext_binary: PathBuf,
}

/// Parse `A-B` (or a single page `A`) into a 1-based inclusive range.
pub fn parse_page_range(s: &str) -> Result<RangeInclusive<usize>> {
    let (first, last) = s.split_once('-').unwrap_or((s, s));
    let parse = |p: &str| {
        p.trim()
            .parse::<usize>()
            .ok()
            .filter(|&n| n >= 1)
            .ok_or_else(|| anyhow!("{p:?} is not a page number"))
    };
    let (first, last) = (parse(first)?, parse(last)?);
    if first > last {
        return Err(anyhow!("page range {s:?} is backwards"));
    }
    Ok(first..=last)
}

/// The 1-based pages to process.
pub fn pages_to_process(
    start_page: usize,
    max_pages: Option<usize>,
    page_count: usize,
) -> Result<Vec<usize>> {
    if start_page > page_count {
        return Err(ExtractError::usage(format!(
            "--start-page {start_page} is past the last page ({page_count})"
        ))
        .into());
    }
    let last = match max_pages {
        Some(max) => (start_page + max - 1).min(page_count),
        None => page_count,
    };
    Ok((start_page..=last).collect())
}

/// Pick the preset named on the command line, adjusted for `--fast`.
async fn load_preset(opts: &ExtractOpts) -> Result<CollectionPreset> {
    let preset = match &opts.collection_file {
        Some(path) => presets::load_preset_file(path).await?,
        None => presets::resolve(&opts.collection)?,
    };
    Ok(if opts.fast {
        preset.for_fast_mode()
    } else {
        preset
    })
}

/// Set `cancel` on the first Ctrl-C. A second one exits at once.
fn watch_for_interrupts(cancel: CancelFlag) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupted, finishing the current step. Press Ctrl-C again to quit now");
        cancel.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            error!("Interrupted twice, quitting without writing results");
            process::exit(i32::from(ErrorKind::Aborted.exit_code()));
        }
    })
}

/// Run an extraction. Returns the process exit code for runs that produced
/// output.
#[instrument(level = "debug", skip_all, fields(document = %opts.document.display()))]
pub async fn cmd_extract(ui: Ui, opts: &ExtractOpts) -> Result<u8> {
    let preset = load_preset(opts).await?;
    let env = &opts.env;

    let poppler = Poppler {
        pdfinfo: env.pdfinfo_binary.clone(),
        pdftocairo: env.pdftocairo_binary.clone(),
        pdftotext: env.pdftotext_binary.clone(),
        raster_timeout: DEFAULT_RASTER_TIMEOUT,
    };
    let document = Document::open(&opts.document, poppler).await?;
    let pages = pages_to_process(
        opts.start_page as usize,
        opts.max_pages.map(|n| n as usize),
        document.page_count(),
    )?;

    let run_dir = match &opts.resume {
        Some(path) => RunDir::resume(path).await?,
        None => RunDir::create(&opts.output_root, &document.clean_name(), Local::now()).await?,
    };

    let llm = if opts.no_llm {
        None
    } else {
        Some(Llm::new(
            Arc::new(OllamaClient::new(&env.llm_url, DEFAULT_LLM_TIMEOUT)?),
            LlmModels {
                vision: env.llm_model_vision.clone(),
                text: env.llm_model_text.clone(),
            },
        ))
    };
    let ocr = create_engine(&env.ocr_binary, &env.ocr_lang);
    let cancel = CancelFlag::default();
    let watcher = watch_for_interrupts(cancel.clone());
    info!(
        collection = %preset.name,
        pages = pages.len(),
        fast = opts.fast,
        llm = llm.is_some(),
        "Starting extraction"
    );

    let index = if preset.has_plate_index {
        let extractor = IndexExtractor {
            ocr: ocr.clone(),
            llm: llm.clone(),
            scan: IndexScan {
                keywords: preset.plate_index_keywords.clone(),
                min_entries: DEFAULT_MIN_ENTRIES,
                pages: opts.index_pages.clone(),
                tail_pages: opts.index_scan_pages,
            },
        };
        Some(extractor.extract(&ui, &document, &cancel).await)
    } else {
        None
    };

    let zone_timeout = if opts.fast {
        DEFAULT_ZONE_TIMEOUT / 2
    } else {
        DEFAULT_ZONE_TIMEOUT
    };
    let collection = preset.name.clone();
    let extractor = Extractor {
        reader: NumberReader::new(ocr, preset.number_probe_zones.clone(), zone_timeout),
        preset,
        llm: llm.clone(),
    };

    let outcome = extractor
        .run(&ui, &document, &run_dir, &pages, opts.resume.is_some(), &cancel)
        .await;
    watcher.abort();

    let summary = RunSummary {
        document: document.clean_name(),
        timestamp: Local::now().to_rfc3339(),
        mode: if opts.fast { "fast" } else { "full" }.to_owned(),
        collection,
        llm_enabled: llm.is_some(),
        failed_pages: outcome.failed_pages,
        cancelled: outcome.cancelled,
    };
    let catalogue = build_catalogue(summary, &outcome.pages, index.as_ref());
    write_consolidated(&run_dir, &catalogue, &outcome.pages, index.as_ref()).await?;

    let counts = &catalogue.session_info.counts;
    info!(
        artworks = counts.artworks,
        doubtful = counts.doubtful,
        failed_pages = counts.pages_failed,
        run_dir = %run_dir.root.display(),
        "Extraction finished"
    );

    if outcome.cancelled {
        return Err(ExtractError::aborted(format!(
            "cancelled after {} pages; partial results in {}",
            counts.pages_processed,
            run_dir.root.display()
        ))
        .into());
    }
    if counts.pages_failed > 0 {
        warn!(
            failed_pages = counts.pages_failed,
            "Some pages failed, see {}",
            run_dir.root.join(REPORT_FILE).display()
        );
        return Ok(PARTIAL_EXIT_CODE);
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::exit_code_for;

    #[test]
    fn page_ranges() {
        assert_eq!(parse_page_range("120-124").unwrap(), 120..=124);
        assert_eq!(parse_page_range("7").unwrap(), 7..=7);
        assert!(parse_page_range("9-3").is_err());
        assert!(parse_page_range("0-3").is_err());
        assert!(parse_page_range("a-b").is_err());
    }

    #[test]
    fn page_selection() {
        assert_eq!(pages_to_process(1, None, 3).unwrap(), [1, 2, 3]);
        assert_eq!(pages_to_process(2, Some(1), 3).unwrap(), [2]);
        assert_eq!(pages_to_process(2, Some(10), 3).unwrap(), [2, 3]);
        let err = pages_to_process(4, None, 3).unwrap_err();
        assert_eq!(exit_code_for(&err), 1);
    }
}
