//! Finding the table of plates and reading its entries.

use std::{ops::RangeInclusive, sync::Arc};

use image::imageops;

use super::{
    ParseMethod, PlateIndex, PlateRecord,
    llm::{LLM_PARSE_CONFIDENCE, parse_with_llm},
    parse::{is_entry_line, parse_rules, rules_confidence, split_entry},
};
use crate::{
    async_utils::spawn_blocking_propagating_panics,
    document::PageSource,
    llm::Llm,
    ocr::{OcrEngine, psm},
    pipeline::CancelFlag,
    prelude::*,
    ui::{ProgressConfig, Ui},
};

/// Pages scanned at the end of the document by default.
pub const DEFAULT_SCAN_PAGES: usize = 10;

/// Entry lines needed for a page to count as an index page.
pub const DEFAULT_MIN_ENTRIES: usize = 5;

/// Text layers with fewer non-blank characters than this are OCRed instead.
pub const MIN_EMBEDDED_CHARS: usize = 40;

/// Resolution for OCRing index pages.
pub const INDEX_OCR_DPI: u32 = 200;

/// Which pages to scan, and how to recognize index pages.
#[derive(Clone, Debug)]
pub struct IndexScan {
    pub keywords: Vec<String>,
    pub min_entries: usize,
    /// Explicit 1-based page range, overriding the tail scan.
    pub pages: Option<RangeInclusive<usize>>,
    /// Number of trailing pages to scan otherwise.
    pub tail_pages: usize,
}

impl IndexScan {
    /// The 1-based pages to scan in a document of `page_count` pages.
    pub fn pages_to_scan(&self, page_count: usize) -> Vec<usize> {
        match &self.pages {
            Some(range) => range
                .clone()
                .filter(|p| (1..=page_count).contains(p))
                .collect(),
            None => {
                let first = page_count.saturating_sub(self.tail_pages) + 1;
                (first..=page_count).collect()
            }
        }
    }
}

/// One entry, possibly spread over several lines.
#[derive(Clone, Debug, PartialEq)]
pub struct RawEntry {
    pub number: u32,
    pub page: usize,
    pub text: String,
    /// The entry as printed, lines joined with spaces.
    pub raw_line: String,
}

/// Is this page an index page? It needs a keyword and enough entry lines.
pub fn is_index_page(text: &str, keywords: &[String], min_entries: usize) -> bool {
    let lower = text.to_lowercase();
    let has_keyword = keywords.iter().any(|k| lower.contains(&k.to_lowercase()));
    has_keyword && text.lines().filter(|l| is_entry_line(l)).count() >= min_entries
}

/// Split a page's text into entries. Lines before the first entry are
/// headings, and other non-entry lines continue the previous entry.
pub fn split_entries(page: usize, text: &str) -> Vec<RawEntry> {
    let mut entries: Vec<RawEntry> = vec![];
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some((number, rest)) = split_entry(line) {
            entries.push(RawEntry {
                number,
                page,
                text: rest,
                raw_line: trimmed.to_owned(),
            });
        } else if let Some(last) = entries.last_mut() {
            last.text.push(' ');
            last.text.push_str(trimmed);
            last.raw_line.push(' ');
            last.raw_line.push_str(trimmed);
        }
    }
    entries
}

/// Reads the table of plates from the end of a document.
pub struct IndexExtractor {
    pub ocr: Arc<dyn OcrEngine>,
    pub llm: Option<Llm>,
    pub scan: IndexScan,
}

impl IndexExtractor {
    /// Scan, classify and parse. Pages that fail to read are logged and
    /// skipped.
    ///
    /// Once `cancel` is set, no more pages are read and the entries already
    /// found are parsed by the rules alone. The same happens for the LLM once
    /// it has stopped answering.
    #[instrument(level = "debug", skip_all)]
    pub async fn extract(
        &self,
        ui: &Ui,
        document: &dyn PageSource,
        cancel: &CancelFlag,
    ) -> PlateIndex {
        let pages = self.scan.pages_to_scan(document.page_count());
        let spinner = ui.new_spinner(&ProgressConfig {
            emoji: "📖",
            msg: "Scanning for table of plates",
            done_msg: "Scanned for table of plates",
        });

        let mut index_pages = vec![];
        let mut entries = vec![];
        let mut scanned = Vec::with_capacity(pages.len());
        for &page in &pages {
            if cancel.is_cancelled() {
                warn!(page, "Interrupted, not scanning further for table of plates");
                break;
            }
            scanned.push(page);
            spinner.set_message(format!("Scanning page {page} for table of plates"));
            let text = match self.page_text(document, page).await {
                Ok(text) => text,
                Err(err) => {
                    warn!(page, "Cannot read page for plate index: {err:#}");
                    continue;
                }
            };
            if is_index_page(&text, &self.scan.keywords, self.scan.min_entries) {
                debug!(page, "Found plate index page");
                index_pages.push(page);
                entries.extend(split_entries(page, &text));
            }
        }
        drop(spinner);

        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            let llm = self
                .llm
                .as_ref()
                .filter(|llm| !llm.is_unavailable() && !cancel.is_cancelled());
            records.push(parse_entry(llm, entry).await);
        }
        let index = PlateIndex::from_records(scanned, index_pages, records);
        info!(
            index_pages = ?index.index_pages,
            records = index.records.len(),
            "Read table of plates"
        );
        index
    }

    /// Embedded text if there is enough of it, OCR otherwise.
    async fn page_text(&self, document: &dyn PageSource, page: usize) -> Result<String> {
        match document.embedded_text(page).await {
            Ok(text) if non_blank_chars(&text) >= MIN_EMBEDDED_CHARS => return Ok(text),
            Ok(_) => debug!(page, "No usable text layer, using OCR"),
            Err(err) => debug!(page, "Cannot extract text layer, using OCR: {err:#}"),
        }
        let raster = document.rasterize(page, INDEX_OCR_DPI).await?;
        let gray = spawn_blocking_propagating_panics(move || imageops::grayscale(&raster)).await;
        self.ocr.recognize(&gray, psm::AUTO, None).await
    }
}

async fn parse_entry(llm: Option<&Llm>, entry: RawEntry) -> PlateRecord {
    if let Some(llm) = llm {
        match parse_with_llm(llm, entry.number, &entry.text).await {
            Ok(fields) => {
                return PlateRecord {
                    number: entry.number,
                    page: entry.page,
                    raw_line: entry.raw_line,
                    fields,
                    parse_method: ParseMethod::Llm,
                    confidence: LLM_PARSE_CONFIDENCE,
                };
            }
            Err(err) => debug!(number = entry.number, "Falling back to rules: {err:#}"),
        }
    }
    let fields = parse_rules(&entry.text);
    PlateRecord {
        number: entry.number,
        page: entry.page,
        raw_line: entry.raw_line,
        confidence: rules_confidence(&fields),
        fields,
        parse_method: ParseMethod::Rules,
    }
}

fn non_blank_chars(text: &str) -> usize {
    text.chars().filter(|c| !c.is_whitespace()).count()
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use image::{Rgb, RgbImage};
    use tokio::net::TcpListener;

    use super::*;
    use crate::{
        document::fake::FakeDocument,
        llm::{LlmModels, fake::ScriptedLlm, ollama::OllamaClient},
        ocr::fake::{Reply, ScriptedOcr},
        presets::picasso,
    };

    const INDEX_TEXT: &str = "\
                 TABLE DES PLANCHES

  1. Pablo Picasso, Guernica, 1937, huile sur toile, 349.3 x 776.6 cm, signé
  2. Pablo Picasso, La Femme qui pleure, 1937,
     huile sur toile, 60 x 49 cm
  3. Nature morte, 1938
  4. Tête de taureau, 1942, bronze
  5. Paysage, 1953
";

    fn scan() -> IndexScan {
        IndexScan {
            keywords: vec!["planches".to_owned(), "sommaire".to_owned()],
            min_entries: DEFAULT_MIN_ENTRIES,
            pages: None,
            tail_pages: DEFAULT_SCAN_PAGES,
        }
    }

    fn blank_pages(n: usize) -> Vec<RgbImage> {
        vec![RgbImage::from_pixel(20, 20, Rgb([255, 255, 255])); n]
    }

    #[test]
    fn scan_ranges() {
        assert_eq!(scan().pages_to_scan(3), [1, 2, 3]);
        assert_eq!(scan().pages_to_scan(25), (16..=25).collect::<Vec<_>>());
        let forced = IndexScan {
            pages: Some(20..=40),
            ..scan()
        };
        assert_eq!(forced.pages_to_scan(22), [20, 21, 22]);
    }

    #[test]
    fn classification_needs_keyword_and_entries() {
        assert!(is_index_page(INDEX_TEXT, &scan().keywords, 5));
        assert!(!is_index_page(INDEX_TEXT, &scan().keywords, 6));
        let no_keyword = INDEX_TEXT.replace("TABLE DES PLANCHES", "");
        assert!(!is_index_page(&no_keyword, &scan().keywords, 5));
    }

    #[test]
    fn catalogue_prose_is_not_an_index() {
        let prose = "\
Le présent catalogue réunit les œuvres exposées en 1955.
1.Les prêts viennent de collections privées.
2.Les dimensions sont données en centimètres.
3.La hauteur précède la largeur.
4.Les œuvres non signées sont indiquées.
5.Les dates entre crochets sont attribuées.
";
        let keywords = picasso().plate_index_keywords;
        assert_eq!(prose.lines().filter(|l| is_entry_line(l)).count(), 5);
        assert!(!is_index_page(prose, &keywords, DEFAULT_MIN_ENTRIES));
        let titled = format!("LISTE DES ŒUVRES\n{prose}");
        assert!(is_index_page(&titled, &keywords, DEFAULT_MIN_ENTRIES));
    }

    #[test]
    fn continuation_lines_join_previous_entry() {
        let entries = split_entries(9, INDEX_TEXT);
        assert_eq!(entries.len(), 5);
        assert_eq!(
            entries[1].text,
            "Pablo Picasso, La Femme qui pleure, 1937, huile sur toile, 60 x 49 cm"
        );
        assert_eq!(entries[4].page, 9);
    }

    #[tokio::test]
    async fn extracts_records_from_text_layer() {
        let mut document = FakeDocument {
            pages: blank_pages(12),
            ..FakeDocument::default()
        };
        document.texts.insert(11, INDEX_TEXT.to_owned());
        let extractor = IndexExtractor {
            ocr: Arc::new(ScriptedOcr::default()),
            llm: None,
            scan: scan(),
        };
        let index = extractor.extract(&Ui::init_for_tests(), &document, &CancelFlag::default())
            .await;
        assert_eq!(index.pages_scanned, (3..=12).collect::<Vec<_>>());
        assert_eq!(index.index_pages, [11]);
        assert_eq!(index.records.len(), 5);
        let guernica = index.get(1).unwrap();
        assert_eq!(guernica.fields.title.as_deref(), Some("Guernica"));
        assert_eq!(guernica.fields.year, Some(1937));
        assert_eq!(guernica.fields.medium.as_deref(), Some("huile sur toile"));
        assert_eq!(guernica.fields.size, Some([349.3, 776.6]));
        assert_eq!(guernica.fields.size_unit.as_deref(), Some("cm"));
        assert_eq!(guernica.fields.signature, Some(true));
        assert_eq!(guernica.parse_method, ParseMethod::Rules);
        assert_eq!(index.get(4).unwrap().fields.medium.as_deref(), Some("bronze"));
    }

    #[tokio::test]
    async fn falls_back_to_ocr_without_text_layer() {
        let document = FakeDocument {
            pages: blank_pages(2),
            ..FakeDocument::default()
        };
        let ocr = Arc::new(ScriptedOcr::new([Reply::Text(""), Reply::Text(INDEX_TEXT)]));
        let extractor = IndexExtractor {
            ocr: ocr.clone(),
            llm: None,
            scan: scan(),
        };
        let index = extractor.extract(&Ui::init_for_tests(), &document, &CancelFlag::default())
            .await;
        assert_eq!(index.index_pages, [2]);
        assert_eq!(ocr.calls().len(), 2);
        assert!(ocr.calls().iter().all(|&(_, _, mode)| mode == psm::AUTO));
    }

    #[tokio::test]
    async fn llm_parse_supersedes_rules_when_valid() {
        let mut document = FakeDocument {
            pages: blank_pages(1),
            ..FakeDocument::default()
        };
        document.texts.insert(1, INDEX_TEXT.to_owned());
        let llm = Arc::new(ScriptedLlm::new([
            Ok(r#"{"title": "Guernica (LLM)", "year": 1937}"#),
            Err("model not loaded"),
        ]));
        let extractor = IndexExtractor {
            ocr: Arc::new(ScriptedOcr::default()),
            llm: Some(llm.clone().into_llm()),
            scan: scan(),
        };
        let index = extractor.extract(&Ui::init_for_tests(), &document, &CancelFlag::default())
            .await;
        let first = index.get(1).unwrap();
        assert_eq!(first.parse_method, ParseMethod::Llm);
        assert_eq!(first.fields.title.as_deref(), Some("Guernica (LLM)"));
        let second = index.get(2).unwrap();
        assert_eq!(second.parse_method, ParseMethod::Rules);
        assert_eq!(second.fields.title.as_deref(), Some("La Femme qui pleure"));
        // The failed call stops the LLM for the rest of the table.
        assert_eq!(llm.requests().len(), 2);
        assert_eq!(index.get(5).unwrap().parse_method, ParseMethod::Rules);
    }

    #[tokio::test]
    async fn silent_llm_server_costs_one_budget() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/api/generate", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let mut held = vec![];
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let budget = Duration::from_millis(300);
        let llm = Llm::new(
            Arc::new(OllamaClient::new(&url, budget).unwrap()),
            LlmModels {
                vision: "vision-model".to_owned(),
                text: "text-model".to_owned(),
            },
        );
        let mut document = FakeDocument {
            pages: blank_pages(1),
            ..FakeDocument::default()
        };
        document.texts.insert(1, INDEX_TEXT.to_owned());
        let extractor = IndexExtractor {
            ocr: Arc::new(ScriptedOcr::default()),
            llm: Some(llm.clone()),
            scan: scan(),
        };

        let started = Instant::now();
        let index = extractor
            .extract(&Ui::init_for_tests(), &document, &CancelFlag::default())
            .await;
        let elapsed = started.elapsed();
        assert!(elapsed < budget * 3, "took {elapsed:?} for a {budget:?} budget");
        assert!(llm.is_unavailable());
        assert_eq!(index.records.len(), 5);
        assert!(index.records.iter().all(|r| r.parse_method == ParseMethod::Rules));
        assert_eq!(index.get(1).unwrap().fields.title.as_deref(), Some("Guernica"));
    }

    #[tokio::test]
    async fn cancelled_scan_reads_no_pages() {
        let mut document = FakeDocument {
            pages: blank_pages(3),
            ..FakeDocument::default()
        };
        document.texts.insert(3, INDEX_TEXT.to_owned());
        let llm = Arc::new(ScriptedLlm::new([Ok(r#"{"title": "Guernica (LLM)"}"#)]));
        let extractor = IndexExtractor {
            ocr: Arc::new(ScriptedOcr::default()),
            llm: Some(llm.clone().into_llm()),
            scan: scan(),
        };
        let cancel = CancelFlag::default();
        cancel.cancel();
        let index = extractor.extract(&Ui::init_for_tests(), &document, &cancel).await;
        assert!(index.pages_scanned.is_empty());
        assert!(index.records.is_empty());
        assert!(llm.requests().is_empty());
    }
}
