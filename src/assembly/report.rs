//! `extraction_report.md`.

use std::fmt::Write as _;

use super::{PageDetails, catalogue::Catalogue};
use crate::plate_index::PlateIndex;

fn join<T: ToString>(items: &[T]) -> String {
    if items.is_empty() {
        "-".to_owned()
    } else {
        items.iter().map(T::to_string).collect::<Vec<_>>().join(", ")
    }
}

/// Render a human-readable summary of a run.
pub fn render_report(
    catalogue: &Catalogue,
    pages: &[PageDetails],
    index: Option<&PlateIndex>,
) -> String {
    let session = &catalogue.session_info;
    let counts = &session.counts;
    let mut out = String::new();

    // `write!` to a `String` cannot fail.
    let _ = writeln!(out, "# Extraction report: {}\n", session.document);
    let _ = writeln!(out, "- Date: {}", session.timestamp);
    let _ = writeln!(out, "- Collection: {}", session.collection);
    let _ = writeln!(out, "- Mode: {}", session.mode);
    let _ = writeln!(
        out,
        "- LLM: {}",
        if session.llm_enabled { "enabled" } else { "disabled" }
    );
    if session.cancelled {
        let _ = writeln!(out, "- **Run was cancelled before all pages were processed.**");
    }

    let _ = writeln!(out, "\n## Summary\n");
    let _ = writeln!(out, "| | Count |\n|---|---:|");
    let _ = writeln!(out, "| Pages processed | {} |", counts.pages_processed);
    let _ = writeln!(out, "| Pages failed | {} |", counts.pages_failed);
    let _ = writeln!(out, "| Artworks | {} |", counts.artworks);
    let _ = writeln!(out, "| Confident | {} |", counts.confident);
    let _ = writeln!(out, "| Doubtful | {} |", counts.doubtful);
    let _ = writeln!(out, "| With plate metadata | {} |", counts.with_plate_metadata);

    if let Some(index) = index {
        let _ = writeln!(out, "\n## Table of plates\n");
        let _ = writeln!(
            out,
            "{} records from pages {} (scanned {}).",
            index.records.len(),
            join(&index.index_pages),
            join(&index.pages_scanned)
        );
    }

    let mut sorted = pages.iter().collect::<Vec<_>>();
    sorted.sort_by_key(|p| p.page);
    let anomalous = sorted
        .iter()
        .filter(|p| p.coherence.has_anomalies())
        .collect::<Vec<_>>();
    let _ = writeln!(out, "\n## Coherence\n");
    if anomalous.is_empty() {
        let _ = writeln!(out, "Every page's numbers are sequential.");
    } else {
        let _ = writeln!(
            out,
            "| Page | Numbers | Gaps | Duplicates | Renumbered | LLM corrections |\n|---:|---|---|---|---:|---:|"
        );
        for page in anomalous {
            let c = &page.coherence;
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} | {} |",
                page.page,
                join(&c.numbers),
                join(&c.gaps),
                join(&c.duplicates),
                c.renumbered.len(),
                c.llm_corrections.len()
            );
        }
    }

    if !session.failed_pages.is_empty() {
        let _ = writeln!(out, "\n## Failed pages\n");
        for failed in &session.failed_pages {
            let _ = writeln!(out, "- Page {}: {}", failed.page, failed.error.replace('\n', " "));
        }
    }

    let doubtful = catalogue
        .artworks
        .iter()
        .filter(|a| a.metadata.is_doubtful)
        .collect::<Vec<_>>();
    if !doubtful.is_empty() {
        let _ = writeln!(out, "\n## Doubtful artworks\n");
        for artwork in doubtful {
            let _ = writeln!(
                out,
                "- `{}`: {}",
                artwork.image_path,
                join(&artwork.metadata.doubt_reasons)
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{
            catalogue::{FailedPage, RunSummary, build_catalogue},
            test_pages::details,
        },
        coherence::CoherenceReport,
    };

    #[test]
    fn report_lists_anomalies_and_failures() {
        let mut page = details(4, &[(Some(4), false), (Some(6), false), (None, true)]);
        page.coherence = CoherenceReport {
            numbers: vec![4, 6],
            gaps: vec![5],
            is_sequential: false,
            ..CoherenceReport::default()
        };
        let pages = vec![page, details(5, &[(Some(7), false)])];
        let summary = RunSummary {
            document: "cat".to_owned(),
            timestamp: "now".to_owned(),
            mode: "fast".to_owned(),
            collection: "dubuffet".to_owned(),
            llm_enabled: false,
            failed_pages: vec![FailedPage {
                page: 9,
                error: "no candidate regions".to_owned(),
            }],
            cancelled: true,
        };
        let catalogue = build_catalogue(summary, &pages, None);
        let report = render_report(&catalogue, &pages, None);
        assert!(report.contains("| 4 | 4, 6 | 5 | - | 0 | 0 |"), "{report}");
        assert!(!report.contains("| 5 |"));
        assert!(report.contains("- Page 9: no candidate regions"));
        assert!(report.contains("`page_004/qualite_DOUTEUSE/03.png`: no_number_read"));
        assert!(report.contains("cancelled"));
        assert!(report.contains("| Artworks | 4 |"));
    }
}
