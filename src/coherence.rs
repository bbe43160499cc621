//! Per-page catalogue number coherence: gaps, duplicates, deterministic
//! renumbering and optional LLM adjudication.

use std::collections::{BTreeMap, BTreeSet};

use image::RgbImage;
use schemars::JsonSchema;
use serde_json::json;

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    imaging::downscale_rgb,
    llm::{Llm, jpeg_base64, render_prompt},
    prelude::*,
};

/// Highest catalogue number we accept.
pub const MAX_CATALOG_NUMBER: u32 = 9999;

/// LLM corrections below this confidence are ignored.
pub const MIN_CORRECTION_CONFIDENCE: f64 = 0.7;

/// Longest side of the crops we send for adjudication.
const ADJUDICATION_MAX_SIDE: u32 = 512;

/// Shape of the numbers read on one page.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceAnalysis {
    /// Distinct numbers, ascending.
    pub numbers: Vec<u32>,
    /// Numbers missing between the lowest and highest.
    pub gaps: Vec<u32>,
    /// Numbers read on more than one region.
    pub duplicates: Vec<u32>,
    pub is_sequential: bool,
}

/// Compute the sorted set, gaps and duplicates of `numbers`.
pub fn analyze(numbers: &[Option<u32>]) -> SequenceAnalysis {
    let mut counts = BTreeMap::<u32, usize>::new();
    for n in numbers.iter().flatten() {
        *counts.entry(*n).or_default() += 1;
    }
    let distinct = counts.keys().copied().collect::<Vec<_>>();
    let duplicates = counts
        .iter()
        .filter(|(_, count)| **count > 1)
        .map(|(n, _)| *n)
        .collect::<Vec<_>>();
    let gaps = match (distinct.first(), distinct.last()) {
        (Some(&lo), Some(&hi)) => (lo..=hi).filter(|n| !counts.contains_key(n)).collect(),
        _ => vec![],
    };
    SequenceAnalysis {
        is_sequential: duplicates.is_empty() && gaps.is_empty(),
        numbers: distinct,
        gaps,
        duplicates,
    }
}

/// A deterministic relabelling of a duplicate.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct Renumbering {
    /// Region index, in reading order.
    pub region: usize,
    pub from: u32,
    pub to: u32,
}

/// Relabel duplicates in place. `numbers` is in reading order. The first
/// region with a number keeps it, and the k-th repeat becomes `base + k`
/// when that number is not already on the page. Returns the relabellings.
pub fn renumber_duplicates(numbers: &mut [Option<u32>]) -> Vec<Renumbering> {
    let mut present = numbers.iter().flatten().copied().collect::<BTreeSet<u32>>();
    let mut repeats = BTreeMap::<u32, u32>::new();
    let mut seen = BTreeSet::new();
    let mut renumbered = vec![];
    for (region, slot) in numbers.iter_mut().enumerate() {
        let Some(base) = *slot else { continue };
        if seen.insert(base) {
            continue;
        }
        let k = repeats.entry(base).or_insert(0);
        *k += 1;
        let target = base + *k;
        if target <= MAX_CATALOG_NUMBER && !present.contains(&target) {
            present.insert(target);
            seen.insert(target);
            *slot = Some(target);
            renumbered.push(Renumbering {
                region,
                from: base,
                to: target,
            });
        }
    }
    renumbered
}

/// Regions that still share their number with an earlier region.
pub fn residual_duplicates(numbers: &[Option<u32>]) -> Vec<usize> {
    let mut seen = BTreeSet::new();
    numbers
        .iter()
        .enumerate()
        .filter_map(|(i, n)| n.filter(|n| !seen.insert(*n)).map(|_| i))
        .collect()
}

/// One correction proposed by the LLM.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ProposedCorrection {
    /// Region index as listed in the prompt.
    pub region: usize,
    /// The number actually printed, or null if none.
    pub catalog_number: Option<u32>,
    /// Confidence between 0 and 1.
    pub confidence: f64,
}

/// What we ask the vision model to return.
#[derive(Clone, Debug, Deserialize, JsonSchema)]
pub struct AdjudicationResponse {
    pub corrections: Vec<ProposedCorrection>,
}

/// A correction we applied.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AppliedCorrection {
    pub region: usize,
    pub from: Option<u32>,
    pub to: Option<u32>,
    pub confidence: f64,
}

/// Per-page coherence block, persisted in `page_details.json`.
///
/// `numbers`, `gaps`, `duplicates` and `is_sequential` describe the numbers
/// as OCR read them. The rest records what we changed.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct CoherenceReport {
    pub numbers: Vec<u32>,
    pub gaps: Vec<u32>,
    pub duplicates: Vec<u32>,
    pub is_sequential: bool,
    pub renumbered: Vec<Renumbering>,
    pub llm_corrections: Vec<AppliedCorrection>,
    /// Regions whose number was cleared because it repeated an earlier
    /// region's and could not be resolved.
    pub unresolved_duplicates: Vec<usize>,
}

impl CoherenceReport {
    /// Does this page need a human look?
    pub fn has_anomalies(&self) -> bool {
        !self.is_sequential || !self.unresolved_duplicates.is_empty()
    }
}

/// One region as the analyzer sees it.
#[derive(Clone, Debug)]
pub struct RegionNumber {
    pub number: Option<u32>,
    pub confidence: f64,
}

/// Reconcile a page's numbers in place.
///
/// `regions` and `crops` are parallel and in reading order. When `llm` is
/// given and the page still has gaps or duplicates after renumbering, the
/// crops are sent for adjudication. Any LLM failure leaves the page as it
/// was. Afterwards no two regions share a number.
#[instrument(level = "debug", skip_all, fields(regions = regions.len()))]
pub async fn reconcile(
    regions: &mut [RegionNumber],
    crops: &[RgbImage],
    llm: Option<&Llm>,
) -> CoherenceReport {
    let mut numbers = regions.iter().map(|r| r.number).collect::<Vec<_>>();
    let analysis = analyze(&numbers);
    let renumbered = renumber_duplicates(&mut numbers);
    for r in &renumbered {
        debug!(region = r.region, from = r.from, to = r.to, "Renumbered duplicate");
    }

    let mut llm_corrections = vec![];
    let residual = residual_duplicates(&numbers);
    if let Some(llm) = llm
        && (!analysis.gaps.is_empty() || !residual.is_empty())
    {
        let after = analyze(&numbers);
        match adjudicate(llm, regions, &numbers, &after, crops).await {
            Ok(proposed) => {
                llm_corrections = apply_corrections(&mut numbers, proposed);
            }
            Err(err) => warn!("Skipping LLM adjudication: {err:#}"),
        }
    }

    let unresolved_duplicates = residual_duplicates(&numbers);
    for &i in &unresolved_duplicates {
        numbers[i] = None;
    }
    for (region, number) in regions.iter_mut().zip(numbers) {
        region.number = number;
    }

    CoherenceReport {
        numbers: analysis.numbers,
        gaps: analysis.gaps,
        duplicates: analysis.duplicates,
        is_sequential: analysis.is_sequential,
        renumbered,
        llm_corrections,
        unresolved_duplicates,
    }
}

/// Apply confident corrections that keep numbers unique and in range.
fn apply_corrections(
    numbers: &mut [Option<u32>],
    proposed: Vec<ProposedCorrection>,
) -> Vec<AppliedCorrection> {
    let mut applied = vec![];
    for correction in proposed {
        if correction.confidence < MIN_CORRECTION_CONFIDENCE
            || correction.region >= numbers.len()
        {
            continue;
        }
        let from = numbers[correction.region];
        let to = correction.catalog_number;
        if from == to {
            continue;
        }
        if let Some(n) = to {
            let clash = numbers
                .iter()
                .enumerate()
                .any(|(i, m)| i != correction.region && *m == Some(n));
            if n == 0 || n > MAX_CATALOG_NUMBER || clash {
                debug!(region = correction.region, number = n, "Rejected LLM correction");
                continue;
            }
        }
        numbers[correction.region] = to;
        applied.push(AppliedCorrection {
            region: correction.region,
            from,
            to,
            confidence: correction.confidence,
        });
    }
    applied
}

/// Ask the vision model to re-read the page's numbers.
async fn adjudicate(
    llm: &Llm,
    regions: &[RegionNumber],
    numbers: &[Option<u32>],
    analysis: &SequenceAnalysis,
    crops: &[RgbImage],
) -> Result<Vec<ProposedCorrection>> {
    let listed = numbers
        .iter()
        .zip(regions)
        .enumerate()
        .map(|(index, (number, region))| {
            json!({
                "index": index,
                "catalog_number": number,
                "confidence": format!("{:.2}", region.confidence),
            })
        })
        .collect::<Vec<_>>();
    let prompt = render_prompt(
        "adjudicate",
        &json!({
            "regions": listed,
            "gaps": analysis.gaps,
            "duplicates": analysis.duplicates,
        }),
    )?;

    let crops = crops.to_vec();
    let images = spawn_blocking_propagating_panics(move || {
        crops
            .iter()
            .map(|crop| jpeg_base64(&downscale_rgb(crop, ADJUDICATION_MAX_SIDE).0))
            .collect::<Result<Vec<_>>>()
    })
    .await?;

    let response: AdjudicationResponse =
        llm.ask_json(&llm.models.vision, prompt, images).await?;
    Ok(response.corrections)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::llm::fake::ScriptedLlm;

    fn regions(numbers: &[Option<u32>]) -> Vec<RegionNumber> {
        numbers
            .iter()
            .map(|&number| RegionNumber {
                number,
                confidence: 0.8,
            })
            .collect()
    }

    fn crops(n: usize) -> Vec<RgbImage> {
        vec![RgbImage::new(40, 30); n]
    }

    #[test]
    fn gap_is_reported() {
        let analysis = analyze(&[Some(4), Some(6)]);
        assert_eq!(analysis.numbers, [4, 6]);
        assert_eq!(analysis.gaps, [5]);
        assert!(analysis.duplicates.is_empty());
        assert!(!analysis.is_sequential);
    }

    #[test]
    fn sequential_page() {
        let analysis = analyze(&[Some(3), None, Some(1), Some(2)]);
        assert!(analysis.is_sequential);
        assert_eq!(analysis.numbers, [1, 2, 3]);
        assert!(analyze(&[]).is_sequential);
    }

    #[test]
    fn duplicate_becomes_next_number() {
        let mut numbers = [Some(12), Some(12)];
        let renumbered = renumber_duplicates(&mut numbers);
        assert_eq!(numbers, [Some(12), Some(13)]);
        assert_eq!(
            renumbered,
            [Renumbering {
                region: 1,
                from: 12,
                to: 13
            }]
        );
    }

    #[test]
    fn taken_target_leaves_duplicate() {
        let mut numbers = [Some(12), Some(13), Some(12)];
        assert!(renumber_duplicates(&mut numbers).is_empty());
        assert_eq!(residual_duplicates(&numbers), [2]);
    }

    #[test]
    fn repeated_duplicates_count_up() {
        let mut numbers = [Some(5), Some(5), None, Some(5)];
        renumber_duplicates(&mut numbers);
        assert_eq!(numbers, [Some(5), Some(6), None, Some(7)]);
    }

    #[tokio::test]
    async fn unresolved_duplicate_is_cleared() {
        let mut page = regions(&[Some(12), Some(13), Some(12)]);
        let report = reconcile(&mut page, &crops(3), None).await;
        assert_eq!(page[2].number, None);
        assert_eq!(report.unresolved_duplicates, [2]);
        assert_eq!(report.duplicates, [12]);
        assert!(report.has_anomalies());
    }

    #[tokio::test]
    async fn numbers_stay_unique_after_reconcile() {
        let mut page = regions(&[Some(1), Some(1), Some(2), Some(2), Some(1), None]);
        reconcile(&mut page, &crops(6), None).await;
        let numbers = page.iter().filter_map(|r| r.number).collect::<Vec<_>>();
        let unique = numbers.iter().collect::<BTreeSet<_>>();
        assert_eq!(numbers.len(), unique.len());
    }

    #[tokio::test]
    async fn confident_llm_corrections_fill_gaps() {
        let llm = Arc::new(ScriptedLlm::new([Ok(r#"{"corrections": [
            {"region": 1, "catalog_number": 5, "confidence": 0.9},
            {"region": 0, "catalog_number": 6, "confidence": 0.95},
            {"region": 2, "catalog_number": 40, "confidence": 0.5}
        ]}"#)]));
        let mut page = regions(&[Some(4), Some(8), Some(6)]);
        let report = reconcile(&mut page, &crops(3), Some(&llm.clone().into_llm())).await;
        // Region 0 -> 6 would clash with region 2, and region 2's is too weak.
        assert_eq!(
            page.iter().map(|r| r.number).collect::<Vec<_>>(),
            [Some(4), Some(5), Some(6)]
        );
        assert_eq!(report.llm_corrections.len(), 1);
        assert_eq!(report.llm_corrections[0].from, Some(8));
        assert_eq!(report.gaps, [5, 7]);

        let requests = llm.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model, "vision-model");
        assert_eq!(requests[0].images.len(), 3);
        assert!(requests[0].prompt.contains("region 1: OCR read \"8\""));
    }

    #[tokio::test]
    async fn llm_failure_leaves_page_alone() {
        let llm = Arc::new(ScriptedLlm::new([Err("connection refused")]));
        let mut page = regions(&[Some(4), Some(6)]);
        let report = reconcile(&mut page, &crops(2), Some(&llm.into_llm())).await;
        assert_eq!(page[1].number, Some(6));
        assert!(report.llm_corrections.is_empty());
        assert_eq!(report.gaps, [5]);
    }

    #[tokio::test]
    async fn sequential_pages_skip_the_llm() {
        let llm = Arc::new(ScriptedLlm::default());
        let mut page = regions(&[Some(1), Some(2)]);
        reconcile(&mut page, &crops(2), Some(&llm.clone().into_llm())).await;
        assert!(llm.requests().is_empty());
    }
}
