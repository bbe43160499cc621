//! Rule-based parsing of plate-index entries.

use std::sync::LazyLock;

use regex::Regex;

use super::PlateFields;

/// An entry line: a number at the start, an optional separator, then text.
static ENTRY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d{1,4})(?:\s*[.)\-–:]\s*(\D.*)|\s+(\S.*))$")
        .expect("failed to compile regex")
});

/// `w x h [unit]`, with `.` or `,` decimals.
static DIMENSIONS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(\d+(?:[.,]\d+)?)\s*[x×]\s*(\d+(?:[.,]\d+)?)\s*(cm|mm|m|in|inches|pouces)?\b",
    )
    .expect("failed to compile regex")
});

static YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{4})\b").expect("failed to compile regex"));

/// Splits fields on commas or semicolons followed by whitespace, so decimal
/// commas survive.
static FIELD_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[,;]\s+").expect("failed to compile regex"));

/// Words that mark a technique or support.
const MEDIUM_KEYWORDS: &[&str] = &[
    "huile",
    "oil",
    "gouache",
    "aquarelle",
    "watercolo",
    "encre",
    "ink",
    "crayon",
    "pencil",
    "fusain",
    "charcoal",
    "pastel",
    "lithograph",
    "gravure",
    "etching",
    "eau-forte",
    "bronze",
    "acrylique",
    "acrylic",
    "collage",
    "technique mixte",
    "mixed media",
    "tempera",
    "toile",
    "canvas",
    "papier",
    "paper",
    "carton",
    "plâtre",
];

/// Years outside this range are not dates of execution.
const YEAR_RANGE: std::ops::RangeInclusive<u16> = 1850..=2100;

/// Prefixed sections, lowercase.
const PROVENANCE_PREFIXES: &[&str] = &["provenance", "prov."];
const LITERATURE_PREFIXES: &[&str] = &["bibliographie", "literature", "bibl.", "lit."];
const EXHIBITION_PREFIXES: &[&str] = &["expositions", "exposition", "exhibitions", "exhibition", "exp.", "exh."];

/// Split an entry line into its number and free text.
pub fn split_entry(line: &str) -> Option<(u32, String)> {
    let caps = ENTRY_LINE.captures(line)?;
    let number = caps[1].parse::<u32>().ok().filter(|n| *n > 0)?;
    let text = caps.get(2).or_else(|| caps.get(3))?.as_str().trim();
    (!text.is_empty()).then(|| (number, text.to_owned()))
}

/// Is this line the start of an entry?
pub fn is_entry_line(line: &str) -> bool {
    split_entry(line).is_some()
}

#[derive(Clone, Copy)]
enum Section {
    Provenance,
    Literature,
    Exhibition,
}

fn strip_prefix<'a>(segment: &'a str, prefixes: &[&str]) -> Option<&'a str> {
    let lower = segment.to_lowercase();
    prefixes.iter().find_map(|prefix| {
        lower.starts_with(prefix).then(|| {
            segment
                .get(prefix.len()..)
                .unwrap_or("")
                .trim_start_matches([':', ' ', '.'])
        })
    })
}

fn append(slot: &mut Option<String>, text: &str) {
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    match slot {
        Some(existing) => {
            existing.push_str(", ");
            existing.push_str(text);
        }
        None => *slot = Some(text.to_owned()),
    }
}

fn parse_number(text: &str) -> Option<f64> {
    text.replace(',', ".").parse().ok()
}

/// Does this look like a person's name: a few capitalized words, no digits?
fn looks_like_name(segment: &str) -> bool {
    let words = segment.split_whitespace().collect::<Vec<_>>();
    (2..=4).contains(&words.len())
        && !segment.chars().any(|c| c.is_ascii_digit())
        && words
            .iter()
            .all(|w| w.chars().next().is_some_and(|c| c.is_uppercase()) || w.len() <= 3)
}

/// Parse an entry's free text with regexes and keyword lists.
pub fn parse_rules(text: &str) -> PlateFields {
    let mut fields = PlateFields::default();
    let mut section: Option<Section> = None;
    let mut plain = vec![];

    for segment in FIELD_SEPARATOR.split(text) {
        let segment = segment.trim().trim_end_matches('.').trim();
        if segment.is_empty() {
            continue;
        }
        if let Some(rest) = strip_prefix(segment, PROVENANCE_PREFIXES) {
            section = Some(Section::Provenance);
            append(&mut fields.provenance, rest);
            continue;
        }
        if let Some(rest) = strip_prefix(segment, LITERATURE_PREFIXES) {
            section = Some(Section::Literature);
            append(&mut fields.literature, rest);
            continue;
        }
        if let Some(rest) = strip_prefix(segment, EXHIBITION_PREFIXES) {
            section = Some(Section::Exhibition);
            append(&mut fields.exhibition, rest);
            continue;
        }
        match section {
            Some(Section::Provenance) => {
                append(&mut fields.provenance, segment);
                continue;
            }
            Some(Section::Literature) => {
                append(&mut fields.literature, segment);
                continue;
            }
            Some(Section::Exhibition) => {
                append(&mut fields.exhibition, segment);
                continue;
            }
            None => {}
        }

        let lower = segment.to_lowercase();
        if fields.signature.is_none() {
            if lower.starts_with("non signé") || lower.starts_with("unsigned") {
                fields.signature = Some(false);
                continue;
            }
            if ["signé", "signed", "sign.", "monogrammé", "monogrammed"]
                .iter()
                .any(|p| lower.starts_with(p))
            {
                fields.signature = Some(true);
                continue;
            }
        }

        if fields.size.is_none()
            && let Some(caps) = DIMENSIONS.captures(segment)
            && let (Some(a), Some(b)) = (parse_number(&caps[1]), parse_number(&caps[2]))
        {
            fields.size = Some([a, b]);
            fields.size_unit = caps.get(3).map(|m| m.as_str().to_lowercase());
            continue;
        }

        if fields.medium.is_none() && MEDIUM_KEYWORDS.iter().any(|k| lower.contains(k)) {
            fields.medium = Some(segment.to_owned());
            continue;
        }

        let year = YEAR
            .captures_iter(segment)
            .filter_map(|c| c[1].parse::<u16>().ok())
            .find(|y| YEAR_RANGE.contains(y));
        if let Some(year) = year
            && fields.year.is_none()
        {
            fields.year = Some(year);
            // A bare date ("1937", "vers 1937") is consumed. Anything longer
            // is kept as text as well.
            if segment.split_whitespace().count() <= 2 {
                continue;
            }
        }
        plain.push(segment.to_owned());
    }

    let mut plain = plain.into_iter();
    match (plain.next(), plain.len()) {
        (Some(first), rest) if rest >= 1 && looks_like_name(&first) => {
            fields.artist = Some(first);
            fields.title = plain.next();
        }
        (Some(first), _) => fields.title = Some(first),
        (None, _) => {}
    }
    for extra in plain {
        append(&mut fields.description, &extra);
    }
    fields
}

/// Confidence of a rule-based parse: 0.3, plus 0.15 per headline field,
/// capped at 0.9.
pub fn rules_confidence(fields: &PlateFields) -> f64 {
    (0.3 + 0.15 * fields.headline_count() as f64).min(0.9)
}
