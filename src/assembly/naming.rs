//! Crop file names within a page directory.

use std::collections::BTreeSet;

use crate::quality::DOUBTFUL_DIR;

/// Base name for a crop: the catalogue number, or a zero-padded 1-based
/// region ordinal when no number is known.
pub fn base_name(catalog_number: Option<u32>, ordinal: usize) -> String {
    match catalog_number {
        Some(n) => n.to_string(),
        None => format!("{ordinal:02}"),
    }
}

/// Assign file names, relative to the page directory, to every region of a
/// page. `regions` holds `(catalog_number, is_doubtful)` in reading order.
///
/// Names are unique within the page across both the confident and doubtful
/// directories. Collisions get `_a`, `_b`, ... suffixes.
pub fn assign_file_names(regions: &[(Option<u32>, bool)]) -> Vec<String> {
    let mut used = BTreeSet::new();
    regions
        .iter()
        .enumerate()
        .map(|(i, &(number, doubtful))| {
            let base = base_name(number, i + 1);
            let stem = unique_stem(&base, &used);
            used.insert(stem.clone());
            if doubtful {
                format!("{DOUBTFUL_DIR}/{stem}.png")
            } else {
                format!("{stem}.png")
            }
        })
        .collect()
}

fn unique_stem(base: &str, used: &BTreeSet<String>) -> String {
    if !used.contains(base) {
        return base.to_owned();
    }
    (0..)
        .map(suffix)
        .map(|s| format!("{base}_{s}"))
        .find(|candidate| !used.contains(candidate))
        .unwrap_or_else(|| base.to_owned())
}

/// `a`, `b`, ..., `z`, `aa`, `ab`, ...
fn suffix(mut n: usize) -> String {
    let mut letters = vec![];
    loop {
        letters.push(char::from(b'a' + (n % 26) as u8));
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    letters.iter().rev().collect()
}
