//! The table of plates: locating it at the back of the document, and turning
//! its entries into [`PlateRecord`]s keyed by catalogue number.

use std::collections::BTreeMap;

use crate::prelude::*;

pub mod llm;
pub mod locate;
pub mod parse;

/// How a record's fields were obtained.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMethod {
    Rules,
    Llm,
}

/// Structured fields parsed from an entry.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct PlateFields {
    pub artist: Option<String>,
    pub title: Option<String>,
    pub medium: Option<String>,
    /// Two dimensions, in the order printed.
    pub size: Option<[f64; 2]>,
    pub size_unit: Option<String>,
    pub year: Option<u16>,
    pub signature: Option<bool>,
    pub description: Option<String>,
    pub provenance: Option<String>,
    pub literature: Option<String>,
    pub exhibition: Option<String>,
}

impl PlateFields {
    /// How many of the headline fields are known.
    pub fn headline_count(&self) -> usize {
        [
            self.title.is_some(),
            self.year.is_some(),
            self.medium.is_some(),
            self.size.is_some(),
            self.signature.is_some(),
        ]
        .into_iter()
        .filter(|known| *known)
        .count()
    }
}

/// One entry of the table of plates.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PlateRecord {
    pub number: u32,
    /// 1-based page the entry was found on.
    pub page: usize,
    pub raw_line: String,
    #[serde(flatten)]
    pub fields: PlateFields,
    pub parse_method: ParseMethod,
    pub confidence: f64,
}

/// All records of a document, unique by number.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct PlateIndex {
    pub pages_scanned: Vec<usize>,
    pub index_pages: Vec<usize>,
    pub records: Vec<PlateRecord>,
}

impl PlateIndex {
    /// Build from records in document order. The first record for a number
    /// wins.
    pub fn from_records(
        pages_scanned: Vec<usize>,
        index_pages: Vec<usize>,
        records: impl IntoIterator<Item = PlateRecord>,
    ) -> Self {
        let mut by_number = BTreeMap::new();
        for record in records {
            if by_number.contains_key(&record.number) {
                debug!(number = record.number, "Ignoring repeated plate entry");
                continue;
            }
            by_number.insert(record.number, record);
        }
        Self {
            pages_scanned,
            index_pages,
            records: by_number.into_values().collect(),
        }
    }

    /// Look up a record by catalogue number.
    pub fn get(&self, number: u32) -> Option<&PlateRecord> {
        self.records
            .binary_search_by_key(&number, |r| r.number)
            .ok()
            .map(|i| &self.records[i])
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(number: u32, page: usize) -> PlateRecord {
        PlateRecord {
            number,
            page,
            raw_line: format!("{number}. Untitled"),
            fields: PlateFields::default(),
            parse_method: ParseMethod::Rules,
            confidence: 0.3,
        }
    }

    #[test]
    fn first_record_wins_and_lookup_works() {
        let index = PlateIndex::from_records(
            vec![9, 10],
            vec![10],
            [record(3, 10), record(1, 10), record(3, 11)],
        );
        assert_eq!(index.records.len(), 2);
        assert_eq!(index.get(3).map(|r| r.page), Some(10));
        assert!(index.get(2).is_none());
    }

    #[test]
    fn fields_are_flattened_in_json() {
        let mut r = record(1, 10);
        r.fields.title = Some("Guernica".to_owned());
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["title"], "Guernica");
        assert_eq!(json["parse_method"], "rules");
    }
}
