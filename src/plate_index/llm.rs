//! LLM parsing of plate-index entries, used in place of the rules when the
//! model returns valid JSON.

use schemars::JsonSchema;
use serde_json::json;

use super::PlateFields;
use crate::{
    llm::{Llm, render_prompt},
    prelude::*,
};

/// Confidence we give a schema-valid LLM parse.
pub const LLM_PARSE_CONFIDENCE: f64 = 0.85;

/// What we ask the text model to return.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq)]
pub struct LlmPlateFields {
    pub artist: Option<String>,
    pub title: Option<String>,
    /// Technique and support, e.g. "huile sur toile".
    pub medium: Option<String>,
    /// The two printed dimensions, in printed order.
    pub size: Option<Vec<f64>>,
    /// Unit of `size`, e.g. "cm".
    pub size_unit: Option<String>,
    pub year: Option<u16>,
    pub signature: Option<bool>,
    pub description: Option<String>,
    pub provenance: Option<String>,
    pub literature: Option<String>,
    pub exhibition: Option<String>,
}

impl LlmPlateFields {
    fn into_fields(self) -> PlateFields {
        let size = match self.size.as_deref() {
            Some([a, b]) => Some([*a, *b]),
            _ => None,
        };
        let blank = |s: Option<String>| s.filter(|s| !s.trim().is_empty());
        PlateFields {
            artist: blank(self.artist),
            title: blank(self.title),
            medium: blank(self.medium),
            size_unit: size.and(blank(self.size_unit)),
            size,
            year: self.year.filter(|y| (1850..=2100).contains(y)),
            signature: self.signature,
            description: blank(self.description),
            provenance: blank(self.provenance),
            literature: blank(self.literature),
            exhibition: blank(self.exhibition),
        }
    }
}

/// Ask the text model to parse one entry.
#[instrument(level = "debug", skip_all, fields(number = number))]
pub async fn parse_with_llm(llm: &Llm, number: u32, text: &str) -> Result<PlateFields> {
    let prompt = render_prompt("plate_line", &json!({ "number": number, "text": text }))?;
    let parsed: LlmPlateFields = llm.ask_json(&llm.models.text, prompt, vec![]).await?;
    Ok(parsed.into_fields())
}
