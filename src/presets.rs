//! Collection presets: named parameter bundles tuned to a publisher's layout.
//!
//! A preset is plain data. The built-in ones are resolved by name, and custom
//! ones can be read from a TOML file, in which case any omitted key falls back
//! to the `picasso` preset.

use std::collections::BTreeSet;

use toml_span::{DeserError, de_helpers::TableHelper};

use crate::{
    detectors::DetectorKind,
    error::ExtractError,
    geometry::RelRect,
    prelude::*,
    toml_utils::{custom_deser_error, describe_deser_error, from_toml_str},
};

/// Names accepted by [`resolve`], in display order.
pub const PRESET_NAMES: &[&str] = &[
    "picasso",
    "dubuffet",
    "preset-with-index",
    "preset-without-index",
];

/// Default keywords identifying a table of plates.
const DEFAULT_INDEX_KEYWORDS: &[&str] = &[
    "planches",
    "table des planches",
    "table des matières",
    "table des illustrations",
    "liste des œuvres",
    "liste des oeuvres",
    "sommaire",
    "list of plates",
    "list of works",
];

/// One place to look for a printed catalogue number, relative to a region.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProbeZone {
    /// Short name used in logs and probe records.
    pub name: String,
    /// Sub-rectangle relative to the region box.
    pub rect: RelRect,
}

impl ProbeZone {
    fn new(name: &str, x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            name: name.to_owned(),
            rect: RelRect::new(x, y, width, height),
        }
    }
}

/// Accepted candidate sizes, as fractions of the page area.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct AreaBounds {
    pub min: f64,
    pub max: f64,
}

/// A collection preset.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CollectionPreset {
    pub name: String,
    pub has_plate_index: bool,
    pub plate_index_keywords: Vec<String>,
    pub number_probe_zones: Vec<ProbeZone>,
    pub detector_set: BTreeSet<DetectorKind>,
    pub area_bounds: AreaBounds,
}

impl CollectionPreset {
    /// Restrict this preset for `--fast` runs: contour detector only, no
    /// plate index.
    pub fn for_fast_mode(mut self) -> Self {
        self.detector_set = BTreeSet::from([DetectorKind::Ultra]);
        self.has_plate_index = false;
        self
    }

    /// Check the invariants the pipeline relies on.
    pub fn validate(&self) -> Result<()> {
        if self.number_probe_zones.is_empty() {
            return Err(ExtractError::usage(format!(
                "preset {:?} defines no number probe zones",
                self.name
            ))
            .into());
        }
        if self.detector_set.is_empty() {
            return Err(ExtractError::usage(format!(
                "preset {:?} enables no detectors",
                self.name
            ))
            .into());
        }
        let AreaBounds { min, max } = self.area_bounds;
        if !(0.0..1.0).contains(&min) || !(min < max && max <= 1.0) {
            return Err(ExtractError::usage(format!(
                "preset {:?} has invalid area bounds [{min}, {max}]",
                self.name
            ))
            .into());
        }
        Ok(())
    }
}

/// Catalogues with a table of plates, numbers printed under the image.
pub fn picasso() -> CollectionPreset {
    CollectionPreset {
        name: "picasso".to_owned(),
        has_plate_index: true,
        plate_index_keywords: DEFAULT_INDEX_KEYWORDS
            .iter()
            .map(|s| (*s).to_owned())
            .collect(),
        number_probe_zones: vec![
            ProbeZone::new("bottom-left", 0.0, 0.85, 0.3, 0.25),
            ProbeZone::new("bottom-right", 0.7, 0.85, 0.3, 0.25),
            ProbeZone::new("bottom-center", 0.35, 0.85, 0.3, 0.25),
            ProbeZone::new("below-image", 0.0, 1.0, 1.0, 0.12),
        ],
        detector_set: BTreeSet::from([
            DetectorKind::Ultra,
            DetectorKind::Template,
            DetectorKind::Color,
        ]),
        area_bounds: AreaBounds {
            min: 0.005,
            max: 0.95,
        },
    }
}

/// Catalogues without a table of plates, numbers in the margins.
pub fn dubuffet() -> CollectionPreset {
    CollectionPreset {
        name: "dubuffet".to_owned(),
        has_plate_index: false,
        plate_index_keywords: vec![],
        number_probe_zones: vec![
            ProbeZone::new("below-image", 0.0, 1.0, 1.0, 0.12),
            ProbeZone::new("bottom-left", 0.0, 0.85, 0.3, 0.25),
            ProbeZone::new("top-left", 0.0, -0.1, 0.3, 0.14),
            ProbeZone::new("bottom-right", 0.7, 0.85, 0.3, 0.25),
        ],
        detector_set: BTreeSet::from([DetectorKind::Ultra, DetectorKind::Color]),
        area_bounds: AreaBounds {
            min: 0.01,
            max: 0.95,
        },
    }
}

/// Look up a built-in preset by name.
pub fn resolve(name: &str) -> Result<CollectionPreset> {
    match name {
        "picasso" | "preset-with-index" => Ok(picasso()),
        "dubuffet" | "preset-without-index" => Ok(dubuffet()),
        other => Err(ExtractError::usage(format!(
            "unknown collection {other:?} (known: {})",
            PRESET_NAMES.join(", ")
        ))
        .into()),
    }
}

/// Read a custom preset from a TOML file.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn load_preset_file(path: &Path) -> Result<CollectionPreset> {
    let text = tokio::fs::read_to_string(path).await.map_err(|err| {
        ExtractError::usage(format!("cannot read preset file {}: {err}", path.display()))
    })?;
    let preset = from_toml_str::<CollectionPreset>(&text).map_err(|err| {
        ExtractError::usage(describe_deser_error(path, &text, &err))
    })?;
    preset.validate()?;
    Ok(preset)
}

impl<'de> toml_span::Deserialize<'de> for CollectionPreset {
    fn deserialize(value: &mut toml_span::Value<'de>) -> Result<Self, DeserError> {
        let base = picasso();
        let mut th = TableHelper::new(value)?;
        let name = th.required::<String>("name")?;
        let has_plate_index = th
            .optional::<bool>("has_plate_index")
            .unwrap_or(base.has_plate_index);
        let plate_index_keywords = th
            .optional::<Vec<String>>("plate_index_keywords")
            .unwrap_or(base.plate_index_keywords);
        let number_probe_zones = th
            .optional::<Vec<ProbeZone>>("number_probe_zones")
            .unwrap_or(base.number_probe_zones);
        let detector_set = th
            .optional::<Vec<DetectorKind>>("detector_set")
            .map(|kinds| kinds.into_iter().collect())
            .unwrap_or(base.detector_set);
        let area_bounds = th
            .optional::<AreaBounds>("area_bounds")
            .unwrap_or(base.area_bounds);
        th.finalize(None)?;
        Ok(Self {
            name,
            has_plate_index,
            plate_index_keywords,
            number_probe_zones,
            detector_set,
            area_bounds,
        })
    }
}

impl<'de> toml_span::Deserialize<'de> for ProbeZone {
    fn deserialize(value: &mut toml_span::Value<'de>) -> Result<Self, DeserError> {
        let span = value.span;
        let mut th = TableHelper::new(value)?;
        let name = th.required::<String>("name")?;
        let x = th.required::<f64>("x")?;
        let y = th.required::<f64>("y")?;
        let width = th.required::<f64>("width")?;
        let height = th.required::<f64>("height")?;
        th.finalize(None)?;
        if width <= 0.0 || height <= 0.0 {
            return Err(custom_deser_error(
                span,
                format!("zone {name:?} must have a positive width and height"),
            ));
        }
        Ok(Self {
            name,
            rect: RelRect::new(x, y, width, height),
        })
    }
}

impl<'de> toml_span::Deserialize<'de> for AreaBounds {
    fn deserialize(value: &mut toml_span::Value<'de>) -> Result<Self, DeserError> {
        let mut th = TableHelper::new(value)?;
        let min = th.required::<f64>("min")?;
        let max = th.required::<f64>("max")?;
        th.finalize(None)?;
        Ok(Self { min, max })
    }
}

impl<'de> toml_span::Deserialize<'de> for DetectorKind {
    fn deserialize(value: &mut toml_span::Value<'de>) -> Result<Self, DeserError> {
        let span = value.span;
        let name = value.take_string(Some("a detector name"))?;
        name.parse::<DetectorKind>()
            .map_err(|err| custom_deser_error(span, err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, exit_code_for};

    #[test]
    fn aliases_resolve_to_shipped_presets() {
        assert_eq!(resolve("preset-with-index").unwrap(), picasso());
        assert_eq!(resolve("preset-without-index").unwrap(), dubuffet());
        assert!(resolve("matisse").is_err());
    }

    #[test]
    fn shipped_presets_are_valid() {
        picasso().validate().unwrap();
        dubuffet().validate().unwrap();
        assert!(picasso().has_plate_index);
        assert!(!dubuffet().has_plate_index);
        assert!(dubuffet().detector_set.len() < picasso().detector_set.len());
    }

    #[test]
    fn fast_mode_keeps_only_the_contour_detector() {
        let fast = picasso().for_fast_mode();
        assert_eq!(fast.detector_set, BTreeSet::from([DetectorKind::Ultra]));
        assert!(!fast.has_plate_index);
    }

    #[test]
    fn toml_preset_inherits_omitted_keys() {
        let preset = from_toml_str::<CollectionPreset>(
            r#"
name = "miro"
has_plate_index = false
detector_set = ["ultra", "color"]

[[number_probe_zones]]
name = "top-right"
x = 0.7
y = -0.1
width = 0.3
height = 0.14
"#,
        )
        .unwrap();
        assert_eq!(preset.name, "miro");
        assert!(!preset.has_plate_index);
        assert_eq!(preset.number_probe_zones.len(), 1);
        assert_eq!(preset.number_probe_zones[0].name, "top-right");
        assert_eq!(preset.area_bounds, picasso().area_bounds);
        assert_eq!(
            preset.detector_set,
            BTreeSet::from([DetectorKind::Ultra, DetectorKind::Color])
        );
    }

    #[test]
    fn toml_preset_rejects_unknown_detectors() {
        let err = from_toml_str::<CollectionPreset>(
            r#"
name = "bad"
detector_set = ["ultra", "laser"]
"#,
        );
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn unreadable_preset_file_is_a_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_preset_file(&dir.path().join("missing.toml"))
            .await
            .unwrap_err();
        assert_eq!(exit_code_for(&err), ErrorKind::Usage.exit_code());
        assert!(format!("{err:#}").contains("missing.toml"));
    }

    #[test]
    fn invalid_area_bounds_fail_validation() {
        let mut preset = picasso();
        preset.area_bounds = AreaBounds { min: 0.5, max: 0.2 };
        assert!(preset.validate().is_err());
    }
}
