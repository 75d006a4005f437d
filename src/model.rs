//! Plain records handed over by the workbook loader.
//!
//! Template payloads stay as [`serde_json::Value`]: their shape belongs to the
//! target editing application and is only loosely checked at compile time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::timecode::{deserialize_optional_timecode, Timecode};

pub type TemplateMap = Map<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelopPattern {
    pub pattern_id: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub overrides: Value,
    #[serde(default)]
    pub base_width: Option<u32>,
    #[serde(default)]
    pub base_height: Option<u32>,
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub asset_id: String,
    #[serde(default)]
    pub kind: Option<String>,
    /// Media file the emitted item points at (`FilePath`).
    #[serde(default)]
    pub path: Option<String>,
    /// Template file holding `parameters` when they are not inline.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub default_layer: Option<i64>,
    #[serde(default)]
    pub default_x: Option<f64>,
    #[serde(default)]
    pub default_y: Option<f64>,
    #[serde(default)]
    pub default_zoom: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pack {
    pub pack_id: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub overrides: Value,
    #[serde(default)]
    pub base_width: Option<u32>,
    #[serde(default)]
    pub base_height: Option<u32>,
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FxPreset {
    pub fx_id: String,
    #[serde(default)]
    pub fx_type: Option<String>,
    /// Pack id instantiated for this effect.
    #[serde(default)]
    pub source: Option<String>,
    /// Asset id instantiated when no pack is given.
    #[serde(default)]
    pub asset: Option<String>,
    #[serde(default)]
    pub parameters: TemplateMap,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Character {
    pub name: String,
    /// Part name -> base path pattern, e.g. `chars/reimu/目/{expression}.png`.
    #[serde(default)]
    pub parts: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpressionPreset {
    pub preset_id: String,
    #[serde(default)]
    pub character: Option<String>,
    #[serde(default)]
    pub tones: Vec<String>,
    #[serde(default)]
    pub parts: BTreeMap<String, String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerBand {
    pub role: String,
    pub layer: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineObject {
    pub role: String,
    pub identifier: String,
    #[serde(default)]
    pub layer: Option<i64>,
    #[serde(default)]
    pub source_column: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimelineFx {
    pub fx_id: String,
    #[serde(default)]
    pub parameters: TemplateMap,
    #[serde(default)]
    pub source_column: Option<String>,
    #[serde(default)]
    pub source_key: Option<String>,
    #[serde(default)]
    pub column_index: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimelineRow {
    /// 1-based source row number.
    pub index: usize,
    #[serde(default, deserialize_with = "deserialize_optional_timecode")]
    pub start: Option<Timecode>,
    #[serde(default, deserialize_with = "deserialize_optional_timecode")]
    pub end: Option<Timecode>,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub telop: Option<String>,
    #[serde(default)]
    pub character: Option<String>,
    /// Expression part name -> expression id.
    #[serde(default)]
    pub expressions: BTreeMap<String, String>,
    #[serde(default)]
    pub objects: Vec<TimelineObject>,
    #[serde(default)]
    pub fxs: Vec<TimelineFx>,
    #[serde(default)]
    pub packs: Vec<String>,
    /// Free-form notes: `approval`, `memo`, `expression_presets`, `expression_tones`.
    #[serde(default)]
    pub notes: TemplateMap,
}

impl TimelineRow {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            ..Self::default()
        }
    }

    pub fn start_seconds(&self) -> Option<f64> {
        self.start.map(|start| start.to_seconds())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkbookData {
    #[serde(default)]
    pub telop_patterns: BTreeMap<String, TelopPattern>,
    #[serde(default)]
    pub assets: BTreeMap<String, Asset>,
    #[serde(default)]
    pub packs: BTreeMap<String, Pack>,
    #[serde(default)]
    pub fx_presets: BTreeMap<String, FxPreset>,
    #[serde(default)]
    pub characters: BTreeMap<String, Character>,
    #[serde(default)]
    pub expression_presets: BTreeMap<String, ExpressionPreset>,
    /// Role -> layer band.
    #[serde(default)]
    pub layers: BTreeMap<String, LayerBand>,
    #[serde(default)]
    pub timeline: Vec<TimelineRow>,
}
