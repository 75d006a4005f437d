//! Timeline compiler: one pass per row, turning references into timed,
//! layered items plus a history entry.
//!
//! Row-local problems are recorded as [`BuildWarning`]s and never stop the
//! build; only a malformed scaffold is fatal.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use anyhow::Result;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::fx::{apply_parameters, merge_parameters, validate_overrides};
use crate::history::{
    history_timestamp, GeneratedItemSummary, HistoryEntry, HistoryFx, HistoryFxPreset,
    HistoryObject,
};
use crate::language::{CachedAnalyzer, LanguageAnalyzer, RegexAnalyzer};
use crate::layers::{
    allocate_layers, infer_layer_band, Placement, DEFAULT_BAND_WIDTH, PACK_ROLE, SUB_ORDER_STEP,
    TACHIE_ROLE, TELOP_ROLE,
};
use crate::model::{
    Asset, Character, ExpressionPreset, TemplateMap, TimelineFx, TimelineRow, WorkbookData,
};
use crate::packs::instantiate_pack;
use crate::project::{ensure_scaffold_shape, inject_timeline};
use crate::tachie::{tachie_item_template, tachie_part_key, TachieOutcome, TachieResolver};
use crate::template::{TemplateCache, TemplateCacheStats};

pub const DEFAULT_FPS: f64 = 60.0;
const TONE_OFF_MARKERS: [&str; 6] = ["off", "none", "disable", "オフ", "無効", "なし"];
const UNRESOLVED_PATH_PREFIX: &str = "template://";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildWarning {
    pub row: Option<usize>,
    pub message: String,
}

impl BuildWarning {
    pub fn row(index: usize, message: impl Into<String>) -> Self {
        Self {
            row: Some(index),
            message: message.into(),
        }
    }

    pub fn global(message: impl Into<String>) -> Self {
        Self {
            row: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for BuildWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.row {
            Some(row) => write!(f, "row {row}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub project: Value,
    pub warnings: Vec<BuildWarning>,
    pub history: Vec<HistoryEntry>,
}

/// References resolved while building one row.
#[derive(Debug, Default)]
struct RowTrace {
    objects: Vec<HistoryObject>,
    fx: Vec<HistoryFx>,
    missing: Vec<String>,
}

struct ObjectItems<'a> {
    items: Vec<TemplateMap>,
    asset: Option<&'a Asset>,
    explicit_layer: bool,
}

/// Owns every per-build cache; construct one per build.
pub struct ProjectBuilder<'a> {
    data: &'a WorkbookData,
    fps: f64,
    band_width: i64,
    analyzer: Option<Box<dyn LanguageAnalyzer + 'a>>,
    templates: TemplateCache<'a>,
    tachie: TachieResolver,
    characters_in_use: BTreeSet<String>,
    warnings: Vec<BuildWarning>,
    history: Vec<HistoryEntry>,
    presets_by_tone: HashMap<String, Vec<&'a ExpressionPreset>>,
    default_presets: Vec<&'a ExpressionPreset>,
}

impl<'a> ProjectBuilder<'a> {
    pub fn new(data: &'a WorkbookData) -> Self {
        let mut presets_by_tone: HashMap<String, Vec<&'a ExpressionPreset>> = HashMap::new();
        let mut default_presets = Vec::new();
        for preset in data.expression_presets.values() {
            if preset.tones.is_empty() {
                default_presets.push(preset);
                continue;
            }
            for tone in preset.tones.iter().filter_map(|tone| normalize_tone(tone)) {
                presets_by_tone.entry(tone).or_default().push(preset);
            }
        }

        Self {
            data,
            fps: DEFAULT_FPS,
            band_width: DEFAULT_BAND_WIDTH,
            analyzer: Some(Box::new(CachedAnalyzer::new(RegexAnalyzer))),
            templates: TemplateCache::new(),
            tachie: TachieResolver::new(),
            characters_in_use: BTreeSet::new(),
            warnings: Vec::new(),
            history: Vec::new(),
            presets_by_tone,
            default_presets,
        }
    }

    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = fps;
        self
    }

    pub fn with_band_width(mut self, band_width: i64) -> Self {
        self.band_width = band_width.max(1);
        self
    }

    pub fn with_analyzer(mut self, analyzer: impl LanguageAnalyzer + 'a) -> Self {
        self.analyzer = Some(Box::new(analyzer));
        self
    }

    /// Disables tone detection; presets then come from notes and defaults only.
    pub fn without_analyzer(mut self) -> Self {
        self.analyzer = None;
        self
    }

    pub fn warnings(&self) -> &[BuildWarning] {
        &self.warnings
    }

    pub fn tachie_probe_count(&self) -> usize {
        self.tachie.probe_count()
    }

    pub fn template_stats(&self) -> TemplateCacheStats {
        self.templates.stats()
    }

    /// Compiles every row into `scaffold` and returns the finished project.
    pub fn build(mut self, mut scaffold: Value) -> Result<CompileOutput> {
        ensure_scaffold_shape(&scaffold)?;
        let data = self.data;
        info!(rows = data.timeline.len(), fps = self.fps, "compiling timeline");

        let mut items = Vec::new();
        for row in &data.timeline {
            items.extend(self.build_row_items(row).into_iter().map(Value::Object));
        }

        self.characters_in_use
            .extend(data.characters.values().map(|character| character.name.clone()));
        let characters = self.characters_in_use.iter().cloned().collect::<Vec<_>>();
        inject_timeline(&mut scaffold, items, &characters)?;

        let stats = self.templates.stats();
        info!(
            warnings = self.warnings.len(),
            tachie_probes = self.tachie.probe_count(),
            template_misses = stats.misses,
            "timeline compiled"
        );
        Ok(CompileOutput {
            project: scaffold,
            warnings: self.warnings,
            history: self.history,
        })
    }

    /// Items for one row, in registration order, with final layers.
    pub fn build_row_items(&mut self, row: &TimelineRow) -> Vec<TemplateMap> {
        let data = self.data;
        let expressions = self.enriched_expressions(row);
        let mut placements: Vec<Placement> = Vec::new();
        let mut trace = RowTrace::default();
        let mut order = 0.0_f64;

        if let Some(telop_id) = row.telop.as_deref() {
            match data.telop_patterns.get(telop_id) {
                None => {
                    self.push_warning(row, format!("Telop pattern not found: {telop_id}"));
                    trace.missing.push(format!("telop:{telop_id}"));
                }
                Some(pattern) => match self.templates.instantiate(&pattern.overrides, row, self.fps) {
                    Ok(mut item) => {
                        if let Some(subtitle) = &row.subtitle {
                            item.insert("Text".to_owned(), json!(subtitle));
                        }
                        let band = infer_layer_band(Some(TELOP_ROLE), &data.layers);
                        self.register(&mut placements, row, vec![item], Some(TELOP_ROLE), order, band, false);
                    }
                    Err(error) => {
                        self.push_warning(row, format!("Telop build error for '{telop_id}': {error:#}"));
                    }
                },
            }
            order += 1.0;
        }

        if let Some(name) = row.character.as_deref() {
            match data.characters.get(name) {
                None => {
                    self.push_warning(row, format!("Character not found: {name}"));
                    trace.missing.push(format!("character:{name}"));
                }
                Some(_) if expressions.is_empty() => {
                    self.push_warning(row, format!("No expressions provided for character '{name}'"));
                }
                Some(character) => match self.build_tachie(row, character, &expressions) {
                    Ok(item) => {
                        let band = infer_layer_band(Some(TACHIE_ROLE), &data.layers);
                        self.register(&mut placements, row, vec![item], Some(TACHIE_ROLE), order, band, false);
                    }
                    Err(error) => {
                        self.push_warning(row, format!("Dynamic Tachie build error: {error:#}"));
                    }
                },
            }
            order += 1.0;
        }

        for pack_id in &row.packs {
            match data.packs.get(pack_id) {
                Some(pack) => {
                    let mut messages = Vec::new();
                    let items = instantiate_pack(pack, row, &mut self.templates, self.fps, &mut messages);
                    for message in messages {
                        self.push_warning(row, message);
                    }
                    let band = infer_layer_band(Some(PACK_ROLE), &data.layers);
                    self.register(&mut placements, row, items, Some(PACK_ROLE), order, band, false);
                }
                None => {
                    self.push_warning(row, format!("Pack not found: {pack_id}"));
                    trace.missing.push(format!("pack:{pack_id}"));
                }
            }
            order += 1.0;
        }

        for object in &row.objects {
            let built = self.instantiate_object(row, &object.identifier, object.layer, &mut trace.missing);
            trace.objects.push(HistoryObject {
                role: object.role.clone(),
                source_column: object.source_column.clone(),
                identifier: object.identifier.clone(),
                resolved_asset: built.asset.map(|asset| asset.asset_id.clone()),
                asset_path: built.asset.and_then(|asset| asset.path.clone()),
            });
            let band = object
                .layer
                .unwrap_or_else(|| infer_layer_band(Some(&object.role), &data.layers));
            self.register(
                &mut placements,
                row,
                built.items,
                Some(object.role.as_str()),
                order,
                band,
                built.explicit_layer,
            );
            order += 1.0;
        }

        for fx in &row.fxs {
            let (built, record) = self.instantiate_fx(row, fx, &mut trace.missing);
            trace.fx.push(record);
            let role = fx
                .source_key
                .as_deref()
                .or(fx.source_column.as_deref())
                .unwrap_or(&fx.fx_id);
            let band = infer_layer_band(Some(role), &data.layers);
            self.register(&mut placements, row, built.items, Some(role), order, band, built.explicit_layer);
            order += 1.0;
        }

        for overflow in allocate_layers(&mut placements, self.band_width) {
            self.push_warning(row, overflow.message());
        }
        debug!(row = row.index, items = placements.len(), "built row");
        self.record_history(row, expressions, trace, &placements);
        placements.into_iter().map(|placement| placement.item).collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn register(
        &mut self,
        placements: &mut Vec<Placement>,
        row: &TimelineRow,
        items: Vec<TemplateMap>,
        role: Option<&str>,
        order: f64,
        band: i64,
        explicit: bool,
    ) {
        for (offset, item) in items.into_iter().enumerate() {
            if let Some(Value::String(name)) = item.get("CharacterName") {
                if !name.is_empty() {
                    self.characters_in_use.insert(name.clone());
                }
            }
            if let Some(Value::String(path)) = item.get("FilePath") {
                if path.starts_with(UNRESOLVED_PATH_PREFIX) {
                    let message = match role {
                        Some(role) => format!("Unresolved template path for role '{role}': {path}"),
                        None => format!("Unresolved template path: {path}"),
                    };
                    self.push_warning(row, message);
                }
            }
            placements.push(Placement {
                explicit: explicit && item.contains_key("Layer"),
                item,
                band,
                order: order + offset as f64 * SUB_ORDER_STEP,
                row_index: row.index,
                role: role.map(str::to_owned),
            });
        }
    }

    fn build_tachie(
        &mut self,
        row: &TimelineRow,
        character: &Character,
        expressions: &BTreeMap<String, String>,
    ) -> Result<TemplateMap> {
        let mut item = self.templates.instantiate(tachie_item_template(), row, self.fps)?;
        item.insert("CharacterName".to_owned(), json!(character.name));
        let mut parameters = match item.remove("TachieItemParameter") {
            Some(Value::Object(parameters)) => parameters,
            _ => TemplateMap::new(),
        };

        for (part, expression) in expressions {
            let Some(key) = tachie_part_key(part) else {
                self.push_warning(row, format!("Unknown tachie part: {part}"));
                continue;
            };
            let Some(base) = character.parts.get(part).or_else(|| character.parts.get(key)) else {
                self.push_warning(
                    row,
                    format!(
                        "Tachie base path missing for part '{part}' of character '{}'",
                        character.name
                    ),
                );
                continue;
            };

            match self.tachie.resolve_part(&character.name, key, base, expression) {
                TachieOutcome::Resolved {
                    path,
                    used_fallback,
                } => {
                    if used_fallback {
                        self.push_warning(
                            row,
                            format!(
                                "Tachie expression '{expression}' missing for part '{part}'. Fallback to '{}'",
                                file_name(&path)
                            ),
                        );
                    }
                    parameters.insert(key.to_owned(), json!(path.to_string_lossy()));
                }
                TachieOutcome::Reused { path, .. } => {
                    self.push_warning(
                        row,
                        format!(
                            "Tachie expression '{expression}' missing for part '{part}'. Reusing previous '{}'",
                            file_name(&path)
                        ),
                    );
                    parameters.insert(key.to_owned(), json!(path.to_string_lossy()));
                }
                TachieOutcome::Missing { attempts } => {
                    let detail = if attempts.is_empty() {
                        String::new()
                    } else {
                        format!(" Tried: {}", attempts.join(", "))
                    };
                    self.push_warning(
                        row,
                        format!(
                            "Tachie expression file not found for part '{part}' of '{}' (expr '{expression}').{detail}",
                            character.name
                        ),
                    );
                }
            }
        }

        item.insert("TachieItemParameter".to_owned(), Value::Object(parameters));
        Ok(item)
    }

    fn instantiate_object(
        &mut self,
        row: &TimelineRow,
        identifier: &str,
        layer: Option<i64>,
        missing: &mut Vec<String>,
    ) -> ObjectItems<'a> {
        let data = self.data;
        let Some(asset) = data.assets.get(identifier) else {
            self.push_warning(row, format!("Asset not found: {identifier}"));
            missing.push(format!("asset:{identifier}"));
            return ObjectItems {
                items: Vec::new(),
                asset: None,
                explicit_layer: false,
            };
        };

        let templates: Vec<&'a Value> = match &asset.parameters {
            Value::Null => Vec::new(),
            Value::Array(entries) => entries.iter().collect(),
            Value::Object(map) if map.is_empty() => Vec::new(),
            other => vec![other],
        };
        let explicit_layer = layer.or(asset.default_layer);
        if templates.is_empty() {
            self.push_warning(
                row,
                format!("Asset '{}' has no template parameters", asset.asset_id),
            );
            return ObjectItems {
                items: Vec::new(),
                asset: Some(asset),
                explicit_layer: false,
            };
        }

        let mut items = Vec::with_capacity(templates.len());
        for template in templates {
            let mut item = match self.templates.instantiate(template, row, self.fps) {
                Ok(item) => item,
                Err(error) => {
                    self.push_warning(row, format!("Asset build error for '{identifier}': {error:#}"));
                    continue;
                }
            };
            if let Some(path) = &asset.path {
                item.entry("FilePath").or_insert_with(|| json!(path));
            }
            let hints = [
                ("X", asset.default_x),
                ("Y", asset.default_y),
                ("Zoom", asset.default_zoom),
            ];
            for (key, hint) in hints {
                if let Some(hint) = hint {
                    item.entry(key).or_insert_with(|| json!(hint));
                }
            }
            if let Some(layer) = explicit_layer {
                item.insert("Layer".to_owned(), json!(layer));
            }
            items.push(item);
        }
        ObjectItems {
            items,
            asset: Some(asset),
            explicit_layer: explicit_layer.is_some(),
        }
    }

    fn instantiate_fx(
        &mut self,
        row: &TimelineRow,
        fx: &TimelineFx,
        missing: &mut Vec<String>,
    ) -> (ObjectItems<'a>, HistoryFx) {
        let data = self.data;
        let mut record = HistoryFx {
            fx_id: fx.fx_id.clone(),
            source_column: fx.source_column.clone(),
            source_key: fx.source_key.clone(),
            parameters: fx.parameters.clone(),
            applied_parameters: TemplateMap::new(),
            preset: None,
        };
        let mut built = ObjectItems {
            items: Vec::new(),
            asset: None,
            explicit_layer: false,
        };

        let Some(preset) = data.fx_presets.get(&fx.fx_id) else {
            self.push_warning(row, format!("FX preset not found: {}", fx.fx_id));
            missing.push(format!("fx:{}", fx.fx_id));
            return (built, record);
        };
        record.preset = Some(HistoryFxPreset {
            fx_type: preset.fx_type.clone(),
            source: preset.source.clone(),
            asset: preset.asset.clone(),
        });

        let pack_id = preset.source.as_deref().filter(|id| !id.trim().is_empty());
        let asset_id = preset.asset.as_deref().filter(|id| !id.trim().is_empty());
        if let Some(pack_id) = pack_id {
            match data.packs.get(pack_id) {
                Some(pack) => {
                    let mut messages = Vec::new();
                    built.items = instantiate_pack(pack, row, &mut self.templates, self.fps, &mut messages);
                    for message in messages {
                        self.push_warning(row, message);
                    }
                }
                None => {
                    self.push_warning(
                        row,
                        format!("FX preset '{}' references missing pack '{pack_id}'", fx.fx_id),
                    );
                    missing.push(format!("pack:{pack_id}"));
                }
            }
        } else if let Some(asset_id) = asset_id {
            built = self.instantiate_object(row, asset_id, None, missing);
            if built.items.is_empty() {
                self.push_warning(
                    row,
                    format!("FX preset '{}' asset not resolved: {asset_id}", fx.fx_id),
                );
            }
        } else {
            self.push_warning(row, format!("FX preset '{}' has no source or asset", fx.fx_id));
        }

        if let Some(message) = validate_overrides(&preset.parameters, &fx.parameters).warning(&fx.fx_id) {
            self.push_warning(row, message);
        }
        let combined = merge_parameters(&preset.parameters, &fx.parameters);
        if !combined.is_empty() {
            for item in &mut built.items {
                apply_parameters(item, &combined);
            }
        }
        record.applied_parameters = combined;
        (built, record)
    }

    /// The row's expressions plus parts filled in from presets.
    ///
    /// Presets named in the notes come first, then the first tone (hinted or
    /// detected) whose preset adds anything, then the default preset.
    fn enriched_expressions(&self, row: &TimelineRow) -> BTreeMap<String, String> {
        let mut expressions = row.expressions.clone();
        let Some(character) = row.character.as_deref() else {
            return expressions;
        };

        for preset_id in note_list(row.notes.get("expression_presets")) {
            let Some(preset) = self.data.expression_presets.get(&preset_id) else {
                continue;
            };
            if preset
                .character
                .as_deref()
                .is_some_and(|owner| owner != character)
            {
                continue;
            }
            apply_preset_parts(preset, &mut expressions);
        }

        let mut disabled = false;
        let mut tones: Vec<String> = Vec::new();
        for hint in note_list(row.notes.get("expression_tones")) {
            if is_off_marker(&hint) {
                disabled = true;
                continue;
            }
            if let Some(tone) = normalize_tone(&hint) {
                if !tones.contains(&tone) {
                    tones.push(tone);
                }
            }
        }
        if disabled {
            return expressions;
        }

        let detected = match (&self.analyzer, row.subtitle.as_deref()) {
            (Some(analyzer), Some(text)) => analyzer.detect_tone(text),
            _ => None,
        };
        if let Some(tone) = detected.as_deref().and_then(normalize_tone) {
            if !tones.contains(&tone) {
                tones.push(tone);
            }
        }

        for tone in &tones {
            if let Some(preset) = self.select_preset(Some(tone), character) {
                if apply_preset_parts(preset, &mut expressions) {
                    return expressions;
                }
            }
        }
        if let Some(preset) = self.select_preset(None, character) {
            apply_preset_parts(preset, &mut expressions);
        }
        expressions
    }

    /// A preset bound to `character` wins over an unbound one.
    fn select_preset(&self, tone: Option<&str>, character: &str) -> Option<&'a ExpressionPreset> {
        let candidates = match tone {
            None => &self.default_presets,
            Some(tone) => self.presets_by_tone.get(tone)?,
        };
        candidates
            .iter()
            .find(|preset| preset.character.as_deref() == Some(character))
            .or_else(|| candidates.iter().find(|preset| preset.character.is_none()))
            .copied()
    }

    fn record_history(
        &mut self,
        row: &TimelineRow,
        expressions: BTreeMap<String, String>,
        trace: RowTrace,
        placements: &[Placement],
    ) {
        let generated_items = placements
            .iter()
            .map(|placement| GeneratedItemSummary {
                role: placement.role.clone(),
                layer: placement.layer(),
                item_type: placement
                    .item
                    .get("$type")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
            })
            .collect();
        self.history.push(HistoryEntry {
            timestamp: history_timestamp(),
            row_index: row.index,
            start: row.start,
            end: row.end,
            subtitle: row.subtitle.clone(),
            telop: row.telop.clone(),
            character: row.character.clone(),
            expressions,
            packs: row.packs.clone(),
            objects: trace.objects,
            fx: trace.fx,
            notes: row.notes.clone(),
            generated_items,
            missing_references: trace.missing,
            warnings: Vec::new(),
        });
    }

    fn push_warning(&mut self, row: &TimelineRow, message: String) {
        warn!(row = row.index, "{message}");
        self.warnings.push(BuildWarning::row(row.index, message));
    }
}

/// Compiles `data` into `scaffold` with default settings.
pub fn build_project(data: &WorkbookData, scaffold: Value) -> Result<CompileOutput> {
    ProjectBuilder::new(data).build(scaffold)
}

fn apply_preset_parts(preset: &ExpressionPreset, expressions: &mut BTreeMap<String, String>) -> bool {
    let mut changed = false;
    for (part, value) in &preset.parts {
        if value.trim().is_empty() || expressions.contains_key(part) {
            continue;
        }
        expressions.insert(part.clone(), value.clone());
        changed = true;
    }
    changed
}

/// `default`/`auto` and blanks mean "no particular tone".
fn normalize_tone(raw: &str) -> Option<String> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    match text.to_lowercase().as_str() {
        "default" | "auto" => None,
        _ => Some(text.to_owned()),
    }
}

fn is_off_marker(raw: &str) -> bool {
    let lowered = raw.trim().to_lowercase();
    TONE_OFF_MARKERS.contains(&lowered.as_str())
}

/// A note value as a list: arrays item by item, strings split on commas.
fn note_list(value: Option<&Value>) -> Vec<String> {
    let split = |text: &str| -> Vec<String> {
        text.split(',')
            .map(str::trim)
            .filter(|chunk| !chunk.is_empty())
            .map(str::to_owned)
            .collect()
    };
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(text)) => split(text),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(text) => Some(text.trim().to_owned()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|text| !text.is_empty())
            .collect(),
        Some(other) => vec![other.to_string()],
    }
}

fn file_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
