//! Harvests reusable templates from an editor project into the workbook.
//!
//! A raw project contributes its first timeline's items: text items become
//! telop patterns, character and image items become assets, grouped items
//! become packs, and effect items become FX presets backed by a pack. A file
//! that already carries workbook dictionaries is taken as-is. Payloads are
//! written under `templates/<category>/` next to the workbook and referenced
//! by `source`; ids already present in the workbook are never overwritten.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::model::{Asset, FxPreset, Pack, TelopPattern, WorkbookData};
use crate::packs::strip_runtime_fields;
use crate::project::write_json;
use crate::template::digest_template;

pub const TEMPLATE_DIR: &str = "templates";

const DICTIONARY_KEYS: [&str; 4] = ["telop_patterns", "assets", "packs", "fx_presets"];
const PACK_TYPE_KEYWORDS: [&str; 3] = ["Group", "Repeat", "Tachie"];
const FX_TYPE_KEYWORDS: [&str; 7] = [
    "effect",
    "zoom",
    "shake",
    "blur",
    "speedline",
    "vignette",
    "filter",
];
const DIGEST_PREFIX_LEN: usize = 8;

/// Template dictionaries harvested from one project.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AbsorbedTemplates {
    pub telop_patterns: BTreeMap<String, TelopPattern>,
    pub assets: BTreeMap<String, Asset>,
    pub packs: BTreeMap<String, Pack>,
    pub fx_presets: BTreeMap<String, FxPreset>,
}

/// Entries added to the workbook per dictionary, plus ids left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AbsorbSummary {
    pub telop_patterns: usize,
    pub assets: usize,
    pub packs: usize,
    pub fx_presets: usize,
    pub skipped: usize,
}

fn item_type(item: &Map<String, Value>) -> &str {
    item.get("$type").and_then(Value::as_str).unwrap_or_default()
}

/// Last path segment, accepting both `/` and `\` separators.
fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

fn file_stem(path: &str) -> &str {
    let name = file_name(path);
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
}

fn safe_filename(identifier: &str) -> String {
    let sanitized = identifier.replace(['\\', '/', ':'], "_");
    if sanitized.is_empty() {
        "template".to_owned()
    } else {
        sanitized
    }
}

fn has_items(item: &Map<String, Value>) -> bool {
    item.get("Items")
        .and_then(Value::as_array)
        .is_some_and(|items| !items.is_empty())
}

pub fn looks_like_pack(item: &Map<String, Value>) -> bool {
    let kind = item_type(item);
    has_items(item) || PACK_TYPE_KEYWORDS.iter().any(|keyword| kind.contains(keyword))
}

pub fn looks_like_fx(item_type: &str) -> bool {
    let lowered = item_type.to_lowercase();
    FX_TYPE_KEYWORDS.iter().any(|keyword| lowered.contains(keyword))
}

/// Short effect name from a `$type` such as `Ns.BlurEffectItem, Assembly`.
pub fn infer_fx_type(item_type: &str) -> String {
    let class = item_type.split(',').next().unwrap_or_default();
    let base = class.rsplit('.').next().unwrap_or_default();
    let name = base.replace("Item", "").to_lowercase();
    if name.is_empty() {
        "fx".to_owned()
    } else {
        name
    }
}

fn tachie_asset_id(item: &Map<String, Value>) -> String {
    let character = item
        .get("CharacterName")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .unwrap_or("unknown");
    let eye = item
        .get("TachieItemParameter")
        .and_then(|parameters| parameters.get("Eye"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let stem = file_stem(eye);
    let expression = match stem.rsplit_once('】') {
        Some((_, expression)) => expression,
        None => "default",
    };
    format!("tachie_{character}_{expression}")
}

fn digest_id(prefix: &str, digest: &str) -> String {
    format!("{prefix}_{}", &digest[..DIGEST_PREFIX_LEN.min(digest.len())])
}

fn project_name(project: &Value, fallback: &str) -> String {
    project
        .get("FilePath")
        .and_then(Value::as_str)
        .map(file_name)
        .filter(|name| !name.is_empty())
        .unwrap_or(fallback)
        .to_owned()
}

/// Harvests templates from a parsed project.
///
/// `source_name` labels the notes when the project records no `FilePath`.
pub fn extract_templates(project: &Value, source_name: &str) -> AbsorbedTemplates {
    let carries_dictionaries = project
        .as_object()
        .is_some_and(|root| DICTIONARY_KEYS.iter().any(|key| root.contains_key(*key)));
    if carries_dictionaries {
        return AbsorbedTemplates {
            telop_patterns: dictionary(project, &["telop_patterns"]),
            assets: dictionary(project, &["assets"]),
            packs: dictionary(project, &["packs"]),
            fx_presets: dictionary(project, &["fx_presets", "fx"]),
        };
    }

    let name = project_name(project, source_name);
    let items: Vec<&Map<String, Value>> = project
        .get("Timelines")
        .and_then(|timelines| timelines.get(0))
        .and_then(|timeline| timeline.get("Items"))
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default();

    let mut absorbed = AbsorbedTemplates::default();
    let mut seen_packs = HashSet::new();
    for item in items {
        let kind = item_type(item);
        if kind.contains("TextItem") {
            absorb_telop(&mut absorbed, item);
        }
        if kind.contains("TachieItem") || kind.contains("ImageItem") {
            absorb_asset(&mut absorbed, item, &name);
        }

        let needs_digest = looks_like_pack(item) || looks_like_fx(kind);
        if !needs_digest {
            continue;
        }
        let sanitized = strip_runtime_fields(&Value::Object(item.clone()), true);
        let Value::Object(sanitized_map) = &sanitized else {
            continue;
        };
        let digest = digest_template(sanitized_map);
        let pack_id = digest_id("pack", &digest);

        if looks_like_pack(item) && seen_packs.insert(digest.clone()) {
            absorbed.packs.entry(pack_id.clone()).or_insert_with(|| Pack {
                pack_id: pack_id.clone(),
                overrides: sanitized.clone(),
                notes: Some(format!("extracted from {name}")),
                ..Pack::default()
            });
        }
        if looks_like_fx(kind) {
            let fx_id = digest_id("fx", &digest);
            if absorbed.fx_presets.contains_key(&fx_id) {
                continue;
            }
            absorbed.packs.entry(pack_id.clone()).or_insert_with(|| Pack {
                pack_id: pack_id.clone(),
                overrides: sanitized.clone(),
                notes: Some("generated from FX item".to_owned()),
                ..Pack::default()
            });
            absorbed.fx_presets.insert(
                fx_id.clone(),
                FxPreset {
                    fx_id,
                    fx_type: Some(infer_fx_type(kind)),
                    source: Some(pack_id),
                    ..FxPreset::default()
                },
            );
        }
    }
    debug!(
        telops = absorbed.telop_patterns.len(),
        assets = absorbed.assets.len(),
        packs = absorbed.packs.len(),
        fx = absorbed.fx_presets.len(),
        "extracted templates"
    );
    absorbed
}

fn absorb_telop(absorbed: &mut AbsorbedTemplates, item: &Map<String, Value>) {
    let text = item
        .get("Text")
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .unwrap_or("no_text");
    let pattern_id = format!("telop_{text}");
    if absorbed.telop_patterns.contains_key(&pattern_id) {
        return;
    }
    absorbed.telop_patterns.insert(
        pattern_id.clone(),
        TelopPattern {
            pattern_id,
            overrides: strip_runtime_fields(&Value::Object(item.clone()), false),
            description: Some(format!("extracted from text '{text}'")),
            ..TelopPattern::default()
        },
    );
}

fn absorb_asset(absorbed: &mut AbsorbedTemplates, item: &Map<String, Value>, project_name: &str) {
    let (asset_id, kind, path) = if item_type(item).contains("TachieItem") {
        (tachie_asset_id(item), "tachie", None)
    } else {
        let file_path = item.get("FilePath").and_then(Value::as_str).unwrap_or_default();
        (
            format!("image_{}", file_stem(file_path)),
            "image",
            Some(file_path.to_owned()).filter(|path| !path.is_empty()),
        )
    };
    if absorbed.assets.contains_key(&asset_id) {
        return;
    }
    absorbed.assets.insert(
        asset_id.clone(),
        Asset {
            asset_id,
            kind: Some(kind.to_owned()),
            path,
            parameters: strip_runtime_fields(&Value::Object(item.clone()), false),
            notes: Some(format!("from {project_name}")),
            ..Asset::default()
        },
    );
}

/// First of `keys` holding a mapping, read as a dictionary of records.
fn dictionary<T: DeserializeOwned>(project: &Value, keys: &[&str]) -> BTreeMap<String, T> {
    let Some((key, value)) = keys
        .iter()
        .find_map(|key| project.get(*key).map(|value| (*key, value)))
    else {
        return BTreeMap::new();
    };
    if !value.is_object() {
        return BTreeMap::new();
    }
    match serde_json::from_value(value.clone()) {
        Ok(records) => records,
        Err(error) => {
            warn!(dictionary = key, "ignoring malformed dictionary: {error}");
            BTreeMap::new()
        }
    }
}

fn has_payload(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        _ => false,
    }
}

/// Writes an inline payload to `templates/<category>/<id>.json` and returns
/// the workbook-relative source.
fn persist_payload(base_dir: &Path, category: &str, identifier: &str, payload: &Value) -> Result<String> {
    let relative = format!("{TEMPLATE_DIR}/{category}/{}.json", safe_filename(identifier));
    write_json(&base_dir.join(&relative), payload)?;
    Ok(relative)
}

/// Moves every inline payload into a template file referenced by `source`.
pub fn persist_templates(templates: &mut AbsorbedTemplates, base_dir: &Path) -> Result<()> {
    for (id, telop) in &mut templates.telop_patterns {
        if has_payload(&telop.overrides) {
            telop.source = Some(persist_payload(base_dir, "telops", id, &telop.overrides)?);
            telop.overrides = Value::Null;
        }
    }
    for (id, asset) in &mut templates.assets {
        if has_payload(&asset.parameters) {
            asset.source = Some(persist_payload(base_dir, "assets", id, &asset.parameters)?);
            asset.parameters = Value::Null;
        }
    }
    for (id, pack) in &mut templates.packs {
        if has_payload(&pack.overrides) {
            pack.source = Some(persist_payload(base_dir, "packs", id, &pack.overrides)?);
            pack.overrides = Value::Null;
        }
    }
    Ok(())
}

fn read_json(path: &Path, what: &str) -> Result<Value> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {what} {}", path.display()))?;
    serde_json::from_str(raw.strip_prefix('\u{feff}').unwrap_or(&raw))
        .with_context(|| format!("failed to parse {what} {}", path.display()))
}

fn dictionary_mut<'a>(root: &'a mut Map<String, Value>, key: &str) -> Result<&'a mut Map<String, Value>> {
    root.entry(key.to_owned())
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| anyhow!("workbook field '{key}' is not a mapping"))
}

/// Drops records whose id the workbook already has; returns how many.
fn drop_existing<T>(records: &mut BTreeMap<String, T>, existing: Option<&Value>) -> usize {
    let Some(existing) = existing.and_then(Value::as_object) else {
        return 0;
    };
    let before = records.len();
    records.retain(|id, _| !existing.contains_key(id));
    before - records.len()
}

fn insert_records<T: Serialize>(
    root: &mut Map<String, Value>,
    key: &str,
    records: &BTreeMap<String, T>,
) -> Result<usize> {
    let dictionary = dictionary_mut(root, key)?;
    for (id, record) in records {
        let value = serde_json::to_value(record)
            .with_context(|| format!("failed to serialize {key} entry '{id}'"))?;
        dictionary.insert(id.clone(), value);
    }
    Ok(records.len())
}

/// Absorbs the project at `ymmp` into the workbook document at `workbook`,
/// creating the workbook when it does not exist yet.
pub fn absorb_project_file(ymmp: &Path, workbook: &Path) -> Result<AbsorbSummary> {
    let project = read_json(ymmp, "project")?;
    let fallback_name = ymmp
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "source.ymmp".to_owned());
    let mut absorbed = extract_templates(&project, &fallback_name);

    let mut document = if workbook.exists() {
        read_json(workbook, "workbook")?
    } else {
        serde_json::to_value(WorkbookData::default()).context("failed to build empty workbook")?
    };
    let root = document
        .as_object_mut()
        .ok_or_else(|| anyhow!("workbook {} is not a JSON object", workbook.display()))?;

    let skipped = drop_existing(&mut absorbed.telop_patterns, root.get("telop_patterns"))
        + drop_existing(&mut absorbed.assets, root.get("assets"))
        + drop_existing(&mut absorbed.packs, root.get("packs"))
        + drop_existing(&mut absorbed.fx_presets, root.get("fx_presets"));

    let base_dir: PathBuf = match workbook.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    persist_templates(&mut absorbed, &base_dir)?;

    let summary = AbsorbSummary {
        telop_patterns: insert_records(root, "telop_patterns", &absorbed.telop_patterns)?,
        assets: insert_records(root, "assets", &absorbed.assets)?,
        packs: insert_records(root, "packs", &absorbed.packs)?,
        fx_presets: insert_records(root, "fx_presets", &absorbed.fx_presets)?,
        skipped,
    };
    write_json(workbook, &document)?;
    info!(
        workbook = %workbook.display(),
        telops = summary.telop_patterns,
        assets = summary.assets,
        packs = summary.packs,
        fx = summary.fx_presets,
        skipped = summary.skipped,
        "absorbed project templates"
    );
    Ok(summary)
}
