//! Loads the workbook hand-off document and its external template files.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, warn};

use crate::model::WorkbookData;
use crate::packs::strip_runtime_fields;

pub fn load_workbook(path: &Path) -> Result<WorkbookData> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read workbook {}", path.display()))?;
    let mut data: WorkbookData = serde_json::from_str(raw.strip_prefix('\u{feff}').unwrap_or(&raw))
        .with_context(|| format!("failed to parse workbook {}", path.display()))?;
    let base_dir = path.parent().unwrap_or(Path::new("."));
    resolve_sources(&mut data, base_dir);
    debug!(
        rows = data.timeline.len(),
        telops = data.telop_patterns.len(),
        assets = data.assets.len(),
        packs = data.packs.len(),
        "loaded workbook"
    );
    Ok(data)
}

/// Fills empty template payloads from their `source` files.
///
/// A file that cannot be read or parsed leaves the payload empty; the row
/// that references it reports the problem at build time.
pub fn resolve_sources(data: &mut WorkbookData, base_dir: &Path) {
    for telop in data.telop_patterns.values_mut() {
        if let Some(loaded) = load_source(base_dir, telop.source.as_deref(), &telop.overrides) {
            telop.overrides = strip_runtime_fields(&loaded, false);
        }
    }
    for asset in data.assets.values_mut() {
        if let Some(loaded) = load_source(base_dir, asset.source.as_deref(), &asset.parameters) {
            asset.parameters = strip_runtime_fields(&loaded, false);
        }
    }
    for pack in data.packs.values_mut() {
        if let Some(loaded) = load_source(base_dir, pack.source.as_deref(), &pack.overrides) {
            pack.overrides = strip_runtime_fields(&loaded, true);
        }
    }
}

fn load_source(base_dir: &Path, source: Option<&str>, current: &Value) -> Option<Value> {
    if !current.is_null() {
        return None;
    }
    let source = source.map(str::trim).filter(|source| !source.is_empty())?;
    let path = source_path(base_dir, source);
    match read_template_file(&path) {
        Ok(value) => Some(value),
        Err(error) => {
            warn!(path = %path.display(), "template source unavailable: {error:#}");
            None
        }
    }
}

fn source_path(base_dir: &Path, source: &str) -> PathBuf {
    let path = PathBuf::from(source);
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

/// A template file is JSON; a whole project contributes its first timeline's items.
pub fn read_template_file(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read template {}", path.display()))?;
    let value: Value = serde_json::from_str(raw.strip_prefix('\u{feff}').unwrap_or(&raw))
        .with_context(|| format!("failed to parse template {}", path.display()))?;
    let items = value
        .get("Timelines")
        .and_then(|timelines| timelines.get(0))
        .and_then(|timeline| timeline.get("Items"))
        .filter(|items| items.is_array())
        .cloned();
    Ok(items.unwrap_or(value))
}
