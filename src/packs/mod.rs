//! Multi-item packs.
//!
//! A pack template is a list of items, a mapping with an `Items` list, or a
//! single `$type`d item. Items keep their timing relative to the first item:
//! prepared templates carry `FrameOffset`/`LengthFrames`, raw ones are read
//! from `Frame`/`Length`.

use serde_json::{json, Value};

use crate::model::{Pack, TemplateMap, TimelineRow};
use crate::template::TemplateCache;

pub const FRAME_OFFSET_KEY: &str = "FrameOffset";
pub const LENGTH_FRAMES_KEY: &str = "LengthFrames";
const RUNTIME_FIELDS: [&str; 2] = ["Frame", "Length"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackItemTiming {
    pub offset: i64,
    pub length: Option<i64>,
}

/// Removes absolute `Frame`/`Length` everywhere in `data`.
///
/// With `preserve_timing`, the items of a pack (a top-level list or an
/// `Items` list) first record their offset from the first item and their
/// original length, so the pack can be re-anchored to any row later.
pub fn strip_runtime_fields(data: &Value, preserve_timing: bool) -> Value {
    if !preserve_timing {
        return strip_value(data);
    }
    match data {
        Value::Array(items) => Value::Array(prepare_items(items)),
        Value::Object(map) => {
            let mut out = TemplateMap::new();
            for (key, value) in map {
                if RUNTIME_FIELDS.contains(&key.as_str()) {
                    continue;
                }
                let prepared = match (key.as_str(), value) {
                    ("Items", Value::Array(items)) => Value::Array(prepare_items(items)),
                    _ => strip_value(value),
                };
                out.insert(key.clone(), prepared);
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn prepare_items(items: &[Value]) -> Vec<Value> {
    let timings = item_timings(items);
    items
        .iter()
        .zip(timings)
        .map(|(item, timing)| {
            let mut stripped = strip_value(item);
            if let Value::Object(map) = &mut stripped {
                map.insert(FRAME_OFFSET_KEY.to_owned(), json!(timing.offset));
                if let Some(length) = timing.length {
                    map.insert(LENGTH_FRAMES_KEY.to_owned(), json!(length));
                }
            }
            stripped
        })
        .collect()
}

fn strip_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !RUNTIME_FIELDS.contains(&key.as_str()))
                .map(|(key, nested)| (key.clone(), strip_value(nested)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_value).collect()),
        other => other.clone(),
    }
}

/// Relative timing of each item, preferring prepared metadata over raw fields.
pub fn item_timings(items: &[Value]) -> Vec<PackItemTiming> {
    let first_frame = items
        .first()
        .and_then(|item| int_field(item, "Frame"))
        .unwrap_or(0);
    items
        .iter()
        .map(|item| PackItemTiming {
            offset: int_field(item, FRAME_OFFSET_KEY)
                .or_else(|| int_field(item, "Frame").map(|frame| frame - first_frame))
                .unwrap_or(0),
            length: int_field(item, LENGTH_FRAMES_KEY).or_else(|| int_field(item, "Length")),
        })
        .collect()
}

fn int_field(item: &Value, key: &str) -> Option<i64> {
    let value = item.get(key)?;
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|number| number.round() as i64))
}

/// Items of a pack template, or the warning explaining why there are none.
pub fn pack_source_items<'a>(pack: &'a Pack) -> Result<&'a [Value], String> {
    let single: &'a [Value] = std::slice::from_ref(&pack.overrides);
    let items = match &pack.overrides {
        Value::Null => return Err(format!("Pack '{}' has no template data", pack.pack_id)),
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("Items") {
            Some(Value::Array(items)) => items.as_slice(),
            _ if map.contains_key("$type") => single,
            _ => &[],
        },
        _ => {
            return Err(format!(
                "Unsupported pack template format for '{}'",
                pack.pack_id
            ))
        }
    };
    if items.is_empty() {
        return Err(format!("Pack '{}' has no items", pack.pack_id));
    }
    Ok(items)
}

/// Expands `pack` against `row`, anchoring the first item at the row's start.
///
/// Item lengths are the pack's own; packs never stretch to the row's end.
/// Problems are pushed onto `warnings` and never abort the row.
pub fn instantiate_pack<'a>(
    pack: &'a Pack,
    row: &TimelineRow,
    templates: &mut TemplateCache<'a>,
    fps: f64,
    warnings: &mut Vec<String>,
) -> Vec<TemplateMap> {
    let items = match pack_source_items(pack) {
        Ok(items) => items,
        Err(message) => {
            warnings.push(message);
            return Vec::new();
        }
    };

    let anchor = row.start.map(|start| start.to_frame(fps)).unwrap_or(0);
    let timings = item_timings(items);
    let mut instantiated = Vec::with_capacity(items.len());
    for (source, timing) in items.iter().zip(timings) {
        let mut item = match templates.instantiate(source, row, fps) {
            Ok(item) => item,
            Err(error) => {
                warnings.push(format!("Pack '{}' build error: {error:#}", pack.pack_id));
                continue;
            }
        };
        item.remove(FRAME_OFFSET_KEY);
        item.remove(LENGTH_FRAMES_KEY);
        item.insert("Frame".to_owned(), json!(anchor + timing.offset));
        match timing.length {
            Some(length) => item.insert("Length".to_owned(), json!(length)),
            None => item.remove("Length"),
        };
        instantiated.push(item);
    }
    instantiated
}
