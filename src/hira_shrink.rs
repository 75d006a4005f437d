//! Post-build filter that shrinks hiragana-heavy text items.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::info;

use crate::project::write_json;

pub const DEFAULT_SHRINK_SCALE: f64 = 0.85;

const MIN_SCALE: f64 = 0.55;
const CHAR_WIDTH_RATIO: f64 = 0.62;
const TARGET_WIDTH: f64 = 1080.0 * 0.9;
const DEFAULT_NUMBER: f64 = 100.0;

pub fn is_hiragana(ch: char) -> bool {
    ('\u{3040}'..='\u{309f}').contains(&ch)
}

pub fn count_hiragana(text: &str) -> usize {
    text.chars().filter(|ch| is_hiragana(*ch)).count()
}

struct TextLayout {
    line_count: usize,
    longest_line: usize,
    total_chars: usize,
}

fn estimate_layout(text: &str) -> TextLayout {
    let mut lines: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();
    if lines.is_empty() {
        lines.push(if text.trim().is_empty() { text } else { text.trim() });
    }
    let widths: Vec<usize> = lines.iter().map(|line| line.chars().count()).collect();
    let total: usize = widths.iter().sum();
    TextLayout {
        line_count: lines.len().max(1),
        longest_line: widths.iter().copied().max().unwrap_or(0),
        total_chars: if total == 0 { text.chars().count() } else { total },
    }
}

/// First number found in a scalar, a `{Values:[{Value}]}` block, or a list.
fn first_number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(number) => number.as_f64(),
        Value::Object(block) => block
            .get("Values")
            .and_then(|values| first_number(Some(values)))
            .or_else(|| block.get("Value").and_then(Value::as_f64)),
        Value::Array(entries) => first_in_list(entries),
        _ => None,
    }
}

fn first_in_list(entries: &[Value]) -> Option<f64> {
    entries.iter().find_map(|entry| match entry {
        Value::Object(entry) => entry.get("Value").and_then(Value::as_f64),
        Value::Number(number) => number.as_f64(),
        _ => None,
    })
}

/// Scale factor for one text item given the requested base scale.
pub fn determine_scale(item: &Map<String, Value>, base_scale: f64) -> f64 {
    let text = item.get("Text").and_then(Value::as_str).unwrap_or_default();
    if text.trim().is_empty() {
        return base_scale.max(0.6).min(1.0);
    }

    let layout = estimate_layout(text);
    let ratio = count_hiragana(text) as f64 / layout.total_chars.max(1) as f64;
    let mut scale = 1.0 - (1.0 - base_scale) * ratio.powf(0.7);

    let font_size = first_number(item.get("FontSize")).unwrap_or(DEFAULT_NUMBER);
    let zoom = first_number(item.get("Zoom")).unwrap_or(DEFAULT_NUMBER);
    let approx_width =
        font_size * CHAR_WIDTH_RATIO * layout.longest_line.max(1) as f64 * (zoom / 100.0);
    let width_ratio = approx_width / TARGET_WIDTH;
    if width_ratio > 1.0 {
        scale = scale.min(1.0 / width_ratio);
    } else {
        let slack = 1.0 - width_ratio;
        if slack > 0.15 {
            scale = (scale + slack * 0.35).min(1.0);
        }
    }

    if layout.line_count > 2 {
        scale *= 0.98_f64.powi((layout.line_count - 2) as i32);
    } else if layout.line_count == 1 && layout.longest_line <= 6 {
        scale = (scale + 0.05).min(1.0);
    }

    scale.clamp(MIN_SCALE, 1.0)
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn is_text_item(item: &Map<String, Value>) -> bool {
    item.get("$type")
        .and_then(Value::as_str)
        .is_some_and(|kind| kind.contains("TextItem"))
}

/// Rescales the item's zoom in place. Returns whether anything changed.
fn shrink_item(item: &mut Map<String, Value>, base_scale: f64) -> bool {
    let has_hiragana = item
        .get("Text")
        .and_then(Value::as_str)
        .is_some_and(|text| count_hiragana(text) > 0);
    if !is_text_item(item) || !has_hiragana {
        return false;
    }
    let scale = determine_scale(item, base_scale);

    match item.get_mut("Zoom") {
        Some(zoom @ Value::Number(_)) => {
            let Some(current) = zoom.as_f64() else {
                return false;
            };
            *zoom = Value::from(round4(current * scale));
            true
        }
        Some(Value::Object(block)) => {
            let Some(Value::Array(values)) = block.get_mut("Values") else {
                return false;
            };
            if values.is_empty() {
                return false;
            }
            let mut base = first_in_list(values).unwrap_or(DEFAULT_NUMBER);
            if base == 0.0 {
                base = DEFAULT_NUMBER;
            }
            let new_base = base * scale;
            for entry in values.iter_mut() {
                let current = entry
                    .as_object()
                    .and_then(|entry| entry.get("Value"))
                    .and_then(Value::as_f64)
                    .unwrap_or(base);
                let scaled = Value::from(round4(new_base * current / base));
                match entry {
                    Value::Object(entry) => {
                        entry.insert("Value".to_owned(), scaled);
                    }
                    other => {
                        let mut wrapped = Map::new();
                        wrapped.insert("Value".to_owned(), scaled);
                        *other = Value::Object(wrapped);
                    }
                }
            }
            true
        }
        _ => false,
    }
}

/// Applies the shrink to every text item of every timeline.
pub fn shrink_project(project: &mut Value, base_scale: f64) -> usize {
    let Some(timelines) = project.get_mut("Timelines").and_then(Value::as_array_mut) else {
        return 0;
    };
    timelines
        .iter_mut()
        .filter_map(|timeline| timeline.get_mut("Items").and_then(Value::as_array_mut))
        .flat_map(|items| items.iter_mut())
        .filter_map(Value::as_object_mut)
        .map(|item| shrink_item(item, base_scale))
        .filter(|changed| *changed)
        .count()
}

pub fn shrink_project_file(input: &Path, output: &Path, base_scale: f64) -> Result<usize> {
    let raw = fs::read_to_string(input)
        .with_context(|| format!("failed to read project {}", input.display()))?;
    let mut project: Value = serde_json::from_str(raw.strip_prefix('\u{feff}').unwrap_or(&raw))
        .with_context(|| format!("failed to parse project {}", input.display()))?;
    let changed = shrink_project(&mut project, base_scale);
    write_json(output, &project)?;
    info!(items = changed, output = %output.display(), "applied hiragana shrink");
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{count_hiragana, determine_scale, round4, shrink_project};

    fn sample() -> Value {
        json!({
            "Timelines": [{
                "Items": [
                    {
                        "$type": "YukkuriMovieMaker.Project.Items.TextItem, YukkuriMovieMaker",
                        "Text": "これはひらがなのテストです",
                        "FontSize": 60.0,
                        "Zoom": 100.0
                    },
                    {
                        "$type": "YukkuriMovieMaker.Project.Items.TextItem, YukkuriMovieMaker",
                        "Text": "きょうは\nいいてんき\nですね",
                        "FontSize": 80.0,
                        "Zoom": {
                            "Values": [
                                { "Value": 100.0, "Frame": 0 },
                                { "Value": 150.0, "Frame": 30, "Ease": "Linear" }
                            ]
                        }
                    },
                    {
                        "$type": "YukkuriMovieMaker.Project.Items.TextItem, YukkuriMovieMaker",
                        "Text": "KATAKANA カタカナ",
                        "Zoom": 100.0
                    }
                ]
            }]
        })
    }

    #[test]
    fn hiragana_is_counted_by_code_point() {
        assert_eq!(count_hiragana("あいうABCカ"), 3);
    }

    #[test]
    fn scalar_zoom_is_scaled() {
        let original = sample();
        let mut project = original.clone();
        assert_eq!(shrink_project(&mut project, 0.8), 2);

        let item = original["Timelines"][0]["Items"][0]
            .as_object()
            .expect("item should be an object");
        let scale = determine_scale(item, 0.8);
        assert_eq!(
            project["Timelines"][0]["Items"][0]["Zoom"].as_f64(),
            Some(round4(100.0 * scale))
        );
        assert!((0.55..=1.0).contains(&scale));
    }

    #[test]
    fn keyframe_ratios_and_metadata_survive() {
        let original = sample();
        let mut project = original.clone();
        shrink_project(&mut project, 0.8);

        let item = original["Timelines"][0]["Items"][1]
            .as_object()
            .expect("item should be an object");
        let scale = determine_scale(item, 0.8);
        let values = &project["Timelines"][0]["Items"][1]["Zoom"]["Values"];
        assert_eq!(values[0]["Value"].as_f64(), Some(round4(100.0 * scale)));
        assert_eq!(values[1]["Value"].as_f64(), Some(round4(150.0 * scale)));
        assert_eq!(values[1]["Frame"], json!(30));
        assert_eq!(values[1]["Ease"], json!("Linear"));
    }

    #[test]
    fn text_without_hiragana_is_untouched() {
        let mut project = sample();
        shrink_project(&mut project, 0.8);
        assert_eq!(project["Timelines"][0]["Items"][2]["Zoom"], json!(100.0));
    }

    #[test]
    fn blank_text_uses_floor_of_base_scale() {
        let item = json!({ "Text": "  " });
        let item = item.as_object().expect("object");
        assert_eq!(determine_scale(item, 0.3), 0.6);
        assert_eq!(determine_scale(item, 0.9), 0.9);
    }
}
