//! Per-row build history: JSON-lines persistence and warning summaries.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::compiler::BuildWarning;
use crate::model::TemplateMap;
use crate::timecode::{deserialize_optional_timecode, Timecode};

pub const HISTORY_DIR: &str = "history";
pub const HISTORY_FILE: &str = "history.jsonl";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, alias = "row", alias = "rowIndex")]
    pub row_index: usize,
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
    /// Expressions after preset enrichment.
    #[serde(default)]
    pub expressions: BTreeMap<String, String>,
    #[serde(default)]
    pub packs: Vec<String>,
    #[serde(default)]
    pub objects: Vec<HistoryObject>,
    #[serde(default)]
    pub fx: Vec<HistoryFx>,
    #[serde(default)]
    pub notes: TemplateMap,
    #[serde(default)]
    pub generated_items: Vec<GeneratedItemSummary>,
    /// References that had no template-store entry when the row was built.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_references: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl HistoryEntry {
    /// Start of the row in seconds, used as the learning position.
    pub fn position(&self) -> Option<f64> {
        self.start.map(|start| start.to_seconds())
    }

    pub fn approval(&self) -> Option<&serde_json::Value> {
        self.notes.get("approval")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryObject {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub source_column: Option<String>,
    #[serde(default)]
    pub identifier: String,
    /// `None` when the identifier did not match any asset.
    #[serde(default)]
    pub resolved_asset: Option<String>,
    #[serde(default)]
    pub asset_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryFx {
    #[serde(default)]
    pub fx_id: String,
    #[serde(default)]
    pub source_column: Option<String>,
    #[serde(default)]
    pub source_key: Option<String>,
    #[serde(default)]
    pub parameters: TemplateMap,
    #[serde(default)]
    pub applied_parameters: TemplateMap,
    /// `None` when the fx id did not match any preset.
    #[serde(default)]
    pub preset: Option<HistoryFxPreset>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryFxPreset {
    #[serde(default, rename = "type")]
    pub fx_type: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub asset: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedItemSummary {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub layer: Option<i64>,
    #[serde(default, rename = "type")]
    pub item_type: Option<String>,
}

/// Second-precision UTC timestamp, e.g. `2024-05-01T12:00:00Z`.
pub fn history_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Copies every row-tagged warning onto the entry for that row.
pub fn annotate_warnings(entries: &mut [HistoryEntry], warnings: &[BuildWarning]) {
    let mut by_row: HashMap<usize, Vec<String>> = HashMap::new();
    for warning in warnings {
        if let Some(row) = warning.row {
            by_row.entry(row).or_default().push(warning.message.clone());
        }
    }
    for entry in entries {
        if let Some(messages) = by_row.remove(&entry.row_index) {
            entry.warnings = messages;
        }
    }
}

/// Appends `entries` to `<output_dir>/history/YYYYMMDD/history.jsonl`.
///
/// Returns the written file, or `None` when there was nothing to write.
pub fn append_history(entries: &[HistoryEntry], output_dir: &Path) -> Result<Option<PathBuf>> {
    if entries.is_empty() {
        return Ok(None);
    }
    let day_dir = output_dir
        .join(HISTORY_DIR)
        .join(Utc::now().format("%Y%m%d").to_string());
    fs::create_dir_all(&day_dir)
        .with_context(|| format!("failed to create history directory {}", day_dir.display()))?;
    let path = day_dir.join(HISTORY_FILE);

    let mut buffer = String::new();
    for entry in entries {
        let line = serde_json::to_string(entry).context("failed to encode history entry")?;
        buffer.push_str(&line);
        buffer.push('\n');
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open history log {}", path.display()))?;
    file.write_all(buffer.as_bytes())
        .with_context(|| format!("failed to append history log {}", path.display()))?;
    Ok(Some(path))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryLoadResult {
    pub entries: Vec<HistoryEntry>,
    /// Unreadable files and undecodable lines; loading never stops on them.
    pub errors: Vec<String>,
}

/// Reads one log file, or every `history.jsonl` below a directory.
pub fn load_history_entries(path: &Path, latest_only: bool) -> HistoryLoadResult {
    let mut result = HistoryLoadResult::default();
    if !path.exists() {
        result
            .errors
            .push(format!("History path not found: {}", path.display()));
        return result;
    }

    let mut files = if path.is_file() {
        vec![path.to_path_buf()]
    } else {
        let mut found = Vec::new();
        if let Err(error) = collect_history_files(path, &mut found) {
            result.errors.push(format!("{error:#}"));
        }
        found.sort();
        found
    };
    if latest_only && files.len() > 1 {
        let latest = files
            .iter()
            .max_by_key(|file| fs::metadata(file).and_then(|meta| meta.modified()).ok())
            .cloned();
        files = latest.into_iter().collect();
    }

    for file in files {
        let text = match fs::read_to_string(&file) {
            Ok(text) => text,
            Err(error) => {
                result.errors.push(format!("{}: {error}", file.display()));
                continue;
            }
        };
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryEntry>(line) {
                Ok(entry) => result.entries.push(entry),
                Err(error) => result.errors.push(format!(
                    "{}:{} JSON decode error: {error}",
                    file.display(),
                    number + 1
                )),
            }
        }
    }
    result
}

fn collect_history_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?;
    for entry in entries {
        let entry =
            entry.with_context(|| format!("failed reading directory entry in {}", dir.display()))?;
        let path = entry.path();
        if path.is_dir() {
            collect_history_files(&path, out)?;
        } else if path.file_name().and_then(|name| name.to_str()) == Some(HISTORY_FILE) {
            out.push(path);
        }
    }
    Ok(())
}

/// Message keyword, label, remediation hint. First match wins.
const WARNING_HINTS: &[(&str, &str, &str)] = &[
    (
        "Unresolved template path",
        "未解決テンプレートパス",
        "テンプレートの source やファイルパスが誤っている可能性があります。辞書のパスを実ファイルと突き合わせて修正してください。",
    ),
    (
        "Layer band overflow",
        "レイヤ帯オーバーフロー",
        "配置レイヤが帯域の上限を超えました。バンド幅設定や優先度を見直し、重要度の低いアイテムを別帯に移してください。",
    ),
    (
        "Telop pattern not found",
        "未登録テロップID",
        "TIMELINEのテロップIDが辞書に存在しません。テロップシートへ登録するか、正しいIDに修正してください。",
    ),
    (
        "Telop build error",
        "テロップ生成エラー",
        "テンプレート適用時にエラーが発生しました。テンプレートJSONの形式と差し替え値を確認してください。",
    ),
    (
        "Character not found",
        "キャラクター未登録",
        "立ち絵キャラクター名が辞書に存在しません。キャラクター設定シートを更新してください。",
    ),
    (
        "No expressions provided",
        "立ち絵差分未設定",
        "対象キャラクターに必要な表情差分が登録されていません。差分パスを設定してください。",
    ),
    (
        "Tachie expression",
        "立ち絵差分フォールバック",
        "指定した表情ファイルが見つからず代替ファイルを使用しました。ファイル名と拡張子を確認してください。",
    ),
    (
        "Unknown tachie part",
        "未知の立ち絵パーツ",
        "辞書にないパーツ名が指定されています。パーツ名を既存のキーに合わせてください。",
    ),
    (
        "Tachie base path missing",
        "立ち絵テンプレート欠損",
        "立ち絵テンプレートの参照パスが不足しています。ベースとなるパーツのパスを確認してください。",
    ),
    (
        "Dynamic Tachie build error",
        "立ち絵生成エラー",
        "立ち絵生成中にエラーが発生しました。辞書の差分指定やテンプレート構造を確認してください。",
    ),
    (
        "Pack not found",
        "パック未登録",
        "パックIDが辞書に存在しません。複数オブジェクトシートを更新するか、IDを修正してください。",
    ),
    (
        "Pack '",
        "パックテンプレート不備",
        "パックのテンプレート内容が不足しています。ItemsやテンプレートJSONの内容を確認してください。",
    ),
    (
        "Asset not found",
        "オブジェクト未登録",
        "単体オブジェクトIDが辞書にありません。オブジェクトシートに登録するか、IDを修正してください。",
    ),
    (
        "Asset '",
        "オブジェクトテンプレート不備",
        "オブジェクトテンプレートの必須パラメータが欠けています。テンプレートJSONと差分を確認してください。",
    ),
    (
        "FX preset not found",
        "FXプリセット未登録",
        "FXプリセットIDが辞書に存在しません。FX定義を追加するか、IDを修正してください。",
    ),
    (
        "FX preset '",
        "FXプリセット設定不備",
        "FXプリセットの参照パックや素材が不足しています。参照先が存在するか確認してください。",
    ),
    (
        "FX '",
        "FX上書き不整合",
        "FXの上書きパラメータがプリセット定義と一致しません。プリセット定義を見直してください。",
    ),
];

const FALLBACK_LABEL: &str = "その他の警告";
const FALLBACK_HINT: &str = "詳細は history.jsonl のメッセージを直接確認してください。";

/// Label and remediation hint for a warning message.
pub fn classify_warning(message: &str) -> (&'static str, &'static str) {
    let lowered = message.to_lowercase();
    WARNING_HINTS
        .iter()
        .find(|(keyword, _, _)| lowered.contains(&keyword.to_lowercase()))
        .map(|(_, label, hint)| (*label, *hint))
        .unwrap_or((FALLBACK_LABEL, FALLBACK_HINT))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarningSummary {
    pub label: String,
    pub count: usize,
    pub hint: String,
    pub rows: Vec<usize>,
    pub messages: Vec<String>,
}

/// Warning counts per label, most frequent first.
pub fn summarize_warnings(entries: &[HistoryEntry]) -> Vec<WarningSummary> {
    struct Bucket {
        count: usize,
        hint: &'static str,
        rows: BTreeSet<usize>,
        messages: BTreeSet<String>,
        first_seen: usize,
    }

    let mut buckets: HashMap<&'static str, Bucket> = HashMap::new();
    for entry in entries {
        for warning in &entry.warnings {
            let (label, hint) = classify_warning(warning);
            let next = buckets.len();
            let bucket = buckets.entry(label).or_insert_with(|| Bucket {
                count: 0,
                hint,
                rows: BTreeSet::new(),
                messages: BTreeSet::new(),
                first_seen: next,
            });
            bucket.count += 1;
            bucket.rows.insert(entry.row_index);
            bucket.messages.insert(warning.clone());
        }
    }

    let mut ordered = buckets.into_iter().collect::<Vec<_>>();
    ordered.sort_by(|(_, a), (_, b)| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.first_seen.cmp(&b.first_seen))
    });
    ordered
        .into_iter()
        .map(|(label, bucket)| WarningSummary {
            label: label.to_owned(),
            count: bucket.count,
            hint: bucket.hint.to_owned(),
            rows: bucket.rows.into_iter().collect(),
            messages: bucket.messages.into_iter().collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::{
        annotate_warnings, append_history, classify_warning, load_history_entries,
        summarize_warnings, HistoryEntry,
    };
    use crate::compiler::BuildWarning;

    fn entry(row_index: usize, warnings: &[&str]) -> HistoryEntry {
        HistoryEntry {
            timestamp: "2024-05-01T00:00:00Z".to_owned(),
            row_index,
            warnings: warnings.iter().map(|w| (*w).to_owned()).collect(),
            ..HistoryEntry::default()
        }
    }

    #[test]
    fn classify_uses_first_matching_keyword() {
        assert_eq!(classify_warning("Pack not found: p9").0, "パック未登録");
        assert_eq!(classify_warning("Pack 'p1' has no items").0, "パックテンプレート不備");
        assert_eq!(
            classify_warning("FX preset 'shake' has no source or asset").0,
            "FXプリセット設定不備"
        );
        assert_eq!(classify_warning("something odd").0, "その他の警告");
    }

    #[test]
    fn summary_groups_and_orders_by_count() {
        let entries = vec![
            entry(1, &["Asset not found: a1", "Pack not found: p1"]),
            entry(2, &["Asset not found: a2"]),
            entry(3, &["Asset not found: a1"]),
        ];
        let summary = summarize_warnings(&entries);
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].label, "オブジェクト未登録");
        assert_eq!(summary[0].count, 3);
        assert_eq!(summary[0].rows, vec![1, 2, 3]);
        assert_eq!(summary[0].messages, vec!["Asset not found: a1", "Asset not found: a2"]);
        assert_eq!(summary[1].count, 1);
    }

    #[test]
    fn appended_history_loads_back_with_bad_lines_reported() {
        let dir = tempdir().expect("tempdir should be created");
        let mut entries = vec![entry(1, &[]), entry(2, &[])];
        annotate_warnings(
            &mut entries,
            &[BuildWarning::row(2, "Asset not found: a1"), BuildWarning::global("scaffold note")],
        );
        assert!(entries[0].warnings.is_empty());
        assert_eq!(entries[1].warnings, vec!["Asset not found: a1"]);

        let path = append_history(&entries, dir.path())
            .expect("history should be written")
            .expect("non-empty history should produce a file");
        let mut text = fs::read_to_string(&path).expect("history should be readable");
        text.push_str("{not json\n");
        fs::write(&path, text).expect("history should be rewritable");

        let loaded = load_history_entries(dir.path(), false);
        assert_eq!(loaded.entries.len(), 2);
        assert_eq!(loaded.entries[1].warnings, vec!["Asset not found: a1"]);
        assert_eq!(loaded.errors.len(), 1);
        assert!(loaded.errors[0].contains(":3 JSON decode error"));

        let missing = load_history_entries(&dir.path().join("nope"), true);
        assert!(missing.entries.is_empty());
        assert!(missing.errors[0].starts_with("History path not found"));
    }
}
