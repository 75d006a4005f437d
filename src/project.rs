//! Base project scaffold and the files written after a build.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::compiler::{BuildWarning, CompileOutput};
use crate::error_codes::CodedError;
use crate::history::{annotate_warnings, append_history, history_timestamp, HISTORY_DIR};
use crate::proposals::{update_proposal_model, DEFAULT_MAX_PROCESSED};

pub const CHARACTER_COLOR: &str = "#FFFFFFFF";
pub const PROJECT_FILE: &str = "out.ymmp";
pub const REPORT_FILE: &str = "report.json";

/// Smallest project the target editor accepts: one empty timeline.
pub fn default_scaffold() -> Value {
    json!({
        "FilePath": "",
        "SelectedTimelineIndex": 0,
        "Timelines": [
            {
                "ID": 0,
                "Name": "タイムライン1",
                "VideoInfo": { "FPS": 60, "Hz": 44100, "Width": 1920, "Height": 1080 },
                "Items": [],
                "Characters": []
            }
        ],
        "Characters": []
    })
}

/// Reads a UTF-8 (optionally BOM-prefixed) JSON scaffold.
pub fn load_scaffold(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Err(anyhow!(CodedError::scaffold(
            "SCAFFOLD_NOT_FOUND",
            format!("scaffold file not found: {}", path.display()),
        )
        .with_details(json!({ "path": path.display().to_string() }))));
    }
    let bytes =
        fs::read(path).with_context(|| format!("failed to read scaffold {}", path.display()))?;
    let text = String::from_utf8(bytes).map_err(|error| {
        anyhow!(CodedError::scaffold(
            "SCAFFOLD_ENCODING",
            format!("scaffold is not valid UTF-8: {error}"),
        ))
    })?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(&text);
    let project: Value = serde_json::from_str(text).map_err(|error| {
        anyhow!(CodedError::scaffold(
            "SCAFFOLD_JSON",
            format!("scaffold is not valid JSON: {error}"),
        )
        .with_details(json!({
            "path": path.display().to_string(),
            "line": error.line(),
            "column": error.column(),
        })))
    })?;
    ensure_scaffold_shape(&project)?;
    Ok(project)
}

/// The scaffold must be an object whose `Timelines` list starts with an object.
pub fn ensure_scaffold_shape(project: &Value) -> Result<()> {
    let Some(root) = project.as_object() else {
        return Err(anyhow!(CodedError::scaffold(
            "SCAFFOLD_SHAPE",
            "scaffold root must be a JSON object",
        )));
    };
    match root.get("Timelines") {
        Some(Value::Array(timelines)) => match timelines.first() {
            Some(Value::Object(_)) => Ok(()),
            Some(_) => Err(anyhow!(CodedError::scaffold(
                "SCAFFOLD_SHAPE",
                "first timeline must be a JSON object",
            ))),
            None => Err(anyhow!(CodedError::scaffold(
                "SCAFFOLD_SHAPE",
                "scaffold has no timelines",
            ))),
        },
        _ => Err(anyhow!(CodedError::scaffold(
            "SCAFFOLD_SHAPE",
            "scaffold is missing a `Timelines` list",
        ))),
    }
}

/// Writes items into the first timeline and the character list into both
/// the root and that timeline.
pub fn inject_timeline(project: &mut Value, items: Vec<Value>, characters: &[String]) -> Result<()> {
    ensure_scaffold_shape(project)?;
    let definitions = Value::Array(
        characters
            .iter()
            .map(|name| json!({ "Name": name, "Color": CHARACTER_COLOR }))
            .collect(),
    );
    let timeline = project
        .get_mut("Timelines")
        .and_then(|timelines| timelines.get_mut(0))
        .and_then(Value::as_object_mut)
        .ok_or_else(|| {
            anyhow!(CodedError::scaffold(
                "SCAFFOLD_SHAPE",
                "first timeline must be a JSON object",
            ))
        })?;
    timeline.insert("Items".to_owned(), Value::Array(items));
    timeline.insert("Characters".to_owned(), definitions.clone());
    if let Some(root) = project.as_object_mut() {
        root.insert("Characters".to_owned(), definitions);
    }
    Ok(())
}

pub fn write_json(path: &Path, value: &impl Serialize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    fs::write(path, format!("{json}\n"))
        .with_context(|| format!("failed to write {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct OutputOptions {
    /// Model file to update; defaults to `<out>/ai/proposal_model.json`.
    pub model_path: Option<PathBuf>,
    pub max_processed: usize,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            model_path: None,
            max_processed: DEFAULT_MAX_PROCESSED,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub generated_at: String,
    pub warnings: Vec<BuildWarning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai: Option<AiReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryReport {
    pub count: usize,
    pub directory: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AiReport {
    pub proposal_model: String,
}

#[derive(Debug, Clone)]
pub struct WrittenOutputs {
    pub project: PathBuf,
    pub report: PathBuf,
    pub history: Option<PathBuf>,
    pub proposal_model: Option<PathBuf>,
    pub build_report: BuildReport,
}

/// Writes `out.ymmp`, appends history, updates the proposal model, and
/// finishes with `report.json`.
///
/// A proposal model that cannot be saved is logged and left out of the
/// report; `learn` can rebuild it from the history later.
pub fn write_outputs(
    output: CompileOutput,
    output_dir: &Path,
    options: &OutputOptions,
) -> Result<WrittenOutputs> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create output directory {}", output_dir.display()))?;
    let output_dir = fs::canonicalize(output_dir)
        .with_context(|| format!("failed to resolve output directory {}", output_dir.display()))?;

    let CompileOutput {
        mut project,
        warnings,
        mut history,
    } = output;

    let project_path = output_dir.join(PROJECT_FILE);
    if let Some(root) = project.as_object_mut() {
        root.insert(
            "FilePath".to_owned(),
            json!(project_path.display().to_string()),
        );
    }
    write_json(&project_path, &project)?;

    annotate_warnings(&mut history, &warnings);
    let history_file = append_history(&history, &output_dir)?;
    let model_base = options.model_path.as_deref().unwrap_or(&output_dir);
    let proposal_model = match update_proposal_model(&history, model_base, options.max_processed) {
        Ok(path) => path,
        Err(error) => {
            warn!(error = %format!("{error:#}"), "proposal model not updated");
            None
        }
    };

    let build_report = BuildReport {
        generated_at: history_timestamp(),
        warnings,
        history: history_file.as_ref().map(|_| HistoryReport {
            count: history.len(),
            directory: output_dir.join(HISTORY_DIR).display().to_string(),
        }),
        ai: proposal_model.as_ref().map(|path| AiReport {
            proposal_model: path.display().to_string(),
        }),
    };
    let report_path = output_dir.join(REPORT_FILE);
    write_json(&report_path, &build_report)?;
    info!(
        project = %project_path.display(),
        warnings = build_report.warnings.len(),
        "wrote build outputs"
    );

    Ok(WrittenOutputs {
        project: project_path,
        report: report_path,
        history: history_file,
        proposal_model,
        build_report,
    })
}
