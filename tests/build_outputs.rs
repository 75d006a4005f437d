use std::fs;
use std::path::Path;

use autoedit::compiler::ProjectBuilder;
use autoedit::history::{load_history_entries, summarize_warnings};
use autoedit::model::WorkbookData;
use autoedit::project::{default_scaffold, write_outputs, OutputOptions};
use autoedit::proposals::{ProposalModel, SuggestContext};
use autoedit::workbook::load_workbook;
use serde_json::{json, Value};
use tempfile::tempdir;

fn write_workbook(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("workbook.json");
    let workbook = json!({
        "telop_patterns": {
            "title": {
                "pattern_id": "title",
                "overrides": {
                    "$type": "YukkuriMovieMaker.Project.Items.TextItem, YukkuriMovieMaker",
                    "Text": "",
                    "FontSize": 60.0
                }
            }
        },
        "packs": {
            "intro": {
                "pack_id": "intro",
                "overrides": [
                    { "$type": "ShapeItem", "Frame": 100, "Length": 45 },
                    { "$type": "TextItem", "Frame": 110, "Length": 10 }
                ]
            }
        },
        "assets": {
            "logo": {
                "asset_id": "logo",
                "path": "media/logo.png",
                "parameters": { "$type": "ImageItem" },
                "default_zoom": 50.0
            }
        },
        "timeline": [
            {
                "index": 1,
                "start": "00:00:01.000",
                "end": "00:00:03.000",
                "subtitle": "こんにちは",
                "telop": "title",
                "packs": ["intro"],
                "notes": { "approval": "承認" }
            },
            {
                "index": 2,
                "start": "00:00:04.000",
                "end": "00:00:05.000",
                "subtitle": "ロゴ",
                "telop": "ghost",
                "objects": [{ "role": "画像", "identifier": "logo" }]
            }
        ]
    });
    fs::write(&path, serde_json::to_string_pretty(&workbook).expect("workbook should serialize"))
        .expect("workbook should write");
    path
}

fn items(project: &Value) -> &Vec<Value> {
    project["Timelines"][0]["Items"]
        .as_array()
        .expect("timeline items should be an array")
}

#[test]
fn rows_compile_into_timed_items() {
    let dir = tempdir().expect("tempdir should create");
    let data = load_workbook(&write_workbook(dir.path())).expect("workbook should load");
    let output = ProjectBuilder::new(&data)
        .build(default_scaffold())
        .expect("build should succeed");

    let items = items(&output.project);
    assert_eq!(items.len(), 4);

    let telop = &items[0];
    assert_eq!(telop["Text"], json!("こんにちは"));
    assert_eq!(telop["Frame"], json!(60));
    assert_eq!(telop["Length"], json!(120));

    let pack_timing: Vec<(Value, Value)> = items[1..3]
        .iter()
        .map(|item| (item["Frame"].clone(), item["Length"].clone()))
        .collect();
    assert_eq!(
        pack_timing,
        vec![(json!(60), json!(45)), (json!(70), json!(10))]
    );

    let logo = &items[3];
    assert_eq!(logo["FilePath"], json!("media/logo.png"));
    assert_eq!(logo["Zoom"], json!(50.0));
    assert_eq!(logo["Frame"], json!(240));
    assert_eq!(logo["Length"], json!(60));

    assert_eq!(output.warnings.len(), 1);
    assert_eq!(output.warnings[0].row, Some(2));
    assert_eq!(output.warnings[0].message, "Telop pattern not found: ghost");
    assert_eq!(output.history[1].missing_references, vec!["telop:ghost".to_owned()]);
}

#[test]
fn empty_workbook_still_produces_a_valid_project() {
    let output = ProjectBuilder::new(&WorkbookData::default())
        .build(default_scaffold())
        .expect("empty build should succeed");
    assert!(items(&output.project).is_empty());
    assert_eq!(output.project["Characters"], json!([]));
    assert!(output.warnings.is_empty());
    assert!(output.history.is_empty());
}

#[test]
fn outputs_feed_history_report_and_proposal_model() {
    let dir = tempdir().expect("tempdir should create");
    let data = load_workbook(&write_workbook(dir.path())).expect("workbook should load");
    let output = ProjectBuilder::new(&data)
        .build(default_scaffold())
        .expect("build should succeed");

    let out_dir = dir.path().join("out");
    let written = write_outputs(output, &out_dir, &OutputOptions::default())
        .expect("outputs should write");

    let project: Value = serde_json::from_str(
        &fs::read_to_string(&written.project).expect("project should be readable"),
    )
    .expect("project should parse");
    assert_eq!(project["FilePath"], json!(written.project.display().to_string()));

    let report: Value = serde_json::from_str(
        &fs::read_to_string(&written.report).expect("report should be readable"),
    )
    .expect("report should parse");
    assert_eq!(report["warnings"][0]["row"], json!(2));
    assert_eq!(report["history"]["count"], json!(2));
    assert!(report["generated_at"].as_str().is_some_and(|stamp| stamp.ends_with('Z')));

    let history_file = written.history.expect("history should be written");
    assert_eq!(history_file.file_name().and_then(|name| name.to_str()), Some("history.jsonl"));
    let loaded = load_history_entries(&out_dir.join("history"), false);
    assert!(loaded.errors.is_empty(), "{:?}", loaded.errors);
    assert_eq!(loaded.entries.len(), 2);
    assert_eq!(
        loaded.entries[1].warnings,
        vec!["Telop pattern not found: ghost".to_owned()]
    );

    let summary = summarize_warnings(&loaded.entries);
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].count, 1);
    assert_eq!(summary[0].rows, vec![2]);

    let model_path = written.proposal_model.expect("proposal model should be written");
    assert!(model_path.ends_with("ai/proposal_model.json"));
    let model = ProposalModel::load(&model_path);
    assert_eq!(model.processed_len(), 2);

    let suggestions = model.suggest(Some("こんにちは"), 3, SuggestContext::default(), None);
    assert_eq!(suggestions.top("telop", 1), vec!["title"]);
    assert_eq!(suggestions.top("pack", 1), vec!["intro"]);
    assert!(suggestions.top("asset", 1).is_empty(), "unapproved rows carry no score");
}

#[test]
fn unwritable_proposal_model_still_leaves_a_report() {
    let dir = tempdir().expect("tempdir should create");
    let data = load_workbook(&write_workbook(dir.path())).expect("workbook should load");
    let output = ProjectBuilder::new(&data)
        .build(default_scaffold())
        .expect("build should succeed");

    let blocker = dir.path().join("blocker");
    fs::write(&blocker, "not a directory").expect("blocker should write");
    let options = OutputOptions {
        model_path: Some(blocker.join("model.json")),
        ..OutputOptions::default()
    };
    let out_dir = dir.path().join("out");
    let written = write_outputs(output, &out_dir, &options).expect("outputs should still write");

    assert!(written.proposal_model.is_none());
    assert!(written.history.is_some());
    let report: Value = serde_json::from_str(
        &fs::read_to_string(&written.report).expect("report should be readable"),
    )
    .expect("report should parse");
    assert_eq!(report["history"]["count"], json!(2));
    assert!(report.get("ai").is_none());
}
