use std::fs;
use std::path::Path;
use std::process::Command;

use serde_json::{json, Value};
use tempfile::tempdir;

fn run_autoedit(cwd: &Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_autoedit"))
        .current_dir(cwd)
        .env_remove("AUTOEDIT_FPS")
        .env_remove("AUTOEDIT_BAND_WIDTH")
        .env_remove("AUTOEDIT_SCAFFOLD")
        .env("RUST_LOG", "warn")
        .args(args)
        .output()
        .expect("autoedit command should run")
}

fn write_json(path: &Path, value: &Value) {
    fs::write(path, serde_json::to_string_pretty(value).expect("json should serialize"))
        .expect("json should write");
}

fn minimal_workbook(path: &Path) {
    write_json(
        path,
        &json!({
            "telop_patterns": {
                "title": { "pattern_id": "title", "overrides": { "$type": "TextItem", "Text": "" } }
            },
            "timeline": [
                { "index": 1, "start": "00:00:00.500", "end": "00:00:02.000", "subtitle": "はじめ", "telop": "title" }
            ]
        }),
    );
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout should be json")
}

#[test]
fn build_writes_project_report_and_model() {
    let dir = tempdir().expect("tempdir should create");
    minimal_workbook(&dir.path().join("workbook.json"));

    let output = run_autoedit(
        dir.path(),
        &["build", "--workbook", "workbook.json", "--out", "out", "--fps", "30"],
    );
    assert!(
        output.status.success(),
        "build should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let summary = stdout_json(&output);
    assert_eq!(summary["ok"], json!(true));
    assert_eq!(summary["warnings"], json!(0));

    let project: Value = serde_json::from_str(
        &fs::read_to_string(dir.path().join("out/out.ymmp")).expect("project should exist"),
    )
    .expect("project should parse");
    let item = &project["Timelines"][0]["Items"][0];
    assert_eq!(item["Frame"], json!(15));
    assert_eq!(item["Length"], json!(45));
    assert!(dir.path().join("out/report.json").is_file());
    assert!(dir.path().join("out/ai/proposal_model.json").is_file());
}

#[test]
fn missing_scaffold_prints_coded_envelope() {
    let dir = tempdir().expect("tempdir should create");
    minimal_workbook(&dir.path().join("workbook.json"));

    let output = run_autoedit(
        dir.path(),
        &["build", "--workbook", "workbook.json", "--scaffold", "nope.ymmp"],
    );
    assert!(!output.status.success(), "missing scaffold should fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("\"code\": \"SCAFFOLD_NOT_FOUND\""), "stderr was: {stderr}");
    assert!(stderr.contains("\"ok\": false"));
    assert!(!dir.path().join("out/out.ymmp").exists());
}

#[test]
fn invalid_fps_is_a_usage_error() {
    let dir = tempdir().expect("tempdir should create");
    minimal_workbook(&dir.path().join("workbook.json"));

    let output = run_autoedit(dir.path(), &["build", "--workbook", "workbook.json", "--fps", "0"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("CONFIG_INVALID"), "stderr was: {stderr}");
    assert!(stderr.contains("\"kind\": \"usage\""));
}

#[test]
fn learn_then_suggest_ranks_approved_templates() {
    let dir = tempdir().expect("tempdir should create");
    let history = dir.path().join("history.jsonl");
    let lines = [
        json!({ "timestamp": "2024-05-01T10:00:00Z", "row_index": 1, "subtitle": "新商品の紹介", "telop": "bold", "notes": { "approval": "承認" } }),
        json!({ "timestamp": "2024-05-01T10:00:00Z", "row_index": 2, "subtitle": "新商品の価格", "telop": "bold", "notes": { "approval": true } }),
        json!({ "timestamp": "2024-05-01T10:00:00Z", "row_index": 3, "subtitle": "新商品の紹介", "telop": "plain", "notes": { "approval": "却下" } }),
    ];
    let body = lines.iter().map(Value::to_string).collect::<Vec<_>>().join("\n");
    fs::write(&history, format!("{body}\nnot json\n")).expect("history should write");

    let learned = run_autoedit(
        dir.path(),
        &["learn", "--history", "history.jsonl", "--model", "model.json"],
    );
    assert!(learned.status.success(), "{}", String::from_utf8_lossy(&learned.stderr));
    let summary = stdout_json(&learned);
    assert_eq!(summary["entries"], json!(3));
    assert_eq!(summary["changed"], json!(true));
    assert!(String::from_utf8_lossy(&learned.stderr).contains("JSON decode error"));

    let suggested = run_autoedit(
        dir.path(),
        &["suggest", "--model", "model.json", "--subtitle", "新商品の紹介", "--limit", "2"],
    );
    assert!(suggested.status.success(), "{}", String::from_utf8_lossy(&suggested.stderr));
    let ranked = stdout_json(&suggested);
    assert_eq!(ranked["telop"][0]["identifier"], json!("bold"));
    assert_eq!(ranked["telop"].as_array().map(Vec::len), Some(1));

    let relearned = run_autoedit(
        dir.path(),
        &["learn", "--history", "history.jsonl", "--model", "model.json"],
    );
    assert_eq!(stdout_json(&relearned)["changed"], json!(false));
}

#[test]
fn warnings_command_groups_messages() {
    let dir = tempdir().expect("tempdir should create");
    let day = dir.path().join("history/20240501");
    fs::create_dir_all(&day).expect("history dir should create");
    let lines = [
        json!({ "row_index": 1, "warnings": ["Telop pattern not found: a"] }),
        json!({ "row_index": 4, "warnings": ["Telop pattern not found: b", "Pack not found: p"] }),
    ];
    let body = lines.iter().map(Value::to_string).collect::<Vec<_>>().join("\n");
    fs::write(day.join("history.jsonl"), body).expect("history should write");

    let output = run_autoedit(dir.path(), &["warnings", "--history", "history"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let summary = stdout_json(&output);
    assert_eq!(summary[0]["count"], json!(2));
    assert_eq!(summary[0]["rows"], json!([1, 4]));
    assert_eq!(summary[1]["count"], json!(1));
}

#[test]
fn hira_shrink_filter_rewrites_text_zoom() {
    let dir = tempdir().expect("tempdir should create");
    write_json(
        &dir.path().join("in.ymmp"),
        &json!({
            "Timelines": [{ "Items": [
                { "$type": "YukkuriMovieMaker.Project.Items.TextItem, YukkuriMovieMaker", "Text": "ひらがな", "Zoom": 100.0 },
                { "$type": "ImageItem", "Zoom": 100.0 }
            ] }]
        }),
    );

    let output = run_autoedit(
        dir.path(),
        &["filter", "hira-shrink", "--input", "in.ymmp", "--out", "shrunk.ymmp", "--scale", "0.8"],
    );
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(stdout_json(&output)["items"], json!(1));

    let project: Value = serde_json::from_str(
        &fs::read_to_string(dir.path().join("shrunk.ymmp")).expect("output should exist"),
    )
    .expect("output should parse");
    let zoom = project["Timelines"][0]["Items"][0]["Zoom"]
        .as_f64()
        .expect("zoom should stay numeric");
    assert!((55.0..=100.0).contains(&zoom));
    assert_eq!(project["Timelines"][0]["Items"][1]["Zoom"], json!(100.0));
}

#[test]
fn absorb_harvests_templates_into_a_new_workbook() {
    let dir = tempdir().expect("tempdir should create");
    write_json(
        &dir.path().join("raw.ymmp"),
        &json!({
            "Timelines": [{ "Items": [
                { "$type": "YukkuriMovieMaker.Project.Items.TextItem, YukkuriMovieMaker", "Text": "タイトル", "Frame": 30, "Length": 60 },
                { "$type": "YukkuriMovieMaker.Project.Items.ImageItem, YukkuriMovieMaker", "FilePath": "media/bg.png", "Frame": 0 }
            ] }]
        }),
    );

    let output = run_autoedit(
        dir.path(),
        &["absorb", "--ymmp", "raw.ymmp", "--workbook", "books/workbook.json"],
    );
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let summary = stdout_json(&output);
    assert_eq!(summary["added"]["telop_patterns"], json!(1));
    assert_eq!(summary["added"]["assets"], json!(1));
    assert_eq!(summary["added"]["packs"], json!(0));

    let workbook: Value = serde_json::from_str(
        &fs::read_to_string(dir.path().join("books/workbook.json")).expect("workbook should exist"),
    )
    .expect("workbook should parse");
    let telop = &workbook["telop_patterns"]["telop_タイトル"];
    assert_eq!(telop["source"], json!("templates/telops/telop_タイトル.json"));
    assert_eq!(telop["overrides"], Value::Null);
    assert_eq!(workbook["assets"]["image_bg"]["path"], json!("media/bg.png"));
    assert_eq!(workbook["timeline"], json!([]));

    let template: Value = serde_json::from_str(
        &fs::read_to_string(dir.path().join("books/templates/telops/telop_タイトル.json"))
            .expect("telop template should exist"),
    )
    .expect("telop template should parse");
    assert_eq!(template["Text"], json!("タイトル"));
    assert!(template.get("Frame").is_none());
}
