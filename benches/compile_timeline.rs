//! Timeline compile benchmarks: cold build vs. a warmed proposal model.
//! Run: cargo bench

use std::collections::BTreeMap;

use autoedit::compiler::ProjectBuilder;
use autoedit::model::{Pack, TelopPattern, TimelineRow, WorkbookData};
use autoedit::project::default_scaffold;
use autoedit::proposals::{ProposalModel, SuggestContext};
use autoedit::timecode::Timecode;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

fn workbook(rows: usize) -> WorkbookData {
    let mut data = WorkbookData::default();
    data.telop_patterns.insert(
        "title".to_owned(),
        TelopPattern {
            pattern_id: "title".to_owned(),
            overrides: json!({ "$type": "TextItem", "Text": "", "FontSize": 64.0 }),
            ..TelopPattern::default()
        },
    );
    data.packs.insert(
        "intro".to_owned(),
        Pack {
            pack_id: "intro".to_owned(),
            overrides: json!([
                { "$type": "ShapeItem", "FrameOffset": 0, "LengthFrames": 45 },
                { "$type": "TextItem", "FrameOffset": 10, "LengthFrames": 10 }
            ]),
            ..Pack::default()
        },
    );
    data.timeline = (1..=rows)
        .map(|index| {
            let second = index as u32;
            TimelineRow {
                start: Some(Timecode::new(0, second / 60, second % 60, 0)),
                end: Some(Timecode::new(0, (second + 1) / 60, (second + 1) % 60, 0)),
                subtitle: Some(format!("line {index} はじまり")),
                telop: Some("title".to_owned()),
                packs: if index % 3 == 0 { vec!["intro".to_owned()] } else { Vec::new() },
                expressions: BTreeMap::new(),
                ..TimelineRow::new(index)
            }
        })
        .collect();
    data
}

fn bench_compile(c: &mut Criterion) {
    let data = workbook(500);

    let mut group = c.benchmark_group("compile_timeline");
    group.sample_size(30);

    group.bench_function("500_rows", |b| {
        b.iter(|| {
            let output = ProjectBuilder::new(&data)
                .build(default_scaffold())
                .expect("compile");
            black_box(output.project)
        });
    });

    let history = ProjectBuilder::new(&data)
        .build(default_scaffold())
        .expect("compile")
        .history;
    let mut model = ProposalModel::new();
    model.update_from_history(&history, None);
    group.bench_function("suggest_warm_model", |b| {
        b.iter(|| {
            black_box(model.suggest(
                Some("line 42 はじまり"),
                3,
                SuggestContext {
                    row_index: Some(42),
                    position: Some(42.0),
                },
                None,
            ))
        });
    });

    group.finish();
}

criterion_group!(benches, bench_compile);
criterion_main!(benches);
