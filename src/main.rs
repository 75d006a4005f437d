use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;

use autoedit::absorb::absorb_project_file;
use autoedit::compiler::ProjectBuilder;
use autoedit::config::{BuildConfig, ConfigOverrides};
use autoedit::error_codes::find_coded_error;
use autoedit::hira_shrink::{shrink_project_file, DEFAULT_SHRINK_SCALE};
use autoedit::history::{load_history_entries, summarize_warnings};
use autoedit::project::{default_scaffold, load_scaffold, write_outputs, OutputOptions};
use autoedit::proposals::{proposal_model_path, ProposalModel, SuggestContext};
use autoedit::workbook::load_workbook;

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("AUTOEDIT_GIT_HASH"), ")");

#[derive(Debug, Parser)]
#[command(name = "autoedit")]
#[command(about = "Subtitle timeline compiler with template proposals")]
#[command(version = VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Compile a workbook into out.ymmp, report.json, history, and the proposal model.
    Build {
        #[arg(long)]
        workbook: PathBuf,
        #[arg(long)]
        scaffold: Option<PathBuf>,
        #[arg(long, default_value = "out")]
        out: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        fps: Option<f64>,
        #[arg(long)]
        band_width: Option<i64>,
        #[arg(long)]
        model: Option<PathBuf>,
    },
    /// Rank template candidates for a subtitle line.
    Suggest {
        #[arg(long)]
        model: PathBuf,
        #[arg(long)]
        subtitle: String,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        row: Option<usize>,
        #[arg(long)]
        position: Option<f64>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Replay history logs into the proposal model.
    Learn {
        #[arg(long)]
        history: PathBuf,
        #[arg(long)]
        model: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Summarize warnings recorded in history logs.
    Warnings {
        #[arg(long)]
        history: PathBuf,
        #[arg(long)]
        latest: bool,
    },
    /// Harvest templates from an editor project into a workbook.
    Absorb {
        #[arg(long)]
        ymmp: PathBuf,
        #[arg(long)]
        workbook: PathBuf,
    },
    /// Post-process a written project.
    Filter {
        #[command(subcommand)]
        filter: FilterCommands,
    },
}

#[derive(Debug, Subcommand)]
enum FilterCommands {
    /// Shrink hiragana-heavy text items.
    HiraShrink {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = DEFAULT_SHRINK_SCALE)]
        scale: f64,
    },
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            report_error(&error);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn report_error(error: &anyhow::Error) {
    match find_coded_error(error) {
        Some(coded) => match serde_json::to_string_pretty(&coded.envelope()) {
            Ok(envelope) => eprintln!("{envelope}"),
            Err(_) => eprintln!("{coded}"),
        },
        None => eprintln!("error: {error:#}"),
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Build {
            workbook,
            scaffold,
            out,
            config,
            fps,
            band_width,
            model,
        } => {
            let overrides = ConfigOverrides {
                fps,
                band_width,
                scaffold,
                model_path: model,
            };
            let config = BuildConfig::resolve(config.as_deref(), &overrides)?;
            run_build(&workbook, &out, &config)
        }
        Commands::Suggest {
            model,
            subtitle,
            limit,
            row,
            position,
            config,
        } => {
            let config = BuildConfig::resolve(config.as_deref(), &ConfigOverrides::default())?;
            let context = SuggestContext {
                row_index: row,
                position,
            };
            run_suggest(&model, &subtitle, limit.unwrap_or(config.suggest_limit), context)
        }
        Commands::Learn {
            history,
            model,
            config,
        } => {
            let config = BuildConfig::resolve(config.as_deref(), &ConfigOverrides::default())?;
            run_learn(&history, &model, config.max_processed)
        }
        Commands::Warnings { history, latest } => run_warnings(&history, latest),
        Commands::Absorb { ymmp, workbook } => {
            let summary = absorb_project_file(&ymmp, &workbook)?;
            println!(
                "{}",
                json!({ "ok": true, "workbook": workbook.display().to_string(), "added": summary })
            );
            Ok(())
        }
        Commands::Filter {
            filter: FilterCommands::HiraShrink { input, out, scale },
        } => {
            let changed = shrink_project_file(&input, &out, scale)?;
            println!("{}", json!({ "ok": true, "output": out.display().to_string(), "items": changed }));
            Ok(())
        }
    }
}

fn run_build(workbook_path: &Path, out_dir: &Path, config: &BuildConfig) -> Result<()> {
    let data = load_workbook(workbook_path)?;
    let scaffold = match &config.scaffold {
        Some(path) => load_scaffold(path)?,
        None => default_scaffold(),
    };
    let output = ProjectBuilder::new(&data)
        .with_fps(config.fps)
        .with_band_width(config.band_width)
        .build(scaffold)?;
    let written = write_outputs(
        output,
        out_dir,
        &OutputOptions {
            model_path: config.model_path.clone(),
            max_processed: config.max_processed,
        },
    )?;
    println!(
        "{}",
        json!({
            "ok": true,
            "project": written.project.display().to_string(),
            "report": written.report.display().to_string(),
            "warnings": written.build_report.warnings.len(),
        })
    );
    Ok(())
}

fn run_suggest(model_path: &Path, subtitle: &str, limit: usize, context: SuggestContext) -> Result<()> {
    let model = ProposalModel::load(&proposal_model_path(model_path));
    let suggestions = model.suggest(Some(subtitle), limit, context, None);
    println!("{}", serde_json::to_string_pretty(&suggestions.items)?);
    Ok(())
}

fn run_learn(history_path: &Path, model_path: &Path, max_processed: usize) -> Result<()> {
    let loaded = load_history_entries(history_path, false);
    for error in &loaded.errors {
        eprintln!("warning: {error}");
    }
    let model_path = proposal_model_path(model_path);
    let mut model = ProposalModel::load(&model_path).with_max_processed(max_processed);
    let changed = model.update_from_history(&loaded.entries, None);
    if changed {
        model.save(&model_path)?;
    }
    info!(entries = loaded.entries.len(), changed, "replayed history");
    println!(
        "{}",
        json!({
            "ok": true,
            "entries": loaded.entries.len(),
            "changed": changed,
            "model": model_path.display().to_string(),
        })
    );
    Ok(())
}

fn run_warnings(history_path: &Path, latest: bool) -> Result<()> {
    let loaded = load_history_entries(history_path, latest);
    for error in &loaded.errors {
        eprintln!("warning: {error}");
    }
    let summary = summarize_warnings(&loaded.entries);
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
