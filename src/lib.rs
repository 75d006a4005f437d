//! Compiles subtitle timelines and template libraries into editor projects,
//! and learns which templates to propose from past builds.

pub mod absorb;
pub mod compiler;
pub mod config;
pub mod error_codes;
pub mod fx;
pub mod hira_shrink;
pub mod history;
pub mod language;
pub mod layers;
pub mod model;
pub mod packs;
pub mod project;
pub mod proposals;
pub mod tachie;
pub mod template;
pub mod timecode;
pub mod workbook;

pub use compiler::{build_project, BuildWarning, CompileOutput, ProjectBuilder};
pub use model::WorkbookData;
