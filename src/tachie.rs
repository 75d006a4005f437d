//! Character overlay ("tachie") part resolution.
//!
//! A character part is configured as a base path pattern such as
//! `chars/reimu/eyes/{expression}.png` or a plain directory. Resolving an
//! expression id walks an ordered candidate list and returns the first file
//! that exists, together with every path it tried.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde_json::{json, Value};

pub const TACHIE_ALLOWED_EXTENSIONS: [&str; 5] = ["png", "webp", "jpg", "jpeg", "avif"];
pub const TACHIE_FALLBACK_NAMES: [&str; 5] = ["default", "base", "normal", "通常", "ノーマル"];
const EXPRESSION_PLACEHOLDERS: [&str; 3] = ["{expression}", "{expr}", "{name}"];

const TACHIE_PARTS: [(&str, &str); 9] = [
    ("目", "Eye"),
    ("口", "Mouth"),
    ("眉", "Eyebrow"),
    ("髪", "Hair"),
    ("体", "Body"),
    ("顔色", "Complexion"),
    ("他1", "Etc1"),
    ("他2", "Etc2"),
    ("他3", "Etc3"),
];

/// Item parameter key for a part name, accepting either spelling.
pub fn tachie_part_key(part: &str) -> Option<&'static str> {
    let part = part.trim();
    TACHIE_PARTS
        .iter()
        .find(|(local, key)| *local == part || *key == part)
        .map(|(_, key)| *key)
}

/// Base item every character overlay is cloned from.
pub fn tachie_item_template() -> &'static Value {
    static TEMPLATE: OnceLock<Value> = OnceLock::new();
    TEMPLATE.get_or_init(|| {
        json!({
            "$type": "YukkuriMovieMaker.Project.Items.TachieItem, YukkuriMovieMaker",
            "CharacterName": "",
            "TachieItemParameter": {
                "$type": "YukkuriMovieMaker.Plugin.Tachie.AnimationTachie.ItemParameter, YukkuriMovieMaker.Plugin.Tachie.AnimationTachie"
            },
            "X": 0.0,
            "Y": 150.0,
            "Zoom": 80.0,
            "Opacity": 100.0,
            "Rotation": 0.0,
            "Blend": "Normal",
            "Layer": 70,
            "Frame": 0,
            "Length": 300
        })
    })
}

/// Attempts reported in warnings are capped to the last few.
pub const REPORTED_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TachieResolution {
    pub path: Option<PathBuf>,
    pub used_fallback: bool,
    pub attempts: Vec<PathBuf>,
}

impl TachieResolution {
    fn not_found(attempts: Vec<PathBuf>) -> Self {
        Self {
            path: None,
            used_fallback: false,
            attempts,
        }
    }

    /// Distinct file names of the last [`REPORTED_ATTEMPTS`] attempts.
    pub fn reported_attempts(&self) -> Vec<String> {
        let start = self.attempts.len().saturating_sub(REPORTED_ATTEMPTS);
        let mut names: Vec<String> = Vec::new();
        for attempt in &self.attempts[start..] {
            let Some(name) = attempt.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if !names.iter().any(|existing| existing == name) {
                names.push(name.to_owned());
            }
        }
        names
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    path: PathBuf,
    fallback: bool,
}

impl Candidate {
    fn direct(path: PathBuf) -> Self {
        Self {
            path,
            fallback: false,
        }
    }
}

/// Outcome of one part lookup through [`TachieResolver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TachieOutcome {
    Resolved { path: PathBuf, used_fallback: bool },
    /// Nothing matched; the last good path for this character part is reused.
    Reused { path: PathBuf, attempts: Vec<String> },
    Missing { attempts: Vec<String> },
}

/// Memoizing front of [`resolve_expression_path`], owned by one build.
#[derive(Debug, Default)]
pub struct TachieResolver {
    resolutions: HashMap<(String, String), TachieResolution>,
    last_known_good: HashMap<(String, String), PathBuf>,
    probes: usize,
}

impl TachieResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of uncached resolutions, i.e. filesystem probing passes.
    pub fn probe_count(&self) -> usize {
        self.probes
    }

    pub fn resolve(&mut self, base_pattern: &str, expression: &str) -> &TachieResolution {
        let key = (base_pattern.to_owned(), expression.to_owned());
        let probes = &mut self.probes;
        self.resolutions.entry(key).or_insert_with(|| {
            *probes += 1;
            resolve_expression_path(base_pattern, expression)
        })
    }

    pub fn resolve_part(
        &mut self,
        character: &str,
        part: &str,
        base_pattern: &str,
        expression: &str,
    ) -> TachieOutcome {
        let resolution = self.resolve(base_pattern, expression).clone();
        let part_key = (character.to_owned(), part.to_owned());

        if let Some(path) = resolution.path.clone() {
            self.last_known_good.insert(part_key, path.clone());
            return TachieOutcome::Resolved {
                path,
                used_fallback: resolution.used_fallback,
            };
        }

        let attempts = resolution.reported_attempts();
        match self.last_known_good.get(&part_key) {
            Some(path) => TachieOutcome::Reused {
                path: path.clone(),
                attempts,
            },
            None => TachieOutcome::Missing { attempts },
        }
    }
}

/// Uncached lookup of `expression` against `base_pattern`.
pub fn resolve_expression_path(base_pattern: &str, expression: &str) -> TachieResolution {
    let expression = expression.trim();
    if expression.is_empty() {
        return TachieResolution::not_found(Vec::new());
    }

    let formatted = substitute_expression(base_pattern, expression);
    let mut patterns: Vec<&str> = Vec::with_capacity(2);
    for pattern in [formatted.as_str(), base_pattern] {
        if !pattern.is_empty() && !patterns.contains(&pattern) {
            patterns.push(pattern);
        }
    }

    let mut direct: Vec<PathBuf> = Vec::new();
    let mut roots: Vec<PathBuf> = Vec::new();
    for pattern in patterns {
        let candidate = loose_resolve(Path::new(pattern));
        if candidate.is_file() {
            return TachieResolution {
                path: Some(candidate.clone()),
                used_fallback: false,
                attempts: vec![candidate],
            };
        }
        let root = if candidate.extension().is_some() && !candidate.is_dir() {
            let parent = candidate.parent().map(Path::to_path_buf);
            direct.push(candidate);
            parent
        } else {
            Some(candidate)
        };
        if let Some(root) = root {
            if !roots.contains(&root) {
                roots.push(root);
            }
        }
    }

    let variants = expression_variants(expression);
    let mut candidates: Vec<Candidate> = direct.into_iter().map(Candidate::direct).collect();
    for root in &roots {
        if root.is_file() {
            candidates.push(Candidate::direct(root.clone()));
            continue;
        }
        for variant in &variants {
            push_named_candidates(&mut candidates, root, variant, false);
        }
        for fallback in TACHIE_FALLBACK_NAMES {
            push_named_candidates(&mut candidates, root, fallback, true);
        }
    }
    first_existing(candidates)
}

fn first_existing(candidates: Vec<Candidate>) -> TachieResolution {
    let mut attempts = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let exists = candidate.path.exists();
        attempts.push(candidate.path.clone());
        if exists {
            return TachieResolution {
                path: Some(candidate.path),
                used_fallback: candidate.fallback,
                attempts,
            };
        }
    }
    TachieResolution::not_found(attempts)
}

fn push_named_candidates(out: &mut Vec<Candidate>, root: &Path, name: &str, fallback: bool) {
    if Path::new(name).extension().is_some() {
        out.push(Candidate {
            path: loose_resolve(&root.join(name)),
            fallback,
        });
        return;
    }
    for extension in TACHIE_ALLOWED_EXTENSIONS {
        out.push(Candidate {
            path: loose_resolve(&root.join(format!("{name}.{extension}"))),
            fallback,
        });
    }
}

fn expression_variants(expression: &str) -> Vec<String> {
    let mut variants = vec![expression.to_owned()];
    if !expression.contains('.') {
        for variant in [expression.to_lowercase(), expression.replace(' ', "_")] {
            if !variants.contains(&variant) {
                variants.push(variant);
            }
        }
    }
    variants
}

fn substitute_expression(pattern: &str, expression: &str) -> String {
    EXPRESSION_PLACEHOLDERS
        .iter()
        .fold(pattern.to_owned(), |acc, placeholder| {
            acc.replace(placeholder, expression)
        })
}

fn loose_resolve(path: &Path) -> PathBuf {
    let expanded = expand_home(path);
    fs::canonicalize(&expanded).unwrap_or(expanded)
}

fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}
