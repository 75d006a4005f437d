//! Keyword-driven proposal statistics learned from build history.
//!
//! Every subtitle token (plus a global token) keeps win/loss counts per
//! category and identifier. Suggestions sum the stats of the query's tokens
//! and rank by net approvals with a confidence bonus.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::history::{history_timestamp, HistoryEntry};
use crate::language::{regex_tokens, LanguageAnalyzer};

pub const GLOBAL_TOKEN: &str = "__global__";
pub const CATEGORIES: [&str; 4] = ["telop", "pack", "asset", "fx"];
pub const DEFAULT_MAX_PROCESSED: usize = 5000;
pub const DEFAULT_SUGGEST_LIMIT: usize = 3;
pub const MODEL_DIR: &str = "ai";
pub const MODEL_FILE: &str = "proposal_model.json";
const MODEL_VERSION: u32 = 1;

/// Position gap (seconds) below which a candidate is suppressed.
const POSITION_WINDOW: f64 = 30.0;
const POSITION_FLOOR: f64 = 0.2;
/// Row gap at or below which a candidate is suppressed.
const ROW_WINDOW: f64 = 3.0;
const ROW_FLOOR: f64 = 0.3;

const APPROVAL_POSITIVE: [&str; 9] = ["true", "1", "yes", "y", "approved", "ok", "承認", "採用", "可"];
const APPROVAL_NEGATIVE: [&str; 8] = ["false", "0", "no", "n", "rejected", "却下", "不採用", "否"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemStats {
    #[serde(default)]
    pub wins: u64,
    #[serde(default)]
    pub losses: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub last_seen: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_row_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_position: Option<f64>,
}

impl ItemStats {
    /// `(wins - losses) + wins / total`; zero when nothing was recorded.
    pub fn base_score(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let wins = self.wins as f64;
        (wins - self.losses as f64) + wins / self.total as f64
    }

    fn observe(&mut self, approved: Option<bool>, timestamp: &str, row_index: usize, position: Option<f64>) {
        self.total += 1;
        match approved {
            Some(true) => self.wins += 1,
            Some(false) => self.losses += 1,
            None => {}
        }
        self.absorb_recency(
            Some(timestamp).filter(|stamp| !stamp.is_empty()),
            Some(row_index),
            position,
        );
    }

    fn absorb(&mut self, other: &ItemStats) {
        self.wins += other.wins;
        self.losses += other.losses;
        self.total += other.total;
        self.absorb_recency(other.last_seen.as_deref(), other.last_row_index, other.last_position);
    }

    /// Recency fields only ever move forward.
    fn absorb_recency(&mut self, seen: Option<&str>, row_index: Option<usize>, position: Option<f64>) {
        if let Some(seen) = seen {
            if is_later(seen, self.last_seen.as_deref()) {
                self.last_seen = Some(seen.to_owned());
            }
        }
        if let Some(row_index) = row_index {
            if self.last_row_index.map_or(true, |current| row_index > current) {
                self.last_row_index = Some(row_index);
            }
        }
        if let Some(position) = position {
            if self.last_position.map_or(true, |current| position > current) {
                self.last_position = Some(position);
            }
        }
    }
}

/// token -> category -> identifier -> stats
pub type KeywordStats = BTreeMap<String, BTreeMap<String, BTreeMap<String, ItemStats>>>;

/// Where the caller is in the timeline when asking for suggestions.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SuggestContext {
    pub row_index: Option<usize>,
    pub position: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedCandidate {
    pub identifier: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProposalSuggestions {
    pub items: BTreeMap<String, Vec<RankedCandidate>>,
}

impl ProposalSuggestions {
    pub fn top(&self, category: &str, limit: usize) -> Vec<&str> {
        self.items
            .get(category)
            .map(|ranked| {
                ranked
                    .iter()
                    .take(limit)
                    .map(|candidate| candidate.identifier.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_data(&self) -> bool {
        self.items.values().any(|ranked| !ranked.is_empty())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ModelDocument {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    keywords: KeywordStats,
    #[serde(default)]
    processed: Vec<String>,
}

fn default_version() -> u32 {
    MODEL_VERSION
}

#[derive(Debug, Clone)]
pub struct ProposalModel {
    version: u32,
    stats: KeywordStats,
    processed_order: VecDeque<String>,
    processed: HashSet<String>,
    max_processed: usize,
}

impl Default for ProposalModel {
    fn default() -> Self {
        Self {
            version: MODEL_VERSION,
            stats: KeywordStats::new(),
            processed_order: VecDeque::new(),
            processed: HashSet::new(),
            max_processed: DEFAULT_MAX_PROCESSED,
        }
    }
}

impl ProposalModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_processed(mut self, max_processed: usize) -> Self {
        self.max_processed = max_processed.max(1);
        self.trim_processed();
        self
    }

    pub fn stats(&self) -> &KeywordStats {
        &self.stats
    }

    pub fn item_stats(&self, token: &str, category: &str, identifier: &str) -> Option<&ItemStats> {
        self.stats.get(token)?.get(category)?.get(identifier)
    }

    pub fn processed_len(&self) -> usize {
        self.processed_order.len()
    }

    pub fn is_processed(&self, entry_id: &str) -> bool {
        self.processed.contains(entry_id)
    }

    /// Loads `path`, or starts empty when it is missing or unreadable.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        let document = fs::read_to_string(path)
            .with_context(|| format!("failed to read proposal model {}", path.display()))
            .and_then(|text| {
                serde_json::from_str::<ModelDocument>(&text)
                    .with_context(|| format!("failed to parse proposal model {}", path.display()))
            });
        match document {
            Ok(document) => {
                let mut model = Self {
                    version: document.version,
                    stats: document.keywords,
                    ..Self::default()
                };
                for entry_id in document.processed {
                    model.register_processed(entry_id);
                }
                model
            }
            Err(error) => {
                warn!(error = %format!("{error:#}"), "starting with an empty proposal model");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create model directory {}", parent.display()))?;
        }
        let document = ModelDocument {
            version: self.version,
            updated_at: Some(history_timestamp()),
            keywords: self.stats.clone(),
            processed: self.processed_order.iter().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&document)
            .context("failed to serialize proposal model")?;
        fs::write(path, format!("{json}\n"))
            .with_context(|| format!("failed to write proposal model {}", path.display()))?;
        info!(path = %path.display(), keywords = self.stats.len(), "saved proposal model");
        Ok(())
    }

    /// Learns from entries not seen before. Returns whether any stats changed.
    pub fn update_from_history(
        &mut self,
        entries: &[HistoryEntry],
        analyzer: Option<&dyn LanguageAnalyzer>,
    ) -> bool {
        let mut changed = false;
        for entry in entries {
            let entry_id = entry_id(entry);
            if self.processed.contains(&entry_id) {
                continue;
            }
            let mut tokens = tokenize(entry.subtitle.as_deref(), analyzer);
            tokens.push(GLOBAL_TOKEN.to_owned());
            let approved = entry.approval().and_then(normalize_approval);

            let mut recorded = false;
            for (category, identifiers) in referenced_identifiers(entry) {
                for identifier in identifiers {
                    for token in &tokens {
                        self.stats
                            .entry(token.clone())
                            .or_default()
                            .entry(category.to_owned())
                            .or_default()
                            .entry(identifier.clone())
                            .or_default()
                            .observe(approved, &entry.timestamp, entry.row_index, entry.position());
                        recorded = true;
                    }
                }
            }

            if recorded {
                changed = true;
                self.register_processed(entry_id);
            }
        }
        debug!(changed, entries = entries.len(), "updated proposal model");
        changed
    }

    /// Ranked candidates per category for `subtitle`.
    pub fn suggest(
        &self,
        subtitle: Option<&str>,
        limit: usize,
        context: SuggestContext,
        analyzer: Option<&dyn LanguageAnalyzer>,
    ) -> ProposalSuggestions {
        let mut tokens = tokenize(subtitle, analyzer);
        tokens.push(GLOBAL_TOKEN.to_owned());

        let mut suggestions = ProposalSuggestions::default();
        for category in CATEGORIES {
            let candidates = self.collect_candidates(&tokens, category);
            let ranked = rank_candidates(candidates, limit, context);
            if !ranked.is_empty() {
                suggestions.items.insert(category.to_owned(), ranked);
            }
        }
        suggestions
    }

    fn collect_candidates(&self, tokens: &[String], category: &str) -> BTreeMap<String, ItemStats> {
        let mut aggregated: BTreeMap<String, ItemStats> = BTreeMap::new();
        for token in tokens {
            let Some(by_identifier) = self.stats.get(token).and_then(|c| c.get(category)) else {
                continue;
            };
            for (identifier, stats) in by_identifier {
                aggregated.entry(identifier.clone()).or_default().absorb(stats);
            }
        }
        aggregated
    }

    fn register_processed(&mut self, entry_id: String) {
        if !self.processed.insert(entry_id.clone()) {
            return;
        }
        self.processed_order.push_back(entry_id);
        self.trim_processed();
    }

    fn trim_processed(&mut self) {
        while self.processed_order.len() > self.max_processed {
            if let Some(oldest) = self.processed_order.pop_front() {
                self.processed.remove(&oldest);
            }
        }
    }
}

/// `timestamp|row_index|telop`
pub fn entry_id(entry: &HistoryEntry) -> String {
    format!(
        "{}|{}|{}",
        entry.timestamp,
        entry.row_index,
        entry.telop.as_deref().unwrap_or("")
    )
}

fn referenced_identifiers(entry: &HistoryEntry) -> [(&'static str, Vec<String>); 4] {
    let telop = entry.telop.iter().filter_map(|id| normalize_identifier(id)).collect();
    let packs = entry.packs.iter().filter_map(|id| normalize_identifier(id)).collect();
    let assets = entry
        .objects
        .iter()
        .filter_map(|object| {
            object
                .resolved_asset
                .as_deref()
                .and_then(normalize_identifier)
                .or_else(|| normalize_identifier(&object.identifier))
        })
        .collect();
    let fx = entry
        .fx
        .iter()
        .filter_map(|fx| normalize_identifier(&fx.fx_id))
        .collect();
    [("telop", telop), ("pack", packs), ("asset", assets), ("fx", fx)]
}

fn normalize_identifier(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

/// Analyzer tokens, else regex words, else the trimmed text itself.
pub fn tokenize(text: Option<&str>, analyzer: Option<&dyn LanguageAnalyzer>) -> Vec<String> {
    let Some(text) = text.filter(|text| !text.is_empty()) else {
        return Vec::new();
    };
    let mut tokens = analyzer.map(|a| a.tokenize(text)).unwrap_or_default();
    if tokens.is_empty() {
        tokens = regex_tokens(text);
    }
    if tokens.is_empty() {
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            tokens.push(trimmed.to_owned());
        }
    }
    let mut seen = HashSet::new();
    tokens.retain(|token| seen.insert(token.clone()));
    tokens
}

pub fn normalize_approval(value: &Value) -> Option<bool> {
    let text = match value {
        Value::Bool(flag) => return Some(*flag),
        Value::Number(number) => number.to_string(),
        Value::String(text) => text.trim().to_lowercase(),
        _ => return None,
    };
    if APPROVAL_POSITIVE.contains(&text.as_str()) {
        Some(true)
    } else if APPROVAL_NEGATIVE.contains(&text.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// Suppresses candidates used close to the queried position or row.
pub fn context_weight(stats: &ItemStats, context: SuggestContext) -> f64 {
    let mut weight = 1.0;
    if let (Some(stored), Some(query)) = (stats.last_position, context.position) {
        let gap = (stored - query).abs();
        if gap < POSITION_WINDOW {
            weight *= (gap / POSITION_WINDOW).max(POSITION_FLOOR);
        }
    }
    if let (Some(stored), Some(query)) = (stats.last_row_index, context.row_index) {
        let gap = stored.abs_diff(query) as f64;
        if gap <= ROW_WINDOW {
            weight *= (gap / ROW_WINDOW).max(ROW_FLOOR);
        }
    }
    weight
}

fn rank_candidates(
    candidates: BTreeMap<String, ItemStats>,
    limit: usize,
    context: SuggestContext,
) -> Vec<RankedCandidate> {
    let mut scored = candidates
        .into_iter()
        .map(|(identifier, stats)| {
            let base = stats.base_score();
            let adjusted = base * context_weight(&stats, context);
            (identifier, stats, base, adjusted)
        })
        .collect::<Vec<_>>();

    scored.sort_by(|a, b| {
        let (a_id, a_stats, a_base, a_adjusted) = a;
        let (b_id, b_stats, b_base, b_adjusted) = b;
        b_adjusted
            .total_cmp(a_adjusted)
            .then_with(|| b_base.total_cmp(a_base))
            .then_with(|| b_stats.wins.cmp(&a_stats.wins))
            .then_with(|| a_stats.losses.cmp(&b_stats.losses))
            .then_with(|| compare_seen(b_stats.last_seen.as_deref(), a_stats.last_seen.as_deref()))
            .then_with(|| b_id.cmp(a_id))
    });

    scored
        .into_iter()
        .filter(|(_, _, _, adjusted)| *adjusted > 0.0)
        .take(limit)
        .map(|(identifier, _, _, adjusted)| RankedCandidate {
            identifier,
            score: (adjusted * 10_000.0).round() / 10_000.0,
        })
        .collect()
}

fn timestamp_seconds(raw: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|parsed| parsed.timestamp())
}

fn compare_seen(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => match (timestamp_seconds(a), timestamp_seconds(b)) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => a.cmp(b),
        },
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

fn is_later(candidate: &str, current: Option<&str>) -> bool {
    compare_seen(Some(candidate), current) == Ordering::Greater
}

pub fn proposal_model_path(base: &Path) -> PathBuf {
    if base.is_dir() {
        base.join(MODEL_DIR).join(MODEL_FILE)
    } else {
        base.to_path_buf()
    }
}

/// Loads the model under `base`, learns from `history`, and saves on change.
///
/// `base` is an output directory (model at `ai/proposal_model.json`) or the
/// model file itself. Returns the model path when a model exists afterwards.
pub fn update_proposal_model(
    history: &[HistoryEntry],
    base: &Path,
    max_processed: usize,
) -> Result<Option<PathBuf>> {
    if history.is_empty() {
        return Ok(None);
    }
    let model_path = proposal_model_path(base);
    let mut model = ProposalModel::load(&model_path).with_max_processed(max_processed);
    if model.update_from_history(history, None) {
        model.save(&model_path)?;
        return Ok(Some(model_path));
    }
    Ok(model_path.exists().then_some(model_path))
}
