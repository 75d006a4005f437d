//! Subtitle tokenization and tone detection.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

pub const TONE_QUESTION: &str = "質問調";
pub const TONE_EMPHASIS: &str = "強調";
pub const TONE_LINGER: &str = "余韻";

/// Source of keyword tokens and a single tone category per subtitle line.
pub trait LanguageAnalyzer {
    fn tokenize(&self, text: &str) -> Vec<String>;
    fn detect_tone(&self, text: &str) -> Option<String>;
}

impl<T: LanguageAnalyzer + ?Sized> LanguageAnalyzer for &T {
    fn tokenize(&self, text: &str) -> Vec<String> {
        (**self).tokenize(text)
    }

    fn detect_tone(&self, text: &str) -> Option<String> {
        (**self).detect_tone(text)
    }
}

fn word_pattern() -> &'static Regex {
    static WORD: OnceLock<Regex> = OnceLock::new();
    WORD.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9ぁ-んァ-ヶ一-龯ー]+").expect("word regex should compile")
    })
}

/// Lower-cased word runs of latin, digits, kana, and common kanji.
pub fn regex_tokens(text: &str) -> Vec<String> {
    word_pattern()
        .find_iter(text)
        .map(|word| word.as_str().to_lowercase())
        .collect()
}

/// Punctuation-based tone: question, then emphatic ending, then trailing ellipsis.
pub fn punctuation_tone(text: &str) -> Option<&'static str> {
    let stripped = text.trim();
    if stripped.is_empty() {
        return None;
    }
    if stripped.contains('?') || stripped.contains('？') {
        return Some(TONE_QUESTION);
    }
    if stripped.ends_with('!') || stripped.ends_with('！') {
        return Some(TONE_EMPHASIS);
    }
    if stripped.contains("...") || stripped.contains('…') {
        return Some(TONE_LINGER);
    }
    None
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RegexAnalyzer;

impl LanguageAnalyzer for RegexAnalyzer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        regex_tokens(text)
    }

    fn detect_tone(&self, text: &str) -> Option<String> {
        punctuation_tone(text).map(str::to_owned)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounts {
    pub hits: usize,
    pub misses: usize,
}

/// Memoizes an analyzer per input text for the lifetime of one build.
#[derive(Debug, Default)]
pub struct CachedAnalyzer<A> {
    inner: A,
    tokens: RefCell<HashMap<String, Vec<String>>>,
    tones: RefCell<HashMap<String, Option<String>>>,
    token_counts: Cell<CacheCounts>,
    tone_counts: Cell<CacheCounts>,
}

impl<A: LanguageAnalyzer> CachedAnalyzer<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            tokens: RefCell::default(),
            tones: RefCell::default(),
            token_counts: Cell::default(),
            tone_counts: Cell::default(),
        }
    }

    pub fn token_counts(&self) -> CacheCounts {
        self.token_counts.get()
    }

    pub fn tone_counts(&self) -> CacheCounts {
        self.tone_counts.get()
    }
}

fn record(counts: &Cell<CacheCounts>, hit: bool) {
    let mut current = counts.get();
    if hit {
        current.hits += 1;
    } else {
        current.misses += 1;
    }
    counts.set(current);
}

impl<A: LanguageAnalyzer> LanguageAnalyzer for CachedAnalyzer<A> {
    fn tokenize(&self, text: &str) -> Vec<String> {
        if let Some(tokens) = self.tokens.borrow().get(text) {
            record(&self.token_counts, true);
            return tokens.clone();
        }
        record(&self.token_counts, false);
        let tokens = self.inner.tokenize(text);
        self.tokens
            .borrow_mut()
            .insert(text.to_owned(), tokens.clone());
        tokens
    }

    fn detect_tone(&self, text: &str) -> Option<String> {
        if let Some(tone) = self.tones.borrow().get(text) {
            record(&self.tone_counts, true);
            return tone.clone();
        }
        record(&self.tone_counts, false);
        let tone = self.inner.detect_tone(text);
        self.tones.borrow_mut().insert(text.to_owned(), tone.clone());
        tone
    }
}
