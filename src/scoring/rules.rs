//! Deterministic rule-based significance scoring.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use super::Assessment;

/// Significance phrases by category. Each distinct phrase found counts once.
pub const NOVELTY_PHRASES: &[&str] = &["breakthrough", "new", "announce", "release", "update", "launch"];
pub const RESEARCH_PHRASES: &[&str] = &["research", "discovery", "findings", "results", "paper"];
pub const BUSINESS_PHRASES: &[&str] = &["acquisition", "merger", "funding", "partnership"];

const LONG_CONTENT_CHARS: usize = 1_000;
const VERY_LONG_CONTENT_CHARS: usize = 5_000;

const LONG_CONTENT_SCORE: f64 = 0.2;
const VERY_LONG_CONTENT_SCORE: f64 = 0.1;
const KEYWORD_SCORE: f64 = 0.15;
const PHRASE_SCORE: f64 = 0.05;
const PHRASE_CAP: f64 = 0.3;
const NUMERIC_SCORE: f64 = 0.02;
const NUMERIC_CAP: f64 = 0.1;

/// Currency amounts, percentages and decimal numbers, leftmost alternative wins.
static NUMERIC_SIGNAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[$€£¥]\s?\d[\d,]*(?:\.\d+)?|\d+(?:\.\d+)?\s?%|\d+\.\d+")
        .expect("numeric signal pattern is valid")
});

/// Per-term breakdown of a rule-based score.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleBreakdown {
    pub length: f64,
    pub keywords: f64,
    pub phrases: f64,
    pub statistics: f64,
    pub matched_keywords: BTreeSet<String>,
    /// Matched keywords counted case-insensitively.
    pub distinct_keywords: usize,
    pub matched_phrases: Vec<&'static str>,
    pub numeric_signals: usize,
}

impl RuleBreakdown {
    pub fn total(&self) -> f64 {
        (self.length + self.keywords + self.phrases + self.statistics).clamp(0.0, 1.0)
    }
}

pub fn breakdown(text: &str, keywords: &BTreeSet<String>) -> RuleBreakdown {
    let lower = text.to_lowercase();
    let char_len = text.chars().count();

    let mut length = 0.0;
    if char_len > LONG_CONTENT_CHARS {
        length += LONG_CONTENT_SCORE;
    }
    if char_len > VERY_LONG_CONTENT_CHARS {
        length += VERY_LONG_CONTENT_SCORE;
    }

    let matched_keywords: BTreeSet<String> = keywords
        .iter()
        .filter(|k| !k.is_empty() && lower.contains(&k.to_lowercase()))
        .cloned()
        .collect();
    // Keywords differing only by case are one keyword.
    let distinct_matches = matched_keywords
        .iter()
        .map(|k| k.to_lowercase())
        .collect::<BTreeSet<_>>()
        .len();
    let keyword_score = distinct_matches as f64 * KEYWORD_SCORE;

    let matched_phrases: Vec<&'static str> = NOVELTY_PHRASES
        .iter()
        .chain(RESEARCH_PHRASES)
        .chain(BUSINESS_PHRASES)
        .copied()
        .filter(|p| lower.contains(p))
        .collect();
    let phrases = (matched_phrases.len() as f64 * PHRASE_SCORE).min(PHRASE_CAP);

    let numeric_signals = NUMERIC_SIGNAL.find_iter(text).count();
    let statistics = (numeric_signals as f64 * NUMERIC_SCORE).min(NUMERIC_CAP);

    RuleBreakdown {
        length,
        keywords: keyword_score,
        phrases,
        statistics,
        matched_keywords,
        distinct_keywords: distinct_matches,
        matched_phrases,
        numeric_signals,
    }
}

/// Score `text` against `keywords` with the rule set alone.
pub fn assess(text: &str, keywords: &BTreeSet<String>) -> Assessment {
    let rules = breakdown(text, keywords);
    Assessment {
        score: rules.total(),
        summary: format!(
            "Rule-based analysis: {} matched keywords, {} significance phrases, {} numeric signals",
            rules.distinct_keywords,
            rules.matched_phrases.len(),
            rules.numeric_signals
        ),
        matched_keywords: rules.matched_keywords,
        enhanced: false,
    }
}
