pub mod rules;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::AnalyzeError;

/// Result of an external analysis pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub score: f64,
    pub summary: String,
}

/// Optional AI-backed analyzer consulted after the rule pass.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, text: &str, keywords: &BTreeSet<String>) -> Result<Analysis, AnalyzeError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    /// Always within [0, 1].
    pub score: f64,
    pub matched_keywords: BTreeSet<String>,
    pub summary: String,
    /// True when the score and summary came from the analyzer.
    pub enhanced: bool,
}

/// Scores candidate changes. Rules always run; an analyzer, when present and
/// healthy, refines the score and summary.
pub struct SignificanceScorer {
    analyzer: Option<Arc<dyn Analyzer>>,
    timeout: Duration,
}

impl SignificanceScorer {
    pub fn new(analyzer: Option<Arc<dyn Analyzer>>, timeout: Duration) -> Self {
        Self { analyzer, timeout }
    }

    #[cfg(test)]
    pub fn rules_only() -> Self {
        Self::new(None, Duration::from_secs(30))
    }

    pub fn has_analyzer(&self) -> bool {
        self.analyzer.is_some()
    }

    pub async fn score(&self, text: &str, keywords: &BTreeSet<String>) -> Assessment {
        let base = rules::assess(text, keywords);

        let Some(analyzer) = &self.analyzer else {
            return base;
        };
        // Nothing the target cares about is in the text; skip the paid pass.
        if !keywords.is_empty() && base.matched_keywords.is_empty() {
            return base;
        }

        let outcome = match tokio::time::timeout(self.timeout, analyzer.analyze(text, keywords)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AnalyzeError::Timeout(self.timeout)),
        };
        match outcome {
            Ok(analysis) if analysis.score.is_finite() => {
                debug!(rule_score = base.score, ai_score = analysis.score, "analyzer refined score");
                Assessment {
                    score: analysis.score.clamp(0.0, 1.0),
                    matched_keywords: base.matched_keywords,
                    summary: analysis.summary,
                    enhanced: true,
                }
            }
            Ok(analysis) => {
                warn!(score = analysis.score, "analyzer returned a non-finite score, using rules");
                base
            }
            Err(e) => {
                warn!("analyzer unavailable, using rules: {}", e);
                base
            }
        }
    }
}
