//! Time-window aggregation of findings into a [`Report`].

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::warn;

use crate::error::{AnalyzeError, PersistenceError};
use crate::store::types::Finding;
use crate::store::MonitorStore;
use crate::targets::types::{MonitoringType, Priority};
use crate::targets::TargetRegistry;

pub const HIGH_SIGNIFICANCE: f64 = 0.7;
pub const TOP_FINDINGS: usize = 10;
pub const TRENDING_KEYWORDS: usize = 5;
pub const EMPTY_NARRATIVE: &str = "No significant findings in the specified time period.";

/// Start of a window ending at `now`. Windows reaching past chrono's range
/// cover everything.
pub fn window_start(now: DateTime<Utc>, window_hours: u32) -> DateTime<Utc> {
    now.checked_sub_signed(TimeDelta::hours(i64::from(window_hours)))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Compact view of a report handed to a [`Narrator`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportDigest {
    pub window_hours: u32,
    pub total_findings: usize,
    pub active_targets: usize,
    pub average_significance: f64,
    pub high_significance: usize,
    pub top_findings: Vec<DigestEntry>,
    pub trending_keywords: Vec<(String, usize)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DigestEntry {
    pub title: String,
    pub significance: f64,
    pub summary: String,
    pub keywords: BTreeSet<String>,
}

/// Writes the prose part of a report.
#[async_trait]
pub trait Narrator: Send + Sync {
    async fn narrate(&self, digest: &ReportDigest) -> Result<String, AnalyzeError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetSection {
    pub target_id: String,
    /// `None` once the target has been removed.
    pub target: Option<String>,
    pub monitoring_type: Option<MonitoringType>,
    pub priority: Option<Priority>,
    /// Most recent first.
    pub findings: Vec<Finding>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub generated_at: DateTime<Utc>,
    pub window_hours: u32,
    pub total_findings: usize,
    pub active_targets: usize,
    pub average_significance: f64,
    pub high_significance: usize,
    pub top_findings: Vec<Finding>,
    pub trending_keywords: Vec<(String, usize)>,
    pub by_target: Vec<TargetSection>,
    pub narrative: String,
    /// True when the narrative came from the narrator.
    pub narrated: bool,
}

impl Report {
    pub fn is_empty(&self) -> bool {
        self.total_findings == 0
    }

    pub fn digest(&self) -> ReportDigest {
        ReportDigest {
            window_hours: self.window_hours,
            total_findings: self.total_findings,
            active_targets: self.active_targets,
            average_significance: self.average_significance,
            high_significance: self.high_significance,
            top_findings: self
                .top_findings
                .iter()
                .map(|f| DigestEntry {
                    title: f.title.clone(),
                    significance: f.significance,
                    summary: f.summary.clone(),
                    keywords: f.matched_keywords.clone(),
                })
                .collect(),
            trending_keywords: self.trending_keywords.clone(),
        }
    }

    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Research Report - Last {} Hours", self.window_hours);
        let _ = writeln!(
            out,
            "Generated: {}\n",
            self.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        );

        if self.is_empty() {
            out.push_str(&self.narrative);
            out.push('\n');
            return out;
        }

        out.push_str("## Executive Summary\n");
        let _ = writeln!(out, "- Total findings: {}", self.total_findings);
        let _ = writeln!(out, "- Active targets: {}", self.active_targets);
        let _ = writeln!(out, "- Average significance score: {:.2}", self.average_significance);
        let _ = writeln!(out, "- High-priority findings: {}\n", self.high_significance);

        out.push_str(&self.narrative);
        out.push_str("\n\n");

        out.push_str("## Key Discoveries\n\n");
        for finding in &self.top_findings {
            let _ = writeln!(out, "### {}", finding.title);
            let _ = writeln!(out, "**Score**: {:.2}", finding.significance);
            let _ = writeln!(out, "**Summary**: {}", finding.summary);
            if !finding.matched_keywords.is_empty() {
                let keywords: Vec<&str> = finding.matched_keywords.iter().map(String::as_str).collect();
                let _ = writeln!(out, "**Keywords**: {}", keywords.join(", "));
            }
            let _ = writeln!(out, "**Source**: {}\n", finding.source_ref);
        }

        if !self.trending_keywords.is_empty() {
            out.push_str("## Trending Topics\n\n");
            for (keyword, count) in &self.trending_keywords {
                let _ = writeln!(out, "- **{}**: {} mentions", keyword, count);
            }
            out.push('\n');
        }

        out.push_str("## By Target\n\n");
        for section in &self.by_target {
            match (&section.target, section.monitoring_type, section.priority) {
                (Some(target), Some(kind), Some(priority)) => {
                    let _ = writeln!(
                        out,
                        "- **{}** ({}, {} priority): {} findings",
                        target,
                        kind,
                        priority,
                        section.findings.len()
                    );
                }
                _ => {
                    let _ = writeln!(
                        out,
                        "- `{}` (removed): {} findings",
                        section.target_id,
                        section.findings.len()
                    );
                }
            }
        }
        out
    }
}

pub struct ReportGenerator {
    store: Arc<MonitorStore>,
    registry: Arc<TargetRegistry>,
    narrator: Option<Arc<dyn Narrator>>,
    timeout: Duration,
}

impl ReportGenerator {
    pub fn new(
        store: Arc<MonitorStore>,
        registry: Arc<TargetRegistry>,
        narrator: Option<Arc<dyn Narrator>>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            narrator,
            timeout,
        }
    }

    /// Report over findings with `timestamp >= now - window_hours`.
    pub async fn generate(&self, window_hours: u32, now: DateTime<Utc>) -> Result<Report, PersistenceError> {
        let findings = self.store.findings_since(window_start(now, window_hours)).await?;

        let mut report = self.aggregate(findings, window_hours, now).await;
        if report.is_empty() {
            report.narrative = EMPTY_NARRATIVE.to_string();
            return Ok(report);
        }

        let digest = report.digest();
        let narrated = match &self.narrator {
            Some(narrator) => {
                let outcome = match tokio::time::timeout(self.timeout, narrator.narrate(&digest)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(AnalyzeError::Timeout(self.timeout)),
                };
                match outcome {
                    Ok(text) if !text.trim().is_empty() => Some(text),
                    Ok(_) => {
                        warn!("narrator returned empty text, using template");
                        None
                    }
                    Err(e) => {
                        warn!("narrator unavailable, using template: {}", e);
                        None
                    }
                }
            }
            None => None,
        };

        match narrated {
            Some(text) => {
                report.narrative = text;
                report.narrated = true;
            }
            None => report.narrative = template_narrative(&digest),
        }
        Ok(report)
    }

    async fn aggregate(&self, findings: Vec<Finding>, window_hours: u32, now: DateTime<Utc>) -> Report {
        let total = findings.len();
        let average = if total == 0 {
            0.0
        } else {
            findings.iter().map(|f| f.significance).sum::<f64>() / total as f64
        };
        let high = findings
            .iter()
            .filter(|f| f.significance >= HIGH_SIGNIFICANCE)
            .count();

        let mut top = findings.clone();
        top.sort_by(|a, b| {
            b.significance
                .total_cmp(&a.significance)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        });
        top.truncate(TOP_FINDINGS);

        // Sections in order of each target's most recent finding.
        let mut by_target: Vec<TargetSection> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for finding in findings.iter() {
            let slot = match index.get(&finding.target_id) {
                Some(&slot) => slot,
                None => {
                    let registered = self.registry.get(&finding.target_id).await;
                    by_target.push(TargetSection {
                        target_id: finding.target_id.clone(),
                        target: registered.as_ref().map(|t| t.target.clone()),
                        monitoring_type: registered.as_ref().map(|t| t.monitoring_type),
                        priority: registered.as_ref().map(|t| t.priority),
                        findings: Vec::new(),
                    });
                    index.insert(finding.target_id.clone(), by_target.len() - 1);
                    by_target.len() - 1
                }
            };
            by_target[slot].findings.push(finding.clone());
        }

        Report {
            generated_at: now,
            window_hours,
            total_findings: total,
            active_targets: by_target.len(),
            average_significance: average,
            high_significance: high,
            top_findings: top,
            trending_keywords: trending_keywords(&findings, TRENDING_KEYWORDS),
            by_target,
            narrative: String::new(),
            narrated: false,
        }
    }
}

/// Keyword counts across findings, highest first, ties alphabetical.
pub fn trending_keywords(findings: &[Finding], limit: usize) -> Vec<(String, usize)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for keyword in findings.iter().flat_map(|f| f.matched_keywords.iter()) {
        *counts.entry(keyword.as_str()).or_default() += 1;
    }
    let mut ranked: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(k, n)| (k.to_string(), n))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(limit);
    ranked
}

fn template_narrative(digest: &ReportDigest) -> String {
    let mut text = format!(
        "{} findings across {} targets in the last {} hours, average significance {:.2}, {} of high significance.",
        digest.total_findings,
        digest.active_targets,
        digest.window_hours,
        digest.average_significance,
        digest.high_significance
    );
    if !digest.trending_keywords.is_empty() {
        let top: Vec<String> = digest
            .trending_keywords
            .iter()
            .take(3)
            .map(|(k, n)| format!("{k} ({n})"))
            .collect();
        let _ = write!(text, " Top keywords: {}.", top.join(", "));
    }
    text
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::store::tests::{finding, temp_store};
    use crate::targets::types::NewTarget;

    struct FixedNarrator(Result<String, AnalyzeError>);

    #[async_trait]
    impl Narrator for FixedNarrator {
        async fn narrate(&self, _digest: &ReportDigest) -> Result<String, AnalyzeError> {
            self.0.clone()
        }
    }

    async fn setup(
        narrator: Option<Arc<dyn Narrator>>,
    ) -> (tempfile::TempDir, Arc<MonitorStore>, Arc<TargetRegistry>, ReportGenerator) {
        let (dir, store) = temp_store().await;
        let store = Arc::new(store);
        let registry = Arc::new(
            TargetRegistry::load(dir.path().join("research_config.json"))
                .await
                .unwrap(),
        );
        let generator = ReportGenerator::new(store.clone(), registry.clone(), narrator, Duration::from_secs(5));
        (dir, store, registry, generator)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_empty_window() {
        let (_dir, _store, _registry, generator) = setup(None).await;
        let report = generator.generate(24, Utc::now()).await.unwrap();
        assert!(report.is_empty());
        assert_eq!(report.narrative, EMPTY_NARRATIVE);
        assert!(report.render_markdown().contains(EMPTY_NARRATIVE));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_top_findings_ordered_by_significance() {
        let (_dir, store, registry, generator) = setup(None).await;
        let id = registry
            .add(NewTarget::new("https://example.com", MonitoringType::Url))
            .await
            .unwrap();
        let now = Utc::now();
        for (score, age) in [(0.9, 30), (0.3, 20), (0.6, 10)] {
            store
                .append_finding(&finding(&id, score, now - ChronoDuration::minutes(age)))
                .await
                .unwrap();
        }

        let report = generator.generate(24, now).await.unwrap();
        let scores: Vec<f64> = report.top_findings.iter().map(|f| f.significance).collect();
        assert_eq!(scores, vec![0.9, 0.6, 0.3]);
        assert_eq!(report.total_findings, 3);
        assert_eq!(report.active_targets, 1);
        assert_eq!(report.high_significance, 1);
        assert!((report.average_significance - 0.6).abs() < 1e-9);
        assert_eq!(report.by_target[0].monitoring_type, Some(MonitoringType::Url));
        assert!(!report.narrated);
        assert!(report.narrative.starts_with("3 findings across 1 targets"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ties_break_on_recency() {
        let (_dir, store, _registry, generator) = setup(None).await;
        let now = Utc::now();
        let older = finding("a", 0.5, now - ChronoDuration::hours(2));
        let newer = finding("b", 0.5, now - ChronoDuration::hours(1));
        store.append_finding(&older).await.unwrap();
        store.append_finding(&newer).await.unwrap();

        let report = generator.generate(24, now).await.unwrap();
        assert_eq!(report.top_findings[0].id, newer.id);
        // Removed or unknown targets still get a section.
        assert!(report.by_target.iter().all(|s| s.target.is_none()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_window_excludes_old_findings() {
        let (_dir, store, _registry, generator) = setup(None).await;
        let now = Utc::now();
        store
            .append_finding(&finding("a", 0.8, now - ChronoDuration::hours(30)))
            .await
            .unwrap();
        store
            .append_finding(&finding("a", 0.4, now - ChronoDuration::hours(1)))
            .await
            .unwrap();

        let report = generator.generate(24, now).await.unwrap();
        assert_eq!(report.total_findings, 1);
        assert_eq!(report.top_findings[0].significance, 0.4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_widest_window_covers_everything() {
        let (_dir, store, _registry, generator) = setup(None).await;
        let now = Utc::now();
        store
            .append_finding(&finding("a", 0.8, now - ChronoDuration::days(3650)))
            .await
            .unwrap();

        assert_eq!(window_start(now, u32::MAX), DateTime::<Utc>::MIN_UTC);
        let report = generator.generate(u32::MAX, now).await.unwrap();
        assert_eq!(report.total_findings, 1);
        assert_eq!(report.window_hours, u32::MAX);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_narrator_used_and_fallback() {
        let now = Utc::now();

        let narrator: Arc<dyn Narrator> = Arc::new(FixedNarrator(Ok("Trends are up.".into())));
        let (_dir, store, _registry, generator) = setup(Some(narrator)).await;
        store.append_finding(&finding("a", 0.8, now)).await.unwrap();
        let report = generator.generate(24, now).await.unwrap();
        assert!(report.narrated);
        assert_eq!(report.narrative, "Trends are up.");

        let failing: Arc<dyn Narrator> = Arc::new(FixedNarrator(Err(AnalyzeError::Request("down".into()))));
        let (_dir2, store2, _registry2, generator2) = setup(Some(failing)).await;
        store2.append_finding(&finding("a", 0.8, now)).await.unwrap();
        let report = generator2.generate(24, now).await.unwrap();
        assert!(!report.narrated);
        assert!(report.narrative.starts_with("1 findings across 1 targets"));
    }

    #[test]
    fn test_trending_keywords() {
        let now = Utc::now();
        let mut a = finding("a", 0.5, now);
        a.matched_keywords = ["rust", "llm"].iter().map(|s| s.to_string()).collect();
        let mut b = finding("b", 0.5, now);
        b.matched_keywords = ["rust"].iter().map(|s| s.to_string()).collect();

        let trending = trending_keywords(&[a, b], 5);
        assert_eq!(trending, vec![("rust".to_string(), 2), ("llm".to_string(), 1)]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_markdown_sections() {
        let (_dir, store, _registry, generator) = setup(None).await;
        let now = Utc::now();
        let mut f = finding("a", 0.75, now);
        f.matched_keywords.insert("rust".into());
        store.append_finding(&f).await.unwrap();

        let md = generator.generate(24, now).await.unwrap().render_markdown();
        assert!(md.starts_with("# Research Report - Last 24 Hours"));
        assert!(md.contains("## Executive Summary"));
        assert!(md.contains("**Score**: 0.75"));
        assert!(md.contains("- **rust**: 1 mentions"));
        assert!(md.contains("(removed): 1 findings"));
    }
}
