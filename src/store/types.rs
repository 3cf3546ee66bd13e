use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An emitted, threshold-passing significant change. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub target_id: String,
    pub timestamp: DateTime<Utc>,
    pub title: String,
    pub summary: String,
    pub significance: f64,
    #[serde(default)]
    pub matched_keywords: BTreeSet<String>,
    /// URL or item identifier the change came from.
    pub source_ref: String,
    /// BLAKE3 hex of the content that produced the finding.
    pub content_digest: String,
    /// Leading slice of the scored text, for display.
    #[serde(default)]
    pub excerpt: String,
}
