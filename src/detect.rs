//! Change detection: turns freshly fetched content into candidate changes.
//!
//! `url` targets are diffed against the last-seen document. Listing targets
//! (`keyword`, `topic`, `arxiv`, `news`) report every item whose id has not
//! been seen before, including on the very first check.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::PersistenceError;
use crate::fetch::{FeedItem, FetchedContent};
use crate::store::MonitorStore;
use crate::targets::types::{MonitoringTarget, MonitoringType, TargetId};

/// Cap on the diff sample handed to the scorer.
pub const MAX_DIFF_SAMPLE_CHARS: usize = 15_000;

/// Seen-item ids kept per listing target; the oldest are dropped first.
pub const MAX_SEEN_ITEMS: usize = 5_000;

/// Last-seen state of a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Snapshot {
    Document { digest: String, content: String },
    Listing { seen: VecDeque<String> },
}

/// Content detected as new or different, not yet scored.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateChange {
    pub title: String,
    pub text: String,
    pub source_ref: String,
    pub content_digest: String,
    /// Listing item behind this candidate; `None` for document diffs.
    pub item_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct Detection {
    pub candidates: Vec<CandidateChange>,
    /// Replacement snapshot, `None` when the state is unchanged.
    pub next: Option<Snapshot>,
}

pub fn digest(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex().to_string()
}

pub struct ChangeDetector {
    snapshots: RwLock<HashMap<TargetId, Snapshot>>,
    store: Option<Arc<MonitorStore>>,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl ChangeDetector {
    /// Detector whose snapshots live only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
            store: None,
        }
    }

    /// Detector backed by the monitor store; previously committed snapshots are restored.
    pub async fn with_store(store: Arc<MonitorStore>) -> Result<Self, PersistenceError> {
        let restored: Vec<(String, Snapshot)> = store.snapshots().await?;
        info!(count = restored.len(), "Snapshots restored");
        Ok(Self {
            snapshots: RwLock::new(restored.into_iter().collect()),
            store: Some(store),
        })
    }

    #[cfg(test)]
    pub async fn has_snapshot(&self, target_id: &str) -> bool {
        self.snapshots.read().await.contains_key(target_id)
    }

    /// Compare `content` against the target's snapshot. Does not modify state;
    /// the caller commits `Detection::next` once the check has completed.
    pub async fn detect(&self, target: &MonitoringTarget, content: FetchedContent) -> Detection {
        let snapshots = self.snapshots.read().await;
        let previous = snapshots.get(&target.id);

        if target.monitoring_type.is_listing() {
            let items = match content {
                FetchedContent::Items(items) => items,
                FetchedContent::Document { text, source_ref } => vec![FeedItem {
                    id: digest(&text),
                    title: String::new(),
                    body: text,
                    url: Some(source_ref),
                }],
            };
            detect_items(target, previous, items)
        } else {
            let (text, source_ref) = match content {
                FetchedContent::Document { text, source_ref } => (text, source_ref),
                FetchedContent::Items(items) => {
                    let text = items
                        .iter()
                        .map(|i| format!("{}\n{}", i.title, i.body))
                        .collect::<Vec<_>>()
                        .join("\n\n");
                    (text, target.target.clone())
                }
            };
            detect_document(target, previous, text, source_ref)
        }
    }

    /// Replace the target's snapshot, durably when backed by a store.
    pub async fn commit(&self, target_id: &str, snapshot: Snapshot) -> Result<(), PersistenceError> {
        let mut snapshots = self.snapshots.write().await;
        if let Some(store) = &self.store {
            store.put_snapshot(target_id, &snapshot).await?;
        }
        snapshots.insert(target_id.to_string(), snapshot);
        Ok(())
    }

    /// Record one listing item as seen ahead of the full commit, so a check
    /// that stops partway does not report it again.
    pub async fn mark_seen(&self, target_id: &str, item_id: &str) -> Result<(), PersistenceError> {
        let mut snapshots = self.snapshots.write().await;
        let mut seen = match snapshots.get(target_id) {
            Some(Snapshot::Listing { seen }) => seen.clone(),
            _ => VecDeque::new(),
        };
        if seen.iter().any(|id| id == item_id) {
            return Ok(());
        }
        seen.push_back(item_id.to_string());
        while seen.len() > MAX_SEEN_ITEMS {
            seen.pop_front();
        }

        let snapshot = Snapshot::Listing { seen };
        if let Some(store) = &self.store {
            store.put_snapshot(target_id, &snapshot).await?;
        }
        snapshots.insert(target_id.to_string(), snapshot);
        Ok(())
    }

    /// Drop a removed target's snapshot.
    pub async fn forget(&self, target_id: &str) -> Result<(), PersistenceError> {
        let mut snapshots = self.snapshots.write().await;
        if snapshots.remove(target_id).is_some() {
            if let Some(store) = &self.store {
                store.delete_snapshot(target_id).await?;
            }
        }
        Ok(())
    }
}

fn detect_document(
    target: &MonitoringTarget,
    previous: Option<&Snapshot>,
    text: String,
    source_ref: String,
) -> Detection {
    let new_digest = digest(&text);

    let old_content = match previous {
        Some(Snapshot::Document { digest, .. }) if *digest == new_digest => {
            debug!(target_id = %target.id, "content unchanged");
            return Detection::default();
        }
        Some(Snapshot::Document { content, .. }) => content.as_str(),
        // First check, or the target's type changed under us: baseline only.
        _ => {
            debug!(target_id = %target.id, "baseline captured");
            return Detection {
                candidates: vec![],
                next: Some(Snapshot::Document {
                    digest: new_digest,
                    content: text,
                }),
            };
        }
    };

    let sample = changed_region(old_content, &text, MAX_DIFF_SAMPLE_CHARS);
    let candidate = CandidateChange {
        title: format!("Significant update detected: {}", target.target),
        text: sample,
        source_ref,
        content_digest: new_digest.clone(),
        item_id: None,
    };
    Detection {
        candidates: vec![candidate],
        next: Some(Snapshot::Document {
            digest: new_digest,
            content: text,
        }),
    }
}

fn detect_items(
    target: &MonitoringTarget,
    previous: Option<&Snapshot>,
    items: Vec<FeedItem>,
) -> Detection {
    let mut seen = match previous {
        Some(Snapshot::Listing { seen }) => seen.clone(),
        _ => VecDeque::new(),
    };
    let known: HashSet<&str> = match previous {
        Some(Snapshot::Listing { seen }) => seen.iter().map(String::as_str).collect(),
        _ => HashSet::new(),
    };

    let mut batch = HashSet::new();
    let mut candidates = Vec::new();
    for item in items {
        if known.contains(item.id.as_str()) || !batch.insert(item.id.clone()) {
            continue;
        }
        let text = if item.title.is_empty() {
            item.body.clone()
        } else {
            format!("{}\n\n{}", item.title, item.body)
        };
        candidates.push(CandidateChange {
            title: listing_title(target, &item),
            content_digest: digest(&text),
            text,
            source_ref: item.url.clone().unwrap_or_else(|| item.id.clone()),
            item_id: Some(item.id.clone()),
        });
        seen.push_back(item.id);
    }

    while seen.len() > MAX_SEEN_ITEMS {
        seen.pop_front();
    }

    let next = if candidates.is_empty() && previous.is_some() {
        None
    } else {
        Some(Snapshot::Listing { seen })
    };
    Detection { candidates, next }
}

fn listing_title(target: &MonitoringTarget, item: &FeedItem) -> String {
    let label = if item.title.is_empty() { &item.id } else { &item.title };
    match target.monitoring_type {
        MonitoringType::Arxiv => format!("New arXiv paper: {}", label),
        MonitoringType::News => format!("New article: {}", label),
        MonitoringType::Keyword if !target.keywords.is_empty() => format!(
            "New content matching keywords: {}",
            target.keywords.iter().cloned().collect::<Vec<_>>().join(", ")
        ),
        MonitoringType::Keyword => format!("New content matching keywords: {}", target.target),
        MonitoringType::Topic | MonitoringType::Url => {
            format!("New content on topic {}: {}", target.target, label)
        }
    }
}

/// Line diff of the region between the common prefix and suffix, with
/// removed lines marked `-` and added lines `+`, capped at `max_chars`.
pub fn changed_region(old: &str, new: &str, max_chars: usize) -> String {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    let prefix = old_lines
        .iter()
        .zip(&new_lines)
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = old_lines[prefix..]
        .iter()
        .rev()
        .zip(new_lines[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let removed = &old_lines[prefix..old_lines.len() - suffix];
    let added = &new_lines[prefix..new_lines.len() - suffix];

    let mut out = format!(
        "@@ -{},{} +{},{} @@\n",
        prefix + 1,
        removed.len(),
        prefix + 1,
        added.len()
    );
    for line in removed {
        out.push('-');
        out.push_str(line);
        out.push('\n');
    }
    for line in added {
        out.push('+');
        out.push_str(line);
        out.push('\n');
    }

    if out.chars().count() > max_chars {
        out = out.chars().take(max_chars).collect();
    }
    out
}
