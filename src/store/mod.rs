pub mod types;

use std::path::Path;

use chrono::{DateTime, Utc};
use cnidarium::{StateDelta, StateRead, StateWrite, Storage};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::PersistenceError;
use types::Finding;

// Key prefixes (no trailing slashes, cnidarium convention)
const FINDING_PREFIX: &str = "finding";
const SNAPSHOT_PREFIX: &str = "snapshot";

/// Findings sort chronologically by key: zero-padded millis, then id.
fn finding_key(finding: &Finding) -> String {
    format!(
        "{}/{:020}/{}",
        FINDING_PREFIX,
        finding.timestamp.timestamp_millis().max(0),
        finding.id
    )
}
fn snapshot_key(target_id: &str) -> String {
    format!("{}/{}", SNAPSHOT_PREFIX, target_id)
}

/// Durable state that is not part of the config document: the append-only
/// findings log and the change detector's per-target snapshots.
pub struct MonitorStore {
    storage: Storage,
    /// Commits are built on the latest snapshot, so writers take turns.
    commit_lock: Mutex<()>,
}

impl MonitorStore {
    pub async fn new(data_dir: &Path) -> Result<Self, PersistenceError> {
        std::fs::create_dir_all(data_dir).map_err(|e| PersistenceError::io(data_dir, e))?;
        let prefixes = vec![FINDING_PREFIX.to_string(), SNAPSHOT_PREFIX.to_string()];
        let storage = Storage::load(data_dir.to_path_buf(), prefixes)
            .await
            .map_err(|e| PersistenceError::store(format!("failed to init cnidarium storage: {e}")))?;
        Ok(Self {
            storage,
            commit_lock: Mutex::new(()),
        })
    }

    async fn put(&self, key: String, value: Vec<u8>) -> Result<(), PersistenceError> {
        let _guard = self.commit_lock.lock().await;
        let mut delta = StateDelta::new(self.storage.latest_snapshot());
        delta.put_raw(key, value);
        self.storage
            .commit(delta)
            .await
            .map_err(PersistenceError::store)?;
        Ok(())
    }

    /// Append a finding to the log.
    pub async fn append_finding(&self, finding: &Finding) -> Result<(), PersistenceError> {
        self.put(finding_key(finding), serde_json::to_vec(finding)?)
            .await?;
        debug!(finding_id = %finding.id, target_id = %finding.target_id, "finding stored");
        Ok(())
    }

    /// Findings with `timestamp >= since`, most recent first.
    pub async fn findings_since(&self, since: DateTime<Utc>) -> Result<Vec<Finding>, PersistenceError> {
        let mut results = self.scan_findings().await?;
        results.retain(|f| f.timestamp >= since);
        Ok(results)
    }

    /// Every finding recorded for one target, most recent first.
    pub async fn findings_for_target(&self, target_id: &str) -> Result<Vec<Finding>, PersistenceError> {
        let mut results = self.scan_findings().await?;
        results.retain(|f| f.target_id == target_id);
        Ok(results)
    }

    async fn scan_findings(&self) -> Result<Vec<Finding>, PersistenceError> {
        let snapshot = self.storage.latest_snapshot();
        let mut stream = snapshot.prefix_raw(FINDING_PREFIX);
        let mut results = Vec::new();

        while let Some(entry) = stream.next().await {
            match entry {
                Ok((_key, value)) => match serde_json::from_slice::<Finding>(&value) {
                    Ok(finding) => results.push(finding),
                    Err(e) => warn!("Skipping unreadable finding: {}", e),
                },
                Err(e) => return Err(PersistenceError::store(e)),
            }
        }

        results.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(results)
    }

    pub async fn put_snapshot<T: Serialize>(&self, target_id: &str, snapshot: &T) -> Result<(), PersistenceError> {
        self.put(snapshot_key(target_id), serde_json::to_vec(snapshot)?)
            .await
    }

    pub async fn delete_snapshot(&self, target_id: &str) -> Result<(), PersistenceError> {
        let _guard = self.commit_lock.lock().await;
        let mut delta = StateDelta::new(self.storage.latest_snapshot());
        delta.delete(snapshot_key(target_id));
        self.storage
            .commit(delta)
            .await
            .map_err(PersistenceError::store)?;
        Ok(())
    }

    /// All stored snapshots keyed by target id.
    pub async fn snapshots<T: DeserializeOwned>(&self) -> Result<Vec<(String, T)>, PersistenceError> {
        let snapshot = self.storage.latest_snapshot();
        let prefix = format!("{}/", SNAPSHOT_PREFIX);
        let mut stream = snapshot.prefix_raw(&prefix);
        let mut results = Vec::new();

        while let Some(entry) = stream.next().await {
            match entry {
                Ok((key, value)) => {
                    // Key format: "snapshot/{target_id}"
                    let Some(target_id) = key.strip_prefix(&prefix) else {
                        continue;
                    };
                    match serde_json::from_slice::<T>(&value) {
                        Ok(snap) => results.push((target_id.to_string(), snap)),
                        Err(e) => warn!(target_id, "Skipping unreadable snapshot: {}", e),
                    }
                }
                Err(e) => return Err(PersistenceError::store(e)),
            }
        }

        Ok(results)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeSet;

    use chrono::Duration;

    use super::*;

    pub(crate) async fn temp_store() -> (tempfile::TempDir, MonitorStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MonitorStore::new(&dir.path().join("store")).await.unwrap();
        (dir, store)
    }

    pub(crate) fn finding(target_id: &str, significance: f64, timestamp: DateTime<Utc>) -> Finding {
        Finding {
            id: uuid::Uuid::new_v4().to_string(),
            target_id: target_id.to_string(),
            timestamp,
            title: format!("finding for {target_id}"),
            summary: "summary".to_string(),
            significance,
            matched_keywords: BTreeSet::new(),
            source_ref: "https://example.com".to_string(),
            content_digest: blake3::hash(b"content").to_hex().to_string(),
            excerpt: String::new(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_findings_most_recent_first() {
        let (_dir, store) = temp_store().await;
        let now = Utc::now();
        let old = finding("a", 0.5, now - Duration::hours(2));
        let new = finding("b", 0.4, now - Duration::minutes(5));
        store.append_finding(&old).await.unwrap();
        store.append_finding(&new).await.unwrap();

        let all = store.findings_since(now - Duration::hours(3)).await.unwrap();
        assert_eq!(all, vec![new.clone(), old]);

        let recent = store.findings_since(now - Duration::hours(1)).await.unwrap();
        assert_eq!(recent, vec![new]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_findings_for_target() {
        let (_dir, store) = temp_store().await;
        let now = Utc::now();
        store.append_finding(&finding("a", 0.5, now)).await.unwrap();
        store.append_finding(&finding("b", 0.5, now)).await.unwrap();
        let a = store.findings_for_target("a").await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].target_id, "a");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_snapshot_roundtrip_and_delete() {
        let (_dir, store) = temp_store().await;
        store.put_snapshot("t1", &vec!["x".to_string()]).await.unwrap();
        let snaps: Vec<(String, Vec<String>)> = store.snapshots().await.unwrap();
        assert_eq!(snaps, vec![("t1".to_string(), vec!["x".to_string()])]);

        store.delete_snapshot("t1").await.unwrap();
        let snaps: Vec<(String, Vec<String>)> = store.snapshots().await.unwrap();
        assert!(snaps.is_empty());
    }
}
