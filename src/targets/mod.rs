pub mod types;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{PersistenceError, ValidationError};
use types::{MonitoringTarget, NewTarget};

/// On-disk shape of the registry.
#[derive(Debug, Serialize, Deserialize)]
struct ConfigDocument {
    targets: Vec<MonitoringTarget>,
    last_updated: DateTime<Utc>,
}

/// Owns the monitored targets and keeps the config document in step with them.
///
/// Every mutation rewrites the document before returning, so a crash right
/// after a successful call never loses it. The write lock is held across the
/// write, which keeps the file order identical to the mutation order.
pub struct TargetRegistry {
    path: PathBuf,
    targets: RwLock<Vec<MonitoringTarget>>,
}

impl TargetRegistry {
    /// Load the registry from `path`. A missing or empty file is an empty registry.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        let targets = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Vec::new(),
            Ok(bytes) => {
                let doc: ConfigDocument = serde_json::from_slice(&bytes)?;
                doc.targets
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(PersistenceError::io(&path, e)),
        };
        info!(path = %path.display(), count = targets.len(), "Target registry loaded");
        Ok(Self {
            path,
            targets: RwLock::new(targets),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Validate, assign an id and creation time, append and persist.
    ///
    /// Validation failures leave the registry untouched. A persistence failure
    /// is reported, but the target stays registered in memory and is written
    /// out with the next successful persist.
    pub async fn add(&self, new: NewTarget) -> Result<String, RegistryError> {
        let target = new.into_target(Utc::now())?;
        let id = target.id.clone();

        let mut targets = self.targets.write().await;
        targets.push(target);
        write_document(&self.path, &targets).await?;
        debug!(target_id = %id, "target added");
        Ok(id)
    }

    /// Remove a target. Unknown ids return `false`.
    pub async fn remove(&self, id: &str) -> Result<bool, PersistenceError> {
        let mut targets = self.targets.write().await;
        let Some(pos) = targets.iter().position(|t| t.id == id) else {
            return Ok(false);
        };
        targets.remove(pos);
        write_document(&self.path, &targets).await?;
        debug!(target_id = id, "target removed");
        Ok(true)
    }

    pub async fn get(&self, id: &str) -> Option<MonitoringTarget> {
        self.targets.read().await.iter().find(|t| t.id == id).cloned()
    }

    /// All targets in insertion order.
    pub async fn list(&self) -> Vec<MonitoringTarget> {
        self.targets.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.targets.read().await.len()
    }

    /// Record a completed check. Unknown ids are ignored: the target may have
    /// been removed while its check was in flight.
    pub async fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<(), PersistenceError> {
        let mut targets = self.targets.write().await;
        let Some(target) = targets.iter_mut().find(|t| t.id == id) else {
            return Ok(());
        };
        target.last_checked_at = Some(at);
        write_document(&self.path, &targets).await
    }

    /// Rewrite the config document from the in-memory state.
    pub async fn persist(&self) -> Result<(), PersistenceError> {
        let targets = self.targets.write().await;
        write_document(&self.path, &targets).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl From<RegistryError> for crate::error::MonitorError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Validation(e) => e.into(),
            RegistryError::Persistence(e) => e.into(),
        }
    }
}

/// Temp-file-then-rename so readers never observe a partial document.
async fn write_document(path: &Path, targets: &[MonitoringTarget]) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PersistenceError::io(parent, e))?;
    }

    let doc = ConfigDocument {
        targets: targets.to_vec(),
        last_updated: Utc::now(),
    };
    let bytes = serde_json::to_vec_pretty(&doc)?;

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, bytes)
        .await
        .map_err(|e| PersistenceError::io(&tmp_path, e))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| PersistenceError::io(path, e))?;
    Ok(())
}
