pub mod discord;
pub mod report;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::detect::CandidateChange;
use crate::error::PersistenceError;
use crate::scoring::Assessment;
use crate::store::types::Finding;
use crate::store::MonitorStore;
use crate::targets::types::MonitoringTarget;

/// Longest excerpt kept on a finding, in chars.
pub const MAX_EXCERPT_CHARS: usize = 1_000;

/// Receives every emitted finding.
#[async_trait]
pub trait Subscriber: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, finding: &Finding) -> anyhow::Result<()>;
}

/// Logs each finding at INFO.
pub struct LogSubscriber;

#[async_trait]
impl Subscriber for LogSubscriber {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, finding: &Finding) -> anyhow::Result<()> {
        info!(
            finding_id = %finding.id,
            target_id = %finding.target_id,
            significance = format_args!("{:.2}", finding.significance),
            source = %finding.source_ref,
            "SIGNIFICANT FINDING: {}",
            finding.title
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// `evaluate` returns after every subscriber has finished.
    #[default]
    Inline,
    /// Subscribers run detached; `evaluate` returns once the finding is stored.
    Background,
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline" => Ok(DispatchMode::Inline),
            "background" => Ok(DispatchMode::Background),
            other => Err(format!("unknown dispatch mode '{other}' (expected inline or background)")),
        }
    }
}

/// Threshold filter, findings log and subscriber fan-out.
pub struct NotificationPipeline {
    store: Arc<MonitorStore>,
    subscribers: RwLock<Vec<Arc<dyn Subscriber>>>,
    mode: DispatchMode,
}

impl NotificationPipeline {
    pub fn new(store: Arc<MonitorStore>, mode: DispatchMode) -> Self {
        Self {
            store,
            subscribers: RwLock::new(Vec::new()),
            mode,
        }
    }

    pub fn store(&self) -> &Arc<MonitorStore> {
        &self.store
    }

    pub async fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        info!(subscriber = subscriber.name(), "subscriber registered");
        self.subscribers.write().await.push(subscriber);
    }

    /// Record and dispatch a finding when `assessment` reaches the target's
    /// threshold. Returns `None` for discarded candidates.
    pub async fn evaluate(
        &self,
        target: &MonitoringTarget,
        candidate: &CandidateChange,
        assessment: Assessment,
        now: DateTime<Utc>,
    ) -> Result<Option<Finding>, PersistenceError> {
        if assessment.score < target.notification_threshold {
            tracing::debug!(
                target_id = %target.id,
                score = assessment.score,
                threshold = target.notification_threshold,
                "candidate below threshold"
            );
            return Ok(None);
        }

        let finding = Finding {
            id: uuid::Uuid::new_v4().to_string(),
            target_id: target.id.clone(),
            timestamp: now,
            title: candidate.title.clone(),
            summary: assessment.summary,
            significance: assessment.score,
            matched_keywords: assessment.matched_keywords,
            source_ref: candidate.source_ref.clone(),
            content_digest: candidate.content_digest.clone(),
            excerpt: candidate.text.chars().take(MAX_EXCERPT_CHARS).collect(),
        };

        self.store.append_finding(&finding).await?;
        self.dispatch(&finding).await;
        Ok(Some(finding))
    }

    async fn dispatch(&self, finding: &Finding) {
        let subscribers = self.subscribers.read().await.clone();
        let mut handles = Vec::with_capacity(subscribers.len());

        for subscriber in subscribers {
            let name = subscriber.name().to_string();
            let owned = finding.clone();
            let task_name = name.clone();
            // One task per subscriber so a panic stays inside it.
            let handle = tokio::spawn(async move {
                if let Err(e) = subscriber.notify(&owned).await {
                    warn!(subscriber = %task_name, finding_id = %owned.id, "subscriber failed: {:#}", e);
                }
            });
            handles.push((name, handle));
        }

        if self.mode == DispatchMode::Background {
            return;
        }
        for (name, handle) in handles {
            if let Err(e) = handle.await {
                error!(subscriber = %name, finding_id = %finding.id, "subscriber task aborted: {}", e);
            }
        }
    }
}
