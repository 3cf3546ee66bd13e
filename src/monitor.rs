//! Host-facing facade over the registry, scheduler, findings store and
//! report generator.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::detect::ChangeDetector;
use crate::error::{MonitorError, PersistenceError, ValidationError};
use crate::fetch::Fetcher;
use crate::notify::report::{window_start, Narrator, Report, ReportGenerator};
use crate::notify::{DispatchMode, NotificationPipeline, Subscriber};
use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerStatus};
use crate::scoring::{Analyzer, SignificanceScorer};
use crate::store::types::Finding;
use crate::store::MonitorStore;
use crate::targets::types::{MonitoringTarget, MonitoringType, NewTarget, Priority, TargetId};
use crate::targets::TargetRegistry;

/// Collaborators the host plugs in.
pub struct Collaborators {
    pub fetcher: Arc<dyn Fetcher>,
    pub analyzer: Option<Arc<dyn Analyzer>>,
    pub narrator: Option<Arc<dyn Narrator>>,
}

pub struct MonitorOptions {
    pub scheduler: SchedulerConfig,
    pub analyze_timeout: Duration,
    pub dispatch: DispatchMode,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            analyze_timeout: Duration::from_secs(60),
            dispatch: DispatchMode::Inline,
        }
    }
}

pub struct Monitor {
    registry: Arc<TargetRegistry>,
    detector: Arc<ChangeDetector>,
    pipeline: Arc<NotificationPipeline>,
    scheduler: Arc<Scheduler>,
    reports: ReportGenerator,
    store: Arc<MonitorStore>,
    fetcher: Arc<dyn Fetcher>,
}

impl Monitor {
    pub async fn new(
        registry: Arc<TargetRegistry>,
        store: Arc<MonitorStore>,
        collaborators: Collaborators,
        options: MonitorOptions,
    ) -> Result<Self, PersistenceError> {
        let detector = Arc::new(ChangeDetector::with_store(store.clone()).await?);
        let scorer = Arc::new(SignificanceScorer::new(
            collaborators.analyzer,
            options.analyze_timeout,
        ));
        let pipeline = Arc::new(NotificationPipeline::new(store.clone(), options.dispatch));
        let scheduler = Scheduler::new(
            options.scheduler,
            registry.clone(),
            detector.clone(),
            scorer.clone(),
            pipeline.clone(),
            collaborators.fetcher.clone(),
        );
        let reports = ReportGenerator::new(
            store.clone(),
            registry.clone(),
            collaborators.narrator,
            options.analyze_timeout,
        );
        info!(
            targets = registry.len().await,
            ai_enhanced = scorer.has_analyzer(),
            "Monitor initialized"
        );

        Ok(Self {
            registry,
            detector,
            pipeline,
            scheduler,
            reports,
            store,
            fetcher: collaborators.fetcher,
        })
    }

    pub async fn add_target(
        &self,
        target: &str,
        monitoring_type: MonitoringType,
        frequency_hours: f64,
        priority: Priority,
        keywords: BTreeSet<String>,
        notification_threshold: f64,
    ) -> Result<TargetId, MonitorError> {
        if !self.fetcher.supports(monitoring_type) {
            return Err(ValidationError::UnsupportedType(monitoring_type.to_string()).into());
        }
        let new = NewTarget::new(target, monitoring_type)
            .frequency_hours(frequency_hours)
            .priority(priority)
            .keywords(keywords)
            .threshold(notification_threshold);
        let id = self.registry.add(new).await?;
        info!(target_id = %id, target, kind = %monitoring_type, "Added monitoring target");
        Ok(id)
    }

    /// Unknown ids return `Ok(false)`.
    pub async fn remove_target(&self, id: &str) -> Result<bool, MonitorError> {
        if !self.registry.remove(id).await? {
            return Ok(false);
        }
        self.scheduler.forget(id).await;
        if let Err(e) = self.detector.forget(id).await {
            warn!(target_id = id, "failed to drop snapshot: {}", e);
        }
        info!(target_id = id, "Removed monitoring target");
        Ok(true)
    }

    pub async fn list_targets(&self) -> Vec<MonitoringTarget> {
        self.registry.list().await
    }

    /// Returns `false` if monitoring was already running.
    pub async fn start_monitoring(&self) -> bool {
        self.scheduler.start().await
    }

    /// Returns `false` if monitoring was not running.
    pub async fn stop_monitoring(&self) -> bool {
        self.scheduler.stop().await
    }

    pub async fn status(&self) -> SchedulerStatus {
        self.scheduler.status(Utc::now()).await
    }

    /// Findings from the last `hours`, most recent first.
    pub async fn findings(&self, hours: u32) -> Result<Vec<Finding>, MonitorError> {
        Ok(self.store.findings_since(window_start(Utc::now(), hours)).await?)
    }

    pub async fn findings_by_target(&self, id: &str) -> Result<Vec<Finding>, MonitorError> {
        Ok(self.store.findings_for_target(id).await?)
    }

    pub async fn generate_report(&self, hours: u32) -> Result<Report, MonitorError> {
        Ok(self.reports.generate(hours, Utc::now()).await?)
    }

    pub async fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        self.pipeline.subscribe(subscriber).await;
    }

    /// Stop checks and flush the registry, carrying any mutation whose
    /// earlier write failed.
    pub async fn shutdown(&self) -> Result<(), MonitorError> {
        self.scheduler.stop().await;
        self.registry.persist().await?;
        info!(config = %self.registry.path().display(), "Monitor shut down");
        Ok(())
    }

    #[cfg(test)]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }
}
