//! Check scheduling: decides which targets are due, runs bounded concurrent
//! checks and keeps per-target health.
//!
//! One control loop ticks on a fixed interval. Each tick spawns a task per due
//! target that is not already being checked; a semaphore bounds how many run at
//! once. A check is fetch, detect, score, evaluate, commit snapshot, touch.
//! Failures only affect the target they happened on and feed its backoff.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::detect::{CandidateChange, ChangeDetector, Detection};
use crate::error::{CheckError, FetchError};
use crate::fetch::Fetcher;
use crate::notify::NotificationPipeline;
use crate::scoring::{Assessment, SignificanceScorer};
use crate::targets::types::{MonitoringTarget, MonitoringType, Priority, TargetId};
use crate::targets::TargetRegistry;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub max_concurrency: usize,
    pub fetch_timeout: Duration,
    /// How long `stop` waits for in-flight checks before aborting them.
    pub stop_grace: Duration,
    /// Consecutive failures tolerated before intervals start stretching.
    pub failure_threshold: u32,
    pub max_backoff_multiplier: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            max_concurrency: 4,
            fetch_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(10),
            failure_threshold: 3,
            max_backoff_multiplier: 16.0,
        }
    }
}

/// Interval stretch after `failures` consecutive failed checks: 1 up to the
/// threshold, then doubling per extra failure, capped.
pub fn backoff_multiplier(failures: u32, threshold: u32, cap: f64) -> f64 {
    if failures <= threshold {
        return 1.0;
    }
    let exponent = (failures - threshold).min(63) as i32;
    2f64.powi(exponent).min(cap.max(1.0))
}

/// `frequency_hours / priority multiplier * backoff`, saturating at
/// `TimeDelta::MAX` for intervals chrono cannot represent.
pub fn effective_interval(frequency_hours: f64, priority: Priority, backoff: f64) -> TimeDelta {
    let millis = (frequency_hours / priority.check_multiplier() * backoff * 3_600_000.0).round();
    if millis.is_nan() || millis >= i64::MAX as f64 {
        return TimeDelta::MAX;
    }
    TimeDelta::try_milliseconds(millis as i64).unwrap_or(TimeDelta::MAX)
}

pub fn is_due(target: &MonitoringTarget, backoff: f64, now: DateTime<Utc>) -> bool {
    match target.last_checked_at {
        None => true,
        Some(last) => now - last >= effective_interval(target.frequency_hours, target.priority, backoff),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckState {
    Idle,
    Due,
    Checking,
    Backoff,
}

#[derive(Debug, Clone, Default)]
struct Health {
    consecutive_failures: u32,
    last_error: Option<String>,
    last_success_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetStatus {
    pub id: TargetId,
    pub target: String,
    pub monitoring_type: MonitoringType,
    pub priority: Priority,
    pub state: CheckState,
    pub consecutive_failures: u32,
    pub backoff_multiplier: f64,
    pub effective_interval_hours: f64,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub next_check_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub target_count: usize,
    pub due_count: usize,
    pub in_flight: usize,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub targets: Vec<TargetStatus>,
}

enum Outcome {
    Completed { findings: usize },
    Failed(CheckError),
    Cancelled,
}

pub struct Scheduler {
    config: SchedulerConfig,
    registry: Arc<TargetRegistry>,
    detector: Arc<ChangeDetector>,
    scorer: Arc<SignificanceScorer>,
    pipeline: Arc<NotificationPipeline>,
    fetcher: Arc<dyn Fetcher>,
    permits: Arc<Semaphore>,
    /// Targets with a live check, with the tick time that dispatched them.
    in_flight: Mutex<HashMap<TargetId, DateTime<Utc>>>,
    health: RwLock<HashMap<TargetId, Health>>,
    tasks: Mutex<JoinSet<()>>,
    cancel_tx: watch::Sender<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    last_tick_at: RwLock<Option<DateTime<Utc>>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<TargetRegistry>,
        detector: Arc<ChangeDetector>,
        scorer: Arc<SignificanceScorer>,
        pipeline: Arc<NotificationPipeline>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Arc<Self> {
        let (cancel_tx, _) = watch::channel(false);
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            config,
            registry,
            detector,
            scorer,
            pipeline,
            fetcher,
            in_flight: Mutex::new(HashMap::new()),
            health: RwLock::new(HashMap::new()),
            tasks: Mutex::new(JoinSet::new()),
            cancel_tx,
            loop_handle: Mutex::new(None),
            last_tick_at: RwLock::new(None),
        })
    }

    pub async fn is_running(&self) -> bool {
        self.loop_handle.lock().await.is_some()
    }

    /// Start the control loop. Returns `false` if it was already running.
    pub async fn start(self: &Arc<Self>) -> bool {
        let mut handle = self.loop_handle.lock().await;
        if handle.is_some() {
            return false;
        }
        self.cancel_tx.send_replace(false);

        let scheduler = self.clone();
        *handle = Some(tokio::spawn(async move { scheduler.run_loop().await }));
        info!(
            tick_secs = self.config.tick_interval.as_secs(),
            max_concurrency = self.config.max_concurrency,
            "Monitoring started"
        );
        true
    }

    async fn run_loop(self: Arc<Self>) {
        let mut cancel = self.cancel_tx.subscribe();
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => break,
                _ = interval.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }
        debug!("control loop exited");
    }

    /// Cancel outstanding checks, stop the loop and wait up to the grace
    /// period for workers before aborting them. Returns whether the loop was
    /// running.
    pub async fn stop(&self) -> bool {
        self.cancel_tx.send_replace(true);

        let handle = self.loop_handle.lock().await.take();
        let was_running = handle.is_some();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("control loop ended abnormally: {}", e);
            }
        }

        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        let drained = tokio::time::timeout(self.config.stop_grace, async {
            while let Some(result) = tasks.join_next().await {
                log_join(result);
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                grace_secs = self.config.stop_grace.as_secs_f64(),
                "checks still running after grace period, aborting"
            );
            tasks.shutdown().await;
        }

        // Aborted workers never reached their own bookkeeping.
        let abandoned: Vec<(TargetId, DateTime<Utc>)> = self.in_flight.lock().await.drain().collect();
        for (target_id, tick_at) in abandoned {
            if let Err(e) = self.registry.touch(&target_id, tick_at).await {
                error!(target_id = %target_id, "failed to record abandoned check: {}", e);
            }
        }

        if was_running {
            info!("Monitoring stopped");
        }
        was_running
    }

    /// Dispatch every due target that is not already being checked. Returns
    /// how many checks were started.
    pub async fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> usize {
        let stopping = *self.cancel_tx.borrow();
        if stopping {
            return 0;
        }
        *self.last_tick_at.write().await = Some(now);

        let targets = self.registry.list().await;
        let health = self.health.read().await.clone();
        let mut in_flight = self.in_flight.lock().await;
        let mut tasks = self.tasks.lock().await;

        while let Some(result) = tasks.try_join_next() {
            log_join(result);
        }

        let mut dispatched = 0;
        for target in targets {
            if in_flight.contains_key(&target.id) {
                continue;
            }
            let backoff = self.backoff_for(health.get(&target.id));
            if !is_due(&target, backoff, now) {
                continue;
            }

            in_flight.insert(target.id.clone(), now);
            let scheduler = self.clone();
            tasks.spawn(async move { scheduler.run_check(target, now).await });
            dispatched += 1;
        }

        if dispatched > 0 {
            debug!(dispatched, in_flight = in_flight.len(), "tick");
        }
        dispatched
    }

    /// Wait until every dispatched check has finished.
    pub async fn wait_idle(&self) {
        loop {
            let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
            if tasks.is_empty() {
                return;
            }
            while let Some(result) = tasks.join_next().await {
                log_join(result);
            }
        }
    }

    /// Drop health bookkeeping for a removed target.
    pub async fn forget(&self, target_id: &str) {
        self.health.write().await.remove(target_id);
    }

    pub async fn status(&self, now: DateTime<Utc>) -> SchedulerStatus {
        let targets = self.registry.list().await;
        let health = self.health.read().await.clone();
        let in_flight: HashSet<TargetId> = self.in_flight.lock().await.keys().cloned().collect();

        let targets: Vec<TargetStatus> = targets
            .into_iter()
            .map(|target| {
                let h = health.get(&target.id).cloned().unwrap_or_default();
                let backoff = self.backoff_for(Some(&h));
                let interval = effective_interval(target.frequency_hours, target.priority, backoff);
                let state = if in_flight.contains(&target.id) {
                    CheckState::Checking
                } else if is_due(&target, backoff, now) {
                    CheckState::Due
                } else if backoff > 1.0 {
                    CheckState::Backoff
                } else {
                    CheckState::Idle
                };
                TargetStatus {
                    state,
                    consecutive_failures: h.consecutive_failures,
                    backoff_multiplier: backoff,
                    effective_interval_hours: interval.num_milliseconds() as f64 / 3_600_000.0,
                    next_check_at: target
                        .last_checked_at
                        .and_then(|last| last.checked_add_signed(interval)),
                    last_checked_at: target.last_checked_at,
                    last_success_at: h.last_success_at,
                    last_error: h.last_error,
                    id: target.id,
                    target: target.target,
                    monitoring_type: target.monitoring_type,
                    priority: target.priority,
                }
            })
            .collect();

        SchedulerStatus {
            running: self.is_running().await,
            target_count: targets.len(),
            due_count: targets.iter().filter(|t| t.state == CheckState::Due).count(),
            in_flight: in_flight.len(),
            last_tick_at: *self.last_tick_at.read().await,
            targets,
        }
    }

    fn backoff_for(&self, health: Option<&Health>) -> f64 {
        let failures = health.map(|h| h.consecutive_failures).unwrap_or(0);
        backoff_multiplier(
            failures,
            self.config.failure_threshold,
            self.config.max_backoff_multiplier,
        )
    }

    async fn run_check(self: Arc<Self>, target: MonitoringTarget, tick_at: DateTime<Utc>) {
        let mut cancel = self.cancel_tx.subscribe();

        let permit = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => None,
            permit = self.permits.clone().acquire_owned() => permit.ok(),
        };
        let outcome = match permit {
            Some(_permit) => self.check(&target, &mut cancel).await,
            None => Outcome::Cancelled,
        };
        self.finish(&target.id, tick_at, outcome).await;
    }

    async fn check(&self, target: &MonitoringTarget, cancel: &mut watch::Receiver<bool>) -> Outcome {
        debug!(target_id = %target.id, target = %target.target, "checking target");

        let gathered = tokio::select! {
            biased;
            _ = cancelled(cancel) => return Outcome::Cancelled,
            gathered = self.gather(target) => gathered,
        };
        let (detection, scored) = match gathered {
            Ok(gathered) => gathered,
            Err(e) => return Outcome::Failed(e.into()),
        };

        let stopping = *cancel.borrow();
        if stopping {
            return Outcome::Cancelled;
        }
        if self.registry.get(&target.id).await.is_none() {
            debug!(target_id = %target.id, "target removed during check");
            return Outcome::Completed { findings: 0 };
        }

        let mut findings = 0;
        for (candidate, assessment) in scored {
            let stopping = *cancel.borrow();
            if stopping {
                return Outcome::Cancelled;
            }
            match self.pipeline.evaluate(target, &candidate, assessment, Utc::now()).await {
                Ok(Some(_)) => findings += 1,
                Ok(None) => {}
                Err(e) => return Outcome::Failed(e.into()),
            }
            if let Some(item_id) = &candidate.item_id {
                if let Err(e) = self.detector.mark_seen(&target.id, item_id).await {
                    return Outcome::Failed(e.into());
                }
            }
        }

        if let Some(next) = detection.next {
            if let Err(e) = self.detector.commit(&target.id, next).await {
                return Outcome::Failed(e.into());
            }
        }
        Outcome::Completed { findings }
    }

    /// The abandonable part of a check: fetch, detect and score.
    async fn gather(
        &self,
        target: &MonitoringTarget,
    ) -> Result<(Detection, Vec<(CandidateChange, Assessment)>), FetchError> {
        let content = tokio::time::timeout(self.config.fetch_timeout, self.fetcher.fetch(target))
            .await
            .map_err(|_| FetchError::Timeout(self.config.fetch_timeout))??;

        let mut detection = self.detector.detect(target, content).await;
        let candidates = std::mem::take(&mut detection.candidates);
        let mut scored = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let assessment = self.scorer.score(&candidate.text, &target.keywords).await;
            scored.push((candidate, assessment));
        }
        Ok((detection, scored))
    }

    async fn finish(&self, target_id: &str, tick_at: DateTime<Utc>, outcome: Outcome) {
        {
            let mut health = self.health.write().await;
            let entry = health.entry(target_id.to_string()).or_default();
            match outcome {
                Outcome::Completed { findings } => {
                    entry.consecutive_failures = 0;
                    entry.last_error = None;
                    entry.last_success_at = Some(Utc::now());
                    info!(target_id = %target_id, findings, "check completed");
                }
                Outcome::Failed(e) => {
                    entry.consecutive_failures += 1;
                    entry.last_error = Some(e.to_string());
                    warn!(
                        target_id = %target_id,
                        consecutive_failures = entry.consecutive_failures,
                        "check failed: {}",
                        e
                    );
                }
                Outcome::Cancelled => {
                    debug!(target_id = %target_id, "check cancelled");
                }
            }
        }

        if let Err(e) = self.registry.touch(target_id, tick_at).await {
            error!(target_id = %target_id, "failed to record check time: {}", e);
        }
        if self.registry.get(target_id).await.is_none() {
            self.health.write().await.remove(target_id);
            // Removed while the check was committing.
            if let Err(e) = self.detector.forget(target_id).await {
                warn!(target_id = %target_id, "failed to drop snapshot: {}", e);
            }
        }
        self.in_flight.lock().await.remove(target_id);
    }
}

/// Resolves once cancellation has been requested.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

fn log_join(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!("check task panicked: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::fetch::{FeedItem, FetchedContent};
    use crate::notify::{DispatchMode, Subscriber};
    use crate::store::types::Finding;
    use crate::store::tests::temp_store;
    use crate::targets::types::NewTarget;

    #[derive(Clone)]
    enum Reply {
        Document(String),
        Items(Vec<FeedItem>),
        Fail,
    }

    /// Returns a fixed reply after an optional delay, tracking concurrency.
    struct ScriptedFetcher {
        reply: StdMutex<Reply>,
        delay: Duration,
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn new(reply: Reply, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                reply: StdMutex::new(reply),
                delay,
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            })
        }

        fn set_reply(&self, reply: Reply) {
            *self.reply.lock().unwrap() = reply;
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, target: &MonitoringTarget) -> Result<FetchedContent, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            let reply = self.reply.lock().unwrap().clone();
            match reply {
                Reply::Document(text) => Ok(FetchedContent::Document {
                    text,
                    source_ref: target.target.clone(),
                }),
                Reply::Items(items) => Ok(FetchedContent::Items(items)),
                Reply::Fail => Err(FetchError::Other("connection refused".into())),
            }
        }
    }

    /// Requests cancellation while the first finding is being delivered.
    struct StopOnFirstFinding {
        scheduler: Arc<Scheduler>,
        fired: AtomicBool,
    }

    #[async_trait]
    impl Subscriber for StopOnFirstFinding {
        fn name(&self) -> &str {
            "stop-on-first"
        }

        async fn notify(&self, _finding: &Finding) -> anyhow::Result<()> {
            if !self.fired.swap(true, Ordering::SeqCst) {
                self.scheduler.cancel_tx.send_replace(true);
            }
            Ok(())
        }
    }

    /// Removes every registered target when a finding arrives.
    struct RemoveOnFinding {
        registry: Arc<TargetRegistry>,
    }

    #[async_trait]
    impl Subscriber for RemoveOnFinding {
        fn name(&self) -> &str {
            "remove-on-finding"
        }

        async fn notify(&self, _finding: &Finding) -> anyhow::Result<()> {
            for target in self.registry.list().await {
                self.registry.remove(&target.id).await?;
            }
            Ok(())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        registry: Arc<TargetRegistry>,
        detector: Arc<ChangeDetector>,
        pipeline: Arc<NotificationPipeline>,
        scheduler: Arc<Scheduler>,
    }

    async fn harness(config: SchedulerConfig, fetcher: Arc<dyn Fetcher>) -> Harness {
        let (dir, store) = temp_store().await;
        let store = Arc::new(store);
        let registry = Arc::new(
            TargetRegistry::load(dir.path().join("research_config.json"))
                .await
                .unwrap(),
        );
        let detector = Arc::new(ChangeDetector::in_memory());
        let pipeline = Arc::new(NotificationPipeline::new(store, DispatchMode::Inline));
        let scheduler = Scheduler::new(
            config,
            registry.clone(),
            detector.clone(),
            Arc::new(SignificanceScorer::rules_only()),
            pipeline.clone(),
            fetcher,
        );
        Harness {
            _dir: dir,
            registry,
            detector,
            pipeline,
            scheduler,
        }
    }

    fn items(ids: &[&str]) -> Vec<FeedItem> {
        ids.iter()
            .map(|id| FeedItem {
                id: id.to_string(),
                title: format!("New research paper {id}"),
                body: "A breakthrough result".into(),
                url: Some(format!("https://example.com/{id}")),
            })
            .collect()
    }

    async fn all_findings(h: &Harness) -> usize {
        h.pipeline
            .store()
            .findings_since(Utc::now() - ChronoDuration::days(365))
            .await
            .unwrap()
            .len()
    }

    #[test]
    fn test_effective_interval_by_priority() {
        assert_eq!(effective_interval(24.0, Priority::Critical, 1.0), ChronoDuration::hours(6));
        assert_eq!(effective_interval(24.0, Priority::High, 1.0), ChronoDuration::hours(12));
        assert_eq!(effective_interval(24.0, Priority::Medium, 1.0), ChronoDuration::hours(24));
        assert_eq!(effective_interval(24.0, Priority::Low, 1.0), ChronoDuration::hours(48));
        assert_eq!(effective_interval(24.0, Priority::Medium, 4.0), ChronoDuration::hours(96));
    }

    #[test]
    fn test_huge_frequency_saturates() {
        assert_eq!(effective_interval(1e10, Priority::Medium, 1.0), ChronoDuration::hours(10_000_000_000));
        assert_eq!(effective_interval(1e300, Priority::Low, 16.0), TimeDelta::MAX);
        assert_eq!(effective_interval(f64::MAX, Priority::Low, 16.0), TimeDelta::MAX);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_status_with_huge_frequency() {
        let fetcher = ScriptedFetcher::new(Reply::Document("page".into()), Duration::ZERO);
        let h = harness(SchedulerConfig::default(), fetcher).await;
        h.registry
            .add(NewTarget::new("https://example.com", MonitoringType::Url).frequency_hours(1e10))
            .await
            .unwrap();

        let now = Utc::now();
        assert_eq!(h.scheduler.tick(now).await, 1);
        h.scheduler.wait_idle().await;

        let status = h.scheduler.status(now).await;
        assert_eq!(status.targets[0].last_checked_at, Some(now));
        assert_eq!(status.targets[0].next_check_at, None);
        assert_eq!(status.targets[0].state, CheckState::Idle);
        assert_eq!(h.scheduler.tick(now + ChronoDuration::days(365)).await, 0);
    }

    #[test]
    fn test_backoff_multiplier() {
        assert_eq!(backoff_multiplier(0, 3, 16.0), 1.0);
        assert_eq!(backoff_multiplier(3, 3, 16.0), 1.0);
        assert_eq!(backoff_multiplier(4, 3, 16.0), 2.0);
        assert_eq!(backoff_multiplier(6, 3, 16.0), 8.0);
        assert_eq!(backoff_multiplier(40, 3, 16.0), 16.0);
        assert_eq!(backoff_multiplier(u32::MAX, 3, 16.0), 16.0);
    }

    #[test]
    fn test_due_rules() {
        let now = Utc::now();
        let mut target = NewTarget::new("https://example.com", MonitoringType::Url)
            .priority(Priority::Critical)
            .into_target(now)
            .unwrap();
        assert!(is_due(&target, 1.0, now));

        target.last_checked_at = Some(now - ChronoDuration::hours(5));
        assert!(!is_due(&target, 1.0, now));
        target.last_checked_at = Some(now - ChronoDuration::hours(6));
        assert!(is_due(&target, 1.0, now));
        assert!(!is_due(&target, 2.0, now));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_url_baseline_then_change() {
        let fetcher = ScriptedFetcher::new(Reply::Document("version one".into()), Duration::ZERO);
        let h = harness(SchedulerConfig::default(), fetcher.clone()).await;
        let id = h
            .registry
            .add(
                NewTarget::new("https://example.com/changelog", MonitoringType::Url)
                    .threshold(0.0)
                    .frequency_hours(1.0),
            )
            .await
            .unwrap();

        let t0 = Utc::now();
        assert_eq!(h.scheduler.tick(t0).await, 1);
        h.scheduler.wait_idle().await;
        assert!(h.detector.has_snapshot(&id).await);
        assert_eq!(all_findings(&h).await, 0);
        assert_eq!(h.registry.get(&id).await.unwrap().last_checked_at, Some(t0));

        // Not due again within the interval.
        assert_eq!(h.scheduler.tick(t0 + ChronoDuration::minutes(30)).await, 0);

        fetcher.set_reply(Reply::Document("version two with a new release".into()));
        let t1 = t0 + ChronoDuration::hours(1);
        assert_eq!(h.scheduler.tick(t1).await, 1);
        h.scheduler.wait_idle().await;
        assert_eq!(all_findings(&h).await, 1);
        assert_eq!(h.registry.get(&id).await.unwrap().last_checked_at, Some(t1));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_listing_items_reported_once() {
        let fetcher = ScriptedFetcher::new(Reply::Items(items(&["a", "b"])), Duration::ZERO);
        let h = harness(SchedulerConfig::default(), fetcher.clone()).await;
        h.registry
            .add(NewTarget::new("transformers", MonitoringType::Arxiv).threshold(0.1))
            .await
            .unwrap();

        let t0 = Utc::now();
        h.scheduler.tick(t0).await;
        h.scheduler.wait_idle().await;
        assert_eq!(all_findings(&h).await, 2);

        fetcher.set_reply(Reply::Items(items(&["a", "b", "c"])));
        h.scheduler.tick(t0 + ChronoDuration::days(2)).await;
        h.scheduler.wait_idle().await;
        assert_eq!(all_findings(&h).await, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_partial_check_keeps_reported_items_seen() {
        let fetcher = ScriptedFetcher::new(Reply::Items(items(&["a", "b", "c"])), Duration::ZERO);
        let h = harness(SchedulerConfig::default(), fetcher).await;
        h.pipeline
            .subscribe(Arc::new(StopOnFirstFinding {
                scheduler: h.scheduler.clone(),
                fired: AtomicBool::new(false),
            }))
            .await;
        let id = h
            .registry
            .add(NewTarget::new("transformers", MonitoringType::Arxiv).threshold(0.0))
            .await
            .unwrap();

        let t0 = Utc::now();
        assert_eq!(h.scheduler.tick(t0).await, 1);
        h.scheduler.wait_idle().await;
        assert_eq!(all_findings(&h).await, 1);
        assert!(h.detector.has_snapshot(&id).await);

        h.scheduler.cancel_tx.send_replace(false);
        assert_eq!(h.scheduler.tick(t0 + ChronoDuration::days(2)).await, 1);
        h.scheduler.wait_idle().await;

        let findings = h.pipeline.store().findings_for_target(&id).await.unwrap();
        let mut refs: Vec<&str> = findings.iter().map(|f| f.source_ref.as_str()).collect();
        refs.sort_unstable();
        assert_eq!(
            refs,
            vec!["https://example.com/a", "https://example.com/b", "https://example.com/c"]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_removed_while_committing_leaves_no_snapshot() {
        let fetcher = ScriptedFetcher::new(Reply::Items(items(&["a"])), Duration::ZERO);
        let h = harness(SchedulerConfig::default(), fetcher).await;
        h.pipeline
            .subscribe(Arc::new(RemoveOnFinding {
                registry: h.registry.clone(),
            }))
            .await;
        let id = h
            .registry
            .add(NewTarget::new("llm", MonitoringType::News).threshold(0.0))
            .await
            .unwrap();

        h.scheduler.tick(Utc::now()).await;
        h.scheduler.wait_idle().await;

        assert_eq!(all_findings(&h).await, 1);
        assert!(h.registry.get(&id).await.is_none());
        assert!(!h.detector.has_snapshot(&id).await);
        assert!(h.scheduler.status(Utc::now()).await.targets.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_in_flight_target_not_redispatched() {
        let fetcher = ScriptedFetcher::new(Reply::Document("page".into()), Duration::from_millis(300));
        let h = harness(SchedulerConfig::default(), fetcher.clone()).await;
        h.registry
            .add(NewTarget::new("https://example.com", MonitoringType::Url))
            .await
            .unwrap();

        let now = Utc::now();
        assert_eq!(h.scheduler.tick(now).await, 1);
        assert_eq!(h.scheduler.tick(now + ChronoDuration::days(3)).await, 0);
        let status = h.scheduler.status(now).await;
        assert_eq!(status.in_flight, 1);
        assert_eq!(status.targets[0].state, CheckState::Checking);

        h.scheduler.wait_idle().await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.scheduler.status(now).await.in_flight, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrency_is_bounded() {
        let fetcher = ScriptedFetcher::new(Reply::Document("page".into()), Duration::from_millis(100));
        let config = SchedulerConfig {
            max_concurrency: 2,
            ..Default::default()
        };
        let h = harness(config, fetcher.clone()).await;
        for i in 0..5 {
            h.registry
                .add(NewTarget::new(format!("https://example.com/{i}"), MonitoringType::Url))
                .await
                .unwrap();
        }

        assert_eq!(h.scheduler.tick(Utc::now()).await, 5);
        h.scheduler.wait_idle().await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 5);
        assert!(fetcher.max_active.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failures_back_off_and_recover() {
        let fetcher = ScriptedFetcher::new(Reply::Fail, Duration::ZERO);
        let config = SchedulerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        let h = harness(config, fetcher.clone()).await;
        let id = h
            .registry
            .add(NewTarget::new("https://example.com", MonitoringType::Url).frequency_hours(1.0))
            .await
            .unwrap();

        let mut now = Utc::now();
        for _ in 0..2 {
            assert_eq!(h.scheduler.tick(now).await, 1);
            h.scheduler.wait_idle().await;
            now += ChronoDuration::hours(1);
        }
        // Failed checks still count as checked.
        let checked = h.registry.get(&id).await.unwrap().last_checked_at.unwrap();

        let status = h.scheduler.status(now).await;
        let entry = &status.targets[0];
        assert_eq!(entry.consecutive_failures, 2);
        assert_eq!(entry.backoff_multiplier, 2.0);
        assert_eq!(entry.state, CheckState::Backoff);
        assert!(entry.last_error.as_deref().unwrap().contains("connection refused"));
        assert_eq!(entry.next_check_at, Some(checked + ChronoDuration::hours(2)));
        assert_eq!(h.scheduler.tick(now).await, 0);

        fetcher.set_reply(Reply::Document("back".into()));
        let later = checked + ChronoDuration::hours(2);
        assert_eq!(h.scheduler.tick(later).await, 1);
        h.scheduler.wait_idle().await;
        let status = h.scheduler.status(later).await;
        assert_eq!(status.targets[0].consecutive_failures, 0);
        assert_eq!(status.targets[0].backoff_multiplier, 1.0);
        assert!(status.targets[0].last_error.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_removed_target_never_due() {
        let fetcher = ScriptedFetcher::new(Reply::Document("page".into()), Duration::ZERO);
        let h = harness(SchedulerConfig::default(), fetcher.clone()).await;
        let id = h
            .registry
            .add(NewTarget::new("https://example.com", MonitoringType::Url))
            .await
            .unwrap();
        assert!(h.registry.remove(&id).await.unwrap());

        assert_eq!(h.scheduler.tick(Utc::now()).await, 0);
        assert_eq!(h.scheduler.status(Utc::now()).await.target_count, 0);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_removed_mid_check_commits_nothing() {
        let fetcher = ScriptedFetcher::new(Reply::Items(items(&["x"])), Duration::from_millis(200));
        let h = harness(SchedulerConfig::default(), fetcher).await;
        let id = h
            .registry
            .add(NewTarget::new("llm", MonitoringType::News).threshold(0.0))
            .await
            .unwrap();

        h.scheduler.tick(Utc::now()).await;
        h.registry.remove(&id).await.unwrap();
        h.scheduler.wait_idle().await;

        assert!(!h.detector.has_snapshot(&id).await);
        assert_eq!(all_findings(&h).await, 0);
        assert!(h.registry.get(&id).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_within_grace_and_no_finding_after() {
        let fetcher = ScriptedFetcher::new(Reply::Items(items(&["a"])), Duration::from_secs(30));
        let config = SchedulerConfig {
            stop_grace: Duration::from_millis(200),
            ..Default::default()
        };
        let h = harness(config, fetcher.clone()).await;
        let id = h
            .registry
            .add(NewTarget::new("rust", MonitoringType::Keyword).threshold(0.0))
            .await
            .unwrap();

        assert!(h.scheduler.start().await);
        assert!(!h.scheduler.start().await);
        for _ in 0..100 {
            if fetcher.calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let started = std::time::Instant::now();
        assert!(h.scheduler.stop().await);
        assert!(started.elapsed() < Duration::from_secs(5));

        let status = h.scheduler.status(Utc::now()).await;
        assert!(!status.running);
        assert_eq!(status.in_flight, 0);
        // The abandoned check still counts as checked.
        assert!(h.registry.get(&id).await.unwrap().last_checked_at.is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(all_findings(&h).await, 0);
        assert!(!h.detector.has_snapshot(&id).await);
        assert_eq!(h.scheduler.tick(Utc::now()).await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_restart_after_stop() {
        let fetcher = ScriptedFetcher::new(Reply::Document("page".into()), Duration::ZERO);
        let config = SchedulerConfig {
            tick_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let h = harness(config, fetcher.clone()).await;
        h.registry
            .add(NewTarget::new("https://example.com", MonitoringType::Url))
            .await
            .unwrap();

        assert!(!h.scheduler.stop().await);
        assert!(h.scheduler.start().await);
        for _ in 0..100 {
            if fetcher.calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(h.scheduler.status(Utc::now()).await.last_tick_at.is_some());
        assert!(h.scheduler.stop().await);
        assert!(h.scheduler.start().await);
        assert!(h.scheduler.is_running().await);
        h.scheduler.stop().await;
    }
}
