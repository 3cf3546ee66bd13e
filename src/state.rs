use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};

use crate::monitor::{Monitor, MonitorOptions};
use crate::notify::DispatchMode;
use crate::scheduler::SchedulerConfig;

/// Runtime settings, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
    pub scheduler: SchedulerConfig,
    pub analyze_timeout: Duration,
    pub dispatch: DispatchMode,
    pub autostart: bool,
    pub ai_enhance: bool,
    pub notify_channel_id: Option<u64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("./data/monitor");
        Self {
            config_path: data_dir.join("research_config.json"),
            data_dir,
            scheduler: SchedulerConfig::default(),
            analyze_timeout: Duration::from_secs(60),
            dispatch: DispatchMode::Inline,
            autostart: true,
            ai_enhance: false,
            notify_channel_id: None,
        }
    }
}

impl MonitorConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    /// Build from any key lookup; unset or blank keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(dir) = get("MONITOR_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        config.config_path = match get("MONITOR_CONFIG_PATH") {
            Some(path) => PathBuf::from(path),
            None => config.data_dir.join("research_config.json"),
        };

        let scheduler = &mut config.scheduler;
        if let Some(secs) = parse::<u64>(&get, "MONITOR_TICK_SECS")? {
            scheduler.tick_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(n) = parse::<usize>(&get, "MONITOR_MAX_CONCURRENCY")? {
            scheduler.max_concurrency = n.max(1);
        }
        if let Some(secs) = parse::<u64>(&get, "MONITOR_FETCH_TIMEOUT_SECS")? {
            scheduler.fetch_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&get, "MONITOR_STOP_GRACE_SECS")? {
            scheduler.stop_grace = Duration::from_secs(secs);
        }
        if let Some(n) = parse::<u32>(&get, "MONITOR_FAILURE_THRESHOLD")? {
            scheduler.failure_threshold = n;
        }
        if let Some(cap) = parse::<f64>(&get, "MONITOR_MAX_BACKOFF")? {
            anyhow::ensure!(cap.is_finite() && cap >= 1.0, "MONITOR_MAX_BACKOFF must be >= 1, got {cap}");
            scheduler.max_backoff_multiplier = cap;
        }

        if let Some(secs) = parse::<u64>(&get, "MONITOR_ANALYZE_TIMEOUT_SECS")? {
            config.analyze_timeout = Duration::from_secs(secs);
        }
        if let Some(mode) = get("MONITOR_DISPATCH") {
            config.dispatch = mode.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(autostart) = parse_flag(&get, "MONITOR_AUTOSTART")? {
            config.autostart = autostart;
        }
        config.ai_enhance = match parse_flag(&get, "MONITOR_AI_ENHANCE")? {
            Some(flag) => flag,
            None => get("LLM_BASE_URL").is_some(),
        };
        config.notify_channel_id = parse::<u64>(&get, "DISCORD_NOTIFY_CHANNEL_ID")?;

        Ok(config)
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    pub fn monitor_options(&self) -> MonitorOptions {
        MonitorOptions {
            scheduler: self.scheduler.clone(),
            analyze_timeout: self.analyze_timeout,
            dispatch: self.dispatch,
        }
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    get(key)
        .map(|raw| raw.parse::<T>().with_context(|| format!("invalid {key}: {raw:?}")))
        .transpose()
}

fn parse_flag(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>> {
    match get(key).map(|v| v.to_ascii_lowercase()).as_deref() {
        None => Ok(None),
        Some("1" | "true" | "yes" | "on") => Ok(Some(true)),
        Some("0" | "false" | "no" | "off") => Ok(Some(false)),
        Some(other) => anyhow::bail!("invalid {key}: {other:?} (expected true or false)"),
    }
}

pub struct AppState {
    pub monitor: Arc<Monitor>,
    pub admin_ids: HashSet<u64>,
}

impl AppState {
    pub fn is_admin(&self, user_id: u64) -> bool {
        self.admin_ids.contains(&user_id)
    }
}

pub type Context<'a> = poise::Context<'a, AppState, anyhow::Error>;
