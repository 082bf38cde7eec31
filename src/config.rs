//! 通知核心配置
//!
//! 加载顺序：
//! 1. `$WORKLOG_NOTIFY_CONFIG` 指定的文件
//! 2. `~/.config/worklog-notify/config.json`
//! 3. 默认值
//!
//! 文件里缺失的字段使用默认值；之后再应用环境变量覆盖
//! （`WORKLOG_NOTIFY_HTTP_TIMEOUT`、`WORKLOG_NOTIFY_MAX_RETRIES`）。

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::notification::{DeliveryConfig, RetryQueueConfig};
use crate::scheduler::SchedulerConfig;

pub const CONFIG_ENV: &str = "WORKLOG_NOTIFY_CONFIG";
pub const HTTP_TIMEOUT_ENV: &str = "WORKLOG_NOTIFY_HTTP_TIMEOUT";
pub const MAX_RETRIES_ENV: &str = "WORKLOG_NOTIFY_MAX_RETRIES";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub http_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_secs: Vec<u64>,
    pub queue_backoff_secs: Vec<u64>,
    pub queue_max_attempts: u32,
    pub queue_check_interval_secs: u64,
    pub queue_capacity: usize,
    pub fast_tick_secs: u64,
    pub slow_tick_secs: u64,
    pub sleep_threshold_secs: u64,
    /// `MemoryStore` 快照文件
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_file: Option<PathBuf>,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            http_timeout_secs: 10,
            max_retries: 3,
            retry_backoff_secs: vec![1, 5, 15],
            queue_backoff_secs: vec![5, 30, 120, 300, 900],
            queue_max_attempts: 5,
            queue_check_interval_secs: 30,
            queue_capacity: 1000,
            fast_tick_secs: 60,
            slow_tick_secs: 300,
            sleep_threshold_secs: 3600,
            data_file: None,
        }
    }
}

impl NotifierConfig {
    /// 默认配置文件路径
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/worklog-notify/config.json"))
    }

    /// 按加载顺序读取配置并应用环境变量覆盖
    pub fn load() -> Result<Self> {
        let explicit = std::env::var(CONFIG_ENV).ok().filter(|p| !p.is_empty());
        let mut config = match explicit {
            Some(path) => Self::load_from(Path::new(&path))?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load_from(&path)?,
                _ => {
                    debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// 应用覆盖值；无法解析的值忽略并告警
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(HTTP_TIMEOUT_ENV) {
            match raw.trim().parse() {
                Ok(secs) => self.http_timeout_secs = secs,
                Err(_) => warn!(var = HTTP_TIMEOUT_ENV, value = %raw, "Ignoring invalid override"),
            }
        }
        if let Some(raw) = lookup(MAX_RETRIES_ENV) {
            match raw.trim().parse() {
                Ok(n) => self.max_retries = n,
                Err(_) => warn!(var = MAX_RETRIES_ENV, value = %raw, "Ignoring invalid override"),
            }
        }
    }

    /// 空的退避表回退到默认值；间隔必须为正
    pub fn validate(&mut self) -> Result<()> {
        let defaults = Self::default();
        if self.retry_backoff_secs.is_empty() {
            warn!("Empty retry_backoff_secs, using defaults");
            self.retry_backoff_secs = defaults.retry_backoff_secs;
        }
        if self.queue_backoff_secs.is_empty() {
            warn!("Empty queue_backoff_secs, using defaults");
            self.queue_backoff_secs = defaults.queue_backoff_secs;
        }
        if self.fast_tick_secs == 0 {
            bail!("fast_tick_secs must be greater than 0");
        }
        if self.slow_tick_secs == 0 {
            bail!("slow_tick_secs must be greater than 0");
        }
        if self.queue_check_interval_secs == 0 {
            bail!("queue_check_interval_secs must be greater than 0");
        }
        if self.http_timeout_secs == 0 {
            bail!("http_timeout_secs must be greater than 0");
        }
        Ok(())
    }

    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            max_retries: self.max_retries,
            backoff: secs(&self.retry_backoff_secs),
        }
    }

    pub fn retry_queue_config(&self) -> RetryQueueConfig {
        RetryQueueConfig {
            check_interval: Duration::from_secs(self.queue_check_interval_secs),
            backoff: secs(&self.queue_backoff_secs),
            max_attempts: self.queue_max_attempts.max(1),
            capacity: self.queue_capacity.max(1),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            fast_tick: Duration::from_secs(self.fast_tick_secs),
            slow_tick: Duration::from_secs(self.slow_tick_secs),
            sleep_threshold: Duration::from_secs(self.sleep_threshold_secs),
        }
    }

    pub fn fast_tick(&self) -> Duration {
        Duration::from_secs(self.fast_tick_secs)
    }
}

fn secs(values: &[u64]) -> Vec<Duration> {
    values.iter().map(|s| Duration::from_secs(*s)).collect()
}
