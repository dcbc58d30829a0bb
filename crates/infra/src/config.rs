//! Configuration loading from the environment.

use std::net::SocketAddr;
use std::time::Duration;

use marketpulse_core::{RetryPolicy, MAX_DELAY};

use crate::jobs::{ReaperConfig, StatsWindow, WorkerConfig};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set when USE_PERSISTENT_STORES=true")]
    Missing(&'static str),
}

/// Upper bound for every duration setting (ten years).
const MAX_SETTING: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Process configuration; every field has a default.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub use_persistent_stores: bool,
    pub http_addr: SocketAddr,
    pub worker_count: usize,
    pub worker: WorkerConfig,
    pub shutdown_grace: Duration,
    pub retry: RetryPolicy,
    pub reaper: ReaperConfig,
    pub cleanup_interval: Duration,
    pub cleanup_retention: Duration,
    /// `None` disables the daily analysis producer.
    pub daily_analysis_interval: Option<Duration>,
    pub collaborator_url: Option<String>,
    pub collaborator_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            use_persistent_stores: false,
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            worker_count: 2,
            worker: WorkerConfig::default(),
            shutdown_grace: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            reaper: ReaperConfig::default(),
            cleanup_interval: Duration::from_secs(3600),
            cleanup_retention: Duration::from_secs(24 * 3600),
            daily_analysis_interval: Some(Duration::from_secs(24 * 3600)),
            collaborator_url: None,
            collaborator_timeout: Duration::from_secs(30),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load from any variable source (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let defaults = Self::default();

        let database_url = env.string("DATABASE_URL");
        let use_persistent_stores = env.flag("USE_PERSISTENT_STORES")?.unwrap_or(false);
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let worker_count = env.parse::<usize>("WORKER_COUNT")?.unwrap_or(defaults.worker_count);
        if worker_count == 0 {
            return Err(ConfigError::Invalid {
                var: "WORKER_COUNT",
                value: "0".into(),
                reason: "at least one worker is required".into(),
            });
        }

        let base_delay = env.secs("RETRY_BASE_DELAY_SECS")?.unwrap_or(defaults.retry.base_delay);
        let max_delay = env.secs("RETRY_MAX_DELAY_SECS")?.unwrap_or(defaults.retry.max_delay);
        at_most("RETRY_BASE_DELAY_SECS", base_delay, MAX_DELAY)?;
        at_most("RETRY_MAX_DELAY_SECS", max_delay, MAX_DELAY)?;
        if max_delay < base_delay {
            return Err(ConfigError::Invalid {
                var: "RETRY_MAX_DELAY_SECS",
                value: max_delay.as_secs().to_string(),
                reason: "must not be below RETRY_BASE_DELAY_SECS".into(),
            });
        }

        let daily_analysis_interval = match env.secs("DAILY_ANALYSIS_INTERVAL_SECS")? {
            Some(d) if d.is_zero() => None,
            Some(d) => Some(d),
            None => defaults.daily_analysis_interval,
        };

        Ok(Self {
            database_url,
            use_persistent_stores,
            http_addr: env.parse("HTTP_ADDR")?.unwrap_or(defaults.http_addr),
            worker_count,
            worker: WorkerConfig {
                poll_interval: env
                    .millis("WORKER_POLL_INTERVAL_MS")?
                    .unwrap_or(defaults.worker.poll_interval),
                error_backoff: env
                    .millis("WORKER_ERROR_BACKOFF_MS")?
                    .unwrap_or(defaults.worker.error_backoff),
            },
            shutdown_grace: env
                .secs("WORKER_SHUTDOWN_GRACE_SECS")?
                .unwrap_or(defaults.shutdown_grace),
            retry: RetryPolicy {
                base_delay,
                max_delay,
                ..defaults.retry
            },
            reaper: ReaperConfig {
                interval: env
                    .secs("REAPER_INTERVAL_SECS")?
                    .unwrap_or(defaults.reaper.interval),
                stuck_after: env
                    .secs("REAPER_STUCK_AFTER_SECS")?
                    .unwrap_or(defaults.reaper.stuck_after),
                ..defaults.reaper
            },
            cleanup_interval: env
                .secs("CLEANUP_INTERVAL_SECS")?
                .unwrap_or(defaults.cleanup_interval),
            cleanup_retention: env
                .hours("CLEANUP_RETENTION_HOURS")?
                .unwrap_or(defaults.cleanup_retention),
            daily_analysis_interval,
            collaborator_url: env.string("COLLABORATOR_URL"),
            collaborator_timeout: env
                .secs("COLLABORATOR_TIMEOUT_SECS")?
                .unwrap_or(defaults.collaborator_timeout),
        })
    }

    /// Stats window consistent with the reaper's notion of "stuck".
    pub fn stats_window(&self) -> StatsWindow {
        StatsWindow {
            stuck_after: self.reaper.stuck_after,
            ..StatsWindow::default()
        }
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(var)
            .map(|value| {
                value.parse::<T>().map_err(|e| ConfigError::Invalid {
                    var,
                    reason: e.to_string(),
                    value,
                })
            })
            .transpose()
    }

    fn flag(&self, var: &'static str) -> Result<Option<bool>, ConfigError> {
        self.string(var)
            .map(|value| match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    var,
                    value,
                    reason: "expected true or false".into(),
                }),
            })
            .transpose()
    }

    fn secs(&self, var: &'static str) -> Result<Option<Duration>, ConfigError> {
        self.parse::<u64>(var)?
            .map(|s| at_most(var, Duration::from_secs(s), MAX_SETTING))
            .transpose()
    }

    fn millis(&self, var: &'static str) -> Result<Option<Duration>, ConfigError> {
        self.parse::<u64>(var)?
            .map(|ms| at_most(var, Duration::from_millis(ms), MAX_SETTING))
            .transpose()
    }

    fn hours(&self, var: &'static str) -> Result<Option<Duration>, ConfigError> {
        self.parse::<u64>(var)?
            .map(|h| {
                let secs = h.checked_mul(3600).unwrap_or(u64::MAX);
                at_most(var, Duration::from_secs(secs), MAX_SETTING)
            })
            .transpose()
    }
}

fn at_most(var: &'static str, value: Duration, max: Duration) -> Result<Duration, ConfigError> {
    if value > max {
        return Err(ConfigError::Invalid {
            var,
            value: value.as_secs().to_string(),
            reason: format!("must be at most {}s", max.as_secs()),
        });
    }
    Ok(value)
}
