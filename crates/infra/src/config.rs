//! Worker configuration loaded from the environment.

use std::collections::HashMap;
use std::time::Duration;

use crate::jobs::{JobExecutorConfig, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {variable}: {message}")]
    Invalid { variable: &'static str, message: String },
}

impl ConfigError {
    fn invalid(variable: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            variable,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// PostgreSQL URL; `None` runs against the in-memory store.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub job_max_attempts: u32,
    /// Queue name -> cron expression overrides.
    pub schedules: HashMap<String, String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: 10,
            concurrency: 4,
            poll_interval: Duration::from_millis(250),
            job_max_attempts: 5,
            schedules: HashMap::new(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let concurrency = parse_or(&get, "FUNDFLOW_WORKER_CONCURRENCY", defaults.concurrency)?;
        if concurrency == 0 {
            return Err(ConfigError::invalid("FUNDFLOW_WORKER_CONCURRENCY", "must be at least 1"));
        }
        let job_max_attempts = parse_or(&get, "FUNDFLOW_JOB_MAX_ATTEMPTS", defaults.job_max_attempts)?;
        if job_max_attempts == 0 {
            return Err(ConfigError::invalid("FUNDFLOW_JOB_MAX_ATTEMPTS", "must be at least 1"));
        }
        let db_max_connections =
            parse_or(&get, "FUNDFLOW_DB_MAX_CONNECTIONS", defaults.db_max_connections)?;
        if db_max_connections == 0 {
            return Err(ConfigError::invalid("FUNDFLOW_DB_MAX_CONNECTIONS", "must be at least 1"));
        }
        let poll_interval_ms: u64 = parse_or(
            &get,
            "FUNDFLOW_POLL_INTERVAL_MS",
            defaults.poll_interval.as_millis() as u64,
        )?;

        let schedules = match get("FUNDFLOW_SCHEDULES") {
            Some(raw) => parse_schedules(&raw)?,
            None => HashMap::new(),
        };

        Ok(Self {
            database_url: get("DATABASE_URL"),
            db_max_connections,
            concurrency,
            poll_interval: Duration::from_millis(poll_interval_ms),
            job_max_attempts,
            schedules,
        })
    }

    pub fn executor_config(&self) -> JobExecutorConfig {
        JobExecutorConfig::default()
            .with_name("fundflow-worker")
            .with_concurrency(self.concurrency)
            .with_poll_interval(self.poll_interval)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.job_max_attempts,
            ..RetryPolicy::default()
        }
    }
}

fn parse_or<T, G>(get: &G, variable: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(variable) {
        Some(raw) => raw
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(variable, format!("{raw:?}: {e}"))),
        None => Ok(default),
    }
}

/// `Queue=<cron>;Queue2=<cron>`
fn parse_schedules(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    raw.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (queue, expression) = entry.split_once('=').ok_or_else(|| {
                ConfigError::invalid("FUNDFLOW_SCHEDULES", format!("expected Queue=<cron>, got {entry:?}"))
            })?;
            let (queue, expression) = (queue.trim(), expression.trim());
            if queue.is_empty() || expression.is_empty() {
                return Err(ConfigError::invalid(
                    "FUNDFLOW_SCHEDULES",
                    format!("expected Queue=<cron>, got {entry:?}"),
                ));
            }
            Ok((queue.to_string(), expression.to_string()))
        })
        .collect()
}
