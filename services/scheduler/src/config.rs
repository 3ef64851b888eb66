//! Configuration for the command scheduler.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => bail!("unknown log format '{other}', expected json or pretty"),
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Fallback rescan interval when no event wakes the scheduling loop.
    pub poll_interval: Duration,

    /// How often watched command files are checked for changes.
    pub command_file_poll_interval: Duration,

    /// Directory command dumps are written to.
    pub dump_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            command_file_poll_interval: Duration::from_secs(20),
            dump_dir: std::env::temp_dir().join("tf-scheduler"),
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let poll_interval = env_parse::<u64>("TF_SCHEDULER_POLL_INTERVAL_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);

        let command_file_poll_interval = env_parse::<u64>("TF_COMMAND_FILE_POLL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.command_file_poll_interval);

        let dump_dir = std::env::var("TF_DUMP_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.dump_dir);

        let log_level = std::env::var("TF_LOG_LEVEL").unwrap_or(defaults.log_level);

        let log_format = match std::env::var("TF_LOG_FORMAT") {
            Ok(s) => s.parse()?,
            Err(_) => defaults.log_format,
        };

        Ok(Self {
            poll_interval,
            command_file_poll_interval,
            dump_dir,
            log_level,
            log_format,
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_command_file_poll_interval(mut self, interval: Duration) -> Self {
        self.command_file_poll_interval = interval;
        self
    }

    pub fn with_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_dir = dir.into();
        self
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map(Some)
            .with_context(|| format!("invalid value for {key}: '{value}'")),
        Err(_) => Ok(None),
    }
}
