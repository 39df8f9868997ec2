//! MailClaw configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{MailClawError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailClawConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl MailClawConfig {
    /// Load config from the default path (~/.mailclaw/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MailClawError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    /// Parse config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| MailClawError::Config(format!("Failed to parse config: {e}")))
    }

    /// Save config to a specific path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| MailClawError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the MailClaw home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".mailclaw")
    }
}

/// Scheduler configuration. Fixed at construction; only the enabled flag
/// changes at runtime (pause/resume).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on tasks counted as active at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,
    /// Period of the admission tick.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// `max_retries` given to tasks that do not set one.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Clear `retry_count` after each successful recurring run.
    #[serde(default = "bool_true")]
    pub reset_retries_on_recurrence: bool,
    /// Number of lifecycle events kept in memory.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Whether admission starts enabled.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// SQLite journal location. `None` keeps library schedulers in memory;
    /// the `mailclaw` binary falls back to `~/.mailclaw/tasks.db`.
    #[serde(default)]
    pub db_path: Option<String>,
    /// Journal rows kept per table: newest events, newest finished tasks.
    #[serde(default = "default_journal_retention")]
    pub journal_retention: usize,
}

fn bool_true() -> bool { true }
fn default_max_concurrent() -> usize { 3 }
fn default_tick_interval() -> u64 { 1 }
fn default_max_retries() -> u32 { 3 }
fn default_history_limit() -> usize { 100 }
fn default_journal_retention() -> usize { 1000 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent(),
            tick_interval_secs: default_tick_interval(),
            default_max_retries: default_max_retries(),
            reset_retries_on_recurrence: true,
            history_limit: default_history_limit(),
            enabled: true,
            db_path: None,
            journal_retention: default_journal_retention(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String { "mailclaw=info,mailclaw_scheduler=info".into() }

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MailClawConfig::default();
        assert_eq!(config.scheduler.max_concurrent_tasks, 3);
        assert_eq!(config.scheduler.tick_interval_secs, 1);
        assert_eq!(config.scheduler.default_max_retries, 3);
        assert!(config.scheduler.reset_retries_on_recurrence);
        assert!(config.scheduler.enabled);
        assert!(config.scheduler.db_path.is_none());
        assert!(!config.log.json);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = MailClawConfig::from_toml(
            r#"
            [scheduler]
            max_concurrent_tasks = 1
            reset_retries_on_recurrence = false
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.max_concurrent_tasks, 1);
        assert!(!config.scheduler.reset_retries_on_recurrence);
        assert_eq!(config.scheduler.history_limit, 100);
        assert_eq!(config.scheduler.journal_retention, 1000);
        assert_eq!(config.log.level, default_log_level());
    }

    #[test]
    fn test_invalid_toml() {
        let err = MailClawConfig::from_toml("scheduler = 5").unwrap_err();
        assert!(matches!(err, MailClawError::Config(_)));
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join("mailclaw-test-config");
        let path = dir.join("config.toml");
        let mut config = MailClawConfig::default();
        config.scheduler.tick_interval_secs = 5;
        config.scheduler.db_path = Some("/tmp/tasks.db".into());
        config.save_to(&path).unwrap();

        let loaded = MailClawConfig::load_from(&path).unwrap();
        assert_eq!(loaded.scheduler.tick_interval_secs, 5);
        assert_eq!(loaded.scheduler.db_path.as_deref(), Some("/tmp/tasks.db"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_file() {
        let err = MailClawConfig::load_from(Path::new("/nonexistent/mailclaw.toml")).unwrap_err();
        assert!(matches!(err, MailClawError::Config(_)));
    }
}
