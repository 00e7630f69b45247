//! Environment-driven application settings

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// All tunables read from the environment at startup.
///
/// `DATABASE_URL` is the only required variable; everything else has a
/// default matching the reference deployment.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database_url: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_true")]
    pub auto_migrate: bool,
    /// Reserved for the external archive collaborator
    #[serde(default)]
    pub archive_enabled: bool,
    #[serde(default = "default_archive_delay_hours")]
    pub archive_delay_hours: u64,
    #[serde(default = "default_abandoned_age")]
    pub abandoned_step_age_minutes: i64,
    #[serde(default = "default_run_timeout")]
    pub run_timeout_minutes: i64,
    #[serde(default = "default_retry_cooldown")]
    pub retry_cooldown_minutes: i64,
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_seconds: u64,
    #[serde(default = "default_max_stories")]
    pub max_stories_per_run: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_archive_delay_hours() -> u64 {
    24
}

const fn default_abandoned_age() -> i64 {
    15
}

const fn default_run_timeout() -> i64 {
    60
}

const fn default_retry_cooldown() -> i64 {
    5
}

const fn default_reaper_interval() -> u64 {
    60
}

const fn default_max_stories() -> usize {
    20
}

impl Settings {
    /// Load settings from the environment (and a `.env` file when present).
    pub fn load() -> Result<Self, SettingsError> {
        dotenvy::dotenv().ok();

        if std::env::var("DATABASE_URL").is_err() {
            return Err(SettingsError::MissingVar("DATABASE_URL"));
        }

        let settings = config::Config::builder()
            .add_source(config::Environment::default().try_parsing(true))
            .build()?
            .try_deserialize()?;

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Settings {
        serde_json::from_value::<Settings>(serde_json::json!({
            "database_url": "postgres://localhost/foreman"
        }))
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let settings = base();
        assert_eq!(settings.host, "0.0.0.0");
        assert_eq!(settings.port, 3000);
        assert_eq!(settings.log_level, "info");
        assert!(settings.auto_migrate);
        assert_eq!(settings.abandoned_step_age_minutes, 15);
        assert_eq!(settings.run_timeout_minutes, 60);
        assert_eq!(settings.retry_cooldown_minutes, 5);
        assert_eq!(settings.reaper_interval_seconds, 60);
        assert_eq!(settings.max_stories_per_run, 20);
        assert!(!settings.archive_enabled);
    }

    #[test]
    fn test_overrides_deserialize() {
        let settings: Settings = serde_json::from_value(serde_json::json!({
            "database_url": "postgres://localhost/foreman",
            "port": 8080,
            "abandoned_step_age_minutes": 30
        }))
        .unwrap();
        assert_eq!(settings.port, 8080);
        assert_eq!(settings.abandoned_step_age_minutes, 30);
    }
}
