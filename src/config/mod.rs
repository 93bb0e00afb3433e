//! Configuration management.
//!
//! Trigger layer configuration can come from:
//! - Environment variables (TRIGGER_LAYER_*)
//! - Config file (~/.config/trigger-layer/config.toml)
//!
//! The config only supplies defaults; per-workflow trigger configs are set
//! through the [`TriggerLayer`](crate::layer::TriggerLayer) API.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::engine::RetryPolicyConfig;
use crate::error::{Error, Result};
use crate::triggers::parse_timezone;

/// Trigger layer configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Retry policy for workflows that never configured their own
    #[serde(default)]
    pub retry: RetryPolicyConfig,

    #[serde(default)]
    pub cron: CronSettings,

    #[serde(default)]
    pub webhook: WebhookSettings,
}

/// Cron defaults and poller settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronSettings {
    /// Timezone for cron configs that leave it blank
    #[serde(default = "default_cron_timezone")]
    pub default_timezone: String,

    /// How often the poller looks for due schedules
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for CronSettings {
    fn default() -> Self {
        Self {
            default_timezone: default_cron_timezone(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_cron_timezone() -> String {
    "UTC".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

/// Webhook defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSettings {
    /// Methods accepted by a webhook that was never configured
    #[serde(default = "default_methods")]
    pub default_methods: Vec<String>,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            default_methods: default_methods(),
        }
    }
}

fn default_methods() -> Vec<String> {
    vec!["POST".to_string()]
}

impl Config {
    /// Load configuration from default locations.
    ///
    /// A missing or unreadable config file is ignored; the environment is
    /// applied on top either way. A file or set of overrides that fails
    /// [`Config::validate`] is dropped with a warning, so the result is
    /// always valid.
    pub fn load() -> Self {
        let primary_path = Self::config_dir().join("config.toml");
        let partial = Self::load_partial_from_path(&primary_path).ok();
        Self::resolve(partial, |name| std::env::var(name).ok())
    }

    fn resolve(partial: Option<PartialConfig>, var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(partial) = partial {
            config.apply_partial(partial);
            if let Err(e) = config.validate() {
                warn!("Ignoring invalid config file: {}", e);
                config = Self::default();
            }
        }

        let mut overridden = config.clone();
        overridden.apply_overrides(var);
        match overridden.validate() {
            Ok(()) => overridden,
            Err(e) => {
                warn!("Ignoring TRIGGER_LAYER_* overrides: {}", e);
                config
            }
        }
    }

    /// Load one config file strictly, without environment overrides.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("trigger-layer"))
            .unwrap_or_else(|| PathBuf::from(".trigger-layer"))
    }

    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        parse_timezone(&self.cron.default_timezone)?;
        if self.cron.poll_interval_ms == 0 {
            return Err(Error::Config(
                "cron.poll_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(tz) = var("TRIGGER_LAYER_CRON_TIMEZONE") {
            self.cron.default_timezone = tz;
        }
        if let Some(ms) = var("TRIGGER_LAYER_POLL_INTERVAL_MS") {
            if let Ok(parsed) = ms.parse::<u64>() {
                self.cron.poll_interval_ms = parsed;
            }
        }
        if let Some(attempts) = var("TRIGGER_LAYER_RETRY_MAX_ATTEMPTS") {
            if let Ok(parsed) = attempts.parse::<u32>() {
                self.retry.max_attempts = parsed;
            }
        }
        if let Some(delay) = var("TRIGGER_LAYER_RETRY_INITIAL_DELAY_SECONDS") {
            if let Ok(parsed) = delay.parse::<f64>() {
                self.retry.initial_delay_seconds = parsed;
            }
        }
        if let Some(methods) = var("TRIGGER_LAYER_WEBHOOK_METHODS") {
            self.webhook.default_methods = methods
                .split(',')
                .map(|m| m.trim().to_uppercase())
                .filter(|m| !m.is_empty())
                .collect();
        }
    }

    fn load_partial_from_path(path: &Path) -> std::result::Result<PartialConfig, ()> {
        let content = std::fs::read_to_string(path).map_err(|_| ())?;
        toml::from_str(&content).map_err(|_| ())
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(retry) = partial.retry {
            self.retry = retry;
        }
        if let Some(cron) = partial.cron {
            self.cron = cron;
        }
        if let Some(webhook) = partial.webhook {
            self.webhook = webhook;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    retry: Option<RetryPolicyConfig>,
    cron: Option<CronSettings>,
    webhook: Option<WebhookSettings>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.cron.default_timezone, "UTC");
        assert_eq!(config.cron.poll_interval_ms, 1000);
        assert_eq!(config.webhook.default_methods, vec!["POST".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_path_partial_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[retry]
max_attempts = 5
initial_delay_seconds = 10.0

[cron]
default_timezone = "Asia/Kuala_Lumpur"
"#
        )
        .unwrap();

        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay_seconds, 10.0);
        assert_eq!(config.retry.backoff_factor, 2.0);
        assert_eq!(config.cron.default_timezone, "Asia/Kuala_Lumpur");
        assert_eq!(config.cron.poll_interval_ms, 1000);
        assert_eq!(config.webhook, WebhookSettings::default());
    }

    #[test]
    fn test_load_from_path_rejects_bad_timezone() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[cron]\ndefault_timezone = \"Mars/Olympus\"").unwrap();
        assert!(Config::load_from_path(file.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("TRIGGER_LAYER_CRON_TIMEZONE", "+08:00"),
            ("TRIGGER_LAYER_POLL_INTERVAL_MS", "250"),
            ("TRIGGER_LAYER_RETRY_MAX_ATTEMPTS", "not-a-number"),
            ("TRIGGER_LAYER_WEBHOOK_METHODS", "post, put,"),
        ]);
        let mut config = Config::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.cron.default_timezone, "+08:00");
        assert_eq!(config.cron.poll_interval_ms, 250);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(
            config.webhook.default_methods,
            vec!["POST".to_string(), "PUT".to_string()]
        );
    }

    #[test]
    fn test_invalid_env_overrides_are_dropped() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("TRIGGER_LAYER_RETRY_INITIAL_DELAY_SECONDS", "inf"),
            ("TRIGGER_LAYER_POLL_INTERVAL_MS", "250"),
        ]);
        let config = Config::resolve(None, |name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config, Config::default());
        assert!(config.validate().is_ok());

        let vars: HashMap<&str, &str> =
            HashMap::from([("TRIGGER_LAYER_POLL_INTERVAL_MS", "0")]);
        let config = Config::resolve(None, |name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.cron.poll_interval_ms, 1000);
    }

    #[test]
    fn test_invalid_file_falls_back_to_defaults() {
        let partial: PartialConfig =
            toml::from_str("[cron]\ndefault_timezone = \"Mars/Olympus\"").unwrap();
        let vars: HashMap<&str, &str> =
            HashMap::from([("TRIGGER_LAYER_POLL_INTERVAL_MS", "250")]);
        let config = Config::resolve(Some(partial), |name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.cron.default_timezone, "UTC");
        assert_eq!(config.cron.poll_interval_ms, 250);
    }

    #[test]
    fn test_toml_output_parses_back() {
        let config = Config::default();
        let rendered = config.to_toml_string().unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
