//! Tracing subscriber setup.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Filter directives (default: `trigger_layer=info`)
//! - `TRIGGER_LAYER_LOG_TARGETS`: Set to "false" to hide module targets

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "trigger_layer=info";

/// Configuration for the fmt subscriber.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// `EnvFilter` directives.
    pub filter: String,
    /// Whether to print the event target.
    pub with_target: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            filter: std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_FILTER.to_string()),
            with_target: std::env::var("TRIGGER_LAYER_LOG_TARGETS")
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(true),
        }
    }
}

impl TracingConfig {
    /// Parse the filter, falling back to [`DEFAULT_FILTER`] on bad directives.
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    }
}

/// Install the global tracing subscriber.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(
    config: &TracingConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(config.with_target)
                .with_filter(config.env_filter()),
        )
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_filter_falls_back() {
        let config = TracingConfig {
            filter: "trigger_layer=loudest".to_string(),
            with_target: true,
        };
        assert_eq!(config.env_filter().to_string(), DEFAULT_FILTER);
    }

    #[test]
    fn test_custom_filter_kept() {
        let config = TracingConfig {
            filter: "trigger_layer=debug".to_string(),
            with_target: false,
        };
        assert_eq!(config.env_filter().to_string(), "trigger_layer=debug");
    }
}
