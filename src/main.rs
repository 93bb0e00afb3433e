use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::info;

use trigger_layer::config::Config;
use trigger_layer::engine::{RetryPolicyConfig, RetryPolicyState};
use trigger_layer::shutdown::ShutdownCoordinator;
use trigger_layer::storage::TriggerStores;
use trigger_layer::telemetry::{init_tracing, TracingConfig};
use trigger_layer::triggers::{
    parse_schedule, parse_timezone, CronDispatchPlan, CronPoller, CronTriggerConfig,
    ExecutionEngine,
};
use trigger_layer::TriggerLayer;

#[derive(Parser)]
#[command(name = "trigger-layer")]
#[command(about = "Webhook, cron and manual workflow triggers", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.config/trigger-layer/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the next occurrences of a cron expression
    CronPreview {
        /// Cron expression (5, 6 or 7 fields)
        expression: String,
        /// IANA timezone, UTC, or fixed offset like +08:00
        #[arg(short, long)]
        timezone: Option<String>,
        #[arg(short = 'n', long, default_value = "5")]
        count: usize,
        /// Start from this RFC 3339 instant instead of now
        #[arg(long)]
        after: Option<String>,
    },
    /// Show the retry schedule a policy produces
    RetryPreview {
        #[arg(long)]
        max_attempts: Option<u32>,
        #[arg(long)]
        initial_delay: Option<f64>,
        #[arg(long)]
        backoff_factor: Option<f64>,
        #[arg(long)]
        max_delay: Option<f64>,
        #[arg(long)]
        jitter: Option<f64>,
    },
    /// Print the effective configuration as TOML
    Config,
    /// Run cron triggers from a TOML file until Ctrl+C
    Watch {
        /// File with [[cron]] entries
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = init_tracing(&TracingConfig::default()) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load(),
    };

    match cli.command {
        Commands::CronPreview {
            expression,
            timezone,
            count,
            after,
        } => cmd_cron_preview(&config, &expression, timezone, count, after.as_deref())?,
        Commands::RetryPreview {
            max_attempts,
            initial_delay,
            backoff_factor,
            max_delay,
            jitter,
        } => {
            let mut policy = config.retry.clone();
            if let Some(v) = max_attempts {
                policy.max_attempts = v;
            }
            if let Some(v) = initial_delay {
                policy.initial_delay_seconds = v;
            }
            if let Some(v) = backoff_factor {
                policy.backoff_factor = v;
            }
            if let Some(v) = max_delay {
                policy.max_delay_seconds = v;
            }
            if let Some(v) = jitter {
                policy.jitter_factor = v;
            }
            cmd_retry_preview(policy)?
        }
        Commands::Config => print!("{}", config.to_toml_string()?),
        Commands::Watch { file } => cmd_watch(&config, &file).await?,
    }

    Ok(())
}

fn cmd_cron_preview(
    config: &Config,
    expression: &str,
    timezone: Option<String>,
    count: usize,
    after: Option<&str>,
) -> anyhow::Result<()> {
    let timezone = timezone.unwrap_or_else(|| config.cron.default_timezone.clone());
    let schedule = parse_schedule(expression)?;
    let tz = parse_timezone(&timezone)?;
    let after = match after {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .with_context(|| format!("Invalid --after instant '{}'", raw))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    let upcoming = tz.upcoming(&schedule, after, count);
    if upcoming.is_empty() {
        println!("No upcoming occurrences for '{}'", expression);
        return Ok(());
    }

    println!("Next {} occurrence(s) of '{}' ({}):", upcoming.len(), expression, timezone);
    for occurrence in upcoming {
        println!("  {}", tz.localize(occurrence).to_rfc3339());
    }
    Ok(())
}

fn cmd_retry_preview(policy: RetryPolicyConfig) -> anyhow::Result<()> {
    policy.validate()?;

    println!(
        "{:<8} {:>12} {:>12}",
        "RETRY", "BASE (s)", "JITTERED (s)"
    );
    println!("{}", "-".repeat(34));

    let failed_at = Utc::now();
    let mut state = RetryPolicyState::new(policy.clone());
    while let Some(decision) = state.next_retry(failed_at) {
        println!(
            "{:<8} {:>12.1} {:>12.1}",
            decision.retry_number,
            policy.base_delay_seconds(decision.retry_number - 1),
            decision.delay_seconds
        );
    }
    println!(
        "\n{} attempt(s) in total, then the run is given up.",
        policy.max_attempts
    );
    Ok(())
}

#[derive(Debug, Deserialize)]
struct WatchFile {
    #[serde(default)]
    cron: Vec<WatchEntry>,
}

#[derive(Debug, Deserialize)]
struct WatchEntry {
    workflow_id: String,
    #[serde(flatten)]
    trigger: CronTriggerConfig,
}

/// Engine that only logs what it would run.
struct LoggingEngine;

#[async_trait]
impl ExecutionEngine for LoggingEngine {
    async fn enqueue_cron(&self, plan: &CronDispatchPlan) -> trigger_layer::Result<String> {
        let run_id = uuid::Uuid::new_v4().to_string();
        info!(
            "Would run workflow '{}' for {} ({}) as '{}'",
            plan.workflow_id,
            plan.scheduled_for.to_rfc3339(),
            plan.timezone,
            run_id
        );
        Ok(run_id)
    }
}

async fn cmd_watch(config: &Config, file: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let watch: WatchFile =
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", file.display()))?;
    if watch.cron.is_empty() {
        anyhow::bail!("{} defines no [[cron]] entries", file.display());
    }

    let layer = Arc::new(TriggerLayer::new(TriggerStores::in_memory(), config));
    for entry in watch.cron {
        layer
            .configure_cron(&entry.workflow_id, entry.trigger)
            .await
            .with_context(|| format!("Invalid cron trigger for '{}'", entry.workflow_id))?;
    }

    let shutdown = ShutdownCoordinator::new();
    shutdown.start_signal_listener();

    let mut poller = CronPoller::new(layer, Arc::new(LoggingEngine))
        .with_poll_interval(config.cron.poll_interval_ms);
    info!("Watching cron triggers from {}", file.display());
    poller.run_until_shutdown(&shutdown).await?;
    Ok(())
}
