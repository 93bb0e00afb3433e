//! Cron trigger state: due-occurrence tracking and the overlap guard.
//!
//! Polling is at-least-once, so finding a due occurrence and committing it are
//! separate steps. `peek_due` caches the occurrence it found and keeps returning
//! it until `consume_due` commits it into `last_dispatched_at`.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, SubsecRound, TimeZone, Utc};
use chrono_tz::Tz;
use ::cron::Schedule;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Schedule configuration for one workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronTriggerConfig {
    /// Cron expression (5, 6 or 7 fields)
    pub expression: String,

    /// IANA timezone name, `UTC`, or a fixed offset such as `+08:00`
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Disabled triggers are never due for dispatch
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Overlap guard limit
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: u32,
}

pub(crate) fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_max_concurrent_runs() -> u32 {
    1
}

impl Default for CronTriggerConfig {
    fn default() -> Self {
        Self {
            expression: String::new(),
            timezone: default_timezone(),
            enabled: default_enabled(),
            max_concurrent_runs: default_max_concurrent_runs(),
        }
    }
}

impl CronTriggerConfig {
    /// Create a config for `expression` in UTC.
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            ..Default::default()
        }
    }

    /// Set the timezone.
    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    /// Whether an expression has been set at all.
    pub fn is_scheduled(&self) -> bool {
        !self.expression.trim().is_empty()
    }

    /// Parse the expression and timezone, rejecting invalid values.
    pub fn validate(&self) -> Result<()> {
        if !self.is_scheduled() {
            return Err(Error::Config("cron expression must not be empty".to_string()));
        }
        if self.max_concurrent_runs < 1 {
            return Err(Error::Config(
                "max_concurrent_runs must be at least 1".to_string(),
            ));
        }
        self.schedule()?;
        parse_timezone(&self.timezone)?;
        Ok(())
    }

    pub fn schedule(&self) -> Result<Schedule> {
        parse_schedule(&self.expression)
    }

    pub fn parsed_timezone(&self) -> Result<CronTimezone> {
        parse_timezone(&self.timezone)
    }
}

/// Timezone a cron expression is evaluated in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CronTimezone {
    Utc,
    FixedOffset(FixedOffset),
    Named(Tz),
}

impl CronTimezone {
    /// Latest occurrence at or before `now`.
    pub fn latest_occurrence(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self {
            CronTimezone::Utc => latest_occurrence_in(schedule, &Utc, now),
            CronTimezone::FixedOffset(offset) => latest_occurrence_in(schedule, offset, now),
            CronTimezone::Named(tz) => latest_occurrence_in(schedule, tz, now),
        }
    }

    /// The next `count` occurrences strictly after `after`.
    pub fn upcoming(
        &self,
        schedule: &Schedule,
        after: DateTime<Utc>,
        count: usize,
    ) -> Vec<DateTime<Utc>> {
        match self {
            CronTimezone::Utc => upcoming_in(schedule, &Utc, after, count),
            CronTimezone::FixedOffset(offset) => upcoming_in(schedule, offset, after, count),
            CronTimezone::Named(tz) => upcoming_in(schedule, tz, after, count),
        }
    }

    /// Express `instant` with this zone's offset.
    pub fn localize(&self, instant: DateTime<Utc>) -> DateTime<FixedOffset> {
        match self {
            CronTimezone::Utc => instant.fixed_offset(),
            CronTimezone::FixedOffset(offset) => instant.with_timezone(offset),
            CronTimezone::Named(tz) => instant.with_timezone(tz).fixed_offset(),
        }
    }
}

fn latest_occurrence_in<Z: TimeZone>(
    schedule: &Schedule,
    tz: &Z,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    // Walk backwards from one second past `now` so an occurrence landing
    // exactly on `now` is included.
    let anchor = (now.trunc_subsecs(0) + chrono::Duration::seconds(1)).with_timezone(tz);
    schedule
        .after(&anchor)
        .rev()
        .map(|t| t.with_timezone(&Utc))
        .find(|t| *t <= now)
}

fn upcoming_in<Z: TimeZone>(
    schedule: &Schedule,
    tz: &Z,
    after: DateTime<Utc>,
    count: usize,
) -> Vec<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(tz))
        .take(count)
        .map(|t| t.with_timezone(&Utc))
        .collect()
}

/// Convert a 5-field Unix expression to the seconds-first form the `cron`
/// crate expects. 6- and 7-field expressions pass through.
pub fn normalize_cron_expression(expr: &str) -> String {
    let trimmed = expr.trim();
    match trimmed.split_whitespace().count() {
        5 => format!("0 {}", trimmed),
        _ => trimmed.to_string(),
    }
}

pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    Schedule::from_str(&normalize_cron_expression(expr))
        .map_err(|e| Error::Config(format!("Invalid cron expression '{}': {}", expr, e)))
}

pub fn parse_timezone(raw: &str) -> Result<CronTimezone> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("utc") {
        return Ok(CronTimezone::Utc);
    }

    if let Ok(tz) = trimmed.parse::<Tz>() {
        return Ok(CronTimezone::Named(tz));
    }

    if let Some(offset) = parse_fixed_offset(trimmed) {
        return Ok(CronTimezone::FixedOffset(offset));
    }

    Err(Error::Config(format!(
        "Invalid timezone '{}'. Use IANA name (e.g. 'Asia/Kuala_Lumpur') or UTC offset (e.g. '+08:00')",
        raw
    )))
}

fn parse_fixed_offset(raw: &str) -> Option<FixedOffset> {
    let (sign, rest) = if let Some(rest) = raw.strip_prefix('+') {
        (1, rest)
    } else if let Some(rest) = raw.strip_prefix('-') {
        (-1, rest)
    } else {
        return None;
    };

    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?),
        None if rest.len() == 4 && rest.is_ascii() => {
            (rest[0..2].parse::<i32>().ok()?, rest[2..4].parse::<i32>().ok()?)
        }
        None => return None,
    };

    if hours > 23 || minutes > 59 {
        return None;
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Per-workflow schedule progress and active runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CronTriggerState {
    pub config: CronTriggerConfig,
    pub last_dispatched_at: Option<DateTime<Utc>>,
    pub active_run_ids: BTreeSet<String>,
    /// Found by `peek_due` but not yet committed
    pub pending_due: Option<DateTime<Utc>>,
}

impl CronTriggerState {
    pub fn new(config: CronTriggerConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Replace the config. Schedule progress and active runs survive; a cached
    /// occurrence computed under the old expression does not.
    pub fn apply_config(&mut self, config: CronTriggerConfig) {
        self.config = config;
        self.pending_due = None;
    }

    /// The occurrence due at `now`, if any.
    ///
    /// Repeated calls return the same occurrence until `consume_due` runs.
    pub fn peek_due(&mut self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        if let Some(pending) = self.pending_due {
            return Ok(Some(pending));
        }
        if !self.config.is_scheduled() {
            return Ok(None);
        }

        let schedule = self.config.schedule()?;
        let timezone = self.config.parsed_timezone()?;
        // Never dispatched means every occurrence since the epoch is eligible.
        let floor = self.last_dispatched_at;

        self.pending_due = timezone
            .latest_occurrence(&schedule, now)
            .filter(|occurrence| floor.map_or(true, |last| *occurrence > last));
        Ok(self.pending_due)
    }

    /// Whether a new run may start now.
    pub fn can_dispatch(&self) -> bool {
        self.config.enabled
            && self.config.is_scheduled()
            && (self.active_run_ids.len() as u64) < u64::from(self.config.max_concurrent_runs)
    }

    /// Commit the cached occurrence. Returns it, or `None` if nothing was
    /// pending.
    pub fn consume_due(&mut self) -> Option<DateTime<Utc>> {
        let committed = self.pending_due.take()?;
        self.last_dispatched_at = Some(committed);
        Some(committed)
    }

    /// Mark `run_id` active. Registering an already-active run is a no-op.
    pub fn register_run(&mut self, workflow_id: &str, run_id: &str) -> Result<()> {
        if self.active_run_ids.contains(run_id) {
            return Ok(());
        }
        let limit = self.config.max_concurrent_runs.max(1) as usize;
        if self.active_run_ids.len() >= limit {
            let active_run_id = self.active_run_ids.iter().next().cloned().unwrap_or_default();
            return Err(Error::CronOverlap {
                workflow_id: workflow_id.to_string(),
                active_run_id,
                conflicting_run_id: run_id.to_string(),
            });
        }
        self.active_run_ids.insert(run_id.to_string());
        Ok(())
    }

    /// Returns whether the run was active.
    pub fn release_run(&mut self, run_id: &str) -> bool {
        self.active_run_ids.remove(run_id)
    }
}

/// A workflow whose schedule is due, awaiting enqueue and commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronDispatchPlan {
    pub workflow_id: String,
    pub scheduled_for: DateTime<FixedOffset>,
    pub timezone: String,
}
