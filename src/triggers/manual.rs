//! Manual dispatch requests and the per-workflow manual trigger policy.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};

/// One run requested by a manual dispatch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManualDispatchItem {
    /// Version to run; the workflow's default when unset
    #[serde(default)]
    pub workflow_version_id: Option<Uuid>,
    #[serde(default)]
    pub input_payload: Map<String, Value>,
}

impl ManualDispatchItem {
    pub fn new(input_payload: Map<String, Value>) -> Self {
        Self {
            workflow_version_id: None,
            input_payload,
        }
    }

    pub fn with_version(mut self, version_id: Uuid) -> Self {
        self.workflow_version_id = Some(version_id);
        self
    }
}

#[derive(Deserialize)]
struct ManualDispatchRequestFields {
    workflow_id: String,
    actor: String,
    runs: Vec<ManualDispatchItem>,
    #[serde(default)]
    label: Option<String>,
}

/// Validated ad hoc dispatch request. Only constructible through
/// [`ManualDispatchRequest::new`] or deserialization, both of which validate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ManualDispatchRequestFields")]
pub struct ManualDispatchRequest {
    workflow_id: String,
    actor: String,
    runs: Vec<ManualDispatchItem>,
    label: Option<String>,
}

impl TryFrom<ManualDispatchRequestFields> for ManualDispatchRequest {
    type Error = Error;

    fn try_from(fields: ManualDispatchRequestFields) -> Result<Self> {
        Self::new(fields.workflow_id, fields.actor, fields.runs, fields.label)
    }
}

impl ManualDispatchRequest {
    /// Trim and validate the request.
    pub fn new(
        workflow_id: impl Into<String>,
        actor: impl Into<String>,
        runs: Vec<ManualDispatchItem>,
        label: Option<String>,
    ) -> Result<Self> {
        let workflow_id = workflow_id.into().trim().to_string();
        if workflow_id.is_empty() {
            return Err(Error::Validation(
                "workflow_id must be a non-empty string".to_string(),
            ));
        }

        let actor = actor.into().trim().to_string();
        if actor.is_empty() {
            return Err(Error::Validation(
                "actor must be a non-empty string".to_string(),
            ));
        }

        let label = match label {
            Some(raw) => {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return Err(Error::Validation(
                        "label must be a non-empty string".to_string(),
                    ));
                }
                Some(trimmed.to_string())
            }
            None => None,
        };

        if runs.is_empty() {
            return Err(Error::Validation(
                "runs must contain at least 1 item".to_string(),
            ));
        }

        Ok(Self {
            workflow_id,
            actor,
            runs,
            label,
        })
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Trimmed actor.
    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn runs(&self) -> &[ManualDispatchItem] {
        &self.runs
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Explicit label, else `manual` for one run and `manual_batch` for more.
    pub fn trigger_label(&self) -> String {
        match &self.label {
            Some(label) => label.clone(),
            None if self.runs.len() > 1 => "manual_batch".to_string(),
            None => "manual".to_string(),
        }
    }

    /// Runs with a missing version filled in from `default_version_id`.
    pub fn resolve_runs(&self, default_version_id: Option<Uuid>) -> Vec<ManualDispatchItem> {
        self.runs
            .iter()
            .map(|item| ManualDispatchItem {
                workflow_version_id: item.workflow_version_id.or(default_version_id),
                input_payload: item.input_payload.clone(),
            })
            .collect()
    }

    /// Plan without any trigger policy applied.
    pub fn plan(&self, default_version_id: Option<Uuid>) -> ManualDispatchPlan {
        ManualDispatchPlan {
            triggered_by: self.trigger_label(),
            actor: self.actor.clone(),
            runs: self.resolve_runs(default_version_id),
        }
    }
}

/// Runs to start for a manual dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualDispatchPlan {
    pub triggered_by: String,
    pub actor: String,
    pub runs: Vec<ManualDispatchItem>,
}

#[derive(Deserialize)]
struct ManualTriggerConfigFields {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    allowed_actors: Vec<String>,
    #[serde(default)]
    default_payload: Map<String, Value>,
    #[serde(default)]
    last_dispatched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    cooldown_seconds: u64,
}

/// Per-workflow manual trigger policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "ManualTriggerConfigFields")]
pub struct ManualTriggerConfig {
    /// Label used when a request carries none
    pub label: Option<String>,
    /// Actors allowed to dispatch; empty allows everyone
    pub allowed_actors: Vec<String>,
    /// Payload keys merged beneath every run's input
    pub default_payload: Map<String, Value>,
    pub last_dispatched_at: Option<DateTime<Utc>>,
    /// Minimum spacing between manual dispatches
    pub cooldown_seconds: u64,
}

// Stored configs may legitimately carry a `last_dispatched_at` ahead of this
// host's clock, so deserialization only normalizes.
impl From<ManualTriggerConfigFields> for ManualTriggerConfig {
    fn from(fields: ManualTriggerConfigFields) -> Self {
        Self {
            label: fields.label,
            allowed_actors: fields.allowed_actors,
            default_payload: fields.default_payload,
            last_dispatched_at: fields.last_dispatched_at,
            cooldown_seconds: fields.cooldown_seconds,
        }
        .normalize_fields()
    }
}

impl ManualTriggerConfig {
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_allowed_actors<I, S>(mut self, actors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_actors = actors.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_default_payload(mut self, payload: Map<String, Value>) -> Self {
        self.default_payload = payload;
        self
    }

    pub fn with_cooldown(mut self, seconds: u64) -> Self {
        self.cooldown_seconds = seconds;
        self
    }

    /// Trim the label and actors, dedupe actors case-insensitively (first
    /// spelling wins), then reject a `last_dispatched_at` later than `now`.
    pub fn normalized(self, now: DateTime<Utc>) -> Result<Self> {
        let normalized = self.normalize_fields();
        if let Some(last) = normalized.last_dispatched_at {
            if last > now {
                return Err(Error::ManualTriggerValidation(format!(
                    "last_dispatched_at {} cannot be in the future",
                    last.to_rfc3339()
                )));
            }
        }
        Ok(normalized)
    }

    fn normalize_fields(mut self) -> Self {
        self.label = self
            .label
            .as_deref()
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .map(str::to_string);
        self.allowed_actors = normalize_actors(&self.allowed_actors);
        self
    }

    /// Case-insensitive membership check against `allowed_actors`.
    pub fn permits_actor(&self, actor: &str) -> bool {
        if self.allowed_actors.is_empty() {
            return true;
        }
        let wanted = actor.trim().to_lowercase();
        self.allowed_actors
            .iter()
            .any(|allowed| allowed.to_lowercase() == wanted)
    }

    /// Time left before another dispatch is allowed.
    pub fn cooldown_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let last = self.last_dispatched_at?;
        let seconds = i64::try_from(self.cooldown_seconds).ok()?;
        let ready_at = last.checked_add_signed(Duration::try_seconds(seconds)?)?;
        (ready_at > now).then(|| ready_at - now)
    }

    /// Apply the policy to `request` and record the dispatch time.
    pub fn authorize(
        &mut self,
        request: &ManualDispatchRequest,
        default_version_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<ManualDispatchPlan> {
        if !self.permits_actor(request.actor()) {
            return Err(Error::ManualDispatchRejected(format!(
                "actor '{}' may not dispatch workflow '{}'",
                request.actor(),
                request.workflow_id()
            )));
        }
        if let Some(remaining) = self.cooldown_remaining(now) {
            return Err(Error::ManualDispatchRejected(format!(
                "workflow '{}' is cooling down for another {}s",
                request.workflow_id(),
                remaining.num_seconds().max(1)
            )));
        }

        let mut plan = request.plan(default_version_id);
        if request.label().is_none() {
            if let Some(label) = &self.label {
                plan.triggered_by = label.clone();
            }
        }
        for run in &mut plan.runs {
            let mut merged = self.default_payload.clone();
            merged.extend(std::mem::take(&mut run.input_payload));
            run.input_payload = merged;
        }

        self.last_dispatched_at = Some(now);
        Ok(plan)
    }
}

fn normalize_actors(actors: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    actors
        .iter()
        .map(|actor| actor.trim())
        .filter(|actor| !actor.is_empty())
        .filter(|actor| seen.insert(actor.to_lowercase()))
        .map(str::to_string)
        .collect()
}
