//! Trigger layer orchestration.
//!
//! [`TriggerLayer`] owns the state stores and composes the webhook, cron,
//! manual and retry components into one async API. Every mutation loads the
//! affected value, changes it and saves it back while holding the per-key lock
//! for that value, so concurrent callers never interleave a read-modify-write.
//!
//! Lock keys are namespaced (`webhook:`, `cron:`, `run:`, `manual:`). When two
//! locks are needed the run lock is always taken before the workflow lock.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::{RetryDecision, RetryPolicyConfig, RetryPolicyState};
use crate::error::{Error, Result};
use crate::metrics;
use crate::storage::{KeyedLocks, TriggerStores};
use crate::triggers::{
    build_dispatch, CronDispatchPlan, CronTriggerConfig, CronTriggerState, ManualDispatchPlan,
    ManualDispatchRequest, ManualTriggerConfig, SecurityReview, TriggerDispatch, WebhookAuth,
    WebhookRequest, WebhookTriggerConfig, WebhookTriggerState,
};

fn webhook_key(workflow_id: &str) -> String {
    format!("webhook:{}", workflow_id)
}

fn cron_key(workflow_id: &str) -> String {
    format!("cron:{}", workflow_id)
}

fn run_key(run_id: &str) -> String {
    format!("run:{}", run_id)
}

fn manual_key(workflow_id: &str) -> String {
    format!("manual:{}", workflow_id)
}

/// Converts webhooks, cron schedules and manual requests into dispatches, and
/// keeps the per-run retry and overlap bookkeeping.
pub struct TriggerLayer {
    stores: TriggerStores,
    locks: KeyedLocks,
    security_review: Option<Arc<dyn SecurityReview>>,
    default_retry: RetryPolicyConfig,
    default_timezone: String,
    default_methods: BTreeSet<String>,
}

impl TriggerLayer {
    /// Layer over fresh in-memory stores with built-in defaults.
    pub fn in_memory() -> Self {
        Self::new(TriggerStores::in_memory(), &Config::default())
    }

    /// Layer over `stores`, taking trigger defaults from `config`.
    pub fn new(stores: TriggerStores, config: &Config) -> Self {
        Self {
            stores,
            locks: KeyedLocks::new(),
            security_review: None,
            default_retry: config.retry.clone(),
            default_timezone: config.cron.default_timezone.clone(),
            default_methods: config
                .webhook
                .default_methods
                .iter()
                .map(|m| m.trim().to_uppercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    /// Report unauthenticated webhooks to `review`.
    pub fn with_security_review(mut self, review: Arc<dyn SecurityReview>) -> Self {
        self.security_review = Some(review);
        self
    }

    pub fn stores(&self) -> &TriggerStores {
        &self.stores
    }

    /// Drop all trigger state.
    pub async fn reset(&self) -> Result<()> {
        self.stores.clear_all().await?;
        info!("Trigger layer state cleared");
        Ok(())
    }

    // ========================================================================
    // Webhooks
    // ========================================================================

    /// Replace the webhook config for `workflow_id` and restart its rate-limit
    /// window.
    pub async fn configure_webhook(
        &self,
        workflow_id: &str,
        config: WebhookTriggerConfig,
    ) -> Result<WebhookTriggerConfig> {
        let config = config.normalized()?;

        let _guard = self.locks.lock(&webhook_key(workflow_id)).await;
        let mut state = self
            .stores
            .webhooks
            .get(workflow_id)
            .await?
            .unwrap_or_default();
        state.apply_config(config.clone());
        self.stores.webhooks.put(workflow_id, state).await?;

        if !config.is_authenticated() {
            warn!(
                "Webhook for workflow '{}' is configured without a shared secret or signature",
                workflow_id
            );
        }
        info!("Configured webhook trigger for workflow '{}'", workflow_id);
        Ok(config)
    }

    /// Stored webhook config, creating and persisting the default if absent.
    pub async fn get_webhook_config(&self, workflow_id: &str) -> Result<WebhookTriggerConfig> {
        let _guard = self.locks.lock(&webhook_key(workflow_id)).await;
        Ok(self.load_webhook_state(workflow_id).await?.config)
    }

    /// Validate an inbound request against the workflow's webhook rules.
    ///
    /// Accepted requests count toward the rate limit. Requests accepted without
    /// any secret check are reported to the security review collaborator.
    pub async fn validate_webhook(
        &self,
        workflow_id: &str,
        request: &WebhookRequest,
    ) -> Result<WebhookAuth> {
        let auth = {
            let _guard = self.locks.lock(&webhook_key(workflow_id)).await;
            let mut state = self.load_webhook_state(workflow_id).await?;

            match state.validate(request) {
                Ok(auth) => {
                    self.stores.webhooks.put(workflow_id, state).await?;
                    auth
                }
                Err(e) => {
                    if let Some(reason) = e.webhook_reason() {
                        metrics::record_webhook_rejected(reason.as_str());
                    }
                    debug!("Webhook for workflow '{}' rejected: {}", workflow_id, e);
                    return Err(e);
                }
            }
        };

        metrics::record_webhook_accepted(auth == WebhookAuth::Authenticated);
        if auth == WebhookAuth::Unauthenticated {
            warn!(
                "Accepted unauthenticated webhook for workflow '{}'",
                workflow_id
            );
            if let Some(review) = &self.security_review {
                review.flag_unauthenticated(workflow_id);
            }
        }
        Ok(auth)
    }

    /// Validate `request` and build the dispatch for it.
    pub async fn prepare_webhook_dispatch(
        &self,
        workflow_id: &str,
        request: &WebhookRequest,
    ) -> Result<TriggerDispatch> {
        self.validate_webhook(workflow_id, request).await?;
        let dispatch = build_dispatch(request);
        debug!("Prepared webhook dispatch for workflow '{}'", workflow_id);
        Ok(dispatch)
    }

    async fn load_webhook_state(&self, workflow_id: &str) -> Result<WebhookTriggerState> {
        if let Some(state) = self.stores.webhooks.get(workflow_id).await? {
            return Ok(state);
        }
        let config = WebhookTriggerConfig {
            allowed_methods: self.default_methods.clone(),
            ..Default::default()
        };
        let state = WebhookTriggerState::new(config);
        self.stores.webhooks.put(workflow_id, state.clone()).await?;
        Ok(state)
    }

    // ========================================================================
    // Cron
    // ========================================================================

    /// Replace the cron config for `workflow_id`.
    ///
    /// Schedule progress and active runs are kept. A blank timezone falls back
    /// to the configured default.
    pub async fn configure_cron(
        &self,
        workflow_id: &str,
        mut config: CronTriggerConfig,
    ) -> Result<CronTriggerConfig> {
        if config.timezone.trim().is_empty() {
            config.timezone = self.default_timezone.clone();
        }
        config.validate()?;

        let _guard = self.locks.lock(&cron_key(workflow_id)).await;
        let mut state = self
            .stores
            .crons
            .get(workflow_id)
            .await?
            .unwrap_or_default();
        state.apply_config(config.clone());
        self.stores.crons.put(workflow_id, state).await?;

        info!(
            "Configured cron trigger for workflow '{}': '{}' ({})",
            workflow_id, config.expression, config.timezone
        );
        Ok(config)
    }

    /// Stored cron config, creating and persisting the default if absent.
    pub async fn get_cron_config(&self, workflow_id: &str) -> Result<CronTriggerConfig> {
        let _guard = self.locks.lock(&cron_key(workflow_id)).await;
        Ok(self.load_cron_state(workflow_id).await?.config)
    }

    /// Snapshot of the cron state, if the workflow has one.
    pub async fn cron_state(&self, workflow_id: &str) -> Result<Option<CronTriggerState>> {
        self.stores.crons.get(workflow_id).await
    }

    /// Plans for every workflow whose schedule is due at `now` and which has
    /// room for another run.
    ///
    /// Nothing is committed: the same plans come back on the next call until
    /// [`commit_cron_dispatch`](Self::commit_cron_dispatch) runs for them.
    /// Workflows with an unparseable schedule are logged and skipped.
    pub async fn collect_due_cron_dispatches(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<CronDispatchPlan>> {
        let mut plans = Vec::new();

        for workflow_id in self.stores.crons.keys().await? {
            let _guard = self.locks.lock(&cron_key(&workflow_id)).await;
            let Some(mut state) = self.stores.crons.get(&workflow_id).await? else {
                continue;
            };

            let previous = state.pending_due;
            let due = match state.peek_due(now) {
                Ok(due) => due,
                Err(e) => {
                    warn!("Skipping cron workflow '{}': {}", workflow_id, e);
                    continue;
                }
            };
            if state.pending_due != previous {
                self.stores.crons.put(&workflow_id, state.clone()).await?;
            }

            let Some(due) = due else {
                continue;
            };
            if !state.can_dispatch() {
                debug!(
                    "Cron workflow '{}' is due but cannot dispatch ({} active runs, enabled: {})",
                    workflow_id,
                    state.active_run_ids.len(),
                    state.config.enabled
                );
                continue;
            }

            let scheduled_for = match state.config.parsed_timezone() {
                Ok(tz) => tz.localize(due),
                Err(_) => due.fixed_offset(),
            };
            metrics::record_cron_dispatch("planned");
            plans.push(CronDispatchPlan {
                workflow_id: workflow_id.clone(),
                scheduled_for,
                timezone: state.config.timezone.clone(),
            });
        }

        Ok(plans)
    }

    /// Commit the pending occurrence for `workflow_id` after its run was
    /// enqueued. Returns the committed instant, or `None` if nothing was
    /// pending.
    pub async fn commit_cron_dispatch(&self, workflow_id: &str) -> Result<Option<DateTime<Utc>>> {
        self.commit_pending(workflow_id, None).await
    }

    /// Commit `plan` only if its occurrence is still the pending one.
    ///
    /// Returns `None` without committing when another caller already
    /// committed it or the pending occurrence moved on.
    pub async fn commit_cron_plan(&self, plan: &CronDispatchPlan) -> Result<Option<DateTime<Utc>>> {
        self.commit_pending(&plan.workflow_id, Some(plan.scheduled_for.with_timezone(&Utc)))
            .await
    }

    async fn commit_pending(
        &self,
        workflow_id: &str,
        expected: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>> {
        let _guard = self.locks.lock(&cron_key(workflow_id)).await;
        let Some(mut state) = self.stores.crons.get(workflow_id).await? else {
            return Ok(None);
        };
        if let Some(expected) = expected {
            if state.pending_due != Some(expected) {
                warn!(
                    "Not committing stale cron occurrence {} for workflow '{}'",
                    expected.to_rfc3339(),
                    workflow_id
                );
                return Ok(None);
            }
        }

        let committed = state.consume_due();
        if let Some(at) = committed {
            self.stores.crons.put(workflow_id, state).await?;
            metrics::record_cron_dispatch("committed");
            info!(
                "Committed cron occurrence {} for workflow '{}'",
                at.to_rfc3339(),
                workflow_id
            );
        }
        Ok(committed)
    }

    /// Mark a tracked run as active for its workflow's overlap guard.
    ///
    /// The run must have been recorded with [`track_run`](Self::track_run).
    pub async fn register_cron_run(&self, run_id: &str) -> Result<()> {
        let _run_guard = self.locks.lock(&run_key(run_id)).await;
        let workflow_id = self
            .stores
            .run_workflows
            .get(run_id)
            .await?
            .ok_or_else(|| Error::UnknownRun(run_id.to_string()))?;

        let _workflow_guard = self.locks.lock(&cron_key(&workflow_id)).await;
        let mut state = self.load_cron_state(&workflow_id).await?;
        let newly_active = !state.active_run_ids.contains(run_id);

        if let Err(e) = state.register_run(&workflow_id, run_id) {
            metrics::record_cron_overlap();
            warn!("{}", e);
            return Err(e);
        }

        self.stores.crons.put(&workflow_id, state).await?;
        self.stores.cron_runs.put(run_id, workflow_id.clone()).await?;
        if newly_active {
            metrics::inc_active_cron_runs();
            debug!("Run '{}' active for cron workflow '{}'", run_id, workflow_id);
        }
        Ok(())
    }

    /// Release a run from the overlap guard. Unknown or already released runs
    /// are ignored. Returns whether anything was released.
    pub async fn release_cron_run(&self, run_id: &str) -> Result<bool> {
        let _run_guard = self.locks.lock(&run_key(run_id)).await;
        let Some(workflow_id) = self.stores.cron_runs.remove(run_id).await? else {
            debug!("Run '{}' holds no cron slot", run_id);
            return Ok(false);
        };

        let _workflow_guard = self.locks.lock(&cron_key(&workflow_id)).await;
        let Some(mut state) = self.stores.crons.get(&workflow_id).await? else {
            return Ok(false);
        };
        if !state.release_run(run_id) {
            return Ok(false);
        }
        self.stores.crons.put(&workflow_id, state).await?;
        metrics::dec_active_cron_runs();
        debug!("Released run '{}' for cron workflow '{}'", run_id, workflow_id);
        Ok(true)
    }

    async fn load_cron_state(&self, workflow_id: &str) -> Result<CronTriggerState> {
        if let Some(state) = self.stores.crons.get(workflow_id).await? {
            return Ok(state);
        }
        let config = CronTriggerConfig {
            timezone: self.default_timezone.clone(),
            ..Default::default()
        };
        let state = CronTriggerState::new(config);
        self.stores.crons.put(workflow_id, state.clone()).await?;
        Ok(state)
    }

    // ========================================================================
    // Retry
    // ========================================================================

    /// Set the retry policy applied to runs tracked after this call.
    pub async fn configure_retry_policy(
        &self,
        workflow_id: &str,
        config: RetryPolicyConfig,
    ) -> Result<RetryPolicyConfig> {
        config.validate()?;
        self.stores
            .retry_configs
            .put(workflow_id, config.clone())
            .await?;
        info!(
            "Configured retry policy for workflow '{}': max_attempts={}",
            workflow_id, config.max_attempts
        );
        Ok(config)
    }

    /// The workflow's retry policy, or the configured default.
    pub async fn get_retry_policy(&self, workflow_id: &str) -> Result<RetryPolicyConfig> {
        Ok(self
            .stores
            .retry_configs
            .get(workflow_id)
            .await?
            .unwrap_or_else(|| self.default_retry.clone()))
    }

    /// Start retry accounting for a new run with a snapshot of the workflow's
    /// current policy, and record which workflow the run belongs to.
    pub async fn track_run(&self, workflow_id: &str, run_id: &str) -> Result<RetryPolicyState> {
        let config = self.get_retry_policy(workflow_id).await?;

        let _guard = self.locks.lock(&run_key(run_id)).await;
        let state = RetryPolicyState::new(config);
        self.stores.retry_states.put(run_id, state.clone()).await?;
        self.stores
            .run_workflows
            .put(run_id, workflow_id.to_string())
            .await?;
        debug!("Tracking run '{}' for workflow '{}'", run_id, workflow_id);
        Ok(state)
    }

    /// Record a failure of `run_id` and decide whether to retry it.
    ///
    /// Returns `None` for untracked runs and once the retry budget is spent;
    /// in the latter case the run's retry state and workflow record are
    /// dropped.
    pub async fn next_retry_for_run(
        &self,
        run_id: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<Option<RetryDecision>> {
        let _guard = self.locks.lock(&run_key(run_id)).await;
        let Some(mut state) = self.stores.retry_states.get(run_id).await? else {
            debug!("No retry state for run '{}'", run_id);
            return Ok(None);
        };

        match state.next_retry(failed_at) {
            Some(decision) => {
                self.stores.retry_states.put(run_id, state).await?;
                metrics::record_retry_scheduled(decision.delay_seconds);
                info!(
                    "Retry {} for run '{}' scheduled in {:.1}s",
                    decision.retry_number, run_id, decision.delay_seconds
                );
                Ok(Some(decision))
            }
            None => {
                self.stores.retry_states.remove(run_id).await?;
                self.stores.run_workflows.remove(run_id).await?;
                metrics::record_retry_exhausted();
                info!(
                    "Run '{}' exhausted its retries after {} attempts",
                    run_id, state.config.max_attempts
                );
                Ok(None)
            }
        }
    }

    /// Stop retry accounting for `run_id`. Returns whether it was tracked.
    pub async fn clear_retry_state(&self, run_id: &str) -> Result<bool> {
        let _guard = self.locks.lock(&run_key(run_id)).await;
        let removed = self.stores.retry_states.remove(run_id).await?.is_some();
        self.stores.run_workflows.remove(run_id).await?;
        Ok(removed)
    }

    pub async fn retry_state(&self, run_id: &str) -> Result<Option<RetryPolicyState>> {
        self.stores.retry_states.get(run_id).await
    }

    /// Workflow a tracked run belongs to.
    pub async fn workflow_for_run(&self, run_id: &str) -> Result<Option<String>> {
        self.stores.run_workflows.get(run_id).await
    }

    // ========================================================================
    // Manual
    // ========================================================================

    /// Plan the runs for a manual request without applying any policy.
    pub fn prepare_manual_dispatch(
        &self,
        request: &ManualDispatchRequest,
        default_version_id: Option<Uuid>,
    ) -> ManualDispatchPlan {
        let plan = request.plan(default_version_id);
        metrics::record_manual_dispatch("planned", plan.runs.len());
        debug!(
            "Prepared manual dispatch '{}' of {} run(s) for workflow '{}'",
            plan.triggered_by,
            plan.runs.len(),
            request.workflow_id()
        );
        plan
    }

    /// Replace the manual trigger policy for `workflow_id`.
    pub async fn configure_manual_trigger(
        &self,
        workflow_id: &str,
        config: ManualTriggerConfig,
    ) -> Result<ManualTriggerConfig> {
        let config = config.normalized(Utc::now())?;

        let _guard = self.locks.lock(&manual_key(workflow_id)).await;
        self.stores
            .manual_configs
            .put(workflow_id, config.clone())
            .await?;
        info!("Configured manual trigger for workflow '{}'", workflow_id);
        Ok(config)
    }

    /// The workflow's manual trigger policy; unrestricted if never configured.
    pub async fn get_manual_trigger_config(&self, workflow_id: &str) -> Result<ManualTriggerConfig> {
        Ok(self
            .stores
            .manual_configs
            .get(workflow_id)
            .await?
            .unwrap_or_default())
    }

    /// Apply the workflow's manual trigger policy to `request` and plan its
    /// runs. A successful dispatch starts the cooldown.
    pub async fn authorize_manual_dispatch(
        &self,
        request: &ManualDispatchRequest,
        default_version_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<ManualDispatchPlan> {
        let workflow_id = request.workflow_id();
        let _guard = self.locks.lock(&manual_key(workflow_id)).await;
        let mut config = self
            .stores
            .manual_configs
            .get(workflow_id)
            .await?
            .unwrap_or_default();

        match config.authorize(request, default_version_id, now) {
            Ok(plan) => {
                self.stores.manual_configs.put(workflow_id, config).await?;
                metrics::record_manual_dispatch("accepted", plan.runs.len());
                info!(
                    "Manual dispatch of {} run(s) for workflow '{}' by '{}'",
                    plan.runs.len(),
                    workflow_id,
                    plan.actor
                );
                Ok(plan)
            }
            Err(e) => {
                metrics::record_manual_dispatch("rejected", 1);
                warn!("{}", e);
                Err(e)
            }
        }
    }
}

impl Default for TriggerLayer {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RateLimitConfig;
    use crate::error::WebhookRejection;
    use crate::triggers::ManualDispatchItem;
    use chrono::{Duration, TimeZone};
    use serde_json::{json, Map};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingReview {
        flagged: Mutex<Vec<String>>,
    }

    impl SecurityReview for RecordingReview {
        fn flag_unauthenticated(&self, workflow_id: &str) {
            self.flagged.lock().unwrap().push(workflow_id.to_string());
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, h, m, 0).unwrap()
    }

    #[tokio::test]
    async fn test_get_webhook_config_persists_default() {
        let layer = TriggerLayer::in_memory();
        let config = layer.get_webhook_config("wf").await.unwrap();
        assert!(config.allowed_methods.contains("POST"));
        assert!(layer.stores().webhooks.get("wf").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unauthenticated_webhook_is_flagged() {
        let review = Arc::new(RecordingReview::default());
        let layer = TriggerLayer::in_memory().with_security_review(review.clone());

        let auth = layer
            .validate_webhook("wf", &WebhookRequest::new("post"))
            .await
            .unwrap();
        assert_eq!(auth, WebhookAuth::Unauthenticated);
        assert_eq!(*review.flagged.lock().unwrap(), vec!["wf".to_string()]);
    }

    #[tokio::test]
    async fn test_authenticated_webhook_is_not_flagged() {
        let review = Arc::new(RecordingReview::default());
        let layer = TriggerLayer::in_memory().with_security_review(review.clone());
        layer
            .configure_webhook(
                "wf",
                WebhookTriggerConfig::default().with_shared_secret("X-Token", "s3cret"),
            )
            .await
            .unwrap();

        let request = WebhookRequest::new("POST").header("x-token", "s3cret");
        let auth = layer.validate_webhook("wf", &request).await.unwrap();
        assert_eq!(auth, WebhookAuth::Authenticated);
        assert!(review.flagged.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_persists_across_calls() {
        let layer = TriggerLayer::in_memory();
        layer
            .configure_webhook(
                "wf",
                WebhookTriggerConfig::default().with_rate_limit(RateLimitConfig {
                    limit: 2,
                    interval_seconds: 60,
                }),
            )
            .await
            .unwrap();

        let request = WebhookRequest::new("POST").received_at(at(12, 0));
        layer.validate_webhook("wf", &request).await.unwrap();
        layer.validate_webhook("wf", &request).await.unwrap();
        let err = layer.validate_webhook("wf", &request).await.unwrap_err();
        assert_eq!(err.webhook_reason(), Some(WebhookRejection::RateLimited));

        // Reconfiguring starts a fresh window.
        layer
            .configure_webhook(
                "wf",
                WebhookTriggerConfig::default().with_rate_limit(RateLimitConfig {
                    limit: 2,
                    interval_seconds: 60,
                }),
            )
            .await
            .unwrap();
        assert!(layer.validate_webhook("wf", &request).await.is_ok());
    }

    #[tokio::test]
    async fn test_configure_cron_rejects_bad_expression() {
        let layer = TriggerLayer::in_memory();
        let err = layer
            .configure_cron("wf", CronTriggerConfig::new("not a cron"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_blank_timezone_uses_default() {
        let layer = TriggerLayer::in_memory();
        let config = layer
            .configure_cron("wf", CronTriggerConfig::new("0 9 * * *").with_timezone(" "))
            .await
            .unwrap();
        assert_eq!(config.timezone, "UTC");
    }

    #[tokio::test]
    async fn test_collect_is_repeatable_until_commit() {
        let layer = TriggerLayer::in_memory();
        layer
            .configure_cron("wf", CronTriggerConfig::new("*/15 * * * *"))
            .await
            .unwrap();

        let first = layer.collect_due_cron_dispatches(at(10, 7)).await.unwrap();
        let second = layer.collect_due_cron_dispatches(at(10, 8)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first, second);
        assert_eq!(first[0].scheduled_for, at(10, 0).fixed_offset());

        assert_eq!(layer.commit_cron_dispatch("wf").await.unwrap(), Some(at(10, 0)));
        assert!(layer
            .collect_due_cron_dispatches(at(10, 8))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(layer.commit_cron_dispatch("wf").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stale_plan_is_not_committed() {
        let layer = TriggerLayer::in_memory();
        layer
            .configure_cron("wf", CronTriggerConfig::new("*/15 * * * *"))
            .await
            .unwrap();

        let stale = layer.collect_due_cron_dispatches(at(10, 7)).await.unwrap();
        // Someone else commits 10:00 and the schedule moves on to 10:15.
        assert_eq!(layer.commit_cron_dispatch("wf").await.unwrap(), Some(at(10, 0)));
        let fresh = layer.collect_due_cron_dispatches(at(10, 16)).await.unwrap();
        assert_eq!(fresh[0].scheduled_for, at(10, 15).fixed_offset());

        assert_eq!(layer.commit_cron_plan(&stale[0]).await.unwrap(), None);
        let state = layer.cron_state("wf").await.unwrap().unwrap();
        assert_eq!(state.pending_due, Some(at(10, 15)));
        assert_eq!(state.last_dispatched_at, Some(at(10, 0)));

        assert_eq!(layer.commit_cron_plan(&fresh[0]).await.unwrap(), Some(at(10, 15)));
        assert_eq!(layer.commit_cron_plan(&fresh[0]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_disabled_cron_is_not_planned() {
        let layer = TriggerLayer::in_memory();
        let mut config = CronTriggerConfig::new("*/15 * * * *");
        config.enabled = false;
        layer.configure_cron("wf", config).await.unwrap();

        assert!(layer
            .collect_due_cron_dispatches(at(10, 7))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_register_unknown_run() {
        let layer = TriggerLayer::in_memory();
        let err = layer.register_cron_run("ghost").await.unwrap_err();
        assert!(matches!(err, Error::UnknownRun(_)));
        assert!(!layer.release_cron_run("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn test_overlap_guard_blocks_second_run() {
        let layer = TriggerLayer::in_memory();
        layer
            .configure_cron("wf", CronTriggerConfig::new("*/15 * * * *"))
            .await
            .unwrap();
        layer.track_run("wf", "run-1").await.unwrap();
        layer.track_run("wf", "run-2").await.unwrap();

        layer.register_cron_run("run-1").await.unwrap();
        layer.register_cron_run("run-1").await.unwrap();
        match layer.register_cron_run("run-2").await.unwrap_err() {
            Error::CronOverlap {
                workflow_id,
                active_run_id,
                conflicting_run_id,
            } => {
                assert_eq!(workflow_id, "wf");
                assert_eq!(active_run_id, "run-1");
                assert_eq!(conflicting_run_id, "run-2");
            }
            other => panic!("unexpected error: {other}"),
        }

        // A due occurrence is withheld while the slot is taken.
        assert!(layer
            .collect_due_cron_dispatches(at(10, 7))
            .await
            .unwrap()
            .is_empty());

        assert!(layer.release_cron_run("run-1").await.unwrap());
        assert!(!layer.release_cron_run("run-1").await.unwrap());
        layer.register_cron_run("run-2").await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_budget_and_cleanup() {
        let layer = TriggerLayer::in_memory();
        layer
            .configure_retry_policy(
                "wf",
                RetryPolicyConfig::default()
                    .with_max_attempts(2)
                    .with_initial_delay(5.0)
                    .with_jitter(0.0),
            )
            .await
            .unwrap();
        layer.track_run("wf", "run-1").await.unwrap();

        let failed_at = at(12, 0);
        let decision = layer
            .next_retry_for_run("run-1", failed_at)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decision.retry_number, 1);
        assert_eq!(decision.delay_seconds, 5.0);
        assert_eq!(decision.retry_at, failed_at + Duration::seconds(5));

        assert!(layer
            .next_retry_for_run("run-1", failed_at)
            .await
            .unwrap()
            .is_none());
        assert!(layer.retry_state("run-1").await.unwrap().is_none());
        assert!(layer.workflow_for_run("run-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tracked_runs_snapshot_policy() {
        let layer = TriggerLayer::in_memory();
        layer.track_run("wf", "run-1").await.unwrap();
        layer
            .configure_retry_policy("wf", RetryPolicyConfig::no_retry())
            .await
            .unwrap();

        let state = layer.retry_state("run-1").await.unwrap().unwrap();
        assert_eq!(state.config.max_attempts, 3);
        assert!(layer.clear_retry_state("run-1").await.unwrap());
        assert!(!layer.clear_retry_state("run-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_retry_policy_rejected() {
        let layer = TriggerLayer::in_memory();
        let err = layer
            .configure_retry_policy("wf", RetryPolicyConfig::default().with_max_attempts(0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_authorize_manual_dispatch_applies_policy() {
        let layer = TriggerLayer::in_memory();
        let mut defaults = Map::new();
        defaults.insert("env".to_string(), json!("prod"));
        layer
            .configure_manual_trigger(
                "wf",
                ManualTriggerConfig::default()
                    .with_label("ops_button")
                    .with_allowed_actors(["Alice"])
                    .with_default_payload(defaults)
                    .with_cooldown(60),
            )
            .await
            .unwrap();

        let mut payload = Map::new();
        payload.insert("env".to_string(), json!("staging"));
        let request =
            ManualDispatchRequest::new("wf", "alice", vec![ManualDispatchItem::new(payload)], None)
                .unwrap();

        let plan = layer
            .authorize_manual_dispatch(&request, None, at(9, 0))
            .await
            .unwrap();
        assert_eq!(plan.triggered_by, "ops_button");
        assert_eq!(plan.runs[0].input_payload["env"], json!("staging"));

        let err = layer
            .authorize_manual_dispatch(&request, None, at(9, 0) + Duration::seconds(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ManualDispatchRejected(_)));

        let stranger =
            ManualDispatchRequest::new("wf", "mallory", vec![ManualDispatchItem::default()], None)
                .unwrap();
        let err = layer
            .authorize_manual_dispatch(&stranger, None, at(10, 0))
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 403);
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let layer = TriggerLayer::in_memory();
        layer
            .configure_cron("wf", CronTriggerConfig::new("0 9 * * *"))
            .await
            .unwrap();
        layer.track_run("wf", "run-1").await.unwrap();

        layer.reset().await.unwrap();
        assert!(layer.cron_state("wf").await.unwrap().is_none());
        assert!(layer.retry_state("run-1").await.unwrap().is_none());
    }
}
