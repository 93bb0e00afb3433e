//! Background polling of cron schedules.
//!
//! [`CronPoller`] periodically asks the [`TriggerLayer`] for due cron plans,
//! hands each to an [`ExecutionEngine`], and commits the occurrence only once
//! the engine accepted it. A failed enqueue leaves the occurrence pending, so
//! it is offered again on the next tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use super::cron::CronDispatchPlan;
use crate::error::{Error, Result};
use crate::layer::TriggerLayer;
use crate::shutdown::ShutdownCoordinator;

/// Default poll interval (in milliseconds).
pub const POLL_INTERVAL_MS: u64 = 1000;

/// Consumer of cron dispatch plans.
#[async_trait]
pub trait ExecutionEngine: Send + Sync + 'static {
    /// Enqueue a run for `plan` and return its run id.
    async fn enqueue_cron(&self, plan: &CronDispatchPlan) -> Result<String>;
}

/// Periodic driver for cron triggers.
pub struct CronPoller {
    layer: Arc<TriggerLayer>,
    engine: Arc<dyn ExecutionEngine>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    poll_interval_ms: u64,
}

impl CronPoller {
    pub fn new(layer: Arc<TriggerLayer>, engine: Arc<dyn ExecutionEngine>) -> Self {
        Self {
            layer,
            engine,
            shutdown_tx: None,
            handle: None,
            poll_interval_ms: POLL_INTERVAL_MS,
        }
    }

    /// Set custom poll interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms.max(1);
        self
    }

    /// Run one polling cycle at `now`. Returns the number of committed plans.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<usize> {
        poll_cycle(&self.layer, &self.engine, now).await
    }

    /// Start the background polling task.
    pub async fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Err(Error::Internal("cron poller is already running".to_string()));
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        let layer = self.layer.clone();
        let engine = self.engine.clone();
        let poll_interval = self.poll_interval_ms;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(poll_interval));

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Cron poller received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = poll_cycle(&layer, &engine, Utc::now()).await {
                            error!("Error polling cron triggers: {}", e);
                        }
                    }
                }
            }
        });

        self.handle = Some(handle);
        info!(
            "Cron poller started with {}ms poll interval",
            self.poll_interval_ms
        );
        Ok(())
    }

    /// Stop the background polling task.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|e| Error::Internal(e.to_string()))?;
        }

        info!("Cron poller stopped");
        Ok(())
    }

    /// Check if the poller is running.
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Poll in the background until `shutdown` is requested, then stop.
    pub async fn run_until_shutdown(&mut self, shutdown: &ShutdownCoordinator) -> Result<()> {
        self.start().await?;
        shutdown.wait_for_shutdown().await;
        self.stop().await
    }
}

async fn poll_cycle(
    layer: &TriggerLayer,
    engine: &Arc<dyn ExecutionEngine>,
    now: DateTime<Utc>,
) -> Result<usize> {
    let plans = layer.collect_due_cron_dispatches(now).await?;
    if plans.is_empty() {
        return Ok(0);
    }

    let mut committed = 0;
    for plan in plans {
        match engine.enqueue_cron(&plan).await {
            Ok(run_id) => {
                if layer.commit_cron_plan(&plan).await?.is_none() {
                    continue;
                }
                committed += 1;
                debug!(
                    "Enqueued run '{}' for cron workflow '{}' at {}",
                    run_id,
                    plan.workflow_id,
                    plan.scheduled_for.to_rfc3339()
                );
            }
            Err(e) => {
                warn!(
                    "Failed to enqueue cron workflow '{}', will retry next tick: {}",
                    plan.workflow_id, e
                );
            }
        }
    }

    if committed > 0 {
        info!("Dispatched {} cron workflow(s)", committed);
    }
    Ok(committed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triggers::CronTriggerConfig;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingEngine {
        fail: AtomicBool,
        counter: AtomicUsize,
        plans: Mutex<Vec<CronDispatchPlan>>,
    }

    #[async_trait]
    impl ExecutionEngine for RecordingEngine {
        async fn enqueue_cron(&self, plan: &CronDispatchPlan) -> Result<String> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Internal("queue unavailable".to_string()));
            }
            self.plans.lock().unwrap().push(plan.clone());
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(format!("run-{}", n))
        }
    }

    async fn setup() -> (Arc<TriggerLayer>, Arc<RecordingEngine>, CronPoller) {
        let layer = Arc::new(TriggerLayer::in_memory());
        layer
            .configure_cron("nightly", CronTriggerConfig::new("0 2 * * *"))
            .await
            .unwrap();
        let engine = Arc::new(RecordingEngine::default());
        let poller = CronPoller::new(layer.clone(), engine.clone());
        (layer, engine, poller)
    }

    #[tokio::test]
    async fn test_poll_once_commits_enqueued_plans() {
        let (layer, engine, poller) = setup().await;
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 2, 30, 0).unwrap();

        assert_eq!(poller.poll_once(now).await.unwrap(), 1);
        assert_eq!(poller.poll_once(now).await.unwrap(), 0);

        let plans = engine.plans.lock().unwrap().clone();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].workflow_id, "nightly");

        let state = layer.cron_state("nightly").await.unwrap().unwrap();
        assert_eq!(
            state.last_dispatched_at,
            Some(Utc.with_ymd_and_hms(2025, 6, 1, 2, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_failed_enqueue_is_not_committed() {
        let (layer, engine, poller) = setup().await;
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 2, 30, 0).unwrap();

        engine.fail.store(true, Ordering::SeqCst);
        assert_eq!(poller.poll_once(now).await.unwrap(), 0);
        let state = layer.cron_state("nightly").await.unwrap().unwrap();
        assert!(state.last_dispatched_at.is_none());
        assert!(state.pending_due.is_some());

        engine.fail.store(false, Ordering::SeqCst);
        assert_eq!(poller.poll_once(now).await.unwrap(), 1);
    }

    /// Engine whose enqueue races with another committer.
    struct RacingEngine {
        layer: Arc<TriggerLayer>,
    }

    #[async_trait]
    impl ExecutionEngine for RacingEngine {
        async fn enqueue_cron(&self, plan: &CronDispatchPlan) -> Result<String> {
            self.layer.commit_cron_dispatch(&plan.workflow_id).await?;
            Ok("run-raced".to_string())
        }
    }

    #[tokio::test]
    async fn test_occurrence_committed_elsewhere_is_not_counted() {
        let (layer, _engine, _poller) = setup().await;
        let poller = CronPoller::new(layer.clone(), Arc::new(RacingEngine { layer: layer.clone() }));
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 2, 30, 0).unwrap();

        assert_eq!(poller.poll_once(now).await.unwrap(), 0);
        let state = layer.cron_state("nightly").await.unwrap().unwrap();
        assert_eq!(
            state.last_dispatched_at,
            Some(Utc.with_ymd_and_hms(2025, 6, 1, 2, 0, 0).unwrap())
        );
        assert!(state.pending_due.is_none());
    }

    #[tokio::test]
    async fn test_start_stop() {
        let (_layer, _engine, poller) = setup().await;
        let mut poller = poller.with_poll_interval(10);

        assert!(!poller.is_running());
        poller.start().await.unwrap();
        assert!(poller.is_running());
        assert!(poller.start().await.is_err());

        poller.stop().await.unwrap();
        assert!(!poller.is_running());
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let (_layer, _engine, poller) = setup().await;
        let mut poller = poller.with_poll_interval(10);
        let shutdown = ShutdownCoordinator::new();
        let trigger = shutdown.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.request_shutdown();
        });

        tokio::time::timeout(Duration::from_secs(2), poller.run_until_shutdown(&shutdown))
            .await
            .unwrap()
            .unwrap();
        assert!(!poller.is_running());
    }
}
