//! State stores for the trigger layer.
//!
//! Every family of trigger state (webhook, cron, retry, indices) sits behind a
//! [`KeyedStore`] so a database-backed implementation can replace the
//! in-memory one without touching the orchestration logic. Stores only load
//! and save whole values; atomic read-modify-write comes from [`KeyedLocks`]
//! held by the caller.

mod locks;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::{RetryPolicyConfig, RetryPolicyState};
use crate::error::Result;
use crate::triggers::{CronTriggerState, ManualTriggerConfig, WebhookTriggerState};

pub use locks::KeyedLocks;
pub use memory::InMemoryStore;

/// Key-value store for one family of trigger state.
#[async_trait]
pub trait KeyedStore<V>: Send + Sync + 'static
where
    V: Clone + Send + Sync + 'static,
{
    /// Load the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<V>>;

    /// Insert or replace the value under `key`.
    async fn put(&self, key: &str, value: V) -> Result<()>;

    /// Remove and return the value under `key`. Absent keys are not an error.
    async fn remove(&self, key: &str) -> Result<Option<V>>;

    /// All keys, sorted.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Remove everything.
    async fn clear(&self) -> Result<()>;
}

/// The stores backing one trigger layer.
#[derive(Clone)]
pub struct TriggerStores {
    pub webhooks: Arc<dyn KeyedStore<WebhookTriggerState>>,
    pub crons: Arc<dyn KeyedStore<CronTriggerState>>,
    /// Run id to owning workflow, for runs registered with the overlap guard
    pub cron_runs: Arc<dyn KeyedStore<String>>,
    pub retry_configs: Arc<dyn KeyedStore<RetryPolicyConfig>>,
    pub retry_states: Arc<dyn KeyedStore<RetryPolicyState>>,
    /// Run id to owning workflow, populated by `track_run`
    pub run_workflows: Arc<dyn KeyedStore<String>>,
    pub manual_configs: Arc<dyn KeyedStore<ManualTriggerConfig>>,
}

impl TriggerStores {
    /// Fresh in-memory stores.
    pub fn in_memory() -> Self {
        Self {
            webhooks: Arc::new(InMemoryStore::new()),
            crons: Arc::new(InMemoryStore::new()),
            cron_runs: Arc::new(InMemoryStore::new()),
            retry_configs: Arc::new(InMemoryStore::new()),
            retry_states: Arc::new(InMemoryStore::new()),
            run_workflows: Arc::new(InMemoryStore::new()),
            manual_configs: Arc::new(InMemoryStore::new()),
        }
    }

    /// Clear every store.
    pub async fn clear_all(&self) -> Result<()> {
        self.webhooks.clear().await?;
        self.crons.clear().await?;
        self.cron_runs.clear().await?;
        self.retry_configs.clear().await?;
        self.retry_states.clear().await?;
        self.run_workflows.clear().await?;
        self.manual_configs.clear().await?;
        Ok(())
    }
}

impl Default for TriggerStores {
    fn default() -> Self {
        Self::in_memory()
    }
}
