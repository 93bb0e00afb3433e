//! Trigger implementations.
//!
//! Triggers define what starts a workflow:
//! - Cron: Schedule-based (e.g., every day at 09:00)
//! - Manual: CLI or API invocation
//! - Webhook: HTTP endpoint

mod cron;
mod manual;
mod poller;
pub mod signature;
mod webhook;

pub use self::cron::{
    normalize_cron_expression, parse_schedule, parse_timezone, CronDispatchPlan, CronTimezone,
    CronTriggerConfig, CronTriggerState,
};
pub use manual::{ManualDispatchItem, ManualDispatchPlan, ManualDispatchRequest, ManualTriggerConfig};
pub use poller::{CronPoller, ExecutionEngine};
pub use signature::{SignatureConfig, SignatureScheme};
pub use webhook::{
    build_dispatch, serialize_payload, SecurityReview, TriggerDispatch, WebhookAuth,
    WebhookPayload, WebhookRequest, WebhookTriggerConfig, WebhookTriggerState,
};
