//! trigger-layer - decides when and how a workflow run starts
//!
//! The trigger layer turns three kinds of trigger into one normalized dispatch
//! instruction for an execution engine:
//!
//! - **Webhooks**: per-workflow method, header, query param, shared secret,
//!   signature and rate-limit checks on inbound requests
//! - **Cron**: due-occurrence tracking that survives repeated polling, plus an
//!   overlap guard limiting concurrent runs per workflow
//! - **Manual**: validated dispatch requests with optional per-workflow
//!   actor and cooldown policy
//!
//! A uniform exponential backoff policy decides when failed runs are retried,
//! whatever triggered them.
//!
//! ## Example
//!
//! ```rust,no_run
//! use trigger_layer::triggers::{WebhookRequest, WebhookTriggerConfig};
//! use trigger_layer::TriggerLayer;
//!
//! # async fn example() -> trigger_layer::Result<()> {
//! let layer = TriggerLayer::in_memory();
//! layer
//!     .configure_webhook(
//!         "order-sync",
//!         WebhookTriggerConfig::default().with_shared_secret("X-Token", "s3cret"),
//!     )
//!     .await?;
//!
//! let request = WebhookRequest::new("POST")
//!     .header("x-token", "s3cret")
//!     .payload(r#"{"order_id": 42}"#);
//! let dispatch = layer.prepare_webhook_dispatch("order-sync", &request).await?;
//! assert_eq!(dispatch.triggered_by, "webhook");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod layer;
pub mod metrics;
pub mod shutdown;
pub mod storage;
pub mod telemetry;
pub mod triggers;

pub use error::{Error, Result};
pub use layer::TriggerLayer;
