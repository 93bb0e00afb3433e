//! Error types for the trigger layer.
//!
//! Every variant carries a stable code so the HTTP layer in front of the
//! trigger layer can map failures to responses without string matching.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for trigger layer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Machine-readable reason a webhook request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookRejection {
    MethodNotAllowed,
    MissingHeader,
    MissingQueryParam,
    InvalidSecret,
    RateLimited,
}

impl WebhookRejection {
    /// Reason code as exposed to callers.
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookRejection::MethodNotAllowed => "method_not_allowed",
            WebhookRejection::MissingHeader => "missing_header",
            WebhookRejection::MissingQueryParam => "missing_query_param",
            WebhookRejection::InvalidSecret => "invalid_secret",
            WebhookRejection::RateLimited => "rate_limited",
        }
    }
}

impl std::fmt::Display for WebhookRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trigger layer error types.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Webhook rejected ({reason}): {message}")]
    WebhookValidation {
        reason: WebhookRejection,
        message: String,
    },

    #[error(
        "Cron workflow '{workflow_id}' already has active run '{active_run_id}'; \
         refusing to register '{conflicting_run_id}'"
    )]
    CronOverlap {
        workflow_id: String,
        active_run_id: String,
        conflicting_run_id: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Manual trigger validation error: {0}")]
    ManualTriggerValidation(String),

    #[error("Manual dispatch rejected: {0}")]
    ManualDispatchRejected(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown run: {0}")]
    UnknownRun(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn webhook(reason: WebhookRejection, message: impl Into<String>) -> Self {
        Error::WebhookValidation {
            reason,
            message: message.into(),
        }
    }

    /// Get the error code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            Error::WebhookValidation { .. } => "WEBHOOK_VALIDATION_ERROR",
            Error::CronOverlap { .. } => "CRON_OVERLAP",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::ManualTriggerValidation(_) => "MANUAL_TRIGGER_VALIDATION_ERROR",
            Error::ManualDispatchRejected(_) => "MANUAL_DISPATCH_REJECTED",
            Error::Config(_) => "CONFIG_ERROR",
            Error::UnknownRun(_) => "UNKNOWN_RUN",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Webhook rejection reason, if this is a webhook validation failure.
    pub fn webhook_reason(&self) -> Option<WebhookRejection> {
        match self {
            Error::WebhookValidation { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Get the error category for retry logic.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::WebhookValidation {
                reason: WebhookRejection::RateLimited,
                ..
            } => ErrorCategory::RateLimit,
            Error::WebhookValidation { .. }
            | Error::Validation(_)
            | Error::ManualTriggerValidation(_)
            | Error::ManualDispatchRejected(_)
            | Error::Config(_)
            | Error::UnknownRun(_) => ErrorCategory::ClientError,
            Error::CronOverlap { .. } => ErrorCategory::Conflict,
            Error::Storage(_) | Error::Internal(_) => ErrorCategory::Permanent,
        }
    }

    /// Get HTTP status code mapping.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::WebhookValidation { reason, .. } => match reason {
                WebhookRejection::MethodNotAllowed => 405,
                WebhookRejection::MissingHeader | WebhookRejection::MissingQueryParam => 400,
                WebhookRejection::InvalidSecret => 401,
                WebhookRejection::RateLimited => 429,
            },
            Error::CronOverlap { .. } => 409,
            Error::Validation(_) | Error::ManualTriggerValidation(_) | Error::Config(_) => 400,
            Error::ManualDispatchRejected(_) => 403,
            Error::UnknownRun(_) => 404,
            Error::Storage(_) | Error::Internal(_) => 500,
        }
    }

    /// Get a sanitized error message safe for external consumers.
    ///
    /// Storage and internal failures may carry backend details (connection
    /// strings, query text), so only their category is exposed.
    pub fn external_message(&self) -> String {
        match self {
            Error::Storage(_) => "A storage error occurred".to_string(),
            Error::Internal(_) => "An internal error occurred".to_string(),
            // Secret mismatches never echo which header or value was wrong.
            Error::WebhookValidation {
                reason: WebhookRejection::InvalidSecret,
                ..
            } => "Webhook rejected (invalid_secret)".to_string(),
            other => other.to_string(),
        }
    }

    /// Convert to a JSON error body with the sanitized message.
    pub fn to_json(&self) -> serde_json::Value {
        let mut error = serde_json::json!({
            "code": self.code(),
            "category": self.category(),
            "message": self.external_message(),
        });
        if let Some(reason) = self.webhook_reason() {
            error["reason"] = serde_json::Value::String(reason.as_str().to_string());
        }
        serde_json::json!({
            "success": false,
            "error": error,
        })
    }
}

/// Error categories for callers deciding whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed request or config. Do not retry without fixing it.
    ClientError,
    /// Rate limited. Retry in a later window.
    RateLimit,
    /// Scheduling conflict. Skip this cycle and try the next one.
    Conflict,
    /// Backend failure.
    Permanent,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::ClientError => write!(f, "client_error"),
            ErrorCategory::RateLimit => write!(f, "rate_limit"),
            ErrorCategory::Conflict => write!(f, "conflict"),
            ErrorCategory::Permanent => write!(f, "permanent"),
        }
    }
}
