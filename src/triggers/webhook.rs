//! Webhook trigger validation and payload normalization.
//!
//! Each workflow owns one [`WebhookTriggerState`]. Inbound requests are checked
//! against its config in a fixed order (method, headers, query params, secret,
//! rate limit) and the first failure is reported with a machine-readable
//! [`WebhookRejection`] reason.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use subtle::ConstantTimeEq;

use super::signature::{verify_signature, SignatureConfig};
use crate::engine::{FixedWindow, RateLimitConfig};
use crate::error::{Error, Result, WebhookRejection};

/// Normalized instruction handed to the execution engine to start a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDispatch {
    pub triggered_by: String,
    pub actor: String,
    pub input_payload: Map<String, Value>,
}

/// Per-workflow webhook rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookTriggerConfig {
    /// Upper-cased HTTP methods. Empty disables the webhook.
    #[serde(default = "default_allowed_methods")]
    pub allowed_methods: BTreeSet<String>,

    /// Header name (case-insensitive) to exact value
    #[serde(default)]
    pub required_headers: BTreeMap<String, String>,

    /// Query param name (case-sensitive) to exact value
    #[serde(default)]
    pub required_query_params: BTreeMap<String, String>,

    #[serde(default)]
    pub shared_secret: Option<String>,

    /// Header carrying `shared_secret`
    #[serde(default)]
    pub shared_secret_header: Option<String>,

    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    /// HMAC signature verification over the raw body
    #[serde(default)]
    pub signature: Option<SignatureConfig>,
}

fn default_allowed_methods() -> BTreeSet<String> {
    BTreeSet::from(["POST".to_string()])
}

impl Default for WebhookTriggerConfig {
    fn default() -> Self {
        Self {
            allowed_methods: default_allowed_methods(),
            required_headers: BTreeMap::new(),
            required_query_params: BTreeMap::new(),
            shared_secret: None,
            shared_secret_header: None,
            rate_limit: None,
            signature: None,
        }
    }
}

impl WebhookTriggerConfig {
    /// Config accepting exactly `methods`.
    pub fn with_methods<I, S>(methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed_methods: methods
                .into_iter()
                .map(|m| m.as_ref().trim().to_uppercase())
                .collect(),
            ..Default::default()
        }
    }

    pub fn require_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.required_headers.insert(name.into(), value.into());
        self
    }

    pub fn require_query_param(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.required_query_params.insert(name.into(), value.into());
        self
    }

    pub fn with_shared_secret(
        mut self,
        header: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        self.shared_secret_header = Some(header.into());
        self.shared_secret = Some(secret.into());
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    pub fn with_signature(mut self, signature: SignatureConfig) -> Self {
        self.signature = Some(signature);
        self
    }

    /// Upper-case and trim methods, then check the remaining fields.
    pub fn normalized(mut self) -> Result<Self> {
        self.allowed_methods = self
            .allowed_methods
            .iter()
            .map(|m| m.trim().to_uppercase())
            .filter(|m| !m.is_empty())
            .collect();

        if matches!(&self.shared_secret, Some(secret) if secret.is_empty()) {
            return Err(Error::Config("shared_secret must not be empty".to_string()));
        }
        if let Some(header) = &self.shared_secret_header {
            if header.trim().is_empty() {
                return Err(Error::Config(
                    "shared_secret_header must not be blank".to_string(),
                ));
            }
        }
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        if let Some(signature) = &self.signature {
            if signature.secret.is_empty() {
                return Err(Error::Config("signature secret must not be empty".to_string()));
            }
        }
        Ok(self)
    }

    /// Whether requests must prove knowledge of a secret.
    pub fn is_authenticated(&self) -> bool {
        let has_secret = matches!(
            (&self.shared_secret, &self.shared_secret_header),
            (Some(secret), Some(_)) if !secret.is_empty()
        );
        has_secret || self.signature.is_some()
    }
}

/// Request body as received from the transport.
///
/// Transports should pass the body as `Text` or `Bytes` exactly as it arrived.
/// `Json` holds an already decoded value whose original bytes are gone, so a
/// webhook with signature verification rejects it.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum WebhookPayload {
    #[default]
    Empty,
    Json(Value),
    Text(String),
    Bytes(Vec<u8>),
}

impl WebhookPayload {
    /// Body bytes as sent, or `None` for a decoded `Json` value.
    pub fn raw_bytes(&self) -> Option<&[u8]> {
        match self {
            WebhookPayload::Empty => Some(&[][..]),
            WebhookPayload::Json(_) => None,
            WebhookPayload::Text(text) => Some(text.as_bytes()),
            WebhookPayload::Bytes(bytes) => Some(bytes.as_slice()),
        }
    }
}

impl From<Value> for WebhookPayload {
    fn from(value: Value) -> Self {
        WebhookPayload::Json(value)
    }
}

impl From<String> for WebhookPayload {
    fn from(text: String) -> Self {
        WebhookPayload::Text(text)
    }
}

impl From<&str> for WebhookPayload {
    fn from(text: &str) -> Self {
        WebhookPayload::Text(text.to_string())
    }
}

impl From<Vec<u8>> for WebhookPayload {
    fn from(bytes: Vec<u8>) -> Self {
        WebhookPayload::Bytes(bytes)
    }
}

/// One inbound webhook call.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookRequest {
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub query_params: BTreeMap<String, String>,
    pub payload: WebhookPayload,
    pub source_ip: Option<String>,
    /// Drives rate-limit windows and signature timestamp checks
    pub received_at: DateTime<Utc>,
}

impl WebhookRequest {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            headers: BTreeMap::new(),
            query_params: BTreeMap::new(),
            payload: WebhookPayload::Empty,
            source_ip: None,
            received_at: Utc::now(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(name.into(), value.into());
        self
    }

    pub fn payload(mut self, payload: impl Into<WebhookPayload>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn source_ip(mut self, ip: impl Into<String>) -> Self {
        self.source_ip = Some(ip.into());
        self
    }

    pub fn received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = at;
        self
    }

    /// Case-insensitive header lookup.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Collaborator told about webhooks accepted without any secret check.
pub trait SecurityReview: Send + Sync {
    fn flag_unauthenticated(&self, workflow_id: &str);
}

/// Whether an accepted request proved knowledge of a secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookAuth {
    Authenticated,
    /// Accepted, but should be flagged for security review
    Unauthenticated,
}

/// Per-workflow webhook config plus its rate-limit window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookTriggerState {
    pub config: WebhookTriggerConfig,
    #[serde(default)]
    pub window: FixedWindow,
}

impl WebhookTriggerState {
    pub fn new(config: WebhookTriggerConfig) -> Self {
        Self {
            config,
            window: FixedWindow::default(),
        }
    }

    /// Replace the config and start a fresh rate-limit window.
    pub fn apply_config(&mut self, config: WebhookTriggerConfig) {
        self.config = config;
        self.window.reset();
    }

    /// Check `request` against the config, counting it toward the rate limit
    /// only when every other check passes.
    pub fn validate(&mut self, request: &WebhookRequest) -> Result<WebhookAuth> {
        let config = &self.config;

        if config.allowed_methods.is_empty() {
            return Err(Error::webhook(
                WebhookRejection::MethodNotAllowed,
                "webhook trigger is disabled",
            ));
        }
        let method = request.method.trim().to_uppercase();
        if !config.allowed_methods.contains(&method) {
            return Err(Error::webhook(
                WebhookRejection::MethodNotAllowed,
                format!("method '{}' is not allowed", method),
            ));
        }

        for (name, expected) in &config.required_headers {
            if request.header_value(name) != Some(expected.as_str()) {
                return Err(Error::webhook(
                    WebhookRejection::MissingHeader,
                    format!("required header '{}' is missing or mismatched", name),
                ));
            }
        }

        for (name, expected) in &config.required_query_params {
            if request.query_params.get(name) != Some(expected) {
                return Err(Error::webhook(
                    WebhookRejection::MissingQueryParam,
                    format!("required query param '{}' is missing or mismatched", name),
                ));
            }
        }

        if let (Some(secret), Some(header)) = (&config.shared_secret, &config.shared_secret_header)
        {
            let matches = match request.header_value(header) {
                Some(provided) if !secret.is_empty() => {
                    provided.as_bytes().ct_eq(secret.as_bytes()).unwrap_u8() == 1
                }
                _ => false,
            };
            if !matches {
                return Err(Error::webhook(
                    WebhookRejection::InvalidSecret,
                    format!("shared secret in header '{}' does not match", header),
                ));
            }
        }

        if let Some(signature) = &config.signature {
            let body = request.payload.raw_bytes().ok_or_else(|| {
                Error::webhook(
                    WebhookRejection::InvalidSecret,
                    "signed webhooks need the raw request body, not a decoded JSON value",
                )
            })?;
            verify_signature(
                signature,
                |name| request.header_value(name).map(str::to_string),
                body,
                request.received_at,
            )?;
        }

        let auth = if config.is_authenticated() {
            WebhookAuth::Authenticated
        } else {
            WebhookAuth::Unauthenticated
        };

        if let Some(rate_limit) = config.rate_limit {
            if !self.window.try_acquire(&rate_limit, request.received_at) {
                return Err(Error::webhook(
                    WebhookRejection::RateLimited,
                    format!(
                        "more than {} requests within {}s",
                        rate_limit.limit, rate_limit.interval_seconds
                    ),
                ));
            }
        }

        Ok(auth)
    }

    /// Validate `request` and build its dispatch.
    pub fn prepare_dispatch(&mut self, request: &WebhookRequest) -> Result<TriggerDispatch> {
        self.validate(request)?;
        Ok(build_dispatch(request))
    }
}

/// Convert a raw body into a JSON value. Never fails: bodies that are not
/// JSON pass through as strings.
pub fn serialize_payload(raw: &WebhookPayload) -> Value {
    match raw {
        WebhookPayload::Empty => Value::Null,
        WebhookPayload::Json(value) => value.clone(),
        WebhookPayload::Text(text) => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.clone()))
        }
        WebhookPayload::Bytes(bytes) if bytes.is_empty() => Value::Null,
        WebhookPayload::Bytes(bytes) => serde_json::from_slice(bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).to_string())),
    }
}

/// Dispatch for an already validated request.
pub fn build_dispatch(request: &WebhookRequest) -> TriggerDispatch {
    let headers: Map<String, Value> = request
        .headers
        .iter()
        .map(|(k, v)| (k.to_lowercase(), Value::String(v.clone())))
        .collect();
    let query_params: Map<String, Value> = request
        .query_params
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();

    let mut input_payload = Map::new();
    input_payload.insert("body".to_string(), serialize_payload(&request.payload));
    input_payload.insert("headers".to_string(), Value::Object(headers));
    input_payload.insert("query_params".to_string(), Value::Object(query_params));
    input_payload.insert(
        "source_ip".to_string(),
        request
            .source_ip
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
    );

    TriggerDispatch {
        triggered_by: "webhook".to_string(),
        actor: "webhook".to_string(),
        input_payload,
    }
}
