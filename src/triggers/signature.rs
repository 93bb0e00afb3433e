//! HMAC signature verification for signed webhooks.
//!
//! Covers the schemes used by common webhook senders:
//!
//! - **GitHub**: `X-Hub-Signature-256: sha256=<hex>` over the body
//! - **Stripe**: `Stripe-Signature: t=<ts>,v1=<hex>` over `<ts>.<body>`
//! - **Slack**: `X-Slack-Signature: v0=<hex>` over `v0:<ts>:<body>`, with the
//!   timestamp in `X-Slack-Request-Timestamp`
//! - **Generic**: `X-Signature: [sha256=]<hex>` over the body
//!
//! All failures map to the `invalid_secret` rejection reason.

use chrono::{DateTime, Utc};
use ring::hmac;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::error::{Error, Result, WebhookRejection};

const SLACK_TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";

/// Webhook signature configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureConfig {
    #[serde(default)]
    pub scheme: SignatureScheme,
    /// HMAC key
    pub secret: String,
    /// Maximum clock skew for timestamped schemes
    #[serde(default = "default_timestamp_tolerance")]
    pub timestamp_tolerance_seconds: u64,
}

fn default_timestamp_tolerance() -> u64 {
    300
}

impl SignatureConfig {
    pub fn new(scheme: SignatureScheme, secret: impl Into<String>) -> Self {
        Self {
            scheme,
            secret: secret.into(),
            timestamp_tolerance_seconds: default_timestamp_tolerance(),
        }
    }
}

/// Supported signature schemes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureScheme {
    #[serde(rename = "github")]
    GitHub,
    Stripe,
    Slack,
    #[default]
    Generic,
}

impl SignatureScheme {
    /// Lower-cased header carrying the signature.
    pub fn header_name(&self) -> &'static str {
        match self {
            SignatureScheme::GitHub => "x-hub-signature-256",
            SignatureScheme::Stripe => "stripe-signature",
            SignatureScheme::Slack => "x-slack-signature",
            SignatureScheme::Generic => "x-signature",
        }
    }
}

impl std::str::FromStr for SignatureScheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "github" => Ok(SignatureScheme::GitHub),
            "stripe" => Ok(SignatureScheme::Stripe),
            "slack" => Ok(SignatureScheme::Slack),
            "generic" | "hmac" => Ok(SignatureScheme::Generic),
            other => Err(Error::Config(format!(
                "Unknown signature scheme '{}'",
                other
            ))),
        }
    }
}

fn rejected(message: &str) -> Error {
    Error::webhook(WebhookRejection::InvalidSecret, message)
}

/// Verify the signature carried in `headers` (keys already lower-cased).
pub fn verify_signature(
    config: &SignatureConfig,
    header: impl Fn(&str) -> Option<String>,
    body: &[u8],
    now: DateTime<Utc>,
) -> Result<()> {
    let signature = header(config.scheme.header_name())
        .ok_or_else(|| rejected("missing signature header"))?;
    let key = hmac::Key::new(hmac::HMAC_SHA256, config.secret.as_bytes());

    match config.scheme {
        SignatureScheme::GitHub => {
            let hex_sig = signature
                .strip_prefix("sha256=")
                .ok_or_else(|| rejected("invalid GitHub signature format"))?;
            check(&key, body, &decode_hex(hex_sig)?)
        }
        SignatureScheme::Generic => {
            let hex_sig = signature.strip_prefix("sha256=").unwrap_or(signature.as_str());
            check(&key, body, &decode_hex(hex_sig)?)
        }
        SignatureScheme::Stripe => {
            let mut timestamp = None;
            let mut candidates = Vec::new();
            for part in signature.split(',') {
                let (k, v) = part
                    .split_once('=')
                    .ok_or_else(|| rejected("invalid Stripe signature format"))?;
                match k.trim() {
                    "t" => timestamp = Some(parse_timestamp(v)?),
                    "v1" => candidates.push(decode_hex(v)?),
                    _ => {}
                }
            }
            let timestamp = timestamp.ok_or_else(|| rejected("missing Stripe timestamp"))?;
            check_tolerance(timestamp, now, config.timestamp_tolerance_seconds)?;

            let signed = signed_payload(&format!("{}.", timestamp), body);
            if candidates
                .iter()
                .any(|candidate| check(&key, &signed, candidate).is_ok())
            {
                Ok(())
            } else {
                Err(rejected("invalid webhook signature"))
            }
        }
        SignatureScheme::Slack => {
            let raw_ts = header(SLACK_TIMESTAMP_HEADER)
                .ok_or_else(|| rejected("missing Slack timestamp"))?;
            let timestamp = parse_timestamp(&raw_ts)?;
            check_tolerance(timestamp, now, config.timestamp_tolerance_seconds)?;

            let hex_sig = signature
                .strip_prefix("v0=")
                .ok_or_else(|| rejected("invalid Slack signature format"))?;
            let signed = signed_payload(&format!("v0:{}:", timestamp), body);
            check(&key, &signed, &decode_hex(hex_sig)?)
        }
    }
}

/// Compute a `sha256=<hex>` signature, as sent by GitHub-style senders.
pub fn compute_signature(secret: &str, body: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    format!("sha256={}", hex::encode(hmac::sign(&key, body).as_ref()))
}

fn check(key: &hmac::Key, message: &[u8], expected: &[u8]) -> Result<()> {
    let computed = hmac::sign(key, message);
    if computed.as_ref().ct_eq(expected).unwrap_u8() != 1 {
        return Err(rejected("invalid webhook signature"));
    }
    Ok(())
}

fn decode_hex(raw: &str) -> Result<Vec<u8>> {
    hex::decode(raw.trim()).map_err(|_| rejected("invalid signature hex encoding"))
}

fn parse_timestamp(raw: &str) -> Result<i64> {
    raw.trim()
        .parse()
        .map_err(|_| rejected("invalid signature timestamp"))
}

fn check_tolerance(timestamp: i64, now: DateTime<Utc>, tolerance: u64) -> Result<()> {
    match now.timestamp().checked_sub(timestamp) {
        Some(skew) if skew.unsigned_abs() <= tolerance => Ok(()),
        _ => Err(rejected("webhook timestamp outside tolerance")),
    }
}

fn signed_payload(prefix: &str, body: &[u8]) -> Vec<u8> {
    let mut signed = Vec::with_capacity(prefix.len() + body.len());
    signed.extend_from_slice(prefix.as_bytes());
    signed.extend_from_slice(body);
    signed
}
