//! Webhook signature verification
//!
//! The processor signs `"{timestamp}.{payload}"` with HMAC-SHA256 and sends
//! `t=<unix>,v1=<hex>[,v1=<hex>...]`. More than one `v1` entry appears while a signing secret
//! is being rolled.

use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Default timestamp tolerance
pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
    tolerance: Duration,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"[REDACTED]")
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>, tolerance: Duration) -> Self {
        Self {
            secret: secret.into(),
            tolerance,
        }
    }

    /// Verify `header` against `payload` at time `now`
    pub fn verify(&self, payload: &[u8], header: &str, now: OffsetDateTime) -> BillingResult<()> {
        let mut timestamp: Option<&str> = None;
        let mut signatures = Vec::new();

        for part in header.split(',') {
            let part = part.trim();
            if let Some(t) = part.strip_prefix("t=") {
                timestamp = Some(t);
            } else if let Some(v) = part.strip_prefix("v1=") {
                signatures.push(v);
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Webhook signature header missing timestamp");
            BillingError::WebhookSignatureInvalid
        })?;
        if signatures.is_empty() {
            tracing::warn!("Webhook signature header missing v1 signature");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let ts: i64 = timestamp
            .parse()
            .map_err(|_| BillingError::WebhookSignatureInvalid)?;
        let Some(age) = now.unix_timestamp().checked_sub(ts).map(i64::unsigned_abs) else {
            tracing::warn!(timestamp = ts, "Webhook timestamp out of range");
            return Err(BillingError::WebhookSignatureInvalid);
        };
        if age > self.tolerance.as_secs() {
            tracing::warn!(age_secs = age, "Webhook timestamp outside tolerance");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let matched = signatures.iter().any(|candidate| {
            let Ok(expected) = hex::decode(candidate) else {
                return false;
            };
            let Ok(mut mac) = HmacSha256::new_from_slice(self.secret.as_bytes()) else {
                return false;
            };
            mac.update(timestamp.as_bytes());
            mac.update(b".");
            mac.update(payload);
            mac.verify_slice(&expected).is_ok()
        });

        if !matched {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        Ok(())
    }

    /// Header value for `payload` signed at `timestamp`
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> BillingResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| BillingError::Config(format!("invalid webhook secret: {}", e)))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        ))
    }
}
