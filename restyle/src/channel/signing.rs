//! HMAC-SHA256 signing for Standard Webhooks compliance.
//!
//! Every delivery to the worker entry point is signed by the execution channel and verified by
//! the worker before it reads any state:
//! - Signature is computed over: `{msg_id}.{timestamp}.{payload}`
//! - The signature is base64-encoded HMAC-SHA256
//! - Headers include: `webhook-id`, `webhook-timestamp`, `webhook-signature`
//!
//! See: <https://www.standardwebhooks.com/>

use axum::http::HeaderMap;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Prefix for webhook secrets
pub const SECRET_PREFIX: &str = "whsec_";

pub const HEADER_ID: &str = "webhook-id";
pub const HEADER_TIMESTAMP: &str = "webhook-timestamp";
pub const HEADER_SIGNATURE: &str = "webhook-signature";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("missing or unreadable {0} header")]
    MissingHeader(&'static str),
    #[error("webhook-timestamp is not a unix timestamp")]
    InvalidTimestamp,
    #[error("webhook-timestamp is outside the accepted window")]
    TimestampOutOfTolerance,
    #[error("no matching signature")]
    InvalidSignature,
}

/// Extract the raw secret bytes from a `whsec_` prefixed secret.
///
/// Returns `None` if the secret doesn't have the correct prefix or invalid base64.
pub fn decode_secret(secret: &str) -> Option<Vec<u8>> {
    let encoded = secret.strip_prefix(SECRET_PREFIX)?;
    BASE64_STANDARD.decode(encoded).ok()
}

/// Sign a payload according to Standard Webhooks spec.
///
/// Returns the signature in format `v1,{base64-hmac-sha256}`, or `None` for a malformed secret.
pub fn sign_payload(msg_id: &str, timestamp: i64, payload: &[u8], secret: &str) -> Option<String> {
    let secret_bytes = decode_secret(secret)?;

    let mut mac = HmacSha256::new_from_slice(&secret_bytes).ok()?;
    mac.update(format!("{}.{}.", msg_id, timestamp).as_bytes());
    mac.update(payload);
    let signature = mac.finalize().into_bytes();

    Some(format!("v1,{}", BASE64_STANDARD.encode(signature)))
}

/// Verify a signature header value. The header may carry several space-separated signatures
/// (secret rotation); any valid `v1` entry is accepted.
pub fn verify_signature(msg_id: &str, timestamp: i64, payload: &[u8], signature: &str, secret: &str) -> bool {
    let Some(expected) = sign_payload(msg_id, timestamp, payload, secret) else {
        return false;
    };
    let Some(expected_value) = expected.strip_prefix("v1,") else {
        return false;
    };

    signature
        .split_whitespace()
        .filter_map(|candidate| candidate.strip_prefix("v1,"))
        .any(|candidate| constant_time_eq(candidate.as_bytes(), expected_value.as_bytes()))
}

/// Verify an inbound delivery: headers present, timestamp within `tolerance` of now in either
/// direction, and signature valid for the raw body.
pub fn verify_delivery(headers: &HeaderMap, payload: &[u8], secret: &str, tolerance: Duration) -> Result<(), VerifyError> {
    let header = |name: &'static str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .ok_or(VerifyError::MissingHeader(name))
    };

    let msg_id = header(HEADER_ID)?;
    let timestamp: i64 = header(HEADER_TIMESTAMP)?.trim().parse().map_err(|_| VerifyError::InvalidTimestamp)?;
    let signature = header(HEADER_SIGNATURE)?;

    let skew = (Utc::now().timestamp() - timestamp).unsigned_abs();
    if skew > tolerance.as_secs() {
        return Err(VerifyError::TimestampOutOfTolerance);
    }

    if !verify_signature(msg_id, timestamp, payload, signature, secret) {
        return Err(VerifyError::InvalidSignature);
    }
    Ok(())
}

/// Constant-time byte comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &str = "whsec_MfKQ9r8GKYqrTwjUPD8ILPZIo2LaLaSw";

    fn signed_headers(msg_id: &str, timestamp: i64, payload: &[u8], secret: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_ID, HeaderValue::from_str(msg_id).unwrap());
        headers.insert(HEADER_TIMESTAMP, HeaderValue::from_str(&timestamp.to_string()).unwrap());
        let signature = sign_payload(msg_id, timestamp, payload, secret).unwrap();
        headers.insert(HEADER_SIGNATURE, HeaderValue::from_str(&signature).unwrap());
        headers
    }

    #[test]
    fn test_decode_secret_invalid_prefix() {
        assert!(decode_secret("invalid_secret").is_none());
    }

    #[test]
    fn test_decode_secret_invalid_base64() {
        assert!(decode_secret("whsec_not-valid-base64!!!").is_none());
    }

    #[test]
    fn test_sign_and_verify() {
        let msg_id = "msg_123";
        let timestamp = 1704067200; // 2024-01-01 00:00:00 UTC
        let payload = br#"{"job_id":"00000000-0000-0000-0000-000000000000"}"#;

        let signature = sign_payload(msg_id, timestamp, payload, SECRET).expect("should sign");
        assert!(signature.starts_with("v1,"));

        assert!(verify_signature(msg_id, timestamp, payload, &signature, SECRET));
        assert!(!verify_signature(msg_id, timestamp, b"wrong", &signature, SECRET));
        assert!(!verify_signature(msg_id, timestamp + 1, payload, &signature, SECRET));
        assert!(!verify_signature("wrong", timestamp, payload, &signature, SECRET));

        let other_secret = "whsec_c2VjcmV0LWtleS1mb3ItdGVzdGluZw==";
        assert!(!verify_signature(msg_id, timestamp, payload, &signature, other_secret));
    }

    #[test]
    fn test_verify_accepts_any_listed_signature() {
        let payload = b"{}";
        let signature = sign_payload("id", 10, payload, SECRET).unwrap();
        let rotated = format!("v1,bm90LXRoaXMtb25l {signature}");
        assert!(verify_signature("id", 10, payload, &rotated, SECRET));
    }

    #[test]
    fn test_verify_invalid_signature_format() {
        assert!(!verify_signature("id", 123, b"payload", "invalid", SECRET));
        assert!(!verify_signature("id", 123, b"payload", "v2,abc", SECRET));
    }

    #[test]
    fn test_standard_webhooks_compatibility() {
        // Reference vector from the Standard Webhooks test suite
        let msg_id = "msg_p5jXN8AQM9LWM0D4loKWxJek";
        let timestamp = 1614265330;
        let payload = br#"{"test": 2432232314}"#;

        let signature = sign_payload(msg_id, timestamp, payload, SECRET).expect("should sign");
        assert_eq!(signature, "v1,g0hM9SsE+OTPJTGt/tmIKtSyZlE3uFJELVlNIOLJ1OE=");
    }

    #[test]
    fn test_verify_delivery() {
        let payload = b"{}";
        let now = Utc::now().timestamp();
        let tolerance = Duration::from_secs(300);

        let headers = signed_headers("msg_1", now, payload, SECRET);
        assert_eq!(verify_delivery(&headers, payload, SECRET, tolerance), Ok(()));
        assert_eq!(
            verify_delivery(&headers, b"{\"tampered\":1}", SECRET, tolerance),
            Err(VerifyError::InvalidSignature)
        );

        let stale = signed_headers("msg_1", now - 301, payload, SECRET);
        assert_eq!(
            verify_delivery(&stale, payload, SECRET, tolerance),
            Err(VerifyError::TimestampOutOfTolerance)
        );

        let mut missing = headers.clone();
        missing.remove(HEADER_SIGNATURE);
        assert_eq!(
            verify_delivery(&missing, payload, SECRET, tolerance),
            Err(VerifyError::MissingHeader(HEADER_SIGNATURE))
        );

        let mut garbled = headers;
        garbled.insert(HEADER_TIMESTAMP, HeaderValue::from_static("yesterday"));
        assert_eq!(
            verify_delivery(&garbled, payload, SECRET, tolerance),
            Err(VerifyError::InvalidTimestamp)
        );
    }
}
