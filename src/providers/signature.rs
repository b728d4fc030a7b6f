//! HMAC-SHA256 webhook signatures.
//!
//! Two header formats are in use:
//! - `sha256=<hex>`: HMAC over the raw body (mobile money, wallet, mock)
//! - `t=<unix>,v1=<hex>`: HMAC over `"<unix>.<body>"` with a timestamp tolerance (card)
//!
//! Comparisons go through `Mac::verify_slice`, which is constant-time.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn mac(secret: &str) -> Option<HmacSha256> {
    HmacSha256::new_from_slice(secret.as_bytes()).ok()
}

/// Generate an HMAC-SHA256 signature for a webhook payload.
///
/// # Format
///
/// `sha256=<hex_encoded_hmac>`
pub fn sign_body(secret: &str, payload: &[u8]) -> String {
    let Some(mut mac) = mac(secret) else {
        return String::new();
    };
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a `sha256=<hex>` header against the raw body.
pub fn verify_body(secret: &str, payload: &[u8], header: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Some(expected) = header.trim().strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(expected) else {
        return false;
    };
    let Some(mut mac) = mac(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// Build a `t=<unix>,v1=<hex>` header for `payload` signed at `timestamp`.
pub fn sign_timestamped(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let Some(mut mac) = mac(secret) else {
        return String::new();
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

/// Verify a `t=<unix>,v1=<hex>` header.
///
/// Signatures older or newer than `tolerance_seconds` relative to `now` are rejected so
/// a captured delivery cannot be replayed later.
pub fn verify_timestamped(
    secret: &str,
    payload: &[u8],
    header: &str,
    now: DateTime<Utc>,
    tolerance_seconds: i64,
) -> bool {
    if secret.is_empty() {
        return false;
    }

    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<Vec<u8>> = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => {
                if let Ok(bytes) = hex::decode(value) {
                    candidates.push(bytes);
                }
            }
            _ => {}
        }
    }

    let Some(timestamp) = timestamp else {
        return false;
    };
    if (now.timestamp() - timestamp).abs() > tolerance_seconds {
        return false;
    }

    // Several v1 entries are sent while a secret is being rolled
    candidates.iter().any(|candidate| {
        let Some(mut mac) = mac(secret) else {
            return false;
        };
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac.verify_slice(candidate).is_ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const SECRET: &str = "whsec_test";

    #[test]
    fn body_signature_round_trip_and_tamper() {
        let body = br#"{"event":"collection.completed"}"#;
        let header = sign_body(SECRET, body);
        assert!(header.starts_with("sha256="));
        assert!(verify_body(SECRET, body, &header));
        assert!(!verify_body(SECRET, br#"{"event":"collection.failed"}"#, &header));
        assert!(!verify_body("other", body, &header));
        assert!(!verify_body(SECRET, body, "md5=abc"));
        assert!(!verify_body("", body, &header));
    }

    #[test]
    fn timestamped_signature_respects_tolerance() {
        let now = Utc::now();
        let body = br#"{"type":"payment_intent.succeeded"}"#;
        let header = sign_timestamped(SECRET, now.timestamp(), body);

        assert!(verify_timestamped(SECRET, body, &header, now, 300));
        assert!(verify_timestamped(SECRET, body, &header, now + Duration::seconds(299), 300));
        assert!(!verify_timestamped(SECRET, body, &header, now + Duration::seconds(301), 300));
        assert!(!verify_timestamped(SECRET, b"{}", &header, now, 300));
        assert!(!verify_timestamped(SECRET, body, "v1=deadbeef", now, 300));
    }

    #[test]
    fn any_matching_v1_entry_is_accepted() {
        let now = Utc::now();
        let body = b"{}";
        let valid = sign_timestamped(SECRET, now.timestamp(), body);
        let v1 = valid.split(",v1=").nth(1).unwrap();
        let header = format!("t={},v1=00ff,v1={}", now.timestamp(), v1);
        assert!(verify_timestamped(SECRET, body, &header, now, 300));
    }
}
