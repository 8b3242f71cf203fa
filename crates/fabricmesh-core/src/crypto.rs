//! HMAC-SHA256 signing and verification over the group secret.
//!
//! Three canonical messages are signed across the protocol (see
//! external interfaces): heartbeat JSON with lexicographically sorted
//! keys, `"{job_id}:{timestamp}"` for job/kill auth, and
//! `"list:{timestamp}"` for list auth. This module provides the
//! primitive; callers build the canonical bytes.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256 of `message` under `secret`.
pub fn sign(secret: &[u8], message: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret).expect("HMAC accepts a key of any length");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time verification of a hex-encoded signature.
pub fn verify(secret: &[u8], message: &[u8], signature_hex: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(message);
    let Ok(sig_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    mac.verify_slice(&sig_bytes).is_ok()
}

/// Canonical JSON for signing: object keys sorted lexicographically,
/// matching `json.dumps(data, sort_keys=True)` in the reference
/// implementation.
pub fn canonical_json<T: serde::Serialize>(value: &T) -> serde_json::Result<Vec<u8>> {
    let as_value = serde_json::to_value(value)?;
    let sorted = sort_keys(as_value);
    serde_json::to_vec(&sorted)
}

fn sort_keys(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys: Vec<String> = map.keys().cloned().collect();
            keys.sort();
            for key in keys {
                let v = map[&key].clone();
                sorted.insert(key, sort_keys(v));
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(sort_keys).collect())
        }
        other => other,
    }
}

/// Builds the auth message for job/kill requests: `"{job_id}:{timestamp}"`.
pub fn job_auth_message(job_id: &str, timestamp: i64) -> Vec<u8> {
    format!("{job_id}:{timestamp}").into_bytes()
}

/// Builds the auth message for list requests: `"list:{timestamp}"`.
pub fn list_auth_message(timestamp: i64) -> Vec<u8> {
    format!("list:{timestamp}").into_bytes()
}

/// Freshness window for job/kill/list auth tokens, in seconds.
pub const AUTH_FRESHNESS_SECS: i64 = 300;

/// `|now - timestamp| <= AUTH_FRESHNESS_SECS`.
pub fn is_fresh(now: i64, timestamp: i64) -> bool {
    (now - timestamp).abs() <= AUTH_FRESHNESS_SECS
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::Serialize;

    #[test]
    fn sign_verify_roundtrip() {
        let secret = b"group-secret";
        let msg = b"hello world";
        let sig = sign(secret, msg);
        assert!(verify(secret, msg, &sig));
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let sig = sign(b"secret-a", b"payload");
        assert!(!verify(b"secret-b", b"payload", &sig));
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let sig = sign(b"secret", b"payload");
        assert!(!verify(b"secret", b"tampered", &sig));
    }

    #[test]
    fn verify_rejects_malformed_hex() {
        assert!(!verify(b"secret", b"payload", "not-hex!"));
    }

    #[derive(Serialize)]
    struct Unordered {
        zeta: i32,
        alpha: i32,
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let value = Unordered { zeta: 1, alpha: 2 };
        let bytes = canonical_json(&value).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, r#"{"alpha":2,"zeta":1}"#);
    }

    #[test]
    fn job_auth_message_format() {
        assert_eq!(job_auth_message("abc12345", 1700000000), b"abc12345:1700000000");
    }

    #[test]
    fn list_auth_message_format() {
        assert_eq!(list_auth_message(1700000000), b"list:1700000000");
    }

    #[test]
    fn freshness_window_boundaries() {
        assert!(is_fresh(1000, 1000 - AUTH_FRESHNESS_SECS));
        assert!(!is_fresh(1000, 1000 - AUTH_FRESHNESS_SECS - 1));
        assert!(is_fresh(1000, 1000 + AUTH_FRESHNESS_SECS));
    }

    proptest! {
        #[test]
        fn tampered_signature_never_verifies(
            secret in prop::collection::vec(any::<u8>(), 1..64),
            message in prop::collection::vec(any::<u8>(), 0..256),
            flip_index in 0..256usize,
        ) {
            let sig = sign(&secret, &message);
            let mut tampered = hex::decode(&sig).unwrap();
            let idx = flip_index % tampered.len();
            tampered[idx] ^= 0xFF;
            let tampered_hex = hex::encode(tampered);
            prop_assert!(!verify(&secret, &message, &tampered_hex));
        }
    }
}
