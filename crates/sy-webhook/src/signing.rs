//! HMAC-SHA256 webhook signatures.
//!
//! The signature covers `timestamp + body` so receivers can reject replays;
//! both values travel in headers alongside the JSON payload.

use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";

fn mac_for(secret: &[u8]) -> Hmac<Sha256> {
    // HMAC accepts keys of any length.
    Hmac::<Sha256>::new_from_slice(secret)
        .unwrap_or_else(|_| Hmac::<Sha256>::new_from_slice(b"default").expect("hmac"))
}

/// Hex-encoded HMAC-SHA256 over `timestamp || payload`.
pub fn compute_signature(secret: &[u8], payload: &[u8], timestamp: &str) -> String {
    let mut mac = mac_for(secret);
    mac.update(timestamp.as_bytes());
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time verification for webhook receivers.
pub fn verify_signature(
    secret: &[u8],
    payload: &[u8],
    timestamp: &str,
    signature_hex: &str,
) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };

    let mut mac = mac_for(secret);
    mac.update(timestamp.as_bytes());
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_roundtrips() {
        let secret = b"tenant-secret";
        let payload = br#"{"event":"payment.approved"}"#;
        let signature = compute_signature(secret, payload, "1700000000");

        assert!(verify_signature(secret, payload, "1700000000", &signature));
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let secret = b"tenant-secret";
        let signature = compute_signature(secret, b"original", "1700000000");

        assert!(!verify_signature(secret, b"tampered", "1700000000", &signature));
        assert!(!verify_signature(secret, b"original", "1700000001", &signature));
        assert!(!verify_signature(b"other-secret", b"original", "1700000000", &signature));
    }

    #[test]
    fn malformed_hex_is_rejected() {
        assert!(!verify_signature(b"secret", b"payload", "0", "not-hex"));
    }
}
