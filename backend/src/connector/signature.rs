// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Webhook signature primitives shared by the platform connectors.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Verifies a Meta-style `sha256=<hex>` body signature.
pub(super) fn verify_sha256_prefix_signature(
    secret: &str,
    body: &[u8],
    signature_header: &str,
) -> bool {
    let Some(provided) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    verify_hmac_sha256_hex(secret, body, provided)
}

/// Verifies a hex-encoded HMAC-SHA256 of the body.
pub(super) fn verify_hmac_sha256_hex(secret: &str, body: &[u8], provided_hex: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    constant_time_eq(hex::encode(digest).as_bytes(), provided_hex.as_bytes())
}

/// Compares a shared webhook token without leaking its length position.
pub(super) fn verify_shared_token(expected: &str, provided: &str) -> bool {
    constant_time_eq(expected.as_bytes(), provided.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn valid_signature_is_accepted() {
        let body = br#"{"entry":[]}"#;
        let header = format!("sha256={}", sign("s3cret", body));
        assert!(verify_sha256_prefix_signature("s3cret", body, &header));
    }

    #[test]
    fn tampered_body_is_rejected() {
        let header = format!("sha256={}", sign("s3cret", b"original"));
        assert!(!verify_sha256_prefix_signature("s3cret", b"tampered", &header));
    }

    #[test]
    fn missing_prefix_is_rejected() {
        let body = b"body";
        let bare = sign("s3cret", body);
        assert!(!verify_sha256_prefix_signature("s3cret", body, &bare));
    }

    #[test]
    fn shared_token_comparison() {
        assert!(verify_shared_token("token", "token"));
        assert!(!verify_shared_token("token", "other"));
        assert!(!verify_shared_token("token", "toke"));
    }
}
