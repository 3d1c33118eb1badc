// SPDX-License-Identifier: MIT OR Apache-2.0
//! The in-memory key ring: versioned signing keys, sign and verify.

use crate::canonical::canonical_payload;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// One version of the signing secret.
#[derive(Debug, Clone)]
pub struct SigningKey {
    /// Monotonically increasing version number, starting at 1.
    pub version: u32,
    /// Raw 32-byte secret.
    pub secret: Vec<u8>,
    /// When this version was generated.
    pub created_at: DateTime<Utc>,
    /// Retired keys no longer sign or verify.
    pub retired: bool,
}

/// Immutable-after-load collection of signing key versions.
///
/// Signing uses the newest non-retired key; verification accepts every
/// non-retired version so that rotation does not invalidate records signed
/// earlier. The ring is read-only after construction, so shared references
/// need no lock.
#[derive(Debug, Clone)]
pub struct KeyRing {
    keys: Vec<SigningKey>,
}

impl KeyRing {
    /// Build a ring from key versions. At least one non-retired key is
    /// required.
    pub fn new(mut keys: Vec<SigningKey>) -> Option<Self> {
        keys.sort_by_key(|k| k.version);
        if keys.iter().any(|k| !k.retired) {
            Some(Self { keys })
        } else {
            None
        }
    }

    /// All key versions, oldest first.
    pub fn keys(&self) -> &[SigningKey] {
        &self.keys
    }

    /// The key used for new signatures.
    pub fn active_key(&self) -> &SigningKey {
        // Invariant from `new`: at least one non-retired key exists.
        self.keys
            .iter()
            .rev()
            .find(|k| !k.retired)
            .expect("key ring holds a non-retired key")
    }

    /// Sign a record, returning a `"v{N}:{hmac_hex}"` signature over the
    /// canonical payload (the `signature_hmac` field excluded).
    pub fn sign_record(&self, record: &Value) -> String {
        let key = self.active_key();
        let mut mac =
            HmacSha256::new_from_slice(&key.secret).expect("hmac accepts any key length");
        mac.update(&canonical_payload(record));
        format!("v{}:{}", key.version, hex::encode(mac.finalize().into_bytes()))
    }

    /// Verify a record signature in constant time.
    ///
    /// A `"vN:"`-prefixed signature is checked against that version only; a
    /// bare hex signature (pre-versioning records) is checked against every
    /// non-retired version.
    pub fn verify_record(&self, record: &Value, signature: &str) -> bool {
        let payload = canonical_payload(record);
        match parse_versioned(signature) {
            Some((version, sig_hex)) => self
                .keys
                .iter()
                .find(|k| k.version == version && !k.retired)
                .is_some_and(|k| verify_one(&k.secret, &payload, sig_hex)),
            None => self
                .keys
                .iter()
                .filter(|k| !k.retired)
                .any(|k| verify_one(&k.secret, &payload, signature)),
        }
    }
}

fn parse_versioned(signature: &str) -> Option<(u32, &str)> {
    let rest = signature.strip_prefix('v')?;
    let (version_str, sig_hex) = rest.split_once(':')?;
    let version = version_str.parse::<u32>().ok()?;
    Some((version, sig_hex))
}

fn verify_one(secret: &[u8], payload: &[u8], sig_hex: &str) -> bool {
    let Ok(expected) = hex::decode(sig_hex) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(version: u32, byte: u8, retired: bool) -> SigningKey {
        SigningKey {
            version,
            secret: vec![byte; 32],
            created_at: Utc::now(),
            retired,
        }
    }

    fn ring() -> KeyRing {
        KeyRing::new(vec![key(1, 0xAA, false)]).unwrap()
    }

    #[test]
    fn sign_verify_roundtrip() {
        let r = ring();
        let record = json!({"principal_id": "p", "permission_id": "store.get"});
        let sig = r.sign_record(&record);
        assert!(sig.starts_with("v1:"));
        assert!(r.verify_record(&record, &sig));
    }

    #[test]
    fn tampered_record_fails() {
        let r = ring();
        let record = json!({"principal_id": "p"});
        let sig = r.sign_record(&record);
        let tampered = json!({"principal_id": "q"});
        assert!(!r.verify_record(&tampered, &sig));
    }

    #[test]
    fn tampered_signature_fails() {
        let r = ring();
        let record = json!({"principal_id": "p"});
        let mut sig = r.sign_record(&record);
        let last = sig.pop().unwrap();
        sig.push(if last == '0' { '1' } else { '0' });
        assert!(!r.verify_record(&record, &sig));
    }

    #[test]
    fn signature_ignores_embedded_signature_field() {
        let r = ring();
        let unsigned = json!({"a": 1});
        let sig = r.sign_record(&unsigned);
        let signed = json!({"a": 1, "signature_hmac": sig});
        assert!(r.verify_record(&signed, &sig));
    }

    #[test]
    fn rotation_keeps_old_signatures_valid() {
        let record = json!({"x": true});
        let old_sig = ring().sign_record(&record);

        let rotated = KeyRing::new(vec![key(1, 0xAA, false), key(2, 0xBB, false)]).unwrap();
        assert_eq!(rotated.active_key().version, 2);
        assert!(rotated.verify_record(&record, &old_sig));

        let new_sig = rotated.sign_record(&record);
        assert!(new_sig.starts_with("v2:"));
        assert!(rotated.verify_record(&record, &new_sig));
    }

    #[test]
    fn retired_key_no_longer_verifies() {
        let record = json!({"x": 1});
        let sig = ring().sign_record(&record);
        let retired = KeyRing::new(vec![key(1, 0xAA, true), key(2, 0xBB, false)]).unwrap();
        assert!(!retired.verify_record(&record, &sig));
    }

    #[test]
    fn unversioned_signature_checked_against_all_live_keys() {
        let record = json!({"x": 1});
        let sig = ring().sign_record(&record);
        let bare = sig.strip_prefix("v1:").unwrap();
        let multi = KeyRing::new(vec![key(1, 0xAA, false), key(2, 0xBB, false)]).unwrap();
        assert!(multi.verify_record(&record, bare));
    }

    #[test]
    fn all_retired_ring_is_rejected() {
        assert!(KeyRing::new(vec![key(1, 0xAA, true)]).is_none());
    }

    #[test]
    fn malformed_signatures_fail_closed() {
        let r = ring();
        let record = json!({"x": 1});
        for sig in ["", "v:abc", "vX:00", "zz", "v1:", "v1:zz"] {
            assert!(!r.verify_record(&record, sig), "accepted {sig:?}");
        }
    }
}
