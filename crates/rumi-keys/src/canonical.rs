// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical JSON payloads for signing.

use crate::SIGNATURE_FIELD;
use serde_json::Value;

/// Serialize a record to the canonical byte form covered by its signature.
///
/// The `signature_hmac` field (at the top level only) is excluded; object
/// keys are emitted in sorted order at every depth; non-ASCII characters are
/// preserved as UTF-8. Signing and verification both run through here, so a
/// record round-tripped through any JSON writer keeps verifying.
pub fn canonical_payload(record: &Value) -> Vec<u8> {
    let stripped = match record {
        Value::Object(map) => {
            let filtered: serde_json::Map<String, Value> = map
                .iter()
                .filter(|(k, _)| k.as_str() != SIGNATURE_FIELD)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Value::Object(filtered)
        }
        other => other.clone(),
    };
    // serde_json's default map representation is ordered by key, so a
    // compact serialization is already canonical.
    serde_json::to_vec(&stripped).unwrap_or_default()
}
