// SPDX-License-Identifier: MIT OR Apache-2.0
//! Property tests: any single-byte perturbation of a record or its
//! signature must fail verification.

use chrono::Utc;
use proptest::prelude::*;
use rumi_keys::{KeyRing, SigningKey};
use serde_json::json;

fn ring() -> KeyRing {
    KeyRing::new(vec![SigningKey {
        version: 1,
        secret: vec![0x42; 32],
        created_at: Utc::now(),
        retired: false,
    }])
    .expect("one live key")
}

proptest! {
    #[test]
    fn sign_then_verify_holds(principal in "[a-z]{1,12}", value in any::<i64>()) {
        let ring = ring();
        let record = json!({"principal_id": principal, "value": value});
        let sig = ring.sign_record(&record);
        prop_assert!(ring.verify_record(&record, &sig));
    }

    #[test]
    fn field_mutation_breaks_signature(
        principal in "[a-z]{1,12}",
        value in any::<i64>(),
        delta in 1i64..1000,
    ) {
        let ring = ring();
        let record = json!({"principal_id": principal, "value": value});
        let sig = ring.sign_record(&record);
        let mutated = json!({"principal_id": principal, "value": value.wrapping_add(delta)});
        prop_assert!(!ring.verify_record(&mutated, &sig));
    }

    #[test]
    fn signature_nibble_flip_fails(pos_seed in any::<usize>(), flip in 1u8..16) {
        let ring = ring();
        let record = json!({"k": "v"});
        let sig = ring.sign_record(&record);

        // Mutate one hex digit past the "v1:" prefix.
        let hex_start = 3;
        let pos = hex_start + pos_seed % (sig.len() - hex_start);
        let mut bytes: Vec<char> = sig.chars().collect();
        let digit = bytes[pos].to_digit(16).unwrap_or(0);
        let new_digit = (digit ^ u32::from(flip)) % 16;
        bytes[pos] = char::from_digit(new_digit, 16).unwrap();
        let mutated: String = bytes.into_iter().collect();

        if mutated != sig {
            prop_assert!(!ring.verify_record(&record, &mutated));
        }
    }
}
