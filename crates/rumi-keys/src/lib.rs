// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! rumi-keys
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod canonical;
mod ring;
mod storage;

pub use canonical::canonical_payload;
pub use ring::{KeyRing, SigningKey};
pub use storage::{KeyStoreError, KeyStoreOptions, load_or_generate};

/// Field name excluded from the signed payload.
pub const SIGNATURE_FIELD: &str = "signature_hmac";
