// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! rumi-store
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod key;
mod ops;
mod registry;

pub use key::validate_key;
pub use ops::{BatchGetResult, DEFAULT_MAX_VALUE_BYTES, MAX_BATCH_KEYS, SOFT_BATCH_BUDGET_BYTES};
pub use registry::{StoreDef, StoreRegistry};
