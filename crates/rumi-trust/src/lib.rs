// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! rumi-trust
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod privileges;
mod store;

pub use privileges::{HostPrivilegeManager, HostPrivilegeRecord};
pub use store::{TrustError, TrustRecord, TrustStore};
