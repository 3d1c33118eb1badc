// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! rumi-grant
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod intersect;
mod manager;

pub use intersect::intersect_configs;
pub use manager::{GrantDecision, GrantError, GrantManager, GrantRecord};
