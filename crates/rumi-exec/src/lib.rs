// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! rumi-exec
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod builtins;
mod context;
mod executor;
mod secrets;
mod services;
mod subprocess;

pub use context::HandlerContext;
pub use executor::{CapabilityExecutor, DENIED_OR_MISSING, TRUST_BYPASS_BUILTINS};
pub use secrets::SecretsStore;
pub use services::{ApplicationState, Services, ServicesError};
pub use subprocess::{KILL_GRACE, run_pack_handler};
