// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! rumi-core
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod fsio;
pub mod paths;
pub mod permission;
pub mod principal;

pub use error::{CapError, CapResult, ErrorCategory, ErrorKind};
pub use paths::RuntimePaths;
pub use permission::PermissionId;
pub use principal::{PRINCIPAL_SEPARATOR, Principal, socket_name};
