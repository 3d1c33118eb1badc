// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! rumi-audit
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod ascii;
mod entry;
mod logger;

pub use ascii::ascii_json_line;
pub use entry::{AuditCategory, AuditEntry, AuditSeverity};
pub use logger::AuditLogger;
