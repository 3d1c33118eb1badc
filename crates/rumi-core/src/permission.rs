// SPDX-License-Identifier: MIT OR Apache-2.0
//! Capability permission identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum accepted length of a permission id in bytes.
pub const MAX_PERMISSION_LEN: usize = 128;

/// Rejection reasons from [`PermissionId::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PermissionError {
    /// The id was empty.
    #[error("permission id is empty")]
    Empty,
    /// The id exceeded [`MAX_PERMISSION_LEN`].
    #[error("permission id exceeds {MAX_PERMISSION_LEN} bytes")]
    TooLong,
    /// The id did not match the dotted lowercase grammar.
    #[error("permission id {0:?} is not a dotted lowercase token")]
    Malformed(String),
}

/// A dotted lowercase permission token such as `fs.read` or `store.get`.
///
/// The namespace is flat: there is no hierarchy between `store.get` and
/// `store.set` beyond the shared spelling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionId(String);

impl PermissionId {
    /// Parse a permission id.
    ///
    /// Grammar: two or more `[a-z][a-z0-9_]*` words joined by single dots.
    pub fn parse(id: &str) -> Result<Self, PermissionError> {
        if id.is_empty() {
            return Err(PermissionError::Empty);
        }
        if id.len() > MAX_PERMISSION_LEN {
            return Err(PermissionError::TooLong);
        }
        let words: Vec<&str> = id.split('.').collect();
        if words.len() < 2 {
            return Err(PermissionError::Malformed(id.to_string()));
        }
        for word in &words {
            let mut chars = word.chars();
            let valid_head = matches!(chars.next(), Some(c) if c.is_ascii_lowercase());
            let valid_tail =
                chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
            if !valid_head || !valid_tail {
                return Err(PermissionError::Malformed(id.to_string()));
            }
        }
        Ok(Self(id.to_string()))
    }

    /// The raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading word of the token (`store` for `store.get`).
    pub fn family(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for PermissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for PermissionId {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
