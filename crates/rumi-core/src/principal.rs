// SPDX-License-Identifier: MIT OR Apache-2.0
//! Principal identifiers and the hierarchical parent chain.
//!
//! A principal is a string of the form `segment(__segment)*`. Authority flows
//! down the chain: `parent__child` can never exceed what `parent` holds.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Separator between chain segments.
pub const PRINCIPAL_SEPARATOR: &str = "__";

/// Maximum accepted length of a principal id in bytes.
pub const MAX_PRINCIPAL_LEN: usize = 256;

/// Rejection reasons from [`Principal::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrincipalError {
    /// The id was empty.
    #[error("principal id is empty")]
    Empty,
    /// The id exceeded [`MAX_PRINCIPAL_LEN`].
    #[error("principal id exceeds {MAX_PRINCIPAL_LEN} bytes")]
    TooLong,
    /// A segment between `__` separators was empty.
    #[error("principal id has an empty segment")]
    EmptySegment,
    /// A character outside `[A-Za-z0-9_.-]` appeared.
    #[error("principal id contains invalid character {0:?}")]
    InvalidChar(char),
}

/// A validated principal identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(String);

impl Principal {
    /// Parse and sanitize a principal id.
    ///
    /// Accepts `[A-Za-z0-9_.-]` segments joined by `__`. Path separators,
    /// whitespace, and control characters are rejected outright so the id
    /// can never influence a filesystem path.
    pub fn parse(id: &str) -> Result<Self, PrincipalError> {
        if id.is_empty() {
            return Err(PrincipalError::Empty);
        }
        if id.len() > MAX_PRINCIPAL_LEN {
            return Err(PrincipalError::TooLong);
        }
        for ch in id.chars() {
            if !(ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || ch == '.') {
                return Err(PrincipalError::InvalidChar(ch));
            }
        }
        for segment in id.split(PRINCIPAL_SEPARATOR) {
            if segment.is_empty() {
                return Err(PrincipalError::EmptySegment);
            }
        }
        Ok(Self(id.to_string()))
    }

    /// The raw id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Segments of the id, leaf-most last.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(PRINCIPAL_SEPARATOR)
    }

    /// The ancestor chain, root first and `self` last.
    ///
    /// `parent__child__grandchild` yields
    /// `[parent, parent__child, parent__child__grandchild]`.
    pub fn chain(&self) -> Vec<Principal> {
        let parts: Vec<&str> = self.0.split(PRINCIPAL_SEPARATOR).collect();
        (1..=parts.len())
            .map(|n| Principal(parts[..n].join(PRINCIPAL_SEPARATOR)))
            .collect()
    }

    /// Direct parent, or `None` for a root principal.
    pub fn parent(&self) -> Option<Principal> {
        self.0
            .rfind(PRINCIPAL_SEPARATOR)
            .map(|idx| Principal(self.0[..idx].to_string()))
    }

    /// Whether `self` is `other` or an ancestor of it.
    pub fn is_prefix_of(&self, other: &Principal) -> bool {
        other.0 == self.0
            || (other.0.starts_with(&self.0)
                && other.0[self.0.len()..].starts_with(PRINCIPAL_SEPARATOR))
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Principal {
    type Err = PrincipalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Deterministic socket file name for a principal.
///
/// The name is `hex(sha256(id))[..32] + ".sock"`: collision-free in
/// practice and leaking nothing about the identifier itself.
pub fn socket_name(principal: &Principal) -> String {
    let digest = Sha256::digest(principal.as_str().as_bytes());
    format!("{}.sock", &hex::encode(digest)[..32])
}
