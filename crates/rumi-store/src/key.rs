// SPDX-License-Identifier: MIT OR Apache-2.0
//! Store key validation.

use rumi_core::{CapError, ErrorKind};

/// Validate a store key.
///
/// Keys match `^[a-zA-Z0-9_/.-]+$`, never start or end with `/`, and may not
/// contain `..` as a path segment. A `..` segment is reported as
/// `security_error` (attempted traversal), everything else as
/// `validation_error`.
pub fn validate_key(key: &str) -> Result<(), CapError> {
    if key.is_empty() {
        return Err(CapError::validation("Missing or invalid key"));
    }
    if key.split('/').any(|segment| segment == "..") {
        return Err(CapError::new(
            ErrorKind::SecurityError,
            "Key contains '..' (path traversal)",
        ));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '/' | '.' | '-'))
    {
        return Err(CapError::validation(
            "Key contains invalid characters (allowed: a-zA-Z0-9_/.-)",
        ));
    }
    if key.starts_with('/') || key.ends_with('/') {
        return Err(CapError::validation("Key must not start or end with '/'"));
    }
    Ok(())
}
