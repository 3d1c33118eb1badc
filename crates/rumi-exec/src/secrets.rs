// SPDX-License-Identifier: MIT OR Apache-2.0
//! File-backed secret values, one file per key.

use std::path::PathBuf;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Maximum secret key length.
pub const MAX_SECRET_KEY_LEN: usize = 64;

/// Read-only view of the secret directory.
///
/// Keys match `^[A-Z0-9_]{1,64}$`; each key maps to `dir/<KEY>`. Values
/// never flow into logs, audit entries, or error messages.
#[derive(Debug, Clone)]
pub struct SecretsStore {
    dir: PathBuf,
}

/// Whether a string is a well-formed secret key.
pub fn valid_secret_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_SECRET_KEY_LEN
        && key
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

impl SecretsStore {
    /// Store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Read a secret. `None` for malformed keys, missing files, and
    /// unreadable content alike; the caller must not distinguish.
    pub fn read(&self, key: &str) -> Option<String> {
        if !valid_secret_key(key) {
            return None;
        }
        let raw = std::fs::read_to_string(self.dir.join(key)).ok()?;
        let value = raw.trim_end_matches('\n').to_string();
        if value.is_empty() { None } else { Some(value) }
    }

    /// Operator-side write (mode 0600).
    pub fn write(&self, key: &str, value: &str) -> std::io::Result<()> {
        if !valid_secret_key(key) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "malformed secret key",
            ));
        }
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(key);
        std::fs::write(&path, value)?;
        #[cfg(unix)]
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        Ok(())
    }
}
