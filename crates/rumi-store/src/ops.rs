// SPDX-License-Identifier: MIT OR Apache-2.0
//! Store operations: get, set, delete, list, batch get, compare-and-swap.

use crate::key::validate_key;
use crate::registry::{StoreRegistry, resolve_key_file};
use fs2::FileExt;
use rumi_core::fsio::atomic_write;
use rumi_core::{CapError, ErrorKind};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use walkdir::WalkDir;

/// Default cap on a serialized value.
pub const DEFAULT_MAX_VALUE_BYTES: usize = 1024 * 1024;

/// Maximum number of keys per `batch_get`.
pub const MAX_BATCH_KEYS: usize = 100;

/// Soft cap on the cumulative size of a `batch_get` response; values past
/// the cap come back as `null`.
pub const SOFT_BATCH_BUDGET_BYTES: usize = 900 * 1024;

/// Result of [`StoreRegistry::batch_get`].
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BatchGetResult {
    /// Number of keys whose file existed.
    pub found: usize,
    /// Number of keys with no backing file.
    pub not_found: usize,
    /// Requested keys in request order. Missing keys and values dropped by
    /// the size budget are `null`; `truncated` lists the latter.
    pub items: BTreeMap<String, Value>,
    /// Keys whose values were withheld by the response budget.
    pub truncated: Vec<String>,
}

impl StoreRegistry {
    /// Read a value.
    pub fn get(&self, store_id: &str, key: &str) -> Result<Value, CapError> {
        validate_key(key)?;
        let root = self.resolved_root(store_id)?;
        let file = resolve_key_file(&root, key)?;
        read_value(&file, key)
    }

    /// Write a value atomically, creating parent directories.
    ///
    /// Serialized values larger than `max_bytes` are rejected with
    /// `payload_too_large`. Concurrent writers are last-writer-wins; use
    /// [`StoreRegistry::cas`] for guarded updates.
    pub fn set(
        &self,
        store_id: &str,
        key: &str,
        value: &Value,
        max_bytes: usize,
    ) -> Result<(), CapError> {
        validate_key(key)?;
        let encoded = serde_json::to_vec(value).map_err(|_| {
            CapError::validation("Value is not JSON serializable")
        })?;
        if encoded.len() > max_bytes {
            return Err(CapError::new(
                ErrorKind::PayloadTooLarge,
                format!("Value too large (max {max_bytes} bytes)"),
            ));
        }
        let root = self.resolved_root(store_id)?;
        let file = resolve_key_file(&root, key)?;
        atomic_write(&file, &encoded)
            .map_err(|e| CapError::new(ErrorKind::WriteError, format!("Failed to write: {e}")))
    }

    /// Delete a value and clean up now-empty ancestor directories (the store
    /// root itself is never removed).
    pub fn delete(&self, store_id: &str, key: &str) -> Result<(), CapError> {
        validate_key(key)?;
        let root = self.resolved_root(store_id)?;
        let file = resolve_key_file(&root, key)?;
        if !file.exists() {
            return Err(CapError::new(
                ErrorKind::KeyNotFound,
                format!("Key not found: {key}"),
            ));
        }
        std::fs::remove_file(&file)
            .map_err(|e| CapError::new(ErrorKind::DeleteError, format!("Failed to delete: {e}")))?;
        if let Some(parent) = file.parent() {
            cleanup_empty_parents(parent, &root);
        }
        Ok(())
    }

    /// List keys, lexically sorted and deduplicated, optionally filtered by
    /// prefix. Keys are root-relative with `/` separators and no `.json`
    /// extension.
    pub fn list(&self, store_id: &str, prefix: Option<&str>) -> Result<Vec<String>, CapError> {
        let root = self.resolved_root(store_id)?;
        let mut keys: Vec<String> = WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let rel = entry.path().strip_prefix(&root).ok()?;
                let rel_str = rel.to_string_lossy().replace('\\', "/");
                rel_str.strip_suffix(".json").map(str::to_string)
            })
            .filter(|key| prefix.is_none_or(|p| key.starts_with(p)))
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Read up to [`MAX_BATCH_KEYS`] values in one call.
    ///
    /// Once the cumulative encoded size passes [`SOFT_BATCH_BUDGET_BYTES`],
    /// remaining values come back as `null` rather than failing the call.
    pub fn batch_get(&self, store_id: &str, keys: &[String]) -> Result<BatchGetResult, CapError> {
        if keys.is_empty() {
            return Err(CapError::validation("Missing or invalid keys"));
        }
        if keys.len() > MAX_BATCH_KEYS {
            return Err(CapError::validation(format!(
                "Too many keys ({}). Maximum is {MAX_BATCH_KEYS}.",
                keys.len()
            )));
        }
        for key in keys {
            validate_key(key)?;
        }
        let root = self.resolved_root(store_id)?;

        let mut result = BatchGetResult {
            found: 0,
            not_found: 0,
            items: BTreeMap::new(),
            truncated: Vec::new(),
        };
        let mut budget_used = 0usize;
        for key in keys {
            let file = resolve_key_file(&root, key)?;
            match read_value(&file, key) {
                Ok(value) => {
                    result.found += 1;
                    let size = serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(0);
                    if budget_used + size > SOFT_BATCH_BUDGET_BYTES {
                        result.truncated.push(key.clone());
                        result.items.insert(key.clone(), Value::Null);
                    } else {
                        budget_used += size;
                        result.items.insert(key.clone(), value);
                    }
                }
                Err(e) if e.kind == ErrorKind::KeyNotFound => {
                    result.not_found += 1;
                    result.items.insert(key.clone(), Value::Null);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(result)
    }

    /// Compare-and-swap under a per-file advisory lock.
    ///
    /// `expected = null` means "the key must not exist". On mismatch the
    /// call fails with `cas_conflict` and the file is left untouched.
    pub fn cas(
        &self,
        store_id: &str,
        key: &str,
        expected: &Value,
        new: &Value,
    ) -> Result<(), CapError> {
        validate_key(key)?;
        let encoded = serde_json::to_vec(new)
            .map_err(|_| CapError::validation("Value is not JSON serializable"))?;
        let root = self.resolved_root(store_id)?;
        let file = resolve_key_file(&root, key)?;

        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CapError::new(ErrorKind::WriteError, format!("Failed to write: {e}"))
            })?;
        }
        let lock_path = file.with_extension("json.lock");
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| CapError::new(ErrorKind::WriteError, format!("Failed to lock: {e}")))?;
        lock_file
            .lock_exclusive()
            .map_err(|e| CapError::new(ErrorKind::WriteError, format!("Failed to lock: {e}")))?;

        // Critical section: compare then swap. The guard below unlocks even
        // on early return.
        let outcome = (|| {
            let current = match read_value(&file, key) {
                Ok(v) => v,
                Err(e) if e.kind == ErrorKind::KeyNotFound => Value::Null,
                Err(e) => return Err(e),
            };
            if &current != expected {
                return Err(CapError::new(ErrorKind::CasConflict, "Current value does not match expected"));
            }
            atomic_write(&file, &encoded)
                .map_err(|e| CapError::new(ErrorKind::WriteError, format!("Failed to write: {e}")))
        })();

        let _ = fs2::FileExt::unlock(&lock_file);
        outcome
    }
}

fn read_value(file: &Path, key: &str) -> Result<Value, CapError> {
    match std::fs::read(file) {
        Ok(raw) => serde_json::from_slice(&raw).map_err(|_| {
            CapError::new(ErrorKind::InternalError, format!("Stored value for {key} is corrupt"))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CapError::new(
            ErrorKind::KeyNotFound,
            format!("Key not found: {key}"),
        )),
        Err(e) => Err(CapError::new(
            ErrorKind::InternalError,
            format!("Failed to read: {e}"),
        )),
    }
}

fn cleanup_empty_parents(directory: &Path, stop_at: &Path) {
    let mut current = directory.to_path_buf();
    while current != *stop_at {
        let is_empty = matches!(
            std::fs::read_dir(&current).map(|mut d| d.next().is_none()),
            Ok(true)
        );
        if !is_empty || std::fs::remove_dir(&current).is_err() {
            break;
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }
}
