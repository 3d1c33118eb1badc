// SPDX-License-Identifier: MIT OR Apache-2.0
//! Store declarations and root resolution.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rumi_core::fsio::atomic_write;
use rumi_core::{CapError, ErrorKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A declared store: a file tree rooted at `root_path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreDef {
    /// Store identifier (`[A-Za-z0-9_-]{1,64}`).
    pub store_id: String,
    /// Root directory holding the store's `.json` files.
    pub root_path: PathBuf,
    /// When the store was declared.
    pub declared_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreIndex {
    stores: BTreeMap<String, StoreDef>,
}

/// Registry of declared stores, persisted to a single index document.
///
/// Declarations are rare control-plane operations; value reads and writes
/// never touch the index (a `set` is the rename alone).
#[derive(Debug, Clone)]
pub struct StoreRegistry {
    index_file: PathBuf,
    stores_dir: PathBuf,
    index: Arc<Mutex<StoreIndex>>,
}

impl StoreRegistry {
    /// Open (or start empty) the registry persisted at `index_file`, with
    /// new store roots allocated under `stores_dir`.
    pub fn open(index_file: impl Into<PathBuf>, stores_dir: impl Into<PathBuf>) -> Self {
        let index_file = index_file.into();
        let index = std::fs::read(&index_file)
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .unwrap_or_default();
        Self {
            index_file,
            stores_dir: stores_dir.into(),
            index: Arc::new(Mutex::new(index)),
        }
    }

    /// Declare a store, creating its root directory.
    ///
    /// Redeclaring an existing id returns the existing definition unchanged.
    pub fn declare(&self, store_id: &str) -> Result<StoreDef, CapError> {
        validate_store_id(store_id)?;
        let mut index = self.index.lock();
        if let Some(existing) = index.stores.get(store_id) {
            return Ok(existing.clone());
        }
        let def = StoreDef {
            store_id: store_id.to_string(),
            root_path: self.stores_dir.join(store_id),
            declared_at: Utc::now(),
        };
        std::fs::create_dir_all(&def.root_path)
            .map_err(|e| CapError::new(ErrorKind::WriteError, format!("Failed to create store root: {e}")))?;
        index.stores.insert(store_id.to_string(), def.clone());
        let bytes = serde_json::to_vec_pretty(&*index)
            .map_err(|_| CapError::internal())?;
        atomic_write(&self.index_file, &bytes)
            .map_err(|e| CapError::new(ErrorKind::WriteError, format!("Failed to write store index: {e}")))?;
        Ok(def)
    }

    /// Look up a store definition.
    pub fn get_store(&self, store_id: &str) -> Option<StoreDef> {
        self.index.lock().stores.get(store_id).cloned()
    }

    /// Sorted list of declared store ids.
    pub fn list_ids(&self) -> Vec<String> {
        self.index.lock().stores.keys().cloned().collect()
    }

    /// Resolve a store's root directory after symlink resolution.
    pub(crate) fn resolved_root(&self, store_id: &str) -> Result<PathBuf, CapError> {
        let def = self.get_store(store_id).ok_or_else(|| {
            CapError::new(ErrorKind::StoreNotFound, format!("Store not found: {store_id}"))
        })?;
        def.root_path.canonicalize().map_err(|_| {
            CapError::new(ErrorKind::StoreNotFound, format!("Store not found: {store_id}"))
        })
    }
}

fn validate_store_id(store_id: &str) -> Result<(), CapError> {
    let ok = !store_id.is_empty()
        && store_id.len() <= 64
        && store_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(CapError::validation("Missing or invalid store_id"))
    }
}

/// Resolve `key` to its backing file, enforcing the store boundary.
///
/// The resolved file must be a descendant of the resolved root: the deepest
/// existing ancestor of the candidate path is canonicalized (following
/// symlinks) and checked against the root before the lexical remainder is
/// re-attached.
pub(crate) fn resolve_key_file(root: &Path, key: &str) -> Result<PathBuf, CapError> {
    let candidate = root.join(format!("{key}.json"));

    let mut existing = candidate.clone();
    let mut remainder = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                remainder.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => {
                return Err(CapError::security("Path traversal detected"));
            }
        }
    }

    let resolved_base = existing
        .canonicalize()
        .map_err(|_| CapError::security("Path traversal detected"))?;
    let mut resolved = resolved_base;
    for part in remainder.iter().rev() {
        resolved.push(part);
    }

    if resolved.strip_prefix(root).is_err() {
        return Err(CapError::security("Path traversal detected"));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, StoreRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let reg = StoreRegistry::open(dir.path().join("stores.json"), dir.path().join("stores"));
        (dir, reg)
    }

    #[test]
    fn declare_creates_root_and_persists() {
        let (dir, reg) = registry();
        let def = reg.declare("s1").unwrap();
        assert!(def.root_path.is_dir());
        assert_eq!(def.store_id, "s1");

        // A fresh registry instance sees the declaration.
        let reopened =
            StoreRegistry::open(dir.path().join("stores.json"), dir.path().join("stores"));
        assert_eq!(reopened.get_store("s1").unwrap().store_id, "s1");
    }

    #[test]
    fn declare_is_idempotent() {
        let (_dir, reg) = registry();
        let first = reg.declare("s1").unwrap();
        let second = reg.declare("s1").unwrap();
        assert_eq!(first, second);
        assert_eq!(reg.list_ids(), vec!["s1"]);
    }

    #[test]
    fn bad_store_ids_rejected() {
        let (_dir, reg) = registry();
        let overlong = "x".repeat(65);
        for id in ["", "a/b", "a b", overlong.as_str()] {
            assert!(reg.declare(id).is_err(), "accepted {id:?}");
        }
    }

    #[test]
    fn unknown_store_is_store_not_found() {
        let (_dir, reg) = registry();
        let err = reg.resolved_root("ghost").unwrap_err();
        assert_eq!(err.kind, ErrorKind::StoreNotFound);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_detected() {
        let (dir, reg) = registry();
        reg.declare("s1").unwrap();
        let root = reg.resolved_root("s1").unwrap();

        // A symlinked subdirectory pointing outside the store.
        let outside = dir.path().join("outside");
        std::fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();

        let err = resolve_key_file(&root, "link/victim").unwrap_err();
        assert_eq!(err.kind, ErrorKind::SecurityError);
    }

    #[test]
    fn resolve_plain_key_stays_inside() {
        let (_dir, reg) = registry();
        reg.declare("s1").unwrap();
        let root = reg.resolved_root("s1").unwrap();
        let file = resolve_key_file(&root, "a/b/c").unwrap();
        assert!(file.starts_with(&root));
        assert!(file.ends_with("a/b/c.json"));
    }
}
