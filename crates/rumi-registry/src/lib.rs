// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! rumi-registry
#![deny(unsafe_code)]
#![warn(missing_docs)]

use parking_lot::RwLock;
use rumi_audit::AuditLogger;
use rumi_core::PermissionId;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Manifest file name looked for during scans.
pub const MANIFEST_NAME: &str = "handler.json";

/// A resolved capability handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerDef {
    /// Handler slug (`^[a-z][a-z0-9_]{0,63}$`).
    pub handler_id: String,
    /// Permission this handler implements.
    pub permission_id: PermissionId,
    /// Argv to execute for pack handlers; empty for built-ins.
    pub entrypoint: Vec<String>,
    /// Absolute path of the entrypoint executable (pack handlers only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler_path: Option<PathBuf>,
    /// Directory holding the manifest (pack handlers only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler_dir: Option<PathBuf>,
    /// Whether the handler runs in-process.
    pub is_builtin: bool,
    /// SHA-256 of the entrypoint file; empty for built-ins.
    pub fingerprint_sha256: String,
}

/// On-disk manifest shape.
#[derive(Debug, Deserialize)]
struct Manifest {
    handler_id: String,
    permission_id: String,
    entrypoint: Vec<String>,
}

/// Scan / registration failures for a single manifest.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The manifest file could not be read or parsed.
    #[error("manifest unreadable: {0}")]
    ManifestUnreadable(String),
    /// The handler id is not a valid slug.
    #[error("invalid handler id {0:?}")]
    InvalidSlug(String),
    /// The permission id is malformed.
    #[error("invalid permission id: {0}")]
    InvalidPermission(String),
    /// The entrypoint is missing, absolute, or not a file.
    #[error("invalid entrypoint: {0}")]
    InvalidEntrypoint(String),
    /// The entrypoint path contains a symlink.
    #[error("entrypoint is behind a symlink: {0}")]
    SymlinkedEntrypoint(String),
    /// Hashing the entrypoint failed.
    #[error("fingerprint failed: {0}")]
    FingerprintFailed(String),
}

/// Permission-id → handler resolution table.
///
/// The namespace is flat and first-wins: a later scan never silently
/// replaces an earlier registration, the collision is audited instead.
#[derive(Clone)]
pub struct HandlerRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    audit: AuditLogger,
    handlers: RwLock<BTreeMap<String, HandlerDef>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new(audit: AuditLogger) -> Self {
        Self {
            inner: Arc::new(Inner {
                audit,
                handlers: RwLock::new(BTreeMap::new()),
            }),
        }
    }

    /// Declare an in-process built-in handler.
    pub fn register_builtin(&self, permission: &PermissionId, handler_id: &str) {
        let def = HandlerDef {
            handler_id: handler_id.to_string(),
            permission_id: permission.clone(),
            entrypoint: Vec::new(),
            handler_path: None,
            handler_dir: None,
            is_builtin: true,
            fingerprint_sha256: String::new(),
        };
        self.insert(def);
    }

    /// Walk `root` for `handler.json` manifests and register each valid
    /// handler. Returns the number registered; individual failures are
    /// logged and skipped.
    pub fn scan_dir(&self, root: &Path) -> usize {
        let mut registered = 0;
        for entry in WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file() && e.file_name() == MANIFEST_NAME)
        {
            match load_manifest(entry.path()) {
                Ok(def) => {
                    if self.insert(def) {
                        registered += 1;
                    }
                }
                Err(e) => {
                    warn!(target: "rumi.registry", manifest = %entry.path().display(), error = %e, "skipping handler manifest");
                }
            }
        }
        debug!(target: "rumi.registry", root = %root.display(), registered, "handler scan complete");
        registered
    }

    /// Resolve the handler for a permission.
    pub fn resolve(&self, permission: &PermissionId) -> Option<HandlerDef> {
        self.inner
            .handlers
            .read()
            .get(permission.as_str())
            .cloned()
    }

    /// Sorted list of registered permission ids.
    pub fn permission_ids(&self) -> Vec<String> {
        self.inner.handlers.read().keys().cloned().collect()
    }

    /// Recompute a pack handler's fingerprint and compare.
    ///
    /// Built-ins trivially verify. Returns `false` when the file is gone or
    /// hashes differently.
    pub fn fingerprint_matches(&self, def: &HandlerDef) -> bool {
        if def.is_builtin {
            return true;
        }
        match &def.handler_path {
            Some(path) => {
                fingerprint_file(path).is_ok_and(|fp| fp == def.fingerprint_sha256)
            }
            None => false,
        }
    }

    fn insert(&self, def: HandlerDef) -> bool {
        let mut handlers = self.inner.handlers.write();
        let key = def.permission_id.as_str().to_string();
        if let Some(existing) = handlers.get(&key) {
            self.inner.audit.security_event(
                rumi_audit::AuditSeverity::Warning,
                "handler_collision",
                None,
                json!({
                    "permission_id": key,
                    "kept": existing.handler_id,
                    "ignored": def.handler_id,
                }),
            );
            return false;
        }
        handlers.insert(key, def);
        true
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.inner.handlers.read().len())
            .finish()
    }
}

/// SHA-256 of a file's contents, hex-encoded.
pub fn fingerprint_file(path: &Path) -> Result<String, RegistryError> {
    let bytes = std::fs::read(path)
        .map_err(|e| RegistryError::FingerprintFailed(format!("{}: {e}", path.display())))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Validate a handler slug.
pub fn validate_slug(slug: &str) -> bool {
    let mut chars = slug.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && slug.len() <= 64
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn load_manifest(manifest_path: &Path) -> Result<HandlerDef, RegistryError> {
    let raw = std::fs::read(manifest_path)
        .map_err(|e| RegistryError::ManifestUnreadable(e.to_string()))?;
    let manifest: Manifest = serde_json::from_slice(&raw)
        .map_err(|e| RegistryError::ManifestUnreadable(e.to_string()))?;

    if !validate_slug(&manifest.handler_id) {
        return Err(RegistryError::InvalidSlug(manifest.handler_id));
    }
    let permission = PermissionId::parse(&manifest.permission_id)
        .map_err(|e| RegistryError::InvalidPermission(e.to_string()))?;

    let handler_dir = manifest_path
        .parent()
        .ok_or_else(|| RegistryError::InvalidEntrypoint("manifest has no parent".to_string()))?
        .to_path_buf();

    let first = manifest
        .entrypoint
        .first()
        .ok_or_else(|| RegistryError::InvalidEntrypoint("entrypoint is empty".to_string()))?;
    if Path::new(first).is_absolute() || first.contains("..") {
        return Err(RegistryError::InvalidEntrypoint(first.clone()));
    }
    let handler_path = handler_dir.join(first);
    ensure_no_symlink(&handler_dir, &handler_path)?;
    if !handler_path.is_file() {
        return Err(RegistryError::InvalidEntrypoint(format!(
            "{} is not a file",
            handler_path.display()
        )));
    }

    let fingerprint_sha256 = fingerprint_file(&handler_path)?;

    Ok(HandlerDef {
        handler_id: manifest.handler_id,
        permission_id: permission,
        entrypoint: manifest.entrypoint,
        handler_path: Some(handler_path),
        handler_dir: Some(handler_dir),
        is_builtin: false,
        fingerprint_sha256,
    })
}

fn ensure_no_symlink(base: &Path, target: &Path) -> Result<(), RegistryError> {
    let mut current = base.to_path_buf();
    let Ok(rel) = target.strip_prefix(base) else {
        return Err(RegistryError::InvalidEntrypoint(
            target.display().to_string(),
        ));
    };
    for part in rel.components() {
        current.push(part);
        if current
            .symlink_metadata()
            .is_ok_and(|m| m.file_type().is_symlink())
        {
            return Err(RegistryError::SymlinkedEntrypoint(
                current.display().to_string(),
            ));
        }
    }
    Ok(())
}
