// SPDX-License-Identifier: MIT OR Apache-2.0
//! The trust store: signed (principal, handler, fingerprint) bindings.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rumi_audit::AuditLogger;
use rumi_core::Principal;
use rumi_core::fsio::atomic_write;
use rumi_keys::KeyRing;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tracing::debug;

/// One trust binding. The signature covers every other field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustRecord {
    /// Principal the binding applies to.
    pub principal_id: Principal,
    /// Handler the principal may invoke.
    pub handler_id: String,
    /// SHA-256 of the handler executable at grant time.
    pub fingerprint_sha256: String,
    /// When the binding was created.
    pub granted_at: DateTime<Utc>,
    /// HMAC over the canonical record.
    pub signature_hmac: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrustDocument {
    records: Vec<TrustRecord>,
}

/// Errors from trust store mutations.
#[derive(Debug, Error)]
pub enum TrustError {
    /// Underlying filesystem failure.
    #[error("trust document I/O failed: {0}")]
    Io(#[from] io::Error),
    /// The document could not be serialized.
    #[error("trust document serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct FileStamp {
    mtime: Option<SystemTime>,
    len: u64,
}

#[derive(Debug, Default)]
struct State {
    records: Vec<TrustRecord>,
    stamp: Option<FileStamp>,
}

/// Verified, hot-reloading view of the signed trust document.
///
/// Reads re-check the file stamp and reload on change; mutations rewrite the
/// whole document atomically and re-sign every record. Fail-closed: a record
/// whose signature does not verify is treated as absent.
#[derive(Clone)]
pub struct TrustStore {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    keys: Arc<KeyRing>,
    audit: AuditLogger,
    state: Mutex<State>,
}

impl TrustStore {
    /// Open the trust store backed by `path`.
    pub fn open(path: impl Into<PathBuf>, keys: Arc<KeyRing>, audit: AuditLogger) -> Self {
        let store = Self {
            inner: Arc::new(Inner {
                path: path.into(),
                keys,
                audit,
                state: Mutex::new(State::default()),
            }),
        };
        store.reload_if_changed();
        store
    }

    /// Whether a valid binding exists for the exact triple.
    pub fn is_trusted(&self, principal: &Principal, handler_id: &str, fingerprint: &str) -> bool {
        self.reload_if_changed();
        self.inner.state.lock().records.iter().any(|r| {
            r.principal_id == *principal
                && r.handler_id == handler_id
                && r.fingerprint_sha256 == fingerprint
        })
    }

    /// All currently valid records (test and inspection surface).
    pub fn records(&self) -> Vec<TrustRecord> {
        self.reload_if_changed();
        self.inner.state.lock().records.clone()
    }

    /// Create (or refresh) a binding. Operator-authenticated callers only.
    pub fn grant(
        &self,
        principal: &Principal,
        handler_id: &str,
        fingerprint: &str,
    ) -> Result<TrustRecord, TrustError> {
        let mut record = TrustRecord {
            principal_id: principal.clone(),
            handler_id: handler_id.to_string(),
            fingerprint_sha256: fingerprint.to_string(),
            granted_at: Utc::now(),
            signature_hmac: String::new(),
        };
        record.signature_hmac = self.sign(&record)?;

        let mut state = self.inner.state.lock();
        state.records.retain(|r| {
            !(r.principal_id == *principal && r.handler_id == handler_id)
        });
        state.records.push(record.clone());
        self.persist(&mut state)?;
        self.inner.audit.permission_event(
            principal.as_str(),
            "trust_granted",
            true,
            json!({"handler_id": handler_id, "fingerprint_sha256": fingerprint}),
        );
        Ok(record)
    }

    /// Remove a binding, writing a tombstone audit event.
    pub fn revoke(&self, principal: &Principal, handler_id: &str) -> Result<bool, TrustError> {
        self.remove(principal, handler_id, "trust_revoked")
    }

    /// Drop a binding because the handler's fingerprint changed.
    pub fn invalidate(&self, principal: &Principal, handler_id: &str) -> Result<bool, TrustError> {
        self.remove(principal, handler_id, "trust_invalidated")
    }

    fn remove(
        &self,
        principal: &Principal,
        handler_id: &str,
        action: &str,
    ) -> Result<bool, TrustError> {
        let mut state = self.inner.state.lock();
        let before = state.records.len();
        state
            .records
            .retain(|r| !(r.principal_id == *principal && r.handler_id == handler_id));
        let removed = state.records.len() != before;
        if removed {
            self.persist(&mut state)?;
            self.inner.audit.permission_event(
                principal.as_str(),
                action,
                true,
                json!({"handler_id": handler_id}),
            );
        }
        Ok(removed)
    }

    fn sign(&self, record: &TrustRecord) -> Result<String, TrustError> {
        let value = serde_json::to_value(record)?;
        Ok(self.inner.keys.sign_record(&value))
    }

    fn persist(&self, state: &mut State) -> Result<(), TrustError> {
        // Re-sign every record so a rotated key covers the whole document.
        for record in &mut state.records {
            let value = serde_json::to_value(&*record)?;
            record.signature_hmac = self.inner.keys.sign_record(&value);
        }
        let doc = TrustDocument {
            records: state.records.clone(),
        };
        atomic_write(&self.inner.path, &serde_json::to_vec_pretty(&doc)?)?;
        state.stamp = stamp_of(&self.inner.path);
        Ok(())
    }

    fn reload_if_changed(&self) {
        let current = stamp_of(&self.inner.path);
        let mut state = self.inner.state.lock();
        if state.stamp == current && state.stamp.is_some() {
            return;
        }
        let mut records = Vec::new();
        if let Ok(raw) = std::fs::read(&self.inner.path)
            && let Ok(doc) = serde_json::from_slice::<TrustDocument>(&raw)
        {
            for record in doc.records {
                if self.verify(&record) {
                    records.push(record);
                } else {
                    self.inner.audit.integrity_event(
                        "trust_record_dropped",
                        Some(record.principal_id.as_str()),
                        json!({
                            "reason": "signature_invalid",
                            "handler_id": record.handler_id,
                        }),
                    );
                }
            }
        }
        debug!(target: "rumi.trust", count = records.len(), "trust document loaded");
        state.records = records;
        state.stamp = current;
    }

    fn verify(&self, record: &TrustRecord) -> bool {
        match serde_json::to_value(record) {
            Ok(value) => self
                .inner
                .keys
                .verify_record(&value, &record.signature_hmac),
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for TrustStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustStore")
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}

fn stamp_of(path: &std::path::Path) -> Option<FileStamp> {
    let meta = std::fs::metadata(path).ok()?;
    Some(FileStamp {
        mtime: meta.modified().ok(),
        len: meta.len(),
    })
}
