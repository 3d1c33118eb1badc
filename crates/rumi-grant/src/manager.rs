// SPDX-License-Identifier: MIT OR Apache-2.0
//! The grant manager: signed document plus chain-walking checks.

use crate::intersect::intersect_configs;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rumi_audit::AuditLogger;
use rumi_core::fsio::atomic_write;
use rumi_core::{PermissionId, Principal};
use rumi_keys::KeyRing;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// One signed grant. The signature covers every other field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantRecord {
    /// Principal the grant applies to.
    pub principal_id: Principal,
    /// Permission being granted.
    pub permission_id: PermissionId,
    /// Capability-specific configuration (`allowed_store_ids`,
    /// `allowed_keys`, `allowed_domains`, …).
    pub config: Map<String, Value>,
    /// When the grant was created.
    pub granted_at: DateTime<Utc>,
    /// Operator identity that approved the grant.
    pub granted_by: String,
    /// HMAC over the canonical record.
    pub signature_hmac: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GrantDocument {
    records: Vec<GrantRecord>,
}

/// Errors from grant mutations.
#[derive(Debug, Error)]
pub enum GrantError {
    /// Underlying filesystem failure.
    #[error("grant document I/O failed: {0}")]
    Io(#[from] io::Error),
    /// The document could not be serialized.
    #[error("grant document serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Outcome of a grant check.
#[derive(Debug, Clone, PartialEq)]
pub struct GrantDecision {
    /// Whether any ancestor grant covers the permission.
    pub allowed: bool,
    /// Effective config after chain intersection (empty when denied).
    pub config: Map<String, Value>,
    /// Denial reason (`no_grant`).
    pub reason: Option<String>,
}

impl GrantDecision {
    fn deny(reason: &str) -> Self {
        Self {
            allowed: false,
            config: Map::new(),
            reason: Some(reason.to_string()),
        }
    }
}

/// Verified view of the signed grant document.
#[derive(Clone)]
pub struct GrantManager {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    keys: Arc<KeyRing>,
    audit: AuditLogger,
    records: Mutex<Vec<GrantRecord>>,
}

impl GrantManager {
    /// Open the grant manager backed by `path`, verifying every record.
    pub fn open(path: impl Into<PathBuf>, keys: Arc<KeyRing>, audit: AuditLogger) -> Self {
        let path = path.into();
        let mut records = Vec::new();
        if let Ok(raw) = std::fs::read(&path)
            && let Ok(doc) = serde_json::from_slice::<GrantDocument>(&raw)
        {
            for record in doc.records {
                let valid = serde_json::to_value(&record)
                    .map(|v| keys.verify_record(&v, &record.signature_hmac))
                    .unwrap_or(false);
                if valid {
                    records.push(record);
                } else {
                    audit.integrity_event(
                        "grant_record_dropped",
                        Some(record.principal_id.as_str()),
                        json!({
                            "reason": "signature_invalid",
                            "permission_id": record.permission_id.as_str(),
                        }),
                    );
                }
            }
        }
        debug!(target: "rumi.grant", count = records.len(), "grant document loaded");
        Self {
            inner: Arc::new(Inner {
                path,
                keys,
                audit,
                records: Mutex::new(records),
            }),
        }
    }

    /// Create or replace a grant. Operator-authenticated callers only.
    pub fn grant(
        &self,
        principal: &Principal,
        permission: &PermissionId,
        config: Map<String, Value>,
        granted_by: &str,
    ) -> Result<GrantRecord, GrantError> {
        let mut record = GrantRecord {
            principal_id: principal.clone(),
            permission_id: permission.clone(),
            config,
            granted_at: Utc::now(),
            granted_by: granted_by.to_string(),
            signature_hmac: String::new(),
        };
        record.signature_hmac = self.inner.keys.sign_record(&serde_json::to_value(&record)?);

        let mut records = self.inner.records.lock();
        records.retain(|r| {
            !(r.principal_id == *principal && r.permission_id == *permission)
        });
        records.push(record.clone());
        self.persist(&records)?;
        self.inner.audit.permission_event(
            principal.as_str(),
            "grant_created",
            true,
            json!({"permission_id": permission.as_str(), "granted_by": granted_by}),
        );
        Ok(record)
    }

    /// Remove a grant, writing a tombstone audit event.
    pub fn revoke(
        &self,
        principal: &Principal,
        permission: &PermissionId,
    ) -> Result<bool, GrantError> {
        let mut records = self.inner.records.lock();
        let before = records.len();
        records.retain(|r| {
            !(r.principal_id == *principal && r.permission_id == *permission)
        });
        let removed = records.len() != before;
        if removed {
            self.persist(&records)?;
            self.inner.audit.permission_event(
                principal.as_str(),
                "grant_revoked",
                true,
                json!({"permission_id": permission.as_str()}),
            );
        }
        Ok(removed)
    }

    /// Walk the principal chain and fold ancestor configs into an effective
    /// config. Ancestors without a grant for this permission are skipped; if
    /// none has one, the decision is `no_grant`.
    pub fn check(&self, principal: &Principal, permission: &PermissionId) -> GrantDecision {
        let records = self.inner.records.lock();
        let mut effective: Option<Map<String, Value>> = None;
        for ancestor in principal.chain() {
            let grant = records
                .iter()
                .find(|r| r.principal_id == ancestor && r.permission_id == *permission);
            if let Some(grant) = grant {
                effective = Some(match effective {
                    None => grant.config.clone(),
                    Some(parent_config) => intersect_configs(&parent_config, &grant.config),
                });
            }
        }
        match effective {
            Some(config) => GrantDecision {
                allowed: true,
                config,
                reason: None,
            },
            None => GrantDecision::deny("no_grant"),
        }
    }

    /// All currently valid records (test and inspection surface).
    pub fn records(&self) -> Vec<GrantRecord> {
        self.inner.records.lock().clone()
    }

    fn persist(&self, records: &[GrantRecord]) -> Result<(), GrantError> {
        let doc = GrantDocument {
            records: records.to_vec(),
        };
        atomic_write(&self.inner.path, &serde_json::to_vec_pretty(&doc)?)?;
        Ok(())
    }
}

impl std::fmt::Debug for GrantManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrantManager")
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}
