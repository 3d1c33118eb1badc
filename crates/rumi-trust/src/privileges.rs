// SPDX-License-Identifier: MIT OR Apache-2.0
//! Host privilege allow-list: packs permitted to run outside containment.

use crate::store::TrustError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rumi_audit::AuditLogger;
use rumi_core::fsio::atomic_write;
use rumi_keys::KeyRing;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// One signed privilege entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostPrivilegeRecord {
    /// Pack the entry applies to.
    pub pack_id: String,
    /// Whether the pack may run outside the container sandbox.
    pub host_execution: bool,
    /// When the entry was created.
    pub granted_at: DateTime<Utc>,
    /// Operator identity that approved the entry.
    pub granted_by: String,
    /// HMAC over the canonical record.
    pub signature_hmac: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PrivilegeDocument {
    entries: BTreeMap<String, HostPrivilegeRecord>,
}

/// Persistent allow-list of host-execution privileges.
///
/// An entry whose HMAC fails verification is refused at load time and the
/// refusal is audited; the pack then has no host privileges until an
/// operator re-grants them.
#[derive(Clone)]
pub struct HostPrivilegeManager {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    keys: Arc<KeyRing>,
    audit: AuditLogger,
    entries: Mutex<BTreeMap<String, HostPrivilegeRecord>>,
}

impl HostPrivilegeManager {
    /// Open the allow-list backed by `path`, verifying every entry.
    pub fn open(path: impl Into<PathBuf>, keys: Arc<KeyRing>, audit: AuditLogger) -> Self {
        let path = path.into();
        let mut entries = BTreeMap::new();
        if let Ok(raw) = std::fs::read(&path)
            && let Ok(doc) = serde_json::from_slice::<PrivilegeDocument>(&raw)
        {
            for (pack_id, record) in doc.entries {
                let valid = serde_json::to_value(&record)
                    .map(|v| keys.verify_record(&v, &record.signature_hmac))
                    .unwrap_or(false);
                if valid {
                    entries.insert(pack_id, record);
                } else {
                    audit.integrity_event(
                        "host_privilege_refused",
                        Some(&pack_id),
                        json!({"reason": "signature_invalid"}),
                    );
                }
            }
        }
        Self {
            inner: Arc::new(Inner {
                path,
                keys,
                audit,
                entries: Mutex::new(entries),
            }),
        }
    }

    /// Whether the pack holds a verified `host_execution = true` entry.
    pub fn allows_host_execution(&self, pack_id: &str) -> bool {
        self.inner
            .entries
            .lock()
            .get(pack_id)
            .is_some_and(|r| r.host_execution)
    }

    /// Grant or update a pack's host execution privilege.
    pub fn grant(
        &self,
        pack_id: &str,
        host_execution: bool,
        granted_by: &str,
    ) -> Result<HostPrivilegeRecord, TrustError> {
        let mut record = HostPrivilegeRecord {
            pack_id: pack_id.to_string(),
            host_execution,
            granted_at: Utc::now(),
            granted_by: granted_by.to_string(),
            signature_hmac: String::new(),
        };
        record.signature_hmac = self.inner.keys.sign_record(&serde_json::to_value(&record)?);

        let mut entries = self.inner.entries.lock();
        entries.insert(pack_id.to_string(), record.clone());
        self.persist(&entries)?;
        self.inner.audit.permission_event(
            pack_id,
            "host_privilege_granted",
            true,
            json!({"host_execution": host_execution, "granted_by": granted_by}),
        );
        Ok(record)
    }

    /// Remove a pack's entry entirely.
    pub fn revoke(&self, pack_id: &str) -> Result<bool, TrustError> {
        let mut entries = self.inner.entries.lock();
        let removed = entries.remove(pack_id).is_some();
        if removed {
            self.persist(&entries)?;
            self.inner.audit.permission_event(
                pack_id,
                "host_privilege_revoked",
                true,
                serde_json::Value::Null,
            );
        }
        Ok(removed)
    }

    fn persist(
        &self,
        entries: &BTreeMap<String, HostPrivilegeRecord>,
    ) -> Result<(), TrustError> {
        let doc = PrivilegeDocument {
            entries: entries.clone(),
        };
        atomic_write(&self.inner.path, &serde_json::to_vec_pretty(&doc)?)?;
        Ok(())
    }
}

impl std::fmt::Debug for HostPrivilegeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostPrivilegeManager")
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}
