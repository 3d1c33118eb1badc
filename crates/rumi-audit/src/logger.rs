// SPDX-License-Identifier: MIT OR Apache-2.0
//! The append-only writer.

use crate::entry::{AuditCategory, AuditEntry, AuditSeverity};
use parking_lot::Mutex;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Append-only audit log handle. Cheap to clone and share.
///
/// Audit writes are fail-open for availability: a write failure is counted
/// and reported to `tracing`, but never propagates into request handling.
#[derive(Clone)]
pub struct AuditLogger {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    state: Mutex<WriterState>,
}

#[derive(Default)]
struct WriterState {
    file: Option<File>,
    dropped: u64,
}

impl AuditLogger {
    /// Create a logger appending to `path`. The file is opened lazily.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                path: path.into(),
                state: Mutex::new(WriterState::default()),
            }),
        }
    }

    /// Path of the log file.
    pub fn path(&self) -> &std::path::Path {
        &self.inner.path
    }

    /// Number of entries dropped due to write failures.
    pub fn dropped(&self) -> u64 {
        self.inner.state.lock().dropped
    }

    /// Append an entry.
    pub fn log(&self, entry: AuditEntry) {
        let line = entry.to_json_line();
        let mut state = self.inner.state.lock();
        if state.file.is_none() {
            match OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.inner.path)
            {
                Ok(f) => state.file = Some(f),
                Err(e) => {
                    state.dropped += 1;
                    warn!(target: "rumi.audit", error = %e, "audit log open failed");
                    return;
                }
            }
        }
        let failed = match state.file.as_mut() {
            Some(f) => writeln!(f, "{line}").is_err(),
            None => true,
        };
        if failed {
            state.dropped += 1;
            state.file = None;
            warn!(target: "rumi.audit", "audit log write failed");
        }
    }

    /// Record a capability authorization / execution outcome.
    pub fn permission_event(
        &self,
        principal: &str,
        action: &str,
        success: bool,
        details: Value,
    ) {
        let severity = if success {
            AuditSeverity::Info
        } else {
            AuditSeverity::Warning
        };
        self.log(
            AuditEntry::new(AuditCategory::Permission, severity, action, success)
                .principal(principal)
                .details(details),
        );
    }

    /// Record a policy-level rejection.
    pub fn security_event(
        &self,
        severity: AuditSeverity,
        action: &str,
        principal: Option<&str>,
        details: Value,
    ) {
        let mut entry =
            AuditEntry::new(AuditCategory::Security, severity, action, false).details(details);
        if let Some(p) = principal {
            entry = entry.principal(p);
        }
        self.log(entry);
    }

    /// Record a signature or fingerprint verification failure.
    pub fn integrity_event(&self, action: &str, principal: Option<&str>, details: Value) {
        let mut entry = AuditEntry::new(
            AuditCategory::Integrity,
            AuditSeverity::Warning,
            action,
            false,
        )
        .details(details);
        if let Some(p) = principal {
            entry = entry.principal(p);
        }
        self.log(entry);
    }
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}
