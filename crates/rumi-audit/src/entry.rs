// SPDX-License-Identifier: MIT OR Apache-2.0
//! Audit entry shape.

use crate::ascii::ascii_json_line;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    /// Capability authorization and execution outcomes.
    Permission,
    /// Policy-level rejections (traversal, SSRF, socket hardening).
    Security,
    /// Signature / fingerprint verification failures.
    Integrity,
    /// Installer candidate transitions.
    Installer,
}

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    /// Routine outcome.
    Info,
    /// Suspicious but handled.
    Warning,
    /// Requires operator attention.
    Critical,
}

/// One security event. Serialized as a single ASCII-escaped JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// RFC 3339 timestamp.
    pub ts: String,
    /// Event family.
    pub category: AuditCategory,
    /// Severity.
    pub severity: AuditSeverity,
    /// Short machine-friendly action name (`store_set`, `trust_revoked`, …).
    pub action: String,
    /// Principal the event applies to, when there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
    /// Whether the audited operation succeeded.
    pub success: bool,
    /// Structured context. Never carries secret values or request bodies.
    #[serde(skip_serializing_if = "Value::is_null", default)]
    pub details: Value,
    /// Error summary for failed operations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEntry {
    /// Create an entry timestamped now.
    pub fn new(
        category: AuditCategory,
        severity: AuditSeverity,
        action: impl Into<String>,
        success: bool,
    ) -> Self {
        Self {
            ts: now_rfc3339(),
            category,
            severity,
            action: action.into(),
            principal: None,
            success,
            details: Value::Null,
            error: None,
        }
    }

    /// Attach the principal.
    pub fn principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// Attach structured details.
    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Attach an error summary.
    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Render as one ASCII-only JSON line (no trailing newline).
    pub fn to_json_line(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or_else(|_| Value::Null);
        ascii_json_line(&value)
    }
}

fn now_rfc3339() -> String {
    let now: DateTime<Utc> = Utc::now();
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
}
