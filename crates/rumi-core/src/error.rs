// SPDX-License-Identifier: MIT OR Apache-2.0
//! Stable error taxonomy shared by every broker component.
//!
//! Each outward-facing failure carries an [`ErrorKind`], a machine-readable
//! snake_case tag that is stable across releases and appears verbatim as the
//! `error_type` field of wire responses and audit entries.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorKind`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed input; recoverable by the caller.
    Validation,
    /// Policy-level rejection (path traversal and friends); also audited.
    Security,
    /// Trust or grant denial.
    Authorization,
    /// Expected negative outcomes (missing keys, CAS races).
    Expected,
    /// Socket / subprocess transport failures.
    Transport,
    /// Signature or fingerprint verification failures; fatal for the record.
    Integrity,
    /// Unexpected internal errors with sanitized messages.
    Internal,
}

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Machine-readable error tag.
///
/// Serialises to the exact `error_type` strings of the wire protocol
/// (`"validation_error"`, `"grant_denied"`, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input: bad key pattern, wrong type, oversized field.
    ValidationError,
    /// Path traversal or a similar policy-level rejection.
    SecurityError,
    /// No trust record covers the (principal, handler, fingerprint) triple.
    TrustDenied,
    /// The grant check denied the permission or an argument.
    GrantDenied,
    /// Uniform denial for secret access (never reveals key existence).
    AccessDenied,
    /// Generic missing resource (handler, flow, …).
    NotFound,
    /// Store key does not exist.
    KeyNotFound,
    /// Store id is not declared.
    StoreNotFound,
    /// Compare-and-swap lost the race.
    CasConflict,
    /// Serialized value exceeds the configured byte cap.
    PayloadTooLarge,
    /// Candidate is blocked; only `unblock` can revive it.
    Blocked,
    /// Wall-clock deadline expired.
    Timeout,
    /// Peer refused the connection.
    ConnectionRefused,
    /// The proxy socket file does not exist.
    SocketNotFound,
    /// The OS denied access to the socket or file.
    PermissionDenied,
    /// Handler file no longer hashes to its recorded fingerprint.
    FingerprintChanged,
    /// A persisted record failed HMAC verification.
    SignatureInvalid,
    /// Filesystem write failed.
    WriteError,
    /// Filesystem delete failed.
    DeleteError,
    /// Operation is not supported on this platform or build.
    NotSupported,
    /// Unexpected exception; message sanitized, never carries secrets.
    InternalError,
}

impl ErrorKind {
    /// Returns the broad [`ErrorCategory`] this kind belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ValidationError | Self::PayloadTooLarge => ErrorCategory::Validation,

            Self::SecurityError => ErrorCategory::Security,

            Self::TrustDenied | Self::GrantDenied | Self::AccessDenied => {
                ErrorCategory::Authorization
            }

            Self::NotFound
            | Self::KeyNotFound
            | Self::StoreNotFound
            | Self::CasConflict
            | Self::Blocked => ErrorCategory::Expected,

            Self::Timeout
            | Self::ConnectionRefused
            | Self::SocketNotFound
            | Self::PermissionDenied => ErrorCategory::Transport,

            Self::FingerprintChanged | Self::SignatureInvalid => ErrorCategory::Integrity,

            Self::WriteError | Self::DeleteError | Self::NotSupported | Self::InternalError => {
                ErrorCategory::Internal
            }
        }
    }

    /// Stable `&'static str` representation (the wire `error_type` value).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::SecurityError => "security_error",
            Self::TrustDenied => "trust_denied",
            Self::GrantDenied => "grant_denied",
            Self::AccessDenied => "access_denied",
            Self::NotFound => "not_found",
            Self::KeyNotFound => "key_not_found",
            Self::StoreNotFound => "store_not_found",
            Self::CasConflict => "cas_conflict",
            Self::PayloadTooLarge => "payload_too_large",
            Self::Blocked => "blocked",
            Self::Timeout => "timeout",
            Self::ConnectionRefused => "connection_refused",
            Self::SocketNotFound => "socket_not_found",
            Self::PermissionDenied => "permission_denied",
            Self::FingerprintChanged => "fingerprint_changed",
            Self::SignatureInvalid => "signature_invalid",
            Self::WriteError => "write_error",
            Self::DeleteError => "delete_error",
            Self::NotSupported => "not_supported",
            Self::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CapError
// ---------------------------------------------------------------------------

/// Structured failure returned by handlers and the authorization pipeline.
///
/// Handlers never raise across process boundaries; they return a `CapError`
/// which the proxy frames as `{success:false, error, error_type}`.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("[{kind}] {message}")]
pub struct CapError {
    /// Stable machine-readable tag.
    pub kind: ErrorKind,
    /// Human-readable description. Sanitized: never carries secret values.
    pub message: String,
}

impl CapError {
    /// Create a new error with the given kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a `validation_error`.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }

    /// Shorthand for a `security_error`.
    pub fn security(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SecurityError, message)
    }

    /// Shorthand for an `internal_error` with a generic message.
    ///
    /// The original error is intentionally not echoed to the caller.
    pub fn internal() -> Self {
        Self::new(ErrorKind::InternalError, "Internal error")
    }
}

/// Result alias for handler execution: a JSON payload or a tagged error.
pub type CapResult = Result<serde_json::Value, CapError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
