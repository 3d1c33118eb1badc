// SPDX-License-Identifier: MIT OR Apache-2.0
//! Request/response DTOs for both socket protocols.

use rumi_core::{CapError, ErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT_SECS: f64 = 30.0;

/// Hard ceiling on a caller-supplied timeout.
pub const MAX_TIMEOUT_SECS: f64 = 120.0;

/// Clamp a caller-supplied timeout into `(0, MAX_TIMEOUT_SECS]`.
pub fn clamp_timeout(requested: Option<f64>) -> f64 {
    let t = requested.unwrap_or(DEFAULT_TIMEOUT_SECS);
    if !t.is_finite() || t <= 0.0 {
        DEFAULT_TIMEOUT_SECS
    } else {
        t.min(MAX_TIMEOUT_SECS)
    }
}

/// A capability call as framed by a pack.
///
/// The principal is **not** part of the payload; it is derived from the
/// socket the request arrived on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRequest {
    /// Permission to exercise (`store.get`, `secrets.get`, …).
    pub permission_id: String,
    /// Handler arguments.
    #[serde(default)]
    pub args: Value,
    /// Requested timeout; clamped to [`MAX_TIMEOUT_SECS`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,
    /// Caller-supplied correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Reply to a [`CapabilityRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityResponse {
    /// Whether the call succeeded.
    pub success: bool,
    /// Handler output on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stable error tag on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    /// Wall-clock latency observed by the proxy.
    pub latency_ms: f64,
}

impl CapabilityResponse {
    /// Successful reply.
    pub fn ok(output: Value, latency_ms: f64) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            error_type: None,
            latency_ms,
        }
    }

    /// Failed reply from a structured error.
    pub fn err(error: &CapError, latency_ms: f64) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.message.clone()),
            error_type: Some(error.kind.as_str().to_string()),
            latency_ms,
        }
    }

    /// Failed reply with an explicit kind and message.
    pub fn err_with(kind: ErrorKind, message: impl Into<String>, latency_ms: f64) -> Self {
        Self::err(&CapError::new(kind, message), latency_ms)
    }
}

/// An outbound HTTP request as framed by a pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressRequest {
    /// HTTP method.
    pub method: String,
    /// Absolute URL.
    pub url: String,
    /// Request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Request body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Requested timeout; clamped to [`MAX_TIMEOUT_SECS`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,
}

/// Reply to an [`EgressRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressResponse {
    /// Whether the request was issued and a response returned.
    pub success: bool,
    /// Upstream status code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Upstream response headers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    /// Upstream response body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Error message when the request failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Validation rejection tag (`internal_ip`, `domain_not_allowed`, …).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

impl EgressResponse {
    /// Successful upstream response.
    pub fn ok(status_code: u16, headers: BTreeMap<String, String>, body: String) -> Self {
        Self {
            success: true,
            status_code: Some(status_code),
            headers: Some(headers),
            body: Some(body),
            error: None,
            rejection_reason: None,
        }
    }

    /// Validation rejection before any socket was opened.
    pub fn rejected(reason: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            status_code: None,
            headers: None,
            body: None,
            error: Some(error.into()),
            rejection_reason: Some(reason.to_string()),
        }
    }

    /// Transport-level failure after validation.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            status_code: None,
            headers: None,
            body: None,
            error: Some(error.into()),
            rejection_reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn timeout_clamping() {
        assert_eq!(clamp_timeout(None), DEFAULT_TIMEOUT_SECS);
        assert_eq!(clamp_timeout(Some(10.0)), 10.0);
        assert_eq!(clamp_timeout(Some(500.0)), MAX_TIMEOUT_SECS);
        assert_eq!(clamp_timeout(Some(0.0)), DEFAULT_TIMEOUT_SECS);
        assert_eq!(clamp_timeout(Some(-1.0)), DEFAULT_TIMEOUT_SECS);
        assert_eq!(clamp_timeout(Some(f64::NAN)), DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn request_defaults() {
        let req: CapabilityRequest =
            serde_json::from_value(json!({"permission_id": "store.get"})).unwrap();
        assert_eq!(req.args, Value::Null);
        assert!(req.timeout_seconds.is_none());
        assert!(req.request_id.is_none());
    }

    #[test]
    fn response_err_carries_error_type() {
        let resp = CapabilityResponse::err_with(ErrorKind::TrustDenied, "nope", 1.5);
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["success"], json!(false));
        assert_eq!(v["error_type"], json!("trust_denied"));
        assert_eq!(v["error"], json!("nope"));
        assert!(v.get("output").is_none());
    }

    #[test]
    fn response_ok_omits_error_fields() {
        let resp = CapabilityResponse::ok(json!({"value": 1}), 2.0);
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["success"], json!(true));
        assert!(v.get("error").is_none());
        assert!(v.get("error_type").is_none());
    }

    #[test]
    fn egress_rejection_shape() {
        let resp = EgressResponse::rejected("internal_ip", "resolves to a private address");
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["success"], json!(false));
        assert_eq!(v["rejection_reason"], json!("internal_ip"));
        assert!(v.get("status_code").is_none());
    }

    #[test]
    fn egress_request_parses_minimal() {
        let req: EgressRequest = serde_json::from_value(json!({
            "method": "GET",
            "url": "https://api.example.com/v1",
        }))
        .unwrap();
        assert!(req.headers.is_empty());
        assert!(req.body.is_none());
    }
}
