// SPDX-License-Identifier: MIT OR Apache-2.0
//! The authorization pipeline: resolve → fingerprint → trust → grant →
//! dispatch → audit.

use crate::builtins;
use crate::context::HandlerContext;
use crate::services::Services;
use crate::subprocess::run_pack_handler;
use rumi_core::{CapError, CapResult, ErrorKind, PermissionId, Principal};
use rumi_protocol::{CapabilityRequest, CapabilityResponse, clamp_timeout};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// The uniform denial string for `secrets.get`: denied, missing, and
/// revoked are indistinguishable to the caller.
pub const DENIED_OR_MISSING: &str = "Access denied or secret not found";

/// Built-ins that skip the trust check even in secure permission mode.
/// Everything with an on-disk entrypoint still requires trust.
pub const TRUST_BYPASS_BUILTINS: &[&str] = &[
    "store.get",
    "store.set",
    "store.delete",
    "store.list",
    "store.batch_get",
    "store.cas",
    "secrets.get",
    "flow.run",
];

/// Executes capability requests against the wired [`Services`].
pub struct CapabilityExecutor {
    services: Services,
}

impl CapabilityExecutor {
    /// Wrap the service context.
    pub fn new(services: Services) -> Arc<Self> {
        Arc::new(Self { services })
    }

    /// The underlying services (operator and test surface).
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Run one request end to end, producing the wire response.
    ///
    /// The request's timeout is clamped, enforced here, and the outcome is
    /// audited with its duration. Unexpected failures surface as a generic
    /// `internal_error`.
    pub async fn execute(
        self: &Arc<Self>,
        principal: &Principal,
        request: &CapabilityRequest,
    ) -> CapabilityResponse {
        let started = Instant::now();
        let timeout = Duration::from_secs_f64(clamp_timeout(request.timeout_seconds));

        let result = match tokio::time::timeout(
            timeout,
            self.execute_inner(principal, &request.permission_id, &request.args, 0),
        )
        .await
        {
            Ok(result) => result,
            Err(_elapsed) => Err(CapError::new(
                ErrorKind::Timeout,
                format!("Request timed out after {}s", timeout.as_secs_f64()),
            )),
        };

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.audit_call(principal, &request.permission_id, &result, latency_ms);
        match result {
            Ok(output) => CapabilityResponse::ok(output, latency_ms),
            Err(e) => CapabilityResponse::err(&e, latency_ms),
        }
    }

    /// The pipeline proper. Also the entry point for flow steps, which
    /// re-authorize under the calling principal with `chain_depth` tracking
    /// nested `flow.run`s.
    pub async fn execute_inner(
        self: &Arc<Self>,
        principal: &Principal,
        permission_str: &str,
        args: &Value,
        chain_depth: usize,
    ) -> CapResult {
        let result = self
            .authorize_and_dispatch(principal, permission_str, args, chain_depth)
            .await;
        normalize_secret_denials(permission_str, result)
    }

    async fn authorize_and_dispatch(
        self: &Arc<Self>,
        principal: &Principal,
        permission_str: &str,
        args: &Value,
        chain_depth: usize,
    ) -> CapResult {
        let permission = PermissionId::parse(permission_str)
            .map_err(|e| CapError::validation(format!("Invalid permission_id: {e}")))?;

        // 1. Handler resolution.
        let def = self.services.registry.resolve(&permission).ok_or_else(|| {
            CapError::new(
                ErrorKind::NotFound,
                format!("No handler for permission {permission}"),
            )
        })?;

        // 2. Fingerprint re-verification (pack handlers).
        if !def.is_builtin {
            let registry = self.services.registry.clone();
            let def_for_check = def.clone();
            let matches = tokio::task::spawn_blocking(move || {
                registry.fingerprint_matches(&def_for_check)
            })
            .await
            .unwrap_or(false);
            if !matches {
                warn!(
                    target: "rumi.exec",
                    handler = %def.handler_id,
                    "handler fingerprint changed, invalidating trust"
                );
                let _ = self.services.trust.invalidate(principal, &def.handler_id);
                self.services.audit.integrity_event(
                    "fingerprint_changed",
                    Some(principal.as_str()),
                    json!({"handler_id": def.handler_id, "permission_id": permission.as_str()}),
                );
                return Err(CapError::new(
                    ErrorKind::FingerprintChanged,
                    format!("Handler {} fingerprint changed", def.handler_id),
                ));
            }
        }

        // 3. Trust check. Built-ins on the bypass list (or all built-ins in
        // permissive permission mode) skip it; pack handlers never do.
        let bypass = def.is_builtin
            && (TRUST_BYPASS_BUILTINS.contains(&permission.as_str())
                || self.services.config.builtin_trust_bypass());
        if !bypass
            && !self
                .services
                .trust
                .is_trusted(principal, &def.handler_id, &def.fingerprint_sha256)
        {
            return Err(CapError::new(
                ErrorKind::TrustDenied,
                format!("Handler {} is not trusted for this principal", def.handler_id),
            ));
        }

        // 4. Grant check with chain intersection.
        let decision = self.services.grants.check(principal, &permission);
        if !decision.allowed {
            return Err(CapError::new(
                ErrorKind::GrantDenied,
                format!(
                    "No grant for {permission} ({})",
                    decision.reason.as_deref().unwrap_or("no_grant")
                ),
            ));
        }
        let ctx = HandlerContext {
            principal: principal.clone(),
            grant_config: decision.config,
        };

        debug!(
            target: "rumi.exec",
            principal = %principal,
            permission = %permission,
            handler = %def.handler_id,
            builtin = def.is_builtin,
            "dispatching"
        );

        // 5. Dispatch. `flow.run` is always intercepted in-process.
        if permission.as_str() == "flow.run" {
            return builtins::dispatch("flow_run", &ctx, &self.services, self, args, chain_depth)
                .await;
        }
        if def.is_builtin {
            return builtins::dispatch(
                &def.handler_id,
                &ctx,
                &self.services,
                self,
                args,
                chain_depth,
            )
            .await;
        }

        // Pack handler: host execution is gated by the privilege list in
        // strict security mode.
        if self.services.config.security_mode == rumi_config::SecurityMode::Strict {
            let root = principal
                .chain()
                .into_iter()
                .next()
                .unwrap_or_else(|| principal.clone());
            if !self.services.privileges.allows_host_execution(root.as_str()) {
                self.services.audit.security_event(
                    rumi_audit::AuditSeverity::Warning,
                    "host_execution_denied",
                    Some(principal.as_str()),
                    json!({"handler_id": def.handler_id}),
                );
                return Err(CapError::new(
                    ErrorKind::PermissionDenied,
                    "Host execution not permitted for this pack",
                ));
            }
        }
        run_pack_handler(
            &def,
            &ctx,
            permission.as_str(),
            args,
            Duration::from_secs_f64(clamp_timeout(None)),
        )
        .await
    }

    // One audit entry per call. Result kind and duration, never the args
    // or any output.
    fn audit_call(
        &self,
        principal: &Principal,
        permission_str: &str,
        result: &CapResult,
        latency_ms: f64,
    ) {
        let mut details = json!({
            "permission_id": permission_str,
            "duration_ms": latency_ms,
        });
        if let Err(e) = result
            && let Some(map) = details.as_object_mut()
        {
            map.insert("error_type".to_string(), json!(e.kind.as_str()));
        }
        self.services.audit.permission_event(
            principal.as_str(),
            "capability_call",
            result.is_ok(),
            details,
        );
    }
}

impl std::fmt::Debug for CapabilityExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityExecutor").finish_non_exhaustive()
    }
}

// For `secrets.get`, every authorization or lookup failure collapses into
// the uniform denial so key existence cannot be probed.
fn normalize_secret_denials(permission_str: &str, result: CapResult) -> CapResult {
    if permission_str != "secrets.get" {
        return result;
    }
    match result {
        Err(e)
            if matches!(
                e.kind,
                ErrorKind::TrustDenied
                    | ErrorKind::GrantDenied
                    | ErrorKind::AccessDenied
                    | ErrorKind::NotFound
                    | ErrorKind::KeyNotFound
            ) =>
        {
            Err(CapError::new(ErrorKind::AccessDenied, DENIED_OR_MISSING))
        }
        other => other,
    }
}
