// SPDX-License-Identifier: MIT OR Apache-2.0
//! `secrets.get`: fetch a secret value under fail-closed key allow-listing.
//!
//! The reply never reveals whether a key exists: denied, missing, and
//! errored lookups all produce the identical `access_denied` response, and
//! the value itself never reaches audit entries or diagnostics.

use crate::builtins::require_str;
use crate::context::HandlerContext;
use crate::executor::DENIED_OR_MISSING;
use crate::secrets::valid_secret_key;
use crate::services::Services;
use rumi_core::{CapError, CapResult, ErrorKind};
use serde_json::{Value, json};

pub(crate) fn execute(ctx: &HandlerContext, services: &Services, args: &Value) -> CapResult {
    let key = require_str(args, "key")?;
    if !valid_secret_key(key) {
        return Err(CapError::validation(
            "Invalid key: must match ^[A-Z0-9_]{1,64}$",
        ));
    }

    // allowed_keys empty or absent → deny everything.
    let allowed = ctx.config_strings("allowed_keys").unwrap_or_default();
    if allowed.is_empty() || !allowed.iter().any(|k| k == key) {
        audit(services, ctx, key, false);
        return Err(denied());
    }

    match services.secrets.read(key) {
        Some(value) => {
            audit(services, ctx, key, true);
            Ok(json!({"value": value}))
        }
        // Missing or unreadable: indistinguishable from denied.
        None => {
            audit(services, ctx, key, false);
            Err(denied())
        }
    }
}

fn denied() -> CapError {
    CapError::new(ErrorKind::AccessDenied, DENIED_OR_MISSING)
}

// Key name only. Never the value.
fn audit(services: &Services, ctx: &HandlerContext, key: &str, success: bool) {
    services.audit.permission_event(
        ctx.principal.as_str(),
        "secrets_get",
        success,
        json!({"key": key}),
    );
}
