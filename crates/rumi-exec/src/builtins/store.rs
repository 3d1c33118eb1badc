// SPDX-License-Identifier: MIT OR Apache-2.0
//! `store.*`: key-value operations gated by `allowed_store_ids` and
//! `max_value_bytes` from the effective grant config.

use crate::builtins::{optional_str, require_str};
use crate::context::HandlerContext;
use crate::services::Services;
use rumi_core::{CapError, CapResult, ErrorKind};
use rumi_store::DEFAULT_MAX_VALUE_BYTES;
use serde_json::{Value, json};

pub(crate) fn get(ctx: &HandlerContext, services: &Services, args: &Value) -> CapResult {
    let store_id = authorized_store(ctx, args)?;
    let key = require_str(args, "key")?;
    let value = services.stores.get(store_id, key)?;
    audit(services, ctx, "store_get", store_id, json!({"key": key}));
    Ok(json!({"value": value}))
}

pub(crate) fn set(ctx: &HandlerContext, services: &Services, args: &Value) -> CapResult {
    let store_id = authorized_store(ctx, args)?;
    let key = require_str(args, "key")?;
    let value = args
        .get("value")
        .filter(|v| !v.is_null())
        .ok_or_else(|| CapError::validation("Missing value"))?;

    let max_bytes = ctx
        .config_u64("max_value_bytes")
        .map(|n| n as usize)
        .unwrap_or(DEFAULT_MAX_VALUE_BYTES);
    services.stores.set(store_id, key, value, max_bytes)?;

    let size = serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0);
    audit(
        services,
        ctx,
        "store_set",
        store_id,
        json!({"key": key, "size_bytes": size}),
    );
    Ok(json!({}))
}

pub(crate) fn delete(ctx: &HandlerContext, services: &Services, args: &Value) -> CapResult {
    let store_id = authorized_store(ctx, args)?;
    let key = require_str(args, "key")?;
    services.stores.delete(store_id, key)?;
    audit(services, ctx, "store_delete", store_id, json!({"key": key}));
    Ok(json!({}))
}

pub(crate) fn list(ctx: &HandlerContext, services: &Services, args: &Value) -> CapResult {
    let store_id = authorized_store(ctx, args)?;
    let prefix = optional_str(args, "prefix").filter(|p| !p.is_empty());
    let keys = services.stores.list(store_id, prefix)?;
    Ok(json!({"keys": keys}))
}

pub(crate) fn batch_get(ctx: &HandlerContext, services: &Services, args: &Value) -> CapResult {
    let store_id = authorized_store(ctx, args)?;
    let keys: Vec<String> = match args.get("keys") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| CapError::validation("Invalid key in list"))
            })
            .collect::<Result<_, _>>()?,
        _ => return Err(CapError::validation("Missing or invalid keys")),
    };
    let result = services.stores.batch_get(store_id, &keys)?;
    audit(
        services,
        ctx,
        "store_batch_get",
        store_id,
        json!({
            "requested_keys": keys.len(),
            "found": result.found,
            "not_found": result.not_found,
        }),
    );
    serde_json::to_value(result).map_err(|_| CapError::internal())
}

pub(crate) fn cas(ctx: &HandlerContext, services: &Services, args: &Value) -> CapResult {
    let store_id = authorized_store(ctx, args)?;
    let key = require_str(args, "key")?;
    let expected = args.get("expected_value").cloned().unwrap_or(Value::Null);
    let new = args
        .get("new_value")
        .cloned()
        .ok_or_else(|| CapError::validation("Missing new_value"))?;

    let outcome = services.stores.cas(store_id, key, &expected, &new);
    let success = outcome.is_ok();
    let error_type = outcome
        .as_ref()
        .err()
        .map(|e| e.kind.as_str())
        .unwrap_or("");
    audit(
        services,
        ctx,
        "store_cas",
        store_id,
        json!({"key": key, "success": success, "error_type": error_type}),
    );
    outcome?;
    Ok(json!({}))
}

// `allowed_store_ids` is a restriction only when present and non-empty.
fn authorized_store<'a>(ctx: &HandlerContext, args: &'a Value) -> Result<&'a str, CapError> {
    let store_id = require_str(args, "store_id")?;
    if let Some(allowed) = ctx.config_strings("allowed_store_ids")
        && !allowed.is_empty()
        && !allowed.iter().any(|s| s == store_id)
    {
        return Err(CapError::new(
            ErrorKind::GrantDenied,
            "Store not in allowed_store_ids",
        ));
    }
    Ok(store_id)
}

fn audit(services: &Services, ctx: &HandlerContext, action: &str, store_id: &str, mut details: Value) {
    if let Some(map) = details.as_object_mut() {
        map.insert("store_id".to_string(), json!(store_id));
    }
    services
        .audit
        .permission_event(ctx.principal.as_str(), action, true, details);
}
