// SPDX-License-Identifier: MIT OR Apache-2.0
//! Built-in capability handlers. All run in-process.

mod docker;
mod flow_run;
mod secrets_get;
mod store;

use crate::context::HandlerContext;
use crate::executor::CapabilityExecutor;
use crate::services::Services;
use rumi_core::{CapError, CapResult};
use serde_json::Value;
use std::sync::Arc;

/// Dispatch a built-in handler by its handler id.
pub(crate) async fn dispatch(
    handler_id: &str,
    ctx: &HandlerContext,
    services: &Services,
    executor: &Arc<CapabilityExecutor>,
    args: &Value,
    chain_depth: usize,
) -> CapResult {
    match handler_id {
        "secrets_get" => secrets_get::execute(ctx, services, args),
        "store_get" => store::get(ctx, services, args),
        "store_set" => store::set(ctx, services, args),
        "store_delete" => store::delete(ctx, services, args),
        "store_list" => store::list(ctx, services, args),
        "store_batch_get" => store::batch_get(ctx, services, args),
        "store_cas" => store::cas(ctx, services, args),
        "docker_run" => docker::run(ctx, args).await,
        "docker_list" => docker::list(ctx, args).await,
        "docker_logs" => docker::logs(ctx, args).await,
        "docker_exec" => docker::exec(ctx, args).await,
        "flow_run" => flow_run::execute(ctx, executor, args, chain_depth).await,
        other => Err(CapError::new(
            rumi_core::ErrorKind::NotFound,
            format!("Unknown builtin handler: {other}"),
        )),
    }
}

// Shared argument accessors.

pub(crate) fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, CapError> {
    match args.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        _ => Err(CapError::validation(format!("Missing or invalid {key}"))),
    }
}

pub(crate) fn optional_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}
