// SPDX-License-Identifier: MIT OR Apache-2.0
//! `docker.*`: thin wrappers over the external `docker` binary.
//!
//! The broker is not a container runtime; these handlers validate
//! arguments against the grant config and shell out.

use crate::builtins::require_str;
use crate::context::HandlerContext;
use rumi_core::{CapError, CapResult, ErrorKind};
use serde_json::{Value, json};
use tokio::process::Command;

pub(crate) async fn run(ctx: &HandlerContext, args: &Value) -> CapResult {
    let image = require_str(args, "image")?;
    validate_ref(image, "image")?;
    if let Some(allowed) = ctx.config_strings("allowed_images")
        && !allowed.is_empty()
        && !allowed.iter().any(|i| i == image)
    {
        return Err(CapError::new(
            ErrorKind::GrantDenied,
            "Image not in allowed_images",
        ));
    }

    let mut argv: Vec<String> = vec!["run".into(), "--rm".into()];
    if let Some(Value::Object(env)) = args.get("env") {
        for (k, v) in env {
            let value = v.as_str().unwrap_or_default();
            validate_env_name(k)?;
            argv.push("--env".into());
            argv.push(format!("{k}={value}"));
        }
    }
    argv.push(image.to_string());
    argv.extend(command_args(args)?);
    invoke(&argv).await
}

pub(crate) async fn list(_ctx: &HandlerContext, _args: &Value) -> CapResult {
    invoke(&[
        "ps".into(),
        "--all".into(),
        "--format".into(),
        "{{json .}}".into(),
    ])
    .await
}

pub(crate) async fn logs(_ctx: &HandlerContext, args: &Value) -> CapResult {
    let container = require_str(args, "container")?;
    validate_ref(container, "container")?;
    let mut argv: Vec<String> = vec!["logs".into()];
    if let Some(tail) = args.get("tail").and_then(Value::as_u64) {
        argv.push("--tail".into());
        argv.push(tail.to_string());
    }
    argv.push(container.to_string());
    invoke(&argv).await
}

pub(crate) async fn exec(_ctx: &HandlerContext, args: &Value) -> CapResult {
    let container = require_str(args, "container")?;
    validate_ref(container, "container")?;
    let command = command_args(args)?;
    if command.is_empty() {
        return Err(CapError::validation("Missing command"));
    }
    let mut argv: Vec<String> = vec!["exec".into(), container.to_string()];
    argv.extend(command);
    invoke(&argv).await
}

async fn invoke(argv: &[String]) -> CapResult {
    let output = Command::new("docker")
        .args(argv)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CapError::new(ErrorKind::NotSupported, "docker binary not found")
            } else {
                CapError::new(ErrorKind::InternalError, format!("docker invocation failed: {e}"))
            }
        })?;
    Ok(json!({
        "exit_code": output.status.code(),
        "stdout": String::from_utf8_lossy(&output.stdout),
        "stderr": String::from_utf8_lossy(&output.stderr),
    }))
}

fn command_args(args: &Value) -> Result<Vec<String>, CapError> {
    match args.get("command") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| CapError::validation("Invalid command element"))
            })
            .collect(),
        Some(_) => Err(CapError::validation("Invalid command")),
    }
}

fn validate_ref(value: &str, what: &str) -> Result<(), CapError> {
    let ok = value.len() <= 256
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '/' | '-' | '@'));
    if ok {
        Ok(())
    } else {
        Err(CapError::validation(format!("Invalid {what} reference")))
    }
}

fn validate_env_name(name: &str) -> Result<(), CapError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(CapError::validation("Invalid env variable name"))
    }
}
