// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pack handler dispatch: a language-neutral subprocess contract.
//!
//! The handler's manifest names an executable argv. The broker writes one
//! JSON request to stdin, reads one JSON response from stdout, and enforces
//! a wall-clock deadline: SIGTERM at the deadline, SIGKILL two seconds
//! later.

use crate::context::HandlerContext;
use rumi_core::{CapError, CapResult, ErrorKind};
use rumi_registry::HandlerDef;
use serde_json::{Value, json};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::warn;

/// Grace period between SIGTERM and SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_secs(2);

/// Run a pack handler subprocess and return its structured result.
pub async fn run_pack_handler(
    def: &HandlerDef,
    ctx: &HandlerContext,
    permission_id: &str,
    args: &Value,
    timeout: Duration,
) -> CapResult {
    let (handler_path, handler_dir) = match (&def.handler_path, &def.handler_dir) {
        (Some(path), Some(dir)) => (path, dir),
        _ => {
            return Err(CapError::new(
                ErrorKind::NotFound,
                format!("Handler {} has no entrypoint", def.handler_id),
            ));
        }
    };

    let request = json!({
        "permission_id": permission_id,
        "args": args,
        "context": {
            "principal_id": ctx.principal.as_str(),
            "grant_config": ctx.grant_config,
        },
    });
    let request_bytes =
        serde_json::to_vec(&request).map_err(|_| CapError::internal())?;

    let mut child = Command::new(handler_path)
        .args(def.entrypoint.iter().skip(1))
        .current_dir(handler_dir)
        .env("RUMI_PRINCIPAL", ctx.principal.as_str())
        .env("RUMI_PERMISSION_ID", permission_id)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            CapError::new(
                ErrorKind::InternalError,
                format!("Failed to spawn handler {}: {e}", def.handler_id),
            )
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        // A handler that never reads stdin must not wedge the dispatch.
        let _ = stdin.write_all(&request_bytes).await;
        let _ = stdin.shutdown().await;
    }

    let mut stdout_pipe = child.stdout.take();
    let reader = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            use tokio::io::AsyncReadExt;
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(_status)) => {
            let stdout = reader.await.unwrap_or_default();
            parse_handler_output(&stdout, &def.handler_id)
        }
        Ok(Err(e)) => {
            reader.abort();
            Err(CapError::new(
                ErrorKind::InternalError,
                format!("Handler {} I/O failed: {e}", def.handler_id),
            ))
        }
        Err(_elapsed) => {
            terminate(&mut child).await;
            reader.abort();
            Err(CapError::new(
                ErrorKind::Timeout,
                format!("Handler {} timed out", def.handler_id),
            ))
        }
    }
}

/// Terminate a child: SIGTERM, then SIGKILL after [`KILL_GRACE`].
pub(crate) async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        #[allow(unsafe_code)]
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
        warn!(target: "rumi.exec", pid, "handler ignored SIGTERM, killing");
    }
    let _ = child.kill().await;
}

fn parse_handler_output(stdout: &[u8], handler_id: &str) -> CapResult {
    let reply: Value = serde_json::from_slice(stdout).map_err(|_| {
        CapError::new(
            ErrorKind::InternalError,
            format!("Handler {handler_id} returned invalid JSON"),
        )
    })?;
    if reply.get("success").and_then(Value::as_bool) == Some(true) {
        Ok(reply.get("output").cloned().unwrap_or(Value::Null))
    } else {
        let message = reply
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("Handler failed")
            .to_string();
        let kind = reply
            .get("error_type")
            .and_then(Value::as_str)
            .and_then(parse_kind)
            .unwrap_or(ErrorKind::InternalError);
        Err(CapError::new(kind, message))
    }
}

fn parse_kind(tag: &str) -> Option<ErrorKind> {
    serde_json::from_value(Value::String(tag.to_string())).ok()
}
