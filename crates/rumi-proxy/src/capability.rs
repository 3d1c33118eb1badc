// SPDX-License-Identifier: MIT OR Apache-2.0
//! The per-principal capability socket server.

use crate::socket::UdsSocketManager;
use rumi_core::{ErrorKind, Principal};
use rumi_exec::CapabilityExecutor;
use rumi_protocol::{
    CapabilityRequest, CapabilityResponse, FrameError, MAX_FRAME_BYTES, clamp_timeout,
    read_frame, write_frame,
};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Slack added to the caller's timeout for the connection deadline.
const DEADLINE_SLACK: Duration = Duration::from_secs(5);

/// Serves the capability protocol for one principal per socket.
///
/// The principal attached at bind time is the request principal for every
/// frame arriving on that socket; nothing in the payload can change it.
pub struct CapabilityProxy {
    executor: Arc<CapabilityExecutor>,
    sockets: UdsSocketManager,
}

/// A bound, serving socket. Dropping the handle stops the accept loop; the
/// socket file is removed on [`ProxyHandle::shutdown`].
pub struct ProxyHandle {
    /// Path of the bound socket file.
    pub socket_path: PathBuf,
    pub(crate) accept_task: JoinHandle<()>,
}

impl ProxyHandle {
    /// Stop accepting and remove the socket file.
    pub async fn shutdown(self) {
        self.accept_task.abort();
        let _ = self.accept_task.await;
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

impl CapabilityProxy {
    /// Proxy dispatching into `executor`, binding through `sockets`.
    pub fn new(executor: Arc<CapabilityExecutor>, sockets: UdsSocketManager) -> Self {
        Self { executor, sockets }
    }

    /// Bind the principal's socket and start serving connections.
    pub fn serve(&self, principal: &Principal) -> io::Result<ProxyHandle> {
        let (listener, socket_path) = self.sockets.bind(principal)?;
        let executor = Arc::clone(&self.executor);
        let principal = principal.clone();
        debug!(target: "rumi.proxy", principal = %principal, path = %socket_path.display(), "capability socket bound");

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let executor = Arc::clone(&executor);
                        let principal = principal.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, executor, principal).await;
                        });
                    }
                    Err(e) => {
                        warn!(target: "rumi.proxy", error = %e, "accept failed");
                        break;
                    }
                }
            }
        });

        Ok(ProxyHandle {
            socket_path,
            accept_task,
        })
    }
}

// One connection may carry several sequential requests; each gets its own
// deadline of `timeout + 5 s`.
async fn handle_connection(
    mut stream: UnixStream,
    executor: Arc<CapabilityExecutor>,
    principal: Principal,
) {
    loop {
        let frame = match read_frame(&mut stream, MAX_FRAME_BYTES).await {
            Ok(frame) => frame,
            Err(FrameError::ConnectionClosed) => return,
            Err(FrameError::TooLarge { len, max }) => {
                let response = CapabilityResponse::err_with(
                    ErrorKind::ValidationError,
                    format!("Request frame too large: {len} > {max}"),
                    0.0,
                );
                let _ = write_response(&mut stream, &response).await;
                return;
            }
            Err(e) => {
                let response = CapabilityResponse::err_with(
                    ErrorKind::ValidationError,
                    format!("Malformed frame: {e}"),
                    0.0,
                );
                let _ = write_response(&mut stream, &response).await;
                return;
            }
        };

        let request: CapabilityRequest = match serde_json::from_value(frame) {
            Ok(request) => request,
            Err(e) => {
                let response = CapabilityResponse::err_with(
                    ErrorKind::ValidationError,
                    format!("Malformed request: {e}"),
                    0.0,
                );
                if write_response(&mut stream, &response).await.is_err() {
                    return;
                }
                continue;
            }
        };

        let deadline =
            Duration::from_secs_f64(clamp_timeout(request.timeout_seconds)) + DEADLINE_SLACK;
        let response =
            match tokio::time::timeout(deadline, executor.execute(&principal, &request)).await {
                Ok(response) => response,
                Err(_elapsed) => {
                    let response = CapabilityResponse::err_with(
                        ErrorKind::Timeout,
                        "Connection deadline exceeded",
                        deadline.as_secs_f64() * 1000.0,
                    );
                    let _ = write_response(&mut stream, &response).await;
                    return;
                }
            };

        if write_response(&mut stream, &response).await.is_err() {
            return;
        }
    }
}

async fn write_response(
    stream: &mut UnixStream,
    response: &CapabilityResponse,
) -> Result<(), FrameError> {
    let value = serde_json::to_value(response)?;
    write_frame(stream, &value, MAX_FRAME_BYTES).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::SocketOptions;
    use rumi_audit::AuditLogger;
    use rumi_config::BrokerConfig;
    use rumi_core::{PermissionId, RuntimePaths};
    use rumi_exec::Services;
    use serde_json::{Map, Value, json};

    struct Fixture {
        _dir: tempfile::TempDir,
        executor: Arc<CapabilityExecutor>,
        proxy: CapabilityProxy,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let paths = RuntimePaths::new(dir.path().join("data"), dir.path().join("run"));
        let config = BrokerConfig::from_map(&std::collections::BTreeMap::new()).unwrap();
        let services = Services::bootstrap(paths.clone(), config).unwrap();
        let executor = CapabilityExecutor::new(services);
        let sockets = UdsSocketManager::new(
            paths.capability_socket_dir(),
            SocketOptions::default(),
            AuditLogger::new(paths.audit_log_file()),
        );
        let proxy = CapabilityProxy::new(Arc::clone(&executor), sockets);
        Fixture {
            _dir: dir,
            executor,
            proxy,
        }
    }

    fn grant_store(executor: &Arc<CapabilityExecutor>, principal_id: &str) {
        let services = executor.services();
        services.stores.declare("s1").unwrap();
        for permission in ["store.set", "store.get"] {
            services
                .grants
                .grant(
                    &Principal::parse(principal_id).unwrap(),
                    &PermissionId::parse(permission).unwrap(),
                    json!({"allowed_store_ids": ["s1"]})
                        .as_object()
                        .cloned()
                        .unwrap_or_else(Map::new),
                    "op",
                )
                .unwrap();
        }
    }

    async fn call(socket: &std::path::Path, request: Value) -> Value {
        let mut stream = UnixStream::connect(socket).await.unwrap();
        write_frame(&mut stream, &request, MAX_FRAME_BYTES)
            .await
            .unwrap();
        read_frame(&mut stream, MAX_FRAME_BYTES).await.unwrap()
    }

    #[tokio::test]
    async fn roundtrip_over_socket() {
        let fx = fixture();
        let principal = Principal::parse("pack-a").unwrap();
        grant_store(&fx.executor, "pack-a");
        let handle = fx.proxy.serve(&principal).unwrap();

        let set = call(
            &handle.socket_path,
            json!({
                "permission_id": "store.set",
                "args": {"store_id": "s1", "key": "greeting", "value": "hello"},
            }),
        )
        .await;
        assert_eq!(set["success"], json!(true), "{set}");

        let get = call(
            &handle.socket_path,
            json!({
                "permission_id": "store.get",
                "args": {"store_id": "s1", "key": "greeting"},
            }),
        )
        .await;
        assert_eq!(get["success"], json!(true));
        assert_eq!(get["output"]["value"], json!("hello"));
        assert!(get["latency_ms"].is_number());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn principal_comes_from_socket_not_payload() {
        let fx = fixture();
        grant_store(&fx.executor, "trusted-pack");
        let trusted = Principal::parse("trusted-pack").unwrap();
        let hostile = Principal::parse("hostile-pack").unwrap();
        let trusted_handle = fx.proxy.serve(&trusted).unwrap();
        let hostile_handle = fx.proxy.serve(&hostile).unwrap();

        // The hostile pack claims another principal in its payload; the
        // field is not part of the protocol and changes nothing.
        let resp = call(
            &hostile_handle.socket_path,
            json!({
                "permission_id": "store.get",
                "args": {"store_id": "s1", "key": "k"},
                "principal_id": "trusted-pack",
            }),
        )
        .await;
        assert_eq!(resp["success"], json!(false));
        assert_eq!(resp["error_type"], json!("grant_denied"));

        trusted_handle.shutdown().await;
        hostile_handle.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_request_is_reported() {
        let fx = fixture();
        let principal = Principal::parse("pack-a").unwrap();
        let handle = fx.proxy.serve(&principal).unwrap();

        let resp = call(&handle.socket_path, json!({"no_permission": true})).await;
        assert_eq!(resp["success"], json!(false));
        assert_eq!(resp["error_type"], json!("validation_error"));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn sequential_requests_share_a_connection() {
        let fx = fixture();
        grant_store(&fx.executor, "pack-a");
        let principal = Principal::parse("pack-a").unwrap();
        let handle = fx.proxy.serve(&principal).unwrap();

        let mut stream = UnixStream::connect(&handle.socket_path).await.unwrap();
        for i in 0..3 {
            let request = json!({
                "permission_id": "store.set",
                "args": {"store_id": "s1", "key": format!("k{i}"), "value": i},
            });
            write_frame(&mut stream, &request, MAX_FRAME_BYTES)
                .await
                .unwrap();
            let resp = read_frame(&mut stream, MAX_FRAME_BYTES).await.unwrap();
            assert_eq!(resp["success"], json!(true));
        }

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_removes_socket_file() {
        let fx = fixture();
        let principal = Principal::parse("pack-a").unwrap();
        let handle = fx.proxy.serve(&principal).unwrap();
        let path = handle.socket_path.clone();
        assert!(path.exists());
        handle.shutdown().await;
        assert!(!path.exists());
    }
}
