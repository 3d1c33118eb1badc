// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end capability chain: framed requests over the per-principal
//! socket, through the authorization pipeline, into the built-in handlers.

use rumi_audit::AuditLogger;
use rumi_config::BrokerConfig;
use rumi_core::{PermissionId, Principal, RuntimePaths};
use rumi_exec::{CapabilityExecutor, Services};
use rumi_protocol::{MAX_FRAME_BYTES, read_frame, write_frame};
use rumi_proxy::{CapabilityProxy, SocketOptions, UdsSocketManager};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::net::UnixStream;

struct Broker {
    _dir: tempfile::TempDir,
    executor: Arc<CapabilityExecutor>,
    proxy: CapabilityProxy,
}

fn broker() -> Broker {
    let dir = tempfile::tempdir().unwrap();
    let paths = RuntimePaths::new(dir.path().join("data"), dir.path().join("run"));
    let config = BrokerConfig::from_map(&BTreeMap::new()).unwrap();
    let services = Services::bootstrap(paths.clone(), config).unwrap();
    let executor = CapabilityExecutor::new(services);
    let sockets = UdsSocketManager::new(
        paths.capability_socket_dir(),
        SocketOptions::default(),
        AuditLogger::new(paths.audit_log_file()),
    );
    let proxy = CapabilityProxy::new(Arc::clone(&executor), sockets);
    Broker {
        _dir: dir,
        executor,
        proxy,
    }
}

fn grant(broker: &Broker, principal: &str, permission: &str, config: Value) {
    broker
        .executor
        .services()
        .grants
        .grant(
            &Principal::parse(principal).unwrap(),
            &PermissionId::parse(permission).unwrap(),
            config.as_object().cloned().unwrap_or_else(Map::new),
            "operator",
        )
        .unwrap();
}

async fn call(socket: &std::path::Path, request: Value) -> Value {
    let mut stream = UnixStream::connect(socket).await.unwrap();
    write_frame(&mut stream, &request, MAX_FRAME_BYTES)
        .await
        .unwrap();
    read_frame(&mut stream, MAX_FRAME_BYTES).await.unwrap()
}

// Strip the per-call latency so replies can be compared byte-for-byte.
fn canonical_reply(mut reply: Value) -> Vec<u8> {
    reply.as_object_mut().unwrap().remove("latency_ms");
    serde_json::to_vec(&reply).unwrap()
}

#[tokio::test]
async fn secret_probes_are_indistinguishable() {
    let broker = broker();
    let principal = Principal::parse("pack-a").unwrap();
    grant(&broker, "pack-a", "secrets.get", json!({"allowed_keys": ["FOO"]}));
    let handle = broker.proxy.serve(&principal).unwrap();

    // Neither key exists; one is outside the allow-list, one inside it.
    let bar = call(
        &handle.socket_path,
        json!({"permission_id": "secrets.get", "args": {"key": "BAR"}}),
    )
    .await;
    let baz = call(
        &handle.socket_path,
        json!({"permission_id": "secrets.get", "args": {"key": "BAZ"}}),
    )
    .await;

    assert_eq!(bar["success"], json!(false));
    assert_eq!(bar["error"], json!("Access denied or secret not found"));
    assert_eq!(bar["error_type"], json!("access_denied"));
    assert_eq!(canonical_reply(bar), canonical_reply(baz));

    handle.shutdown().await;
}

#[tokio::test]
async fn store_traversal_writes_nothing_outside_the_root() {
    let broker = broker();
    let services = broker.executor.services();
    services.stores.declare("s1").unwrap();
    grant(&broker, "pack-a", "store.set", json!({"allowed_store_ids": ["s1"]}));
    let principal = Principal::parse("pack-a").unwrap();
    let handle = broker.proxy.serve(&principal).unwrap();

    let reply = call(
        &handle.socket_path,
        json!({
            "permission_id": "store.set",
            "args": {"store_id": "s1", "key": "../etc/passwd", "value": {}},
        }),
    )
    .await;
    assert_eq!(reply["success"], json!(false));
    assert_eq!(reply["error_type"], json!("security_error"));

    // Nothing escaped the store root.
    let stores_dir = services.paths.stores_dir();
    assert!(!stores_dir.join("etc").exists());
    assert!(!stores_dir.parent().unwrap().join("etc").exists());
    let root = services.stores.get_store("s1").unwrap().root_path;
    assert_eq!(
        walk_count(&root),
        0,
        "store root should still be empty"
    );

    handle.shutdown().await;
}

fn walk_count(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

#[tokio::test]
async fn parent_ceiling_narrows_child_grants() {
    let broker = broker();
    grant(
        &broker,
        "parent",
        "store.set",
        json!({"allowed_store_ids": ["a", "b"], "max_value_bytes": 1_048_576}),
    );
    grant(
        &broker,
        "parent__child",
        "store.set",
        json!({"allowed_store_ids": ["b", "c"], "max_value_bytes": 2_097_152}),
    );

    let decision = broker.executor.services().grants.check(
        &Principal::parse("parent__child").unwrap(),
        &PermissionId::parse("store.set").unwrap(),
    );
    assert!(decision.allowed);
    assert_eq!(
        Value::Object(decision.config),
        json!({"allowed_store_ids": ["b"], "max_value_bytes": 1_048_576})
    );
}

#[tokio::test]
async fn concurrent_cas_over_sockets_has_one_winner() {
    let broker = broker();
    let services = broker.executor.services();
    services.stores.declare("s1").unwrap();
    services
        .stores
        .set("s1", "slot", &json!("v0"), 1024)
        .unwrap();
    grant(&broker, "pack-a", "store.cas", json!({"allowed_store_ids": ["s1"]}));
    let principal = Principal::parse("pack-a").unwrap();
    let handle = broker.proxy.serve(&principal).unwrap();

    let socket = handle.socket_path.clone();
    let tasks: Vec<_> = ["v1", "v2"]
        .into_iter()
        .map(|new_value| {
            let socket = socket.clone();
            tokio::spawn(async move {
                call(
                    &socket,
                    json!({
                        "permission_id": "store.cas",
                        "args": {
                            "store_id": "s1",
                            "key": "slot",
                            "expected_value": "v0",
                            "new_value": new_value,
                        },
                    }),
                )
                .await
            })
        })
        .collect();

    let mut wins = 0;
    let mut conflicts = 0;
    for task in tasks {
        let reply = task.await.unwrap();
        if reply["success"] == json!(true) {
            wins += 1;
        } else {
            assert_eq!(reply["error_type"], json!("cas_conflict"));
            conflicts += 1;
        }
    }
    assert_eq!((wins, conflicts), (1, 1));

    let final_value = services.stores.get("s1", "slot").unwrap();
    assert!(final_value == json!("v1") || final_value == json!("v2"));

    handle.shutdown().await;
}

#[tokio::test]
async fn flow_run_composes_granted_capabilities() {
    let broker = broker();
    let services = broker.executor.services();
    services.stores.declare("s1").unwrap();
    services.secrets.write("TOKEN", "tok-123").unwrap();
    grant(&broker, "pack-a", "flow.run", json!({}));
    grant(&broker, "pack-a", "secrets.get", json!({"allowed_keys": ["TOKEN"]}));
    grant(&broker, "pack-a", "store.set", json!({"allowed_store_ids": ["s1"]}));
    let principal = Principal::parse("pack-a").unwrap();
    let handle = broker.proxy.serve(&principal).unwrap();

    let flow = json!({
        "flow_id": "fetch-and-store",
        "steps": [
            {"id": "token", "handler": "secrets.get", "args": {"key": "TOKEN"}},
            {"id": "save", "handler": "store.set", "depends_on": ["token"],
             "args": {"store_id": "s1", "key": "creds/token",
                      "value": {"token": "$flow.token.value"}}},
        ],
    });
    let reply = call(
        &handle.socket_path,
        json!({"permission_id": "flow.run", "args": {"flow": flow}}),
    )
    .await;
    assert_eq!(reply["success"], json!(true), "{reply}");
    assert_eq!(reply["output"]["completed"], json!(true));

    let stored = services.stores.get("s1", "creds/token").unwrap();
    assert_eq!(stored, json!({"token": "tok-123"}));

    handle.shutdown().await;
}
