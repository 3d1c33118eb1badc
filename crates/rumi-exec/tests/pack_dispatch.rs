// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pack handler dispatch through the whole pipeline: manifest scan,
//! fingerprint pinning, trust, grant, host privilege, subprocess reply.

#![cfg(unix)]

use rumi_config::BrokerConfig;
use rumi_core::{PermissionId, Principal, RuntimePaths};
use rumi_exec::{CapabilityExecutor, Services};
use rumi_protocol::CapabilityRequest;
use serde_json::{Map, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn write_handler(pack_dir: &Path) -> PathBuf {
    let handler_dir = pack_dir.join("echo_tool");
    std::fs::create_dir_all(&handler_dir).unwrap();
    let script = handler_dir.join("run.sh");
    std::fs::write(
        &script,
        "#!/bin/sh\necho '{\"success\": true, \"output\": {\"echoed\": true}}'\n",
    )
    .unwrap();
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    std::fs::write(
        handler_dir.join("handler.json"),
        serde_json::to_vec(&json!({
            "handler_id": "echo_tool",
            "permission_id": "tool.echo",
            "entrypoint": ["run.sh"],
        }))
        .unwrap(),
    )
    .unwrap();
    script
}

fn fixture() -> (tempfile::TempDir, Arc<CapabilityExecutor>, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let paths = RuntimePaths::new(dir.path().join("data"), dir.path().join("run"));
    let config = BrokerConfig::from_map(&BTreeMap::new()).unwrap();
    let services = Services::bootstrap(paths, config).unwrap();

    let pack_dir = dir.path().join("packs").join("pack-a");
    let script = write_handler(&pack_dir);
    assert_eq!(services.registry.scan_dir(&pack_dir), 1);

    (dir, CapabilityExecutor::new(services), script)
}

fn authorize(exec: &Arc<CapabilityExecutor>, principal: &Principal) {
    let services = exec.services();
    let def = services
        .registry
        .resolve(&PermissionId::parse("tool.echo").unwrap())
        .unwrap();
    services
        .trust
        .grant(principal, &def.handler_id, &def.fingerprint_sha256)
        .unwrap();
    services
        .grants
        .grant(
            principal,
            &PermissionId::parse("tool.echo").unwrap(),
            Map::new(),
            "op",
        )
        .unwrap();
    services
        .privileges
        .grant(principal.as_str(), true, "op")
        .unwrap();
}

fn request() -> CapabilityRequest {
    CapabilityRequest {
        permission_id: "tool.echo".to_string(),
        args: json!({"msg": "hi"}),
        timeout_seconds: None,
        request_id: None,
    }
}

#[tokio::test]
async fn authorized_pack_handler_executes() {
    let (_dir, exec, _script) = fixture();
    let principal = Principal::parse("pack-a").unwrap();
    authorize(&exec, &principal);

    let resp = exec.execute(&principal, &request()).await;
    assert!(resp.success, "{resp:?}");
    assert_eq!(resp.output.unwrap(), json!({"echoed": true}));
}

#[tokio::test]
async fn untrusted_pack_handler_is_denied() {
    let (_dir, exec, _script) = fixture();
    let principal = Principal::parse("pack-a").unwrap();
    // Grant and privilege but no trust record.
    exec.services()
        .grants
        .grant(
            &principal,
            &PermissionId::parse("tool.echo").unwrap(),
            Map::new(),
            "op",
        )
        .unwrap();
    exec.services()
        .privileges
        .grant(principal.as_str(), true, "op")
        .unwrap();

    let resp = exec.execute(&principal, &request()).await;
    assert_eq!(resp.error_type.as_deref(), Some("trust_denied"));
}

#[tokio::test]
async fn host_privilege_gates_subprocess_in_strict_mode() {
    let (_dir, exec, _script) = fixture();
    let principal = Principal::parse("pack-a").unwrap();
    let services = exec.services();
    let def = services
        .registry
        .resolve(&PermissionId::parse("tool.echo").unwrap())
        .unwrap();
    services
        .trust
        .grant(&principal, &def.handler_id, &def.fingerprint_sha256)
        .unwrap();
    services
        .grants
        .grant(
            &principal,
            &PermissionId::parse("tool.echo").unwrap(),
            Map::new(),
            "op",
        )
        .unwrap();

    let resp = exec.execute(&principal, &request()).await;
    assert_eq!(resp.error_type.as_deref(), Some("permission_denied"));
}

#[tokio::test]
async fn modified_handler_invalidates_trust() {
    let (_dir, exec, script) = fixture();
    let principal = Principal::parse("pack-a").unwrap();
    authorize(&exec, &principal);

    // A byte changes after the scan: the fingerprint no longer matches.
    std::fs::write(
        &script,
        "#!/bin/sh\necho '{\"success\": true, \"output\": {\"echoed\": \"tampered\"}}'\n",
    )
    .unwrap();

    let resp = exec.execute(&principal, &request()).await;
    assert_eq!(resp.error_type.as_deref(), Some("fingerprint_changed"));

    // The trust binding was dropped, so even restoring the file content
    // elsewhere would leave the principal untrusted until re-granted.
    let def = exec
        .services()
        .registry
        .resolve(&PermissionId::parse("tool.echo").unwrap())
        .unwrap();
    assert!(!exec.services().trust.is_trusted(
        &principal,
        &def.handler_id,
        &def.fingerprint_sha256
    ));
}
