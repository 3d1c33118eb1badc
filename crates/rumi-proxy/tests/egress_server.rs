// SPDX-License-Identifier: MIT OR Apache-2.0
//! Egress proxy over its socket: rejections framed back to the pack.

use async_trait::async_trait;
use rumi_audit::AuditLogger;
use rumi_core::Principal;
use rumi_grant::GrantManager;
use rumi_keys::{KeyRing, SigningKey};
use rumi_protocol::{MAX_FRAME_BYTES, read_frame, write_frame};
use rumi_proxy::{EgressProxy, HostResolver, SocketOptions, UdsSocketManager};
use serde_json::{Value, json};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::UnixStream;

struct PublicResolver;

#[async_trait]
impl HostResolver for PublicResolver {
    async fn resolve(&self, _host: &str, _port: u16) -> std::io::Result<Vec<IpAddr>> {
        Ok(vec!["93.184.216.34".parse().unwrap()])
    }
}

struct LoopbackResolver;

#[async_trait]
impl HostResolver for LoopbackResolver {
    async fn resolve(&self, _host: &str, _port: u16) -> std::io::Result<Vec<IpAddr>> {
        Ok(vec!["127.0.0.1".parse().unwrap()])
    }
}

fn fixture(resolver: Arc<dyn HostResolver>) -> (tempfile::TempDir, Arc<EgressProxy>, GrantManager) {
    let dir = tempfile::tempdir().unwrap();
    let audit = AuditLogger::new(dir.path().join("audit.log"));
    let keys = Arc::new(
        KeyRing::new(vec![SigningKey {
            version: 1,
            secret: vec![6u8; 32],
            created_at: chrono::Utc::now(),
            retired: false,
        }])
        .unwrap(),
    );
    let grants = GrantManager::open(dir.path().join("grants.json"), keys, audit.clone());
    let sockets = UdsSocketManager::new(
        dir.path().join("egress"),
        SocketOptions::default(),
        audit,
    );
    let proxy = Arc::new(EgressProxy::new(grants.clone(), sockets, resolver));
    (dir, proxy, grants)
}

async fn call(socket: &std::path::Path, request: Value) -> Value {
    let mut stream = UnixStream::connect(socket).await.unwrap();
    write_frame(&mut stream, &request, MAX_FRAME_BYTES)
        .await
        .unwrap();
    read_frame(&mut stream, MAX_FRAME_BYTES).await.unwrap()
}

#[tokio::test]
async fn loopback_resolution_is_rejected_over_the_wire() {
    let (_dir, proxy, _grants) = fixture(Arc::new(LoopbackResolver));
    let pack = Principal::parse("pack-a").unwrap();
    let handle = proxy.serve(&pack).unwrap();

    let resp = call(
        &handle.socket_path,
        json!({"method": "GET", "url": "http://evil.example/"}),
    )
    .await;
    assert_eq!(resp["success"], json!(false));
    assert_eq!(resp["rejection_reason"], json!("internal_ip"));

    handle.shutdown().await;
}

#[tokio::test]
async fn ungranted_domain_is_rejected() {
    let (_dir, proxy, _grants) = fixture(Arc::new(PublicResolver));
    let pack = Principal::parse("pack-a").unwrap();
    let handle = proxy.serve(&pack).unwrap();

    let resp = call(
        &handle.socket_path,
        json!({"method": "GET", "url": "https://api.example.com/v1"}),
    )
    .await;
    assert_eq!(resp["success"], json!(false));
    assert_eq!(resp["rejection_reason"], json!("no_grant"));

    handle.shutdown().await;
}

#[tokio::test]
async fn blocked_domain_beats_allow_list() {
    let (_dir, proxy, grants) = fixture(Arc::new(PublicResolver));
    let pack = Principal::parse("pack-a").unwrap();
    grants
        .grant(
            &pack,
            &rumi_core::PermissionId::parse("net.http").unwrap(),
            json!({
                "allowed_domains": ["*.example.com"],
                "blocked_domains": ["evil.example.com"],
            })
            .as_object()
            .unwrap()
            .clone(),
            "op",
        )
        .unwrap();
    let handle = proxy.serve(&pack).unwrap();

    let resp = call(
        &handle.socket_path,
        json!({"method": "GET", "url": "https://evil.example.com/"}),
    )
    .await;
    assert_eq!(resp["rejection_reason"], json!("domain_blocked"));

    let resp = call(
        &handle.socket_path,
        json!({"method": "GET", "url": "https://api.example.com:8443/"}),
    )
    .await;
    // Allowed domain, but 8443 is not in the default port set.
    assert_eq!(resp["rejection_reason"], json!("port_not_allowed"));

    handle.shutdown().await;
}

#[tokio::test]
async fn invalid_method_is_rejected_before_resolution() {
    let (_dir, proxy, _grants) = fixture(Arc::new(LoopbackResolver));
    let pack = Principal::parse("pack-a").unwrap();
    let handle = proxy.serve(&pack).unwrap();

    let resp = call(
        &handle.socket_path,
        json!({"method": "TRACE", "url": "http://anything.example/"}),
    )
    .await;
    assert_eq!(resp["rejection_reason"], json!("method_not_allowed"));

    handle.shutdown().await;
}
