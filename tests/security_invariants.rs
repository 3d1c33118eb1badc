// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cross-crate security invariants: candidate lifecycle, SSRF defense,
//! record integrity.

use async_trait::async_trait;
use rumi_audit::AuditLogger;
use rumi_core::{ErrorKind, Principal};
use rumi_grant::GrantManager;
use rumi_installer::{CandidateStatus, InstallerState, artifact_sha256};
use rumi_keys::{KeyRing, SigningKey};
use rumi_protocol::EgressRequest;
use rumi_proxy::{EgressProxy, HostResolver, SocketOptions, UdsSocketManager};
use serde_json::json;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn keys() -> Arc<KeyRing> {
    Arc::new(
        KeyRing::new(vec![SigningKey {
            version: 1,
            secret: vec![0x11; 32],
            created_at: chrono::Utc::now(),
            retired: false,
        }])
        .unwrap(),
    )
}

// -- candidate lifecycle ----------------------------------------------------

#[test]
fn candidate_lifecycle_to_blocked_and_back() {
    let dir = tempfile::tempdir().unwrap();
    let audit = AuditLogger::new(dir.path().join("audit.log"));
    let state = InstallerState::open(dir.path().join("capability_installer"), audit);

    // discover → pending
    let candidate = state
        .discover("pack-a", "handlers/fetch/run.sh", &artifact_sha256(b"body"))
        .unwrap();
    assert_eq!(candidate.status, CandidateStatus::Pending);
    let key = candidate.candidate_key;

    // first reject → pending again after cooldown, count = 1
    let rejected = state.reject(&key).unwrap();
    assert_eq!(rejected.reject_count, 1);
    assert!(rejected.cooldown_until.is_some());

    // two more rejects → blocked
    state.reject(&key).unwrap();
    let blocked = state.reject(&key).unwrap();
    assert_eq!(blocked.status, CandidateStatus::Blocked);

    // approve on a blocked candidate fails with the blocked tag
    let err = state.approve(&key).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Blocked);

    // only unblock leaves the absorbing state
    state.unblock(&key).unwrap();
    assert_eq!(
        state.approve(&key).unwrap().status,
        CandidateStatus::Installed
    );
}

// -- SSRF defense -----------------------------------------------------------

// Resolves any name to loopback, counting how often it is consulted.
struct RebindingResolver {
    lookups: AtomicUsize,
}

#[async_trait]
impl HostResolver for RebindingResolver {
    async fn resolve(&self, _host: &str, _port: u16) -> std::io::Result<Vec<IpAddr>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(vec!["127.0.0.1".parse().unwrap()])
    }
}

#[tokio::test]
async fn rebinding_hostname_never_reaches_loopback() {
    // A listener that fails the test if anything connects.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let connected = Arc::new(AtomicUsize::new(0));
    let connected_clone = Arc::clone(&connected);
    let guard = tokio::spawn(async move {
        while let Ok((_stream, _addr)) = listener.accept().await {
            connected_clone.fetch_add(1, Ordering::SeqCst);
        }
    });

    let dir = tempfile::tempdir().unwrap();
    let audit = AuditLogger::new(dir.path().join("audit.log"));
    let grants = GrantManager::open(dir.path().join("grants.json"), keys(), audit.clone());
    let pack = Principal::parse("pack-a").unwrap();
    // Even a fully permissive domain grant must not defeat the IP check.
    grants
        .grant(
            &pack,
            &rumi_core::PermissionId::parse("net.http").unwrap(),
            json!({"allowed_domains": ["*"]}).as_object().unwrap().clone(),
            "op",
        )
        .unwrap();

    let resolver = Arc::new(RebindingResolver {
        lookups: AtomicUsize::new(0),
    });
    let sockets = UdsSocketManager::new(
        dir.path().join("egress"),
        SocketOptions::default(),
        audit,
    );
    let proxy = EgressProxy::new(grants, sockets, resolver.clone());

    let response = proxy
        .handle_request(
            &pack,
            &EgressRequest {
                method: "GET".to_string(),
                url: "http://evil.example/".to_string(),
                headers: Default::default(),
                body: None,
                timeout_seconds: None,
            },
        )
        .await;

    assert!(!response.success);
    assert_eq!(response.rejection_reason.as_deref(), Some("internal_ip"));
    assert_eq!(resolver.lookups.load(Ordering::SeqCst), 1);

    // Give any stray connection a moment to land, then assert none did.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(connected.load(Ordering::SeqCst), 0);
    guard.abort();
}

// -- record integrity -------------------------------------------------------

#[test]
fn tampered_documents_fail_closed_everywhere() {
    let dir = tempfile::tempdir().unwrap();
    let audit = AuditLogger::new(dir.path().join("audit.log"));
    let grants = GrantManager::open(dir.path().join("grants.json"), keys(), audit.clone());
    let p = Principal::parse("pack-a").unwrap();
    let perm = rumi_core::PermissionId::parse("store.get").unwrap();
    grants
        .grant(
            &p,
            &perm,
            json!({"allowed_store_ids": ["safe"]})
                .as_object()
                .unwrap()
                .clone(),
            "op",
        )
        .unwrap();

    // Widen the allow-list on disk without re-signing.
    let path = dir.path().join("grants.json");
    let doc = std::fs::read_to_string(&path)
        .unwrap()
        .replace(r#""safe""#, r#""safe", "victim""#);
    std::fs::write(&path, doc).unwrap();

    let reopened = GrantManager::open(&path, keys(), audit);
    let decision = reopened.check(&p, &perm);
    // The whole record is dropped: fail closed, not fail widened.
    assert!(!decision.allowed);
    assert_eq!(decision.reason.as_deref(), Some("no_grant"));

    let log = std::fs::read_to_string(dir.path().join("audit.log")).unwrap();
    assert!(log.contains("signature_invalid"));
}
