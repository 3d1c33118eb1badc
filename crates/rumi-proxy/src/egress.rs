// SPDX-License-Identifier: MIT OR Apache-2.0
//! The per-pack egress proxy: validated outbound HTTP over UDS.
//!
//! Validation order: shape (method, headers, timeout, URL) → SSRF
//! (resolve the host and require every address to be public) → grant
//! (domain allow/block lists and ports) → issue the request with a
//! streaming response-size cap.

use crate::socket::UdsSocketManager;
use async_trait::async_trait;
use rumi_audit::AuditSeverity;
use rumi_core::Principal;
use rumi_grant::GrantManager;
use rumi_protocol::{
    EgressRequest, EgressResponse, FrameError, MAX_FRAME_BYTES, MAX_TIMEOUT_SECS, read_frame,
    write_frame,
};
use serde_json::json;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tracing::{debug, warn};

/// Permission id egress grants are attached to.
pub const EGRESS_PERMISSION: &str = "net.http";

/// Cap on an upstream response body.
pub const MAX_EGRESS_RESPONSE_BYTES: usize = 1024 * 1024;

/// Allowed HTTP methods.
pub const ALLOWED_METHODS: &[&str] =
    &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// Header caps.
pub const MAX_HEADER_COUNT: usize = 64;
/// Maximum header name length in bytes.
pub const MAX_HEADER_NAME_LEN: usize = 128;
/// Maximum header value length in bytes.
pub const MAX_HEADER_VALUE_LEN: usize = 8 * 1024;

/// Ports allowed when the grant does not name any.
pub const DEFAULT_ALLOWED_PORTS: &[u16] = &[80, 443];

/// DNS seam so tests can pin resolution.
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Resolve a hostname to all its addresses.
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>>;
}

/// `getaddrinfo`-backed resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

/// Whether an address sits in a reserved or private range that egress must
/// never reach.
pub fn is_internal_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_multicast()
                || octets[0] == 0
                // 100.64.0.0/10 carrier-grade NAT
                || (octets[0] == 100 && (octets[1] & 0xC0) == 64)
                // 240.0.0.0/4 reserved
                || octets[0] >= 240
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_internal_ip(IpAddr::V4(mapped));
            }
            let segments = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                // fc00::/7 unique local
                || (segments[0] & 0xFE00) == 0xFC00
                // fe80::/10 link local
                || (segments[0] & 0xFFC0) == 0xFE80
        }
    }
}

/// A validated request, ready for SSRF and grant checks.
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    /// Upper-cased HTTP method.
    pub method: String,
    /// Parsed URL.
    pub url: reqwest::Url,
    /// Lower-cased host.
    pub host: String,
    /// Effective port.
    pub port: u16,
    /// Clamped timeout.
    pub timeout: Duration,
}

/// Shape validation: method, header caps, timeout ceiling, URL form.
pub fn validate_request(request: &EgressRequest) -> Result<ValidatedRequest, EgressResponse> {
    let method = request.method.to_ascii_uppercase();
    if !ALLOWED_METHODS.contains(&method.as_str()) {
        return Err(EgressResponse::rejected(
            "method_not_allowed",
            format!("Method not allowed: {}", request.method),
        ));
    }

    if request.headers.len() > MAX_HEADER_COUNT {
        return Err(EgressResponse::rejected(
            "too_many_headers",
            format!("Header count exceeds {MAX_HEADER_COUNT}"),
        ));
    }
    for (name, value) in &request.headers {
        if name.is_empty() || name.len() > MAX_HEADER_NAME_LEN {
            return Err(EgressResponse::rejected(
                "invalid_header",
                format!("Invalid header name length: {}", name.len()),
            ));
        }
        if value.len() > MAX_HEADER_VALUE_LEN {
            return Err(EgressResponse::rejected(
                "invalid_header",
                format!("Header value for {name} exceeds {MAX_HEADER_VALUE_LEN} bytes"),
            ));
        }
    }

    if let Some(t) = request.timeout_seconds
        && (!t.is_finite() || t <= 0.0 || t > MAX_TIMEOUT_SECS)
    {
        return Err(EgressResponse::rejected(
            "invalid_timeout",
            format!("Timeout out of range: {t}"),
        ));
    }
    let timeout =
        Duration::from_secs_f64(rumi_protocol::clamp_timeout(request.timeout_seconds));

    let url = reqwest::Url::parse(&request.url)
        .map_err(|e| EgressResponse::rejected("invalid_url", format!("URL parse error: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(EgressResponse::rejected(
            "invalid_url",
            format!("Unsupported scheme: {}", url.scheme()),
        ));
    }
    let host = url
        .host_str()
        .ok_or_else(|| EgressResponse::rejected("invalid_url", "URL has no host"))?
        .to_ascii_lowercase();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| EgressResponse::rejected("invalid_url", "URL has no port"))?;

    Ok(ValidatedRequest {
        method,
        url,
        host,
        port,
        timeout,
    })
}

/// Resolve the host and require every address to be public.
///
/// IP-literal hosts are checked directly, without DNS.
pub async fn resolve_and_check(
    resolver: &dyn HostResolver,
    host: &str,
    port: u16,
) -> Result<Vec<IpAddr>, EgressResponse> {
    let trimmed = host.trim_start_matches('[').trim_end_matches(']');
    let addrs = if let Ok(literal) = trimmed.parse::<IpAddr>() {
        vec![literal]
    } else {
        resolver.resolve(host, port).await.map_err(|e| {
            EgressResponse::rejected("dns_failure", format!("Host resolution failed: {e}"))
        })?
    };
    if addrs.is_empty() {
        return Err(EgressResponse::rejected(
            "dns_failure",
            "Host resolved to no addresses",
        ));
    }
    if let Some(internal) = addrs.iter().find(|a| is_internal_ip(**a)) {
        return Err(EgressResponse::rejected(
            "internal_ip",
            format!("Host resolves to a non-public address ({internal})"),
        ));
    }
    Ok(addrs)
}

/// `*.example.com` matches subdomains only; a bare pattern matches the
/// host itself and its subdomains.
pub fn domain_matches(hostname: &str, pattern: &str) -> bool {
    let hostname = hostname.to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();
    if let Some(suffix) = pattern.strip_prefix("*.") {
        hostname.ends_with(&format!(".{suffix}"))
    } else {
        hostname == pattern || hostname.ends_with(&format!(".{pattern}"))
    }
}

/// Serves the egress protocol for one pack per socket.
pub struct EgressProxy {
    grants: GrantManager,
    sockets: UdsSocketManager,
    resolver: Arc<dyn HostResolver>,
    client: reqwest::Client,
}

impl EgressProxy {
    /// Proxy checking `grants`, binding through `sockets`, resolving via
    /// `resolver`.
    pub fn new(
        grants: GrantManager,
        sockets: UdsSocketManager,
        resolver: Arc<dyn HostResolver>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self {
            grants,
            sockets,
            resolver,
            client,
        }
    }

    /// Bind the pack's egress socket and start serving connections.
    pub fn serve(self: &Arc<Self>, pack: &Principal) -> io::Result<super::ProxyHandle> {
        let (listener, socket_path) = self.sockets.bind(pack)?;
        let proxy = Arc::clone(self);
        let pack = pack.clone();
        debug!(target: "rumi.egress", pack = %pack, path = %socket_path.display(), "egress socket bound");

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let proxy = Arc::clone(&proxy);
                        let pack = pack.clone();
                        tokio::spawn(async move {
                            proxy.handle_connection(stream, pack).await;
                        });
                    }
                    Err(e) => {
                        warn!(target: "rumi.egress", error = %e, "accept failed");
                        break;
                    }
                }
            }
        });

        Ok(super::ProxyHandle {
            socket_path,
            accept_task,
        })
    }

    async fn handle_connection(&self, mut stream: UnixStream, pack: Principal) {
        loop {
            let frame = match read_frame(&mut stream, MAX_FRAME_BYTES).await {
                Ok(frame) => frame,
                Err(FrameError::ConnectionClosed) => return,
                Err(e) => {
                    let response =
                        EgressResponse::rejected("invalid_frame", format!("Malformed frame: {e}"));
                    let _ = write_egress(&mut stream, &response).await;
                    return;
                }
            };
            let request: EgressRequest = match serde_json::from_value(frame) {
                Ok(request) => request,
                Err(e) => {
                    let response = EgressResponse::rejected(
                        "invalid_request",
                        format!("Malformed request: {e}"),
                    );
                    if write_egress(&mut stream, &response).await.is_err() {
                        return;
                    }
                    continue;
                }
            };
            let response = self.handle_request(&pack, &request).await;
            if write_egress(&mut stream, &response).await.is_err() {
                return;
            }
        }
    }

    /// Full validation pipeline plus the upstream request.
    pub async fn handle_request(&self, pack: &Principal, request: &EgressRequest) -> EgressResponse {
        let validated = match validate_request(request) {
            Ok(validated) => validated,
            Err(rejection) => {
                self.audit_rejection(pack, request, &rejection);
                return rejection;
            }
        };

        if let Err(rejection) =
            resolve_and_check(self.resolver.as_ref(), &validated.host, validated.port).await
        {
            self.audit_rejection(pack, request, &rejection);
            return rejection;
        }

        if let Err(rejection) = self.check_grant(pack, &validated) {
            self.audit_rejection(pack, request, &rejection);
            return rejection;
        }

        self.issue(&validated, request).await
    }

    fn check_grant(
        &self,
        pack: &Principal,
        validated: &ValidatedRequest,
    ) -> Result<(), EgressResponse> {
        let permission = rumi_core::PermissionId::parse(EGRESS_PERMISSION)
            .expect("egress permission id is well-formed");
        let decision = self.grants.check(pack, &permission);
        if !decision.allowed {
            return Err(EgressResponse::rejected(
                "no_grant",
                "No egress grant for this pack",
            ));
        }

        let as_strings = |key: &str| -> Vec<String> {
            decision
                .config
                .get(key)
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };

        let blocked = as_strings("blocked_domains");
        if blocked.iter().any(|b| domain_matches(&validated.host, b)) {
            return Err(EgressResponse::rejected(
                "domain_blocked",
                format!("Domain blocked: {}", validated.host),
            ));
        }

        let allowed = as_strings("allowed_domains");
        let host_allowed = allowed.iter().any(|pattern| {
            pattern == "*" || domain_matches(&validated.host, pattern)
        });
        if !host_allowed {
            return Err(EgressResponse::rejected(
                "domain_not_allowed",
                format!("Domain not allowed: {}", validated.host),
            ));
        }

        let ports: Vec<u16> = decision
            .config
            .get("allowed_ports")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_u64())
                    .filter_map(|p| u16::try_from(p).ok())
                    .collect()
            })
            .unwrap_or_else(|| DEFAULT_ALLOWED_PORTS.to_vec());
        if !ports.contains(&validated.port) {
            return Err(EgressResponse::rejected(
                "port_not_allowed",
                format!("Port not allowed: {}", validated.port),
            ));
        }
        Ok(())
    }

    async fn issue(&self, validated: &ValidatedRequest, request: &EgressRequest) -> EgressResponse {
        let method = match reqwest::Method::from_bytes(validated.method.as_bytes()) {
            Ok(method) => method,
            Err(_) => return EgressResponse::rejected("method_not_allowed", "Invalid method"),
        };
        let mut builder = self
            .client
            .request(method, validated.url.clone())
            .timeout(validated.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let upstream = match builder.send().await {
            Ok(upstream) => upstream,
            Err(e) if e.is_timeout() => {
                return EgressResponse::failed(format!(
                    "Request timed out after {}s",
                    validated.timeout.as_secs_f64()
                ));
            }
            Err(e) => return EgressResponse::failed(format!("Request failed: {e}")),
        };

        // Declared length first, then re-checked while streaming: a chunked
        // body that overruns the cap aborts mid-stream.
        if let Some(declared) = upstream.content_length()
            && declared > MAX_EGRESS_RESPONSE_BYTES as u64
        {
            return EgressResponse::rejected(
                "response_too_large",
                format!("Declared Content-Length {declared} exceeds cap"),
            );
        }

        let status = upstream.status().as_u16();
        let headers: std::collections::BTreeMap<String, String> = upstream
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let mut body = Vec::new();
        let mut upstream = upstream;
        loop {
            match upstream.chunk().await {
                Ok(Some(chunk)) => {
                    if body.len() + chunk.len() > MAX_EGRESS_RESPONSE_BYTES {
                        return EgressResponse::rejected(
                            "response_too_large",
                            "Response body exceeds cap",
                        );
                    }
                    body.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(e) => return EgressResponse::failed(format!("Body read failed: {e}")),
            }
        }

        EgressResponse::ok(
            status,
            headers,
            String::from_utf8_lossy(&body).into_owned(),
        )
    }

    fn audit_rejection(&self, pack: &Principal, request: &EgressRequest, rejection: &EgressResponse) {
        self.sockets.audit().security_event(
            AuditSeverity::Warning,
            "egress_rejected",
            Some(pack.as_str()),
            json!({
                "url": request.url,
                "rejection_reason": rejection.rejection_reason,
            }),
        );
    }
}

async fn write_egress(
    stream: &mut UnixStream,
    response: &EgressResponse,
) -> Result<(), FrameError> {
    let value = serde_json::to_value(response)?;
    write_frame(stream, &value, MAX_FRAME_BYTES).await
}
