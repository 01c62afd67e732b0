//! Subdomain routing and proxying into sandbox containers.
//!
//! Requests whose hostname carries a UUIDv4 leftmost label are forwarded to
//! the sandbox bound to that subdomain; everything else falls through to
//! the orchestrator's own routes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::extract::Request;
use axum::extract::State;
use axum::http::header;
use axum::http::HeaderMap;
use axum::http::HeaderValue;
use axum::http::StatusCode;
use axum::http::Uri;
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::Json;
use hyper::upgrade::OnUpgrade;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use serde_json::json;
use tower_http::timeout::TimeoutBody;
use tracing::debug;
use tracing::error;
use tracing::warn;
use uuid::Uuid;

use crate::activity::ActivityTracker;
use crate::db::Database;

/// The pooled HTTP client used to reach sandbox backends.
pub type ProxyClient = Client<HttpConnector, Body>;

/// Headers that must not be forwarded between hops.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Creates the pooled client for proxying.
pub fn client() -> ProxyClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// State for the proxy layer.
#[derive(Clone)]
pub struct ProxyState {
    /// Registry handle for subdomain lookups.
    pub db: Arc<dyn Database>,
    /// Activity tracker touched on every proxied request.
    pub activity: ActivityTracker,
    /// Pooled backend client.
    pub client: ProxyClient,
    /// Round-trip and idle-socket timeout.
    pub timeout: Duration,
}

impl std::fmt::Debug for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyState").finish_non_exhaustive()
    }
}

/// Middleware that intercepts sandbox subdomain traffic.
///
/// Requests without a valid UUIDv4 subdomain pass through to the inner
/// router so the orchestrator's own surface stays reachable.
pub async fn layer(State(state): State<ProxyState>, req: Request, next: Next) -> Response {
    let Some(subdomain) = request_subdomain(&req) else {
        return next.run(req).await;
    };

    let record = match state.db.get_running_by_subdomain(subdomain).await {
        Ok(Some(record)) => record,
        Ok(None) => return not_found(subdomain),
        Err(e) => {
            error!(%subdomain, error = %e, "registry lookup failed");
            return bad_gateway("registry lookup failed");
        }
    };

    let Some(host_port) = record.host_port else {
        error!(%subdomain, container = %record.id, "running record has no host port");
        return bad_gateway("sandbox has no bound port");
    };

    state.activity.touch(subdomain);

    forward(&state, subdomain, &host_port, req).await
}

/// Extracts the sandbox subdomain from a request's hostname, if any.
fn request_subdomain(req: &Request) -> Option<Uuid> {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())?;

    subdomain_of(host)
}

/// Parses the UUIDv4 subdomain out of a hostname.
///
/// The hostname must have at least three labels; the leftmost one must be a
/// UUIDv4. Anything else falls through to the main application.
pub fn subdomain_of(host: &str) -> Option<Uuid> {
    // IPv6 literals have no subdomain.
    if host.starts_with('[') {
        return None;
    }

    let host = host.split(':').next().unwrap_or(host);

    let mut labels = host.split('.');
    let leftmost = labels.next()?;
    if labels.count() < 2 {
        return None;
    }

    let uuid = Uuid::parse_str(leftmost).ok()?;
    if uuid.get_version_num() != 4 {
        return None;
    }

    Some(uuid)
}

/// Forwards a request to the sandbox bound to `host_port`.
async fn forward(
    state: &ProxyState,
    subdomain: Uuid,
    host_port: &str,
    mut req: Request,
) -> Response {
    // Taken out before the request is moved; resolves once the client
    // connection is handed over after a `101 Switching Protocols`.
    let client_upgrade = req.extensions_mut().remove::<OnUpgrade>();
    let upgrading = is_upgrade_request(req.headers());

    let client_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let target: Uri = match format!("http://127.0.0.1:{host_port}{path_and_query}").parse() {
        Ok(uri) => uri,
        Err(e) => {
            error!(%subdomain, error = %e, "failed to build upstream uri");
            return bad_gateway("invalid upstream address");
        }
    };

    let (mut parts, body) = req.into_parts();
    parts.uri = target;
    if !upgrading {
        strip_hop_by_hop(&mut parts.headers);
    }
    append_forwarded_for(&mut parts.headers, client_ip.as_deref());
    let req = Request::from_parts(parts, body);

    let result = tokio::time::timeout(state.timeout, state.client.request(req)).await;

    let mut upstream = match result {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            debug!(%subdomain, error = %e, "upstream request failed");
            return bad_gateway(&e.to_string());
        }
        Err(_) => {
            debug!(%subdomain, "upstream request timed out");
            return bad_gateway("upstream timed out");
        }
    };

    if upstream.status() == StatusCode::SWITCHING_PROTOCOLS {
        if let Some(client_upgrade) = client_upgrade {
            let server_upgrade = hyper::upgrade::on(&mut upstream);
            tokio::spawn(relay_upgraded(subdomain, client_upgrade, server_upgrade));
        }
    }

    let timeout = state.timeout;
    let (parts, body) = upstream.into_parts();
    Response::from_parts(parts, Body::new(TimeoutBody::new(timeout, body)))
}

/// Splices the two upgraded connections together.
async fn relay_upgraded(subdomain: Uuid, client: OnUpgrade, server: OnUpgrade) {
    match tokio::try_join!(client, server) {
        Ok((client_io, server_io)) => {
            let mut client_io = TokioIo::new(client_io);
            let mut server_io = TokioIo::new(server_io);
            if let Err(e) = tokio::io::copy_bidirectional(&mut client_io, &mut server_io).await {
                debug!(%subdomain, error = %e, "upgraded stream closed");
            }
        }
        Err(e) => {
            warn!(%subdomain, error = %e, "upgrade handshake failed");
        }
    }
}

/// Whether the request asks for a protocol upgrade.
fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
}

/// Removes hop-by-hop headers before forwarding.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Appends the client address to the forwarded-for chain.
fn append_forwarded_for(headers: &mut HeaderMap, client_ip: Option<&str>) {
    let Some(client_ip) = client_ip else {
        return;
    };

    let value = match headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(existing) => format!("{existing}, {client_ip}"),
        None => client_ip.to_string(),
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}

/// The structured 404 for unknown or stale subdomains.
fn not_found(subdomain: Uuid) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Container not found or not running",
            "subdomain": subdomain,
        })),
    )
        .into_response()
}

/// The structured 502 for upstream failures before headers are sent.
fn bad_gateway(message: &str) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({
            "error": "Proxy error",
            "message": message,
        })),
    )
        .into_response()
}
