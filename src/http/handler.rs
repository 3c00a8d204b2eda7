//! Main axum router and HTTP request handlers for the caching proxy.
//!
//! Routes:
//! - `GET  /healthz` - health check
//! - `GET  /metrics` - Prometheus metrics
//! - everything else - the git path grammar
//!   `/<scheme>://<host>/<owner>/<name>[.git]/<git-endpoint>`:
//!   - `GET  …/info/refs?service=git-upload-pack` - ref advertisement,
//!     refreshed from upstream, served from the local mirror
//!   - `POST …/git-upload-pack` - pack negotiation / data transfer from the
//!     local mirror
//!   - any `git-receive-pack` request - rejected (403); the proxy is
//!     read-only

use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use flate2::read::GzDecoder;
use futures::StreamExt;
use tracing::{instrument, warn};

use crate::coordination::leases::ReadLease;
use crate::error::ProxyError;
use crate::fingerprint::{parse_route, GitEndpoint, GitRoute};
use crate::git::commands;
use crate::metrics::{EndpointLabels, MetricsRegistry, RepoLabels, RequestLabels};
use crate::sync::{RefreshPolicy, SyncOutcome};
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
///
/// The git endpoints live on the fallback handler: the upstream URL is
/// embedded literally in the request path (`/https://host/…`), which typed
/// axum routes cannot express.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(crate::health::health_handler))
        .route("/metrics", get(handle_metrics))
        .fallback(dispatch_git)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Git dispatch
// ---------------------------------------------------------------------------

/// Parse the git path grammar and dispatch to the matching endpoint
/// handler, recording request metrics on the way out.
#[instrument(skip_all, fields(method = %method, path = %uri.path()))]
async fn dispatch_git(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();

    let route = match parse_route(uri.path(), uri.query(), state.config.allow_insecure_http) {
        Ok(route) => route,
        Err(err) => return err.into_response(),
    };
    let repo = route.fingerprint.to_string();
    let endpoint = route.endpoint.label();

    // Pushes are rejected before any mirror work.
    if route.endpoint == GitEndpoint::ReceivePack {
        warn!(repo = %repo, "rejected git-receive-pack (push)");
        record_request(&state.metrics, &repo, endpoint, "forbidden", started);
        return (
            StatusCode::FORBIDDEN,
            "push (git-receive-pack) is not supported by this caching proxy\n",
        )
            .into_response();
    }

    let result = match route.endpoint {
        GitEndpoint::InfoRefs if method == Method::GET => {
            serve_info_refs(&state, &route, &headers).await
        }
        GitEndpoint::UploadPack if method == Method::POST => {
            serve_upload_pack(&state, &route, &headers, body).await
        }
        _ => {
            record_request(&state.metrics, &repo, endpoint, "method-not-allowed", started);
            return (
                StatusCode::METHOD_NOT_ALLOWED,
                "method not allowed for this git endpoint\n",
            )
                .into_response();
        }
    };

    let outcome = match &result {
        Ok(_) => "ok",
        Err(err) => err.kind(),
    };
    record_request(&state.metrics, &repo, endpoint, outcome, started);

    match result {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

/// `GET /<repo>/info/refs?service=git-upload-pack`
///
/// Refreshes the mirror (soft-failing to stale data when upstream is
/// unreachable) and serves the ref advertisement from local disk.
async fn serve_info_refs(
    state: &Arc<AppState>,
    route: &GitRoute,
    headers: &HeaderMap,
) -> Result<Response, ProxyError> {
    // The returned read lease keeps the eviction sweep off this mirror
    // until the advertisement has been produced.
    let (outcome, _lease) = state
        .sync
        .ensure_fresh(
            &route.fingerprint,
            route.scheme,
            RefreshPolicy::InfoRefs,
            authorization(headers),
        )
        .await?;
    record_cache_outcome(state, route, outcome);

    let path = state.store.resolve(&route.fingerprint);
    let advertisement = commands::advertise_refs(&path, git_protocol(headers).as_deref())
        .await
        .map_err(|e| ProxyError::Internal(format!("ref advertisement failed: {e}")))?;

    let mut body = commands::service_announcement("git-upload-pack");
    body.extend_from_slice(&advertisement);
    state.metrics.metrics.response_bytes.observe(body.len() as f64);

    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                "application/x-git-upload-pack-advertisement",
            ),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

/// `POST /<repo>/git-upload-pack`
///
/// Streams pack negotiation between the client and a local
/// `git upload-pack --stateless-rpc`. No upstream traffic unless the mirror
/// is missing entirely.
async fn serve_upload_pack(
    state: &Arc<AppState>,
    route: &GitRoute,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let (outcome, lease) = state
        .sync
        .ensure_fresh(
            &route.fingerprint,
            route.scheme,
            RefreshPolicy::OnMiss,
            authorization(headers),
        )
        .await?;
    record_cache_outcome(state, route, outcome);

    let request_body = decode_request_body(headers, body)?;
    let path = state.store.resolve(&route.fingerprint);
    let stream = commands::upload_pack_stream(&path, request_body, git_protocol(headers).as_deref())
        .await
        .map_err(|e| ProxyError::Internal(format!("git upload-pack failed: {e}")))?;

    // The meter holds the read lease until the body has fully streamed and
    // observes the bytes-out histogram when it drops.
    let meter = Arc::new(ResponseMeter::new(state.metrics.clone(), lease));
    let metered = stream.inspect(move |chunk| {
        if let Ok(chunk) = chunk {
            meter.add(chunk.len());
        }
    });

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/x-git-upload-pack-result"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(metered),
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Metrics endpoint
// ---------------------------------------------------------------------------

/// `GET /metrics` - Prometheus metrics in OpenMetrics text encoding.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, ProxyError> {
    let mut buf = String::new();
    prometheus_client::encoding::text::encode(&mut buf, &state.metrics.registry)
        .map_err(|e| ProxyError::Internal(format!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn authorization(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn git_protocol(headers: &HeaderMap) -> Option<String> {
    headers
        .get("git-protocol")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

/// Inflate a gzip-compressed request body; git clients compress larger
/// upload-pack negotiation requests.
fn decode_request_body(headers: &HeaderMap, body: Bytes) -> Result<Bytes, ProxyError> {
    let gzipped = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));
    if !gzipped {
        return Ok(body);
    }

    let mut decoder = GzDecoder::new(body.as_ref());
    let mut inflated = Vec::new();
    decoder
        .read_to_end(&mut inflated)
        .map_err(|e| ProxyError::InvalidRequest(format!("invalid gzip request body: {e}")))?;
    Ok(Bytes::from(inflated))
}

fn record_request(
    metrics: &MetricsRegistry,
    repo: &str,
    endpoint: &str,
    outcome: &str,
    started: Instant,
) {
    metrics
        .metrics
        .requests_total
        .get_or_create(&RequestLabels {
            repo: repo.to_string(),
            endpoint: endpoint.to_string(),
            outcome: outcome.to_string(),
        })
        .inc();
    metrics
        .metrics
        .request_duration_seconds
        .get_or_create(&EndpointLabels {
            endpoint: endpoint.to_string(),
        })
        .observe(started.elapsed().as_secs_f64());
}

/// A cache hit is a request served without any upstream network I/O.
fn record_cache_outcome(state: &Arc<AppState>, route: &GitRoute, outcome: SyncOutcome) {
    let labels = RepoLabels {
        repo: route.fingerprint.to_string(),
    };
    let metrics = &state.metrics.metrics;
    if outcome.performed_network() {
        metrics.cache_misses.get_or_create(&labels).inc();
    } else {
        metrics.cache_hits.get_or_create(&labels).inc();
    }
}

/// Keeps the mirror's read lease alive while a response body streams and
/// records the bytes-out histogram once the stream is dropped.
struct ResponseMeter {
    metrics: MetricsRegistry,
    bytes: AtomicU64,
    _lease: ReadLease,
}

impl ResponseMeter {
    fn new(metrics: MetricsRegistry, lease: ReadLease) -> Self {
        Self {
            metrics,
            bytes: AtomicU64::new(0),
            _lease: lease,
        }
    }

    fn add(&self, n: usize) {
        self.bytes.fetch_add(n as u64, Ordering::Relaxed);
    }
}

impl Drop for ResponseMeter {
    fn drop(&mut self) {
        self.metrics
            .metrics
            .response_bytes
            .observe(self.bytes.load(Ordering::Relaxed) as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn gzip_bodies_are_inflated() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"0000").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());

        let decoded = decode_request_body(&headers, Bytes::from(compressed)).unwrap();
        assert_eq!(decoded.as_ref(), b"0000");
    }

    #[test]
    fn uncompressed_bodies_pass_through() {
        let headers = HeaderMap::new();
        let body = Bytes::from_static(b"0032want deadbeef");
        assert_eq!(decode_request_body(&headers, body.clone()).unwrap(), body);
    }

    #[test]
    fn corrupt_gzip_is_an_invalid_request() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());
        let err = decode_request_body(&headers, Bytes::from_static(b"not gzip")).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidRequest(_)));
    }
}
