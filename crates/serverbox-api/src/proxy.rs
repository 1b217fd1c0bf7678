use std::pin::Pin;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::stream::{self, Stream, StreamExt};
use serverbox_domain::InstanceId;
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, warn};

use crate::auth::constant_time_eq;
use crate::error::ApiError;
use crate::state::AppState;

/// Headers that must never cross a proxy hop (RFC 7230 §6.1) plus `host`,
/// which is re-derived for the upstream request.
const STRIPPED_HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Caller-supplied auth headers that must not leak to the upstream server —
/// the proxy injects its own upstream credentials instead.
const STRIPPED_CALLER_AUTH: &[&str] = &[
    "authorization",
    "x-daytona-preview-token",
    "x-serverbox-admin-key",
    "x-serverbox-proxy-key",
];

/// Error surfaced by [`with_idle_timeout`]: either the upstream connection
/// itself failed, or no chunk arrived before the idle deadline.
#[derive(Debug)]
enum StreamError {
    Upstream(reqwest::Error),
    Idle,
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::Upstream(e) => write!(f, "{e}"),
            StreamError::Idle => write!(f, "idle timeout waiting for upstream data"),
        }
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StreamError::Upstream(e) => Some(e),
            StreamError::Idle => None,
        }
    }
}

/// Wraps an upstream byte stream so a gap of more than `idle` between chunks
/// fails the stream, without bounding the total duration of a long-lived
/// response (e.g. SSE). The stream ends after the first error.
fn with_idle_timeout(
    stream: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
    idle: Duration,
) -> impl Stream<Item = Result<Bytes, StreamError>> + Send + 'static {
    let boxed: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>> = Box::pin(stream);
    stream::unfold(Some(boxed), move |state| async move {
        let mut s = state?;
        match tokio_timeout(idle, s.next()).await {
            Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some(s))),
            Ok(Some(Err(e))) => Some((Err(StreamError::Upstream(e)), None)),
            Ok(None) => None,
            Err(_) => Some((Err(StreamError::Idle), None)),
        }
    })
}

pub async fn proxy_root(state: State<AppState>, req: Request) -> Response {
    proxy(state, Path((extract_instance_id(&req), String::new())), req).await
}

pub async fn proxy_with_suffix(
    state: State<AppState>,
    Path((instance_id, suffix)): Path<(String, String)>,
    req: Request,
) -> Response {
    proxy(state, Path((instance_id, suffix)), req).await
}

fn extract_instance_id(req: &Request) -> String {
    req.uri()
        .path()
        .trim_start_matches("/i/")
        .trim_end_matches('/')
        .to_string()
}

async fn proxy(
    State(state): State<AppState>,
    Path((instance_id, suffix)): Path<(String, String)>,
    req: Request,
) -> Response {
    if let Some(key) = state.proxy_api_key.as_ref() {
        let provided = req
            .headers()
            .get("x-serverbox-proxy-key")
            .and_then(|v| v.to_str().ok());
        match provided {
            Some(given) if constant_time_eq(given, key) => {}
            _ => return ApiError::unauthorized("Unauthorized proxy request.").into_response(),
        }
    }

    if instance_id.is_empty() {
        return ApiError::bad_request("missing instance id").into_response();
    }

    match forward(&state, &instance_id, &suffix, req).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

async fn forward(
    state: &AppState,
    instance_id: &str,
    suffix: &str,
    req: Request,
) -> Result<Response, ApiError> {
    let original_host = req
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let id = InstanceId::new(instance_id);
    let current = state.manager.get(&id).await?;
    let record = if current.is_running() {
        current
    } else if !state.auto_resume {
        return Err(ApiError::from(serverbox_lifecycle::LifecycleError::InstanceNotRunning(
            id.to_string(),
        )));
    } else {
        state.resume.ensure_running(&id, state.resume_timeout_ms).await?
    };

    let base_url = record.url.as_deref().unwrap_or("").trim_end_matches('/');
    let query = req.uri().query().map(|q| format!("?{q}")).unwrap_or_default();
    let suffix = if suffix.is_empty() || suffix.starts_with('/') {
        suffix.to_string()
    } else {
        format!("/{suffix}")
    };
    let upstream_url = format!("{base_url}{suffix}{query}");

    let method = req.method().clone();
    let mut upstream_headers = HeaderMap::new();
    for (name, value) in req.headers() {
        if STRIPPED_HOP_BY_HOP.contains(&name.as_str()) || STRIPPED_CALLER_AUTH.contains(&name.as_str()) {
            continue;
        }
        upstream_headers.insert(name.clone(), value.clone());
    }

    let basic = STANDARD.encode(format!("{}:{}", record.username, record.password));
    upstream_headers.insert(
        axum::http::header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Basic {basic}")).expect("base64 is valid header value"),
    );
    if let Some(token) = &record.preview_token {
        upstream_headers.insert(
            HeaderName::from_static("x-daytona-preview-token"),
            HeaderValue::from_str(token).map_err(|e| ApiError::bad_request(e.to_string()))?,
        );
    }
    if !original_host.is_empty() {
        upstream_headers.insert(
            HeaderName::from_static("x-forwarded-host"),
            HeaderValue::from_str(&original_host).map_err(|e| ApiError::bad_request(e.to_string()))?,
        );
    }
    upstream_headers.insert(
        HeaderName::from_static("x-forwarded-proto"),
        HeaderValue::from_static("http"),
    );

    let body_stream = req.into_body().into_data_stream();
    let upstream_body = reqwest::Body::wrap_stream(body_stream);

    debug!(instance_id, %upstream_url, "forwarding proxy request");

    let upstream_resp = state
        .http
        .request(method, &upstream_url)
        .headers(upstream_headers)
        .body(upstream_body)
        .send()
        .await
        .map_err(|e| {
            warn!(instance_id, error = %e, "upstream proxy request failed");
            e
        });

    let upstream_resp = match upstream_resp {
        Ok(resp) => resp,
        Err(e) => {
            return Ok(ApiError::bad_gateway("Upstream proxy request failed", e.to_string()));
        }
    };

    let status = upstream_resp.status();
    let mut resp_headers = HeaderMap::new();
    for (name, value) in upstream_resp.headers() {
        if STRIPPED_HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        resp_headers.insert(name.clone(), value.clone());
    }

    let idle_timeout = Duration::from_millis(state.request_timeout_ms);
    let body = Body::from_stream(with_idle_timeout(upstream_resp.bytes_stream(), idle_timeout));
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = resp_headers;
    Ok(response)
}
