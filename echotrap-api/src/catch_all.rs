//! The catch-all: every request that is not dashboard-control API traffic.
//!
//! Classification order: subdomain from the `Host` header's leading label,
//! else from a `/r/<sub>/` path prefix, else the request is for the
//! dashboard itself and the static asset tree (with SPA fallback) is served.
//! Subdomain requests are answered from the response tree and then logged
//! through the capture pipeline.

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::util::ServiceExt;
use tower_http::services::{ServeDir, ServeFile};
use tracing::{debug, warn};
use uuid::Uuid;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use echotrap_core::{subdomain, Capture, HttpCapture, ResponseFile};

use crate::conn::ReceivedHeaderCase;
use crate::rest::ApiError;
use crate::AppState;

/// Entry point registered as the router fallback for any method and path.
pub async fn catch_all(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(&state.config.server_domain)
        .to_string();

    let sub = subdomain::from_hostname(
        &host,
        &state.config.server_domain,
        &state.config.subdomain_alphabet,
        state.config.subdomain_length,
    )
    .or_else(|| {
        subdomain::from_path(
            request.uri().path(),
            &state.config.subdomain_alphabet,
            state.config.subdomain_length,
        )
    });

    match sub {
        None => serve_dashboard(&state, request).await,
        Some(sub) => match serve_capture(&state, &sub, &host, peer, request).await {
            Ok(response) => response,
            Err(err) => err.into_response(),
        },
    }
}

/// Static dashboard assets with SPA fallback. The asset service resolves
/// paths inside the asset root only; everything gets permissive CORS.
async fn serve_dashboard(state: &AppState, request: Request) -> Response {
    let public = &state.config.public_dir;
    let service =
        ServeDir::new(public).fallback(ServeFile::new(public.join("index.html")));

    let mut response = match service.oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    if response.status() == StatusCode::NOT_FOUND {
        // No asset and no SPA entry point to fall back on.
        response = (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Not found" })),
        )
            .into_response();
    }
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

/// Serve the subdomain's programmed response and log the request.
async fn serve_capture(
    state: &AppState,
    sub: &str,
    host: &str,
    peer: SocketAddr,
    request: Request,
) -> Result<Response, ApiError> {
    let tree = state.sessions.tree(sub).await?;
    let file = tree
        .resolve(request.uri().path())
        .cloned()
        .unwrap_or_else(|| ResponseFile {
            raw: String::new(),
            headers: Vec::new(),
            status_code: 200,
        });

    let capture = build_capture(state, sub, host, peer, request).await;
    state.sessions.log_capture(&capture).await?;

    Ok(render(&file))
}

/// Materialize a response leaf: decoded body, programmed headers, status.
fn render(file: &ResponseFile) -> Response {
    let body = BASE64.decode(&file.raw).unwrap_or_default();
    let status = StatusCode::from_u16(file.status_code).unwrap_or(StatusCode::OK);

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    for header in &file.headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(header.header.as_bytes()),
            HeaderValue::from_str(&header.value),
        ) else {
            debug!(header = %header.header, "skipping unrepresentable header");
            continue;
        };
        response.headers_mut().append(name, value);
    }
    response
}

/// The capture's header mapping: names exactly as received, in arrival
/// order, last value winning per name.
///
/// The connection layer records the raw head before the HTTP stack parses
/// (and lowercases) names; each recorded name is paired with its parsed
/// value by per-name occurrence. Without a recorded head (direct router
/// invocation) the parsed names are used as-is.
fn capture_headers(parts: &Parts) -> serde_json::Map<String, serde_json::Value> {
    let mut headers = serde_json::Map::new();

    match parts.extensions.get::<Arc<ReceivedHeaderCase>>() {
        Some(case) => {
            let mut occurrence: HashMap<String, usize> = HashMap::new();
            for name in case.names() {
                let lower = name.to_ascii_lowercase();
                let index = occurrence.entry(lower.clone()).or_insert(0);
                if let Some(value) = parts.headers.get_all(lower.as_str()).iter().nth(*index) {
                    headers.insert(
                        name.to_string(),
                        serde_json::Value::String(
                            String::from_utf8_lossy(value.as_bytes()).into_owned(),
                        ),
                    );
                }
                *index += 1;
            }
        }
        None => {
            for (name, value) in parts.headers.iter() {
                headers.insert(
                    name.as_str().to_string(),
                    serde_json::Value::String(
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    ),
                );
            }
        }
    }

    headers
}

/// Assemble the HTTP capture record, reading the body up to the configured
/// bound. Hitting the bound stops reading without failing; a client
/// disconnect mid-body leaves the partial body in the record.
async fn build_capture(
    state: &AppState,
    sub: &str,
    host: &str,
    peer: SocketAddr,
    request: Request,
) -> Capture {
    let (parts, body) = request.into_parts();
    let headers = capture_headers(&parts);

    let max = state.config.max_request_size;
    let mut collected: Vec<u8> = Vec::new();
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                collected.extend_from_slice(&bytes);
                if collected.len() >= max {
                    collected.truncate(max);
                    break;
                }
            }
            Err(err) => {
                warn!(%err, "request body ended early; logging partial body");
                break;
            }
        }
    }

    let path = parts.uri.path().to_string();
    let query = parts
        .uri
        .query()
        .map(|q| format!("?{}", q))
        .unwrap_or_default();
    let ip = peer.ip().to_string();

    Capture::Http(HttpCapture {
        id: Uuid::new_v4().to_string(),
        subdomain: sub.to_string(),
        country: state.geo.lookup(&ip).map(String::from),
        ip,
        port: peer.port(),
        date: chrono::Utc::now().timestamp(),
        raw: BASE64.encode(&collected),
        method: parts.method.to_string(),
        protocol: format!("{:?}", parts.version),
        headers,
        url: format!("http://{}{}", host, parts.uri),
        path,
        query,
        // Fragments never reach the server; kept for the dashboard shape.
        fragment: String::new(),
    })
}
