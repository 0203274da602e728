//! End-to-end flows over the HTTP engine: mint a session, hit the capture
//! subdomain, program responses, manage DNS records, and walk the capture
//! log through tombstoning and purge.

use axum::body::{to_bytes, Body};
use axum::extract::connect_info::ConnectInfo;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;

use echotrap_api::HttpGateway;
use echotrap_core::geo::GeoTable;
use echotrap_core::EchotrapConfig;
use echotrap_store::{SessionStore, Store};

struct Harness {
    router: Router,
    sessions: SessionStore,
}

fn harness_with(config: EchotrapConfig) -> Harness {
    let config = Arc::new(config);
    let store = Store::open_temporary().unwrap();
    let sessions = SessionStore::new(store.handle(), config.clone());
    let gateway = HttpGateway::new(
        config,
        sessions.clone(),
        Arc::new(GeoTable::empty()),
        CancellationToken::new(),
    );
    Harness {
        router: gateway.router(),
        sessions,
    }
}

fn harness() -> Harness {
    harness_with(EchotrapConfig::default())
}

fn peer() -> ConnectInfo<SocketAddr> {
    ConnectInfo(SocketAddr::from(([203, 0, 113, 7], 40000)))
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, value)
}

async fn send_raw(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>, axum::http::HeaderMap) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec(), headers)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn subdomain_request(sub: &str, path_and_query: &str, method: &str, body: &[u8]) -> Request<Body> {
    let mut request = Request::builder()
        .method(method)
        .uri(path_and_query)
        .header(header::HOST, format!("{}.localhost", sub))
        .body(Body::from(body.to_vec()))
        .unwrap();
    request.extensions_mut().insert(peer());
    request
}

async fn mint(router: &Router) -> (String, String) {
    let (status, body) = send(
        router,
        Request::builder()
            .method("POST")
            .uri("/api/get_token")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    (
        body["token"].as_str().unwrap().to_string(),
        body["subdomain"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn mint_hit_observe() {
    let h = harness();
    let (token, sub) = mint(&h.router).await;
    assert_eq!(sub.len(), 8);

    // Live fan-out: subscribe before the hit, like a dashboard session.
    let mut rx = h.sessions.subscribe(&sub);

    // Hitting any path on the subdomain host serves the seeded index.html.
    let (status, body, headers) = send_raw(
        &h.router,
        subdomain_request(&sub, "/hello", "GET", b""),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
    assert_eq!(
        headers.get("content-type").unwrap(),
        "text/html; charset=utf-8"
    );
    assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");

    // The capture streamed to the subscriber...
    let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(frame["type"], "http");
    assert_eq!(frame["method"], "GET");
    assert_eq!(frame["path"], "/hello");
    assert_eq!(frame["subdomain"], sub);

    // ...and landed in the log.
    let (status, listed) = send(&h.router, get(&format!("/api/requests?token={}", token))).await;
    assert_eq!(status, StatusCode::OK);
    let listed = listed.as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["id"], frame["id"]);
    assert_eq!(listed[0]["ip"], "203.0.113.7");
    assert_eq!(listed[0]["protocol"], "HTTP/1.1");

    // The default tree is visible over the files API.
    let (status, files) = send(&h.router, get(&format!("/api/files?token={}", token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(files["index.html"]["raw"], "");
    assert_eq!(files["index.html"]["status_code"], 200);
}

#[tokio::test]
async fn custom_response_per_path() {
    let h = harness();
    let (token, sub) = mint(&h.router).await;

    let tree = serde_json::json!({
        "api/v1": {
            "raw": "cG9uZw==",
            "headers": [{"header": "Content-Type", "value": "text/plain"}],
            "status_code": 201
        },
        "index.html": {"raw": "", "headers": [], "status_code": 200}
    });
    let (status, body) = send(
        &h.router,
        post_json(&format!("/api/files?token={}", token), tree.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["msg"], "Updated files");

    let (status, body, headers) =
        send_raw(&h.router, subdomain_request(&sub, "/api/v1", "GET", b"")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body, b"pong");
    assert_eq!(headers.get("content-type").unwrap(), "text/plain");

    // Below the flat leaf: root index.html fallback.
    let (status, body, _) = send_raw(
        &h.router,
        subdomain_request(&sub, "/api/v1/unknown", "GET", b""),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());

    // Applying the same tree twice is observationally identical.
    send(
        &h.router,
        post_json(&format!("/api/files?token={}", token), tree.clone()),
    )
    .await;
    let (_, files) = send(&h.router, get(&format!("/api/files?token={}", token))).await;
    assert_eq!(files, tree);
}

#[tokio::test]
async fn files_update_rejects_missing_index_and_bad_leaves() {
    let h = harness();
    let (token, _) = mint(&h.router).await;

    let no_index = serde_json::json!({
        "page": {"raw": "", "headers": [], "status_code": 200}
    });
    let (status, body) = send(
        &h.router,
        post_json(&format!("/api/files?token={}", token), no_index),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "index.html cannot be deleted");

    let malformed = serde_json::json!({
        "index.html": {"raw": 42, "headers": [], "status_code": 200}
    });
    let (status, body) = send(
        &h.router,
        post_json(&format!("/api/files?token={}", token), malformed),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().unwrap().contains("Invalid file structure"));
}

#[tokio::test]
async fn update_file_replaces_only_the_index_leaf() {
    let h = harness();
    let (token, sub) = mint(&h.router).await;

    let (status, body) = send(
        &h.router,
        post_json(
            &format!("/api/update_file?token={}", token),
            serde_json::json!({
                "raw": "aGVsbG8=",
                "headers": [{"header": "Content-Type", "value": "text/plain"}],
                "status_code": 418
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["msg"], "Updated response");

    let (status, leaf) = send(&h.router, get(&format!("/api/get_file?token={}", token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(leaf["raw"], "aGVsbG8=");
    assert_eq!(leaf["status_code"], 418);

    let (status, body, _) = send_raw(&h.router, subdomain_request(&sub, "/", "GET", b"")).await;
    assert_eq!(status, StatusCode::IM_A_TEAPOT);
    assert_eq!(body, b"hello");
}

#[tokio::test]
async fn dns_records_update_resolve_and_reject_atomically() {
    let h = harness();
    let (token, sub) = mint(&h.router).await;

    let (status, body) = send(
        &h.router,
        post_json(
            &format!("/api/update_dns?token={}", token),
            serde_json::json!({
                "records": [{"domain": "a", "type": 0, "value": "1.2.3.4%5.6.7.8"}]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["msg"], "Updated DNS records");

    let (status, records) = send(&h.router, get(&format!("/api/get_dns?token={}", token))).await;
    assert_eq!(status, StatusCode::OK);
    let expected_fqdn = format!("a.{}.localhost.", sub);
    assert_eq!(
        records,
        serde_json::json!([
            {"domain": expected_fqdn, "type": "A", "value": "1.2.3.4%5.6.7.8"}
        ])
    );

    // The resolver bucket agrees with the aggregate.
    let bucket = h
        .sessions
        .resolver_values("A", &expected_fqdn)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bucket, vec!["1.2.3.4%5.6.7.8"]);

    // One invalid record rejects the whole submission and persists nothing.
    let too_long = "a".repeat(64);
    let (status, body) = send(
        &h.router,
        post_json(
            &format!("/api/update_dns?token={}", token),
            serde_json::json!({
                "records": [
                    {"domain": "fresh", "type": 0, "value": "9.9.9.9"},
                    {"domain": too_long, "type": 0, "value": "x"}
                ]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().unwrap().contains("too long"));

    let (_, records) = send(&h.router, get(&format!("/api/get_dns?token={}", token))).await;
    assert_eq!(records.as_array().unwrap().len(), 1);
    assert!(h
        .sessions
        .resolver_values("A", &format!("fresh.{}.localhost.", sub))
        .await
        .unwrap()
        .is_none());

    // Clearing the records leaves an empty aggregate.
    let (status, _) = send(
        &h.router,
        post_json(
            &format!("/api/update_dns?token={}", token),
            serde_json::json!({"records": []}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, records) = send(&h.router, get(&format!("/api/get_dns?token={}", token))).await;
    assert_eq!(records, serde_json::json!([]));
}

#[tokio::test]
async fn tombstone_and_purge_walk_the_capture_log() {
    let h = harness();
    let (token, sub) = mint(&h.router).await;

    for path in ["/one", "/two", "/three"] {
        let (status, _, _) =
            send_raw(&h.router, subdomain_request(&sub, path, "GET", b"")).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (_, listed) = send(&h.router, get(&format!("/api/requests?token={}", token))).await;
    let ids: Vec<String> = listed
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids.len(), 3);

    // Tombstone the middle capture: list shrinks, slot becomes `{}`.
    let (status, body) = send(
        &h.router,
        post_json(
            &format!("/api/delete_request?token={}", token),
            serde_json::json!({"id": ids[1]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["msg"], "Deleted request");

    let raw = h
        .sessions
        .store()
        .range(&format!("requests:{}", sub))
        .await
        .unwrap();
    assert_eq!(raw.len(), 3);
    assert_eq!(raw[1], "{}");

    let (_, listed) = send(&h.router, get(&format!("/api/requests?token={}", token))).await;
    let remaining: Vec<&str> = listed
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["id"].as_str().unwrap())
        .collect();
    assert_eq!(remaining, vec![ids[0].as_str(), ids[2].as_str()]);

    // The shared lookup treats a tombstoned capture as gone.
    let (status, _) = send(
        &h.router,
        get(&format!("/api/get_request?subdomain={}&id={}", sub, ids[1])),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, shared) = send(
        &h.router,
        get(&format!("/api/get_request?subdomain={}&id={}", sub, ids[0])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(shared["id"], ids[0].as_str());

    // Purge drops the list and every secondary index.
    let (status, body) = send(
        &h.router,
        post_json(&format!("/api/delete_all?token={}", token), serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["msg"], "Deleted all requests");

    let (_, listed) = send(&h.router, get(&format!("/api/requests?token={}", token))).await;
    assert!(listed.as_array().unwrap().is_empty());
    assert!(h
        .sessions
        .store()
        .get(&format!("request:{}:{}", sub, ids[0]))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn auth_is_required_and_bearer_equals_query() {
    let h = harness();
    let (token, _) = mint(&h.router).await;

    let (status, body) = send(&h.router, get("/api/files")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().is_some());

    let (status, _) = send(&h.router, get("/api/files?token=not-a-token")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let bearer = Request::builder()
        .uri("/api/files")
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap();
    let (status, files) = send(&h.router, bearer).await;
    assert_eq!(status, StatusCode::OK);
    assert!(files.get("index.html").is_some());
}

#[tokio::test]
async fn shared_lookup_rejects_malformed_coordinates() {
    let h = harness();

    let (status, _) = send(
        &h.router,
        get("/api/get_request?subdomain=abcd1234&id=not-a-uuid"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &h.router,
        get(&format!(
            "/api/get_request?subdomain=bad$sub&id={}",
            uuid::Uuid::new_v4()
        )),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn request_body_capture_is_bounded() {
    let h = harness_with(EchotrapConfig {
        max_request_size: 16,
        ..EchotrapConfig::default()
    });
    let (token, sub) = mint(&h.router).await;

    let oversized = vec![b'x'; 64];
    let (status, _, _) = send_raw(
        &h.router,
        subdomain_request(&sub, "/upload", "POST", &oversized),
    )
    .await;
    // Reaching the bound stops the read without failing the request.
    assert_eq!(status, StatusCode::OK);

    let (_, listed) = send(&h.router, get(&format!("/api/requests?token={}", token))).await;
    let raw = listed.as_array().unwrap()[0]["raw"].as_str().unwrap().to_string();
    let body = {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.decode(raw).unwrap()
    };
    assert_eq!(body.len(), 16);
    assert!(body.iter().all(|b| *b == b'x'));
}

#[tokio::test]
async fn header_case_is_preserved_exactly_in_captures() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let config = Arc::new(EchotrapConfig::default());
    let store = Store::open_temporary().unwrap();
    let sessions = SessionStore::new(store.handle(), config.clone());
    let shutdown = CancellationToken::new();
    let gateway = HttpGateway::new(
        config,
        sessions.clone(),
        Arc::new(GeoTable::empty()),
        shutdown.clone(),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move { gateway.serve_listener(listener).await });

    let sub = sessions.mint_subdomain().await.unwrap();

    // Deliberately unusual casing: the capture must echo it byte-for-byte.
    let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET /probe HTTP/1.1\r\nHost: {}.localhost\r\nx-CUSTOM-Header: WeIrD\r\nACCEPT-language: en\r\n\r\n",
        sub
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert!(response.starts_with(b"HTTP/1.1 200"));

    let mut captures = Vec::new();
    for _ in 0..50 {
        captures = sessions.list_captures(&sub, 0, 0).await.unwrap();
        if !captures.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(captures.len(), 1);

    let headers = &captures[0]["headers"];
    assert_eq!(headers["x-CUSTOM-Header"], "WeIrD");
    assert_eq!(headers["ACCEPT-language"], "en");
    assert_eq!(headers["Host"], format!("{}.localhost", sub));
    // No synthesized casings alongside the received ones.
    assert!(headers.get("X-Custom-Header").is_none());
    assert!(headers.get("x-custom-header").is_none());
    assert!(headers.get("accept-language").is_none());

    shutdown.cancel();
    let _ = server.await;
}

#[tokio::test]
async fn dashboard_without_assets_is_a_json_404_with_cors() {
    let h = harness_with(EchotrapConfig {
        public_dir: std::path::PathBuf::from("./definitely-not-there"),
        ..EchotrapConfig::default()
    });

    let mut request = Request::builder()
        .uri("/some/dashboard/route")
        .body(Body::empty())
        .unwrap();
    request.extensions_mut().insert(peer());

    let (status, body, headers) = send_raw(&h.router, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"], "Not found");
}

#[tokio::test]
async fn path_prefix_identifies_the_subdomain_without_a_host_match() {
    let h = harness();
    let (token, sub) = mint(&h.router).await;

    let mut request = Request::builder()
        .uri(format!("/r/{}/probe", sub))
        .body(Body::empty())
        .unwrap();
    request.extensions_mut().insert(peer());
    let (status, _, _) = send_raw(&h.router, request).await;
    assert_eq!(status, StatusCode::OK);

    let (_, listed) = send(&h.router, get(&format!("/api/requests?token={}", token))).await;
    let capture = &listed.as_array().unwrap()[0];
    assert_eq!(capture["path"], format!("/r/{}/probe", sub));
    assert_eq!(capture["subdomain"], sub);
}
