// =============================================================================
// Matrixon Client SDK - HTTP Executor Integration Tests
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Contributors: Matrixon Development Team
// Date: 2024-03-21
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   End-to-end tests of the retrying HTTP executor against a local axum
//   mock homeserver: retry classification, rate-limit handling, error
//   envelope parsing, implicit JSON bodies and streaming downloads.
//
// =============================================================================

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use reqwest::Method;
use serde_json::{json, Value};
use url::Url;

use matrixon_client::http::{HttpExecutor, HttpExecutorConfig, HttpRequest};
use matrixon_client::ClientError;

async fn spawn_server(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve mock server");
    });
    addr
}

fn executor(max_attempts: u32) -> HttpExecutor {
    HttpExecutor::new(HttpExecutorConfig {
        max_attempts,
        base_backoff: Duration::from_millis(20),
        ..HttpExecutorConfig::default()
    })
    .expect("build executor")
}

fn url_of(addr: SocketAddr, path: &str) -> Url {
    Url::parse(&format!("http://{addr}{path}")).expect("valid URL")
}

#[test_log::test(tokio::test)]
async fn retries_gateway_errors_until_success() {
    let hits = Arc::new(AtomicU32::new(0));
    let app = Router::new()
        .route(
            "/thing",
            get(|State(hits): State<Arc<AtomicU32>>| async move {
                if hits.fetch_add(1, Ordering::SeqCst) < 2 {
                    (StatusCode::SERVICE_UNAVAILABLE, Json(json!({}))).into_response()
                } else {
                    Json(json!({"ok": true})).into_response()
                }
            }),
        )
        .with_state(Arc::clone(&hits));
    let addr = spawn_server(app).await;

    let executor = executor(3);
    let response: Value = executor
        .execute(HttpRequest::new(Method::GET, url_of(addr, "/thing")))
        .await
        .expect("third attempt succeeds");
    assert_eq!(response, json!({"ok": true}));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[test_log::test(tokio::test)]
async fn gateway_errors_exhaust_attempts() {
    let hits = Arc::new(AtomicU32::new(0));
    let app = Router::new()
        .route(
            "/thing",
            get(|State(hits): State<Arc<AtomicU32>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (StatusCode::BAD_GATEWAY, Json(json!({})))
            }),
        )
        .with_state(Arc::clone(&hits));
    let addr = spawn_server(app).await;

    let executor = executor(2);
    let error = executor
        .execute::<Value>(HttpRequest::new(Method::GET, url_of(addr, "/thing")))
        .await
        .expect_err("all attempts fail");
    assert!(matches!(error, ClientError::Server { status: 502, .. }));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[test_log::test(tokio::test)]
async fn gateway_errors_carry_the_error_envelope() {
    let app = Router::new().route(
        "/thing",
        get(|| async {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"errcode": "M_UNAVAILABLE", "error": "try again later"})),
            )
        }),
    );
    let addr = spawn_server(app).await;

    let executor = executor(1);
    let error = executor
        .execute::<Value>(HttpRequest::new(Method::GET, url_of(addr, "/thing")))
        .await
        .expect_err("single attempt fails");
    match &error {
        ClientError::Server {
            status,
            errcode,
            message,
            ..
        } => {
            assert_eq!(*status, 503);
            assert_eq!(errcode.as_deref(), Some("M_UNAVAILABLE"));
            assert_eq!(message.as_deref(), Some("try again later"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(error.errcode(), Some("M_UNAVAILABLE"));
}

#[test_log::test(tokio::test)]
async fn retry_backoff_doubles_between_attempts() {
    let hit_times = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route(
            "/thing",
            get(|State(hit_times): State<Arc<Mutex<Vec<Instant>>>>| async move {
                hit_times.lock().unwrap().push(Instant::now());
                (StatusCode::SERVICE_UNAVAILABLE, Json(json!({})))
            }),
        )
        .with_state(Arc::clone(&hit_times));
    let addr = spawn_server(app).await;

    let executor = HttpExecutor::new(HttpExecutorConfig {
        max_attempts: 3,
        base_backoff: Duration::from_millis(100),
        ..HttpExecutorConfig::default()
    })
    .expect("build executor");
    let error = executor
        .execute::<Value>(HttpRequest::new(Method::GET, url_of(addr, "/thing")))
        .await
        .expect_err("all attempts fail");
    assert!(matches!(error, ClientError::Server { status: 503, .. }));

    let hit_times = hit_times.lock().unwrap();
    assert_eq!(hit_times.len(), 3);
    // base delay before the second attempt, doubled before the third
    assert!(hit_times[1] - hit_times[0] >= Duration::from_millis(100));
    assert!(hit_times[2] - hit_times[1] >= Duration::from_millis(200));
}

#[test_log::test(tokio::test)]
async fn client_errors_are_not_retried() {
    let hits = Arc::new(AtomicU32::new(0));
    let app = Router::new()
        .route(
            "/thing",
            get(|State(hits): State<Arc<AtomicU32>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (
                    StatusCode::FORBIDDEN,
                    Json(json!({"errcode": "M_FORBIDDEN", "error": "not allowed"})),
                )
            }),
        )
        .with_state(Arc::clone(&hits));
    let addr = spawn_server(app).await;

    let executor = executor(3);
    let error = executor
        .execute::<Value>(HttpRequest::new(Method::GET, url_of(addr, "/thing")))
        .await
        .expect_err("4xx is terminal");
    match &error {
        ClientError::Http {
            status,
            errcode,
            message,
            ..
        } => {
            assert_eq!(*status, 403);
            assert_eq!(errcode.as_deref(), Some("M_FORBIDDEN"));
            assert_eq!(message.as_deref(), Some("not allowed"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test_log::test(tokio::test)]
async fn rate_limit_waits_out_retry_after_body() {
    let hits = Arc::new(AtomicU32::new(0));
    let app = Router::new()
        .route(
            "/thing",
            get(|State(hits): State<Arc<AtomicU32>>| async move {
                if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                    (
                        StatusCode::TOO_MANY_REQUESTS,
                        Json(json!({
                            "errcode": "M_LIMIT_EXCEEDED",
                            "error": "slow down",
                            "retry_after_ms": 300
                        })),
                    )
                        .into_response()
                } else {
                    Json(json!({"ok": true})).into_response()
                }
            }),
        )
        .with_state(Arc::clone(&hits));
    let addr = spawn_server(app).await;

    let executor = executor(2);
    let started = Instant::now();
    let response: Value = executor
        .execute(HttpRequest::new(Method::GET, url_of(addr, "/thing")))
        .await
        .expect("second attempt succeeds");
    assert_eq!(response, json!({"ok": true}));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    // slept the server-specified delay, not the default backoff
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[test_log::test(tokio::test)]
async fn rate_limit_honors_retry_after_header() {
    let hits = Arc::new(AtomicU32::new(0));
    let app = Router::new()
        .route(
            "/thing",
            get(|State(hits): State<Arc<AtomicU32>>| async move {
                if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                    (
                        StatusCode::TOO_MANY_REQUESTS,
                        [(header::RETRY_AFTER, "1")],
                        Json(json!({"errcode": "M_LIMIT_EXCEEDED", "error": "slow down"})),
                    )
                        .into_response()
                } else {
                    Json(json!({"ok": true})).into_response()
                }
            }),
        )
        .with_state(Arc::clone(&hits));
    let addr = spawn_server(app).await;

    let executor = executor(2);
    let started = Instant::now();
    let _: Value = executor
        .execute(HttpRequest::new(Method::GET, url_of(addr, "/thing")))
        .await
        .expect("second attempt succeeds");
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[test_log::test(tokio::test)]
async fn rate_limit_surfaces_when_backoff_disabled() {
    let hits = Arc::new(AtomicU32::new(0));
    let app = Router::new()
        .route(
            "/thing",
            get(|State(hits): State<Arc<AtomicU32>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({
                        "errcode": "M_LIMIT_EXCEEDED",
                        "error": "slow down",
                        "retry_after_ms": 50
                    })),
                )
            }),
        )
        .with_state(Arc::clone(&hits));
    let addr = spawn_server(app).await;

    let executor = HttpExecutor::new(HttpExecutorConfig {
        max_attempts: 3,
        rate_limit_backoff: false,
        base_backoff: Duration::from_millis(20),
        ..HttpExecutorConfig::default()
    })
    .expect("build executor");
    let error = executor
        .execute::<Value>(HttpRequest::new(Method::GET, url_of(addr, "/thing")))
        .await
        .expect_err("429 surfaces immediately");
    match &error {
        ClientError::RateLimited {
            retry_after,
            errcode,
            ..
        } => {
            assert_eq!(*retry_after, Some(Duration::from_millis(50)));
            assert_eq!(errcode.as_deref(), Some("M_LIMIT_EXCEEDED"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test_log::test(tokio::test)]
async fn bodyless_post_sends_empty_json_object() {
    let app = Router::new().route(
        "/thing",
        post(|body: String| async move {
            assert_eq!(body, "{}");
            Json(json!({"ok": true}))
        }),
    );
    let addr = spawn_server(app).await;

    let executor = executor(1);
    let response: Value = executor
        .execute(HttpRequest::new(Method::POST, url_of(addr, "/thing")))
        .await
        .expect("request succeeds");
    assert_eq!(response, json!({"ok": true}));
}

#[test_log::test(tokio::test)]
async fn bearer_token_is_attached() {
    let app = Router::new().route(
        "/thing",
        get(|headers: axum::http::HeaderMap| async move {
            assert_eq!(
                headers
                    .get(header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok()),
                Some("Bearer syt_secret")
            );
            Json(json!({"ok": true}))
        }),
    );
    let addr = spawn_server(app).await;

    let executor = HttpExecutor::new(HttpExecutorConfig {
        access_token: Some("syt_secret".to_string()),
        ..HttpExecutorConfig::default()
    })
    .expect("build executor");
    let _: Value = executor
        .execute(HttpRequest::new(Method::GET, url_of(addr, "/thing")))
        .await
        .expect("request succeeds");
}

#[test_log::test(tokio::test)]
async fn downloads_stream_to_file() {
    let payload = "x".repeat(64 * 1024);
    let body = payload.clone();
    let app = Router::new().route("/blob", get(move || async move { body }));
    let addr = spawn_server(app).await;

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("blob.bin");
    let executor = executor(1);
    let written = executor
        .execute_to_file(HttpRequest::new(Method::GET, url_of(addr, "/blob")), &path)
        .await
        .expect("download succeeds");
    assert_eq!(written, payload.len() as u64);
    let contents = std::fs::read_to_string(&path).expect("read file");
    assert_eq!(contents, payload);
}
