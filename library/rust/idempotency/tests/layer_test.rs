use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware;
use axum::routing::post;
use axum::{Json, Router};
use http::Request;
use http_body_util::BodyExt;
use serde_json::json;
use tablekit_idempotency::{
    idempotency_middleware, BodyEncoding, IdempotencyBackend, IdempotencyConfig,
    IdempotencyRecord, IdempotencyState, InMemoryIdempotencyBackend, StoredResponseBody,
    IDEMPOTENCY_KEY_HEADER, IDEMPOTENT_REPLAYED_HEADER,
};
use tower::ServiceExt;

fn app(backend: Arc<InMemoryIdempotencyBackend>, calls: Arc<AtomicU32>) -> Router {
    app_with_config(backend, calls, IdempotencyConfig::default())
}

fn app_with_config(
    backend: Arc<InMemoryIdempotencyBackend>,
    calls: Arc<AtomicU32>,
    config: IdempotencyConfig,
) -> Router {
    let state = IdempotencyState::with_config(backend as Arc<dyn IdempotencyBackend>, config);
    let order_calls = calls.clone();
    let fail_calls = calls;
    Router::new()
        .route(
            "/orders",
            post(move || {
                let calls = order_calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    (
                        StatusCode::CREATED,
                        Json(json!({"ok": true, "orderId": format!("ord-{n}")})),
                    )
                }
            }),
        )
        .route("/text", post(|| async { "created" }))
        .route("/greeting", post(|| async { Json("hello") }))
        .route(
            "/receipt.csv",
            post(|| async { ([(header::CONTENT_TYPE, "text/csv")], "item,qty\nramen,2\n") }),
        )
        .route(
            "/receipt.bin",
            post(|| async {
                (
                    [(header::CONTENT_TYPE, "application/octet-stream")],
                    vec![0xff_u8, 0x00, 0xfe, 0x80],
                )
            }),
        )
        .route(
            "/payments",
            post(move || {
                let calls = fail_calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::BAD_GATEWAY, "processor unavailable")
                }
            }),
        )
        .layer(middleware::from_fn_with_state(state, idempotency_middleware))
}

fn request(uri: &str, key: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(k) = key {
        builder = builder.header(IDEMPOTENCY_KEY_HEADER, k);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn send(app: Router, req: Request<Body>) -> (u16, Option<String>, String) {
    let response = app.oneshot(req).await.unwrap();
    let status = response.status().as_u16();
    let replayed = response
        .headers()
        .get(IDEMPOTENT_REPLAYED_HEADER)
        .map(|v| v.to_str().unwrap().to_string());
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, replayed, String::from_utf8_lossy(&body).to_string())
}

async fn send_raw(app: Router, req: Request<Body>) -> (u16, HeaderMap, Vec<u8>) {
    let response = app.oneshot(req).await.unwrap();
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body.to_vec())
}

#[tokio::test]
async fn test_no_idempotency_key_passes_through() {
    let backend = Arc::new(InMemoryIdempotencyBackend::new());
    let calls = Arc::new(AtomicU32::new(0));

    for _ in 0..2 {
        let (status, replayed, _) = send(
            app(backend.clone(), calls.clone()),
            request("/orders", None, "{}"),
        )
        .await;
        assert_eq!(status, 201);
        assert!(replayed.is_none());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(backend.is_empty().await);
}

#[tokio::test]
async fn test_duplicate_request_replays_original_response() {
    let backend = Arc::new(InMemoryIdempotencyBackend::new());
    let calls = Arc::new(AtomicU32::new(0));
    let body = r#"{"items":[{"sku":"ramen","qty":2}]}"#;

    let (s1, r1, b1) = send(
        app(backend.clone(), calls.clone()),
        request("/orders", Some("order-1"), body),
    )
    .await;
    assert_eq!(s1, 201);
    assert!(r1.is_none());

    let (s2, r2, b2) = send(
        app(backend.clone(), calls.clone()),
        request("/orders", Some("order-1"), body),
    )
    .await;
    assert_eq!(s2, 201);
    assert_eq!(r2.as_deref(), Some("true"));
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&b2).unwrap(),
        serde_json::from_str::<serde_json::Value>(&b1).unwrap()
    );
    // ハンドラーは 1 回しか実行されない
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_text_response_is_replayed_verbatim() {
    let backend = Arc::new(InMemoryIdempotencyBackend::new());
    let calls = Arc::new(AtomicU32::new(0));

    send(app(backend.clone(), calls.clone()), request("/text", Some("t-1"), "")).await;
    let (status, replayed, body) =
        send(app(backend.clone(), calls), request("/text", Some("t-1"), "")).await;

    assert_eq!(status, 200);
    assert_eq!(replayed.as_deref(), Some("true"));
    assert_eq!(body, "created");
}

#[tokio::test]
async fn test_reused_key_with_different_body_is_rejected() {
    let backend = Arc::new(InMemoryIdempotencyBackend::new());
    let calls = Arc::new(AtomicU32::new(0));

    send(
        app(backend.clone(), calls.clone()),
        request("/orders", Some("order-2"), r#"{"table":1}"#),
    )
    .await;
    let (status, _, _) = send(
        app(backend.clone(), calls.clone()),
        request("/orders", Some("order-2"), r#"{"table":2}"#),
    )
    .await;

    assert_eq!(status, 422);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_in_flight_request_returns_conflict() {
    let backend = Arc::new(InMemoryIdempotencyBackend::new());
    let calls = Arc::new(AtomicU32::new(0));
    backend
        .insert(IdempotencyRecord::new("order-3", "whatever", Some(60)))
        .await
        .unwrap();

    let (status, _, _) = send(
        app(backend.clone(), calls.clone()),
        request("/orders", Some("order-3"), "{}"),
    )
    .await;

    assert_eq!(status, 409);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_server_error_releases_claim() {
    let backend = Arc::new(InMemoryIdempotencyBackend::new());
    let calls = Arc::new(AtomicU32::new(0));

    for _ in 0..2 {
        let (status, replayed, _) = send(
            app(backend.clone(), calls.clone()),
            request("/payments", Some("pay-1"), "{}"),
        )
        .await;
        assert_eq!(status, 502);
        assert!(replayed.is_none());
    }
    // 5xx は保存されないため再試行で再実行される
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(backend.get("pay-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_different_keys_are_independent() {
    let backend = Arc::new(InMemoryIdempotencyBackend::new());
    let calls = Arc::new(AtomicU32::new(0));

    let (s1, _, _) = send(
        app(backend.clone(), calls.clone()),
        request("/orders", Some("key-a"), "{}"),
    )
    .await;
    let (s2, _, _) = send(
        app(backend.clone(), calls.clone()),
        request("/orders", Some("key-b"), "{}"),
    )
    .await;
    assert_eq!(s1, 201);
    assert_eq!(s2, 201);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_store_records_finalized_response() {
    let backend = Arc::new(InMemoryIdempotencyBackend::new());
    let calls = Arc::new(AtomicU32::new(0));

    send(
        app(backend.clone(), calls),
        request("/orders", Some("check-store"), "{}"),
    )
    .await;

    let record = backend.get("check-store").await.unwrap().unwrap();
    assert!(record.is_finalized());
    assert_eq!(record.status_code, Some(201));

    let stored: StoredResponseBody =
        serde_json::from_value(record.response_data.unwrap()).unwrap();
    assert_eq!(stored.content_type.as_deref(), Some("application/json"));
    assert_eq!(stored.encoding, BodyEncoding::Text);
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&stored.body).unwrap(),
        json!({"ok": true, "orderId": "ord-1"})
    );
}

#[tokio::test]
async fn test_replay_preserves_body_and_content_type() {
    let backend = Arc::new(InMemoryIdempotencyBackend::new());
    let calls = Arc::new(AtomicU32::new(0));

    for uri in ["/greeting", "/receipt.csv", "/receipt.bin"] {
        let key = format!("replay{uri}");
        let (s1, h1, b1) = send_raw(
            app(backend.clone(), calls.clone()),
            request(uri, Some(key.as_str()), "{}"),
        )
        .await;
        let (s2, h2, b2) = send_raw(
            app(backend.clone(), calls.clone()),
            request(uri, Some(key.as_str()), "{}"),
        )
        .await;

        assert_eq!(s2, s1, "{uri}");
        assert_eq!(b2, b1, "{uri}");
        assert_eq!(h2.get(header::CONTENT_TYPE), h1.get(header::CONTENT_TYPE), "{uri}");
        assert!(h1.get(IDEMPOTENT_REPLAYED_HEADER).is_none());
        assert_eq!(h2.get(IDEMPOTENT_REPLAYED_HEADER).unwrap(), "true");
    }

    let (_, headers, body) = send_raw(
        app(backend.clone(), calls.clone()),
        request("/greeting", Some("replay/greeting"), "{}"),
    )
    .await;
    assert_eq!(body, b"\"hello\"");
    assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "application/json");

    let record = backend.get("replay/receipt.bin").await.unwrap().unwrap();
    let stored: StoredResponseBody =
        serde_json::from_value(record.response_data.unwrap()).unwrap();
    assert_eq!(stored.encoding, BodyEncoding::Hex);
    assert_eq!(stored.bytes().unwrap(), vec![0xff, 0x00, 0xfe, 0x80]);
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let backend = Arc::new(InMemoryIdempotencyBackend::new());
    let calls = Arc::new(AtomicU32::new(0));
    let config = IdempotencyConfig {
        max_body_bytes: 8,
        ..IdempotencyConfig::default()
    };

    let (status, _, _) = send(
        app_with_config(backend.clone(), calls.clone(), config),
        request("/orders", Some("big"), r#"{"items":[1,2,3,4,5]}"#),
    )
    .await;

    assert_eq!(status, 413);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(backend.is_empty().await);
}

#[tokio::test]
async fn test_custom_header_name() {
    let backend = Arc::new(InMemoryIdempotencyBackend::new());
    let calls = Arc::new(AtomicU32::new(0));
    let config = IdempotencyConfig {
        header_name: "x-request-key".to_string(),
        ..IdempotencyConfig::default()
    };

    let req = Request::builder()
        .method("POST")
        .uri("/orders")
        .header("x-request-key", "custom-1")
        .body(Body::empty())
        .unwrap();
    send(app_with_config(backend.clone(), calls, config), req).await;

    assert!(backend.get("custom-1").await.unwrap().is_some());
}
