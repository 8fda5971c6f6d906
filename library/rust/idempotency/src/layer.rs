use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};

use crate::backend::IdempotencyBackend;
use crate::config::IdempotencyConfig;
use crate::hash::hash_request;
use crate::record::CachedResponse;
use crate::store::{ClaimResult, IdempotencyStore};

/// リプレイしたレスポンスに付与するヘッダー
pub const IDEMPOTENT_REPLAYED_HEADER: &str = "x-idempotent-replayed";

/// ミドルウェアが `response_data` に保存するレスポンス本体。
/// 再生時にバイト列と Content-Type を元どおりに復元する。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponseBody {
    pub content_type: Option<String>,
    pub encoding: BodyEncoding,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyEncoding {
    /// UTF-8 テキストをそのまま保持する
    Text,
    /// UTF-8 でない本体を 16 進文字列で保持する
    Hex,
}

impl StoredResponseBody {
    pub fn capture(content_type: Option<&str>, body: &[u8]) -> Self {
        let (encoding, body) = match std::str::from_utf8(body) {
            Ok(text) => (BodyEncoding::Text, text.to_string()),
            Err(_) => (BodyEncoding::Hex, hex::encode(body)),
        };
        Self {
            content_type: content_type.map(ToString::to_string),
            encoding,
            body,
        }
    }

    pub fn bytes(&self) -> Result<Vec<u8>, hex::FromHexError> {
        match self.encoding {
            BodyEncoding::Text => Ok(self.body.clone().into_bytes()),
            BodyEncoding::Hex => hex::decode(&self.body),
        }
    }
}

/// axum middleware State に渡すストア（dyn dispatch）
#[derive(Clone)]
pub struct IdempotencyState {
    pub store: IdempotencyStore,
}

impl IdempotencyState {
    pub fn new(backend: Arc<dyn IdempotencyBackend>) -> Self {
        Self {
            store: IdempotencyStore::new(backend),
        }
    }

    pub fn with_config(backend: Arc<dyn IdempotencyBackend>, config: IdempotencyConfig) -> Self {
        Self {
            store: IdempotencyStore::with_config(backend, config),
        }
    }

    pub fn from_store(store: IdempotencyStore) -> Self {
        Self { store }
    }
}

/// axum ミドルウェア関数
///
/// `axum::middleware::from_fn_with_state` で利用する。
///
/// ```ignore
/// use axum::{Router, middleware};
/// use tablekit_idempotency::{idempotency_middleware, IdempotencyState, InMemoryIdempotencyBackend};
///
/// let state = IdempotencyState::new(Arc::new(InMemoryIdempotencyBackend::new()));
/// let app = Router::new()
///     .route("/orders", post(create_order))
///     .layer(middleware::from_fn_with_state(state, idempotency_middleware));
/// ```
pub async fn idempotency_middleware(
    State(state): State<IdempotencyState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let config = state.store.config();
    let idempotency_key = req
        .headers()
        .get(config.header_name.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string);

    let Some(key) = idempotency_key else {
        return next.run(req).await;
    };

    // ボディをバッファしてリクエストハッシュを計算する
    let (parts, body) = req.into_parts();
    let Ok(body_bytes) = axum::body::to_bytes(body, config.max_body_bytes).await else {
        return (
            StatusCode::PAYLOAD_TOO_LARGE,
            "リクエストボディが大きすぎます",
        )
            .into_response();
    };
    let request_hash = hash_request(parts.method.as_str(), parts.uri.path(), &body_bytes);
    let req = Request::from_parts(parts, Body::from(body_bytes));

    match state.store.claim(&key, &request_hash).await {
        Ok(ClaimResult::Acquired) => {}
        Ok(ClaimResult::InProgress) => {
            return (StatusCode::CONFLICT, "リクエストは現在処理中です").into_response();
        }
        Ok(ClaimResult::HashMismatch) => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                "冪等キーが異なるリクエストで再利用されています",
            )
                .into_response();
        }
        Ok(ClaimResult::Cached { response }) => return replay(response),
        Err(e) => {
            // 取得できたか不明な状態でハンドラーを実行すると二重実行になりうる
            tracing::warn!(idempotency_key = %key, error = %e, "idempotency store claim error");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                "冪等ストアが利用できません",
            )
                .into_response();
        }
    }

    // ハンドラー実行
    let response = next.run(req).await;

    let (parts, body) = response.into_parts();
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::warn!(idempotency_key = %key, error = %e, "failed to read handler response");
            release(&state.store, &key).await;
            return Response::from_parts(parts, Body::empty());
        }
    };

    if parts.status.is_server_error() {
        // 5xx は再試行可能とし、結果を保存しない
        release(&state.store, &key).await;
    } else {
        let content_type = parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        let stored = StoredResponseBody::capture(content_type, &body_bytes);
        match serde_json::to_value(&stored) {
            Ok(response_data) => {
                if let Err(e) = state
                    .store
                    .store(&key, &request_hash, response_data, parts.status.as_u16())
                    .await
                {
                    tracing::warn!(idempotency_key = %key, error = %e, "idempotency store save error");
                }
            }
            Err(e) => {
                tracing::warn!(idempotency_key = %key, error = %e, "failed to encode handler response");
                release(&state.store, &key).await;
            }
        }
    }

    Response::from_parts(parts, Body::from(body_bytes))
}

async fn release(store: &IdempotencyStore, key: &str) {
    if let Err(e) = store.release(key).await {
        tracing::warn!(idempotency_key = %key, error = %e, "idempotency store release error");
    }
}

fn replay(response: CachedResponse) -> Response {
    let status = StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::OK);

    if let Ok(stored) = serde_json::from_value::<StoredResponseBody>(response.response_data.clone()) {
        let Ok(body) = stored.bytes() else {
            tracing::warn!("stored idempotent response body is corrupted");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        };
        let mut replayed = axum::http::Response::builder()
            .status(status)
            .header(IDEMPOTENT_REPLAYED_HEADER, "true");
        if let Some(content_type) = &stored.content_type {
            replayed = replayed.header(header::CONTENT_TYPE, content_type.as_str());
        }
        return replayed
            .body(Body::from(body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }

    // `IdempotencyStore::store` を直接呼んで保存された値
    match response.response_data {
        serde_json::Value::String(text) => {
            (status, [(IDEMPOTENT_REPLAYED_HEADER, "true")], text).into_response()
        }
        data => (
            status,
            [
                (IDEMPOTENT_REPLAYED_HEADER, "true"),
                (header::CONTENT_TYPE.as_str(), "application/json"),
            ],
            data.to_string(),
        )
            .into_response(),
    }
}
