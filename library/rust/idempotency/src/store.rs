use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::backend::IdempotencyBackend;
use crate::config::IdempotencyConfig;
use crate::record::{CachedResponse, IdempotencyRecord};
use crate::IdempotencyError;

/// 挿入が一意制約で弾かれた後にレコードが消えていた場合の再挿入回数
const MAX_CLAIM_ATTEMPTS: usize = 2;

/// `IdempotencyStore::claim` の結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClaimResult {
    /// クレームを取得した。呼び出し側は処理を実行し `store` を呼ぶ。
    Acquired,
    /// 同じキーの処理が実行中。副作用を再実行してはならない。
    InProgress,
    /// 確定済みのレスポンスをそのまま再生する。
    Cached { response: CachedResponse },
    /// 同じキーが異なるペイロードで再利用された。
    HashMismatch,
}

/// 冪等キーのクレームプロトコル。
///
/// 排他制御はバックエンドの一意制約だけに依存する。複数プロセスから同じバックエンドを共有してよい。
#[derive(Clone)]
pub struct IdempotencyStore {
    backend: Arc<dyn IdempotencyBackend>,
    config: IdempotencyConfig,
}

impl IdempotencyStore {
    pub fn new(backend: Arc<dyn IdempotencyBackend>) -> Self {
        Self {
            backend,
            config: IdempotencyConfig::default(),
        }
    }

    pub fn with_config(backend: Arc<dyn IdempotencyBackend>, config: IdempotencyConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    pub async fn claim(
        &self,
        key: &str,
        request_hash: &str,
    ) -> Result<ClaimResult, IdempotencyError> {
        validate_key(key)?;

        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let record = IdempotencyRecord::new(key, request_hash, self.config.ttl_secs);
            match self.backend.insert(record).await {
                Ok(()) => {
                    tracing::debug!(idempotency_key = key, "冪等キーのクレームを取得しました");
                    return Ok(ClaimResult::Acquired);
                }
                Err(IdempotencyError::Duplicate { .. }) => {}
                Err(e) => return Err(e),
            }

            let Some(existing) = self.backend.get(key).await? else {
                // 挿入と読み取りの間に期限切れ・削除された
                continue;
            };

            let result = match existing.cached_response() {
                None => ClaimResult::InProgress,
                Some(_) if existing.request_hash != request_hash => ClaimResult::HashMismatch,
                Some(response) => ClaimResult::Cached { response },
            };
            match &result {
                ClaimResult::HashMismatch => tracing::warn!(
                    idempotency_key = key,
                    "冪等キーが異なるリクエストで再利用されました"
                ),
                ClaimResult::InProgress => {
                    tracing::debug!(idempotency_key = key, "同じキーのリクエストが処理中です");
                }
                _ => tracing::debug!(idempotency_key = key, "確定済みレスポンスを再生します"),
            }
            return Ok(result);
        }

        Ok(ClaimResult::InProgress)
    }

    /// クレームを確定しレスポンスを保存する。クレーム行が無い場合も確定済みレコードとして保存する。
    pub async fn store(
        &self,
        key: &str,
        request_hash: &str,
        response_data: serde_json::Value,
        status_code: u16,
    ) -> Result<(), IdempotencyError> {
        validate_key(key)?;
        let record = IdempotencyRecord::finalized(
            key,
            request_hash,
            response_data,
            status_code,
            self.config.ttl_secs,
        );
        self.backend.finalize(record).await?;
        tracing::debug!(idempotency_key = key, status_code, "冪等レスポンスを保存しました");
        Ok(())
    }

    /// 未確定のクレームを破棄し、後続のリトライが再取得できるようにする。
    /// 確定済みレコードは削除しない。
    pub async fn release(&self, key: &str) -> Result<bool, IdempotencyError> {
        validate_key(key)?;
        let released = self.backend.delete_in_flight(key).await?;
        if released {
            tracing::debug!(idempotency_key = key, "冪等キーのクレームを解放しました");
        }
        Ok(released)
    }

    pub async fn cleanup(&self) -> Result<u64, IdempotencyError> {
        let removed = self.backend.delete_expired(Utc::now()).await?;
        if removed > 0 {
            tracing::info!(removed, "期限切れの冪等レコードを削除しました");
        }
        Ok(removed)
    }
}

fn validate_key(key: &str) -> Result<(), IdempotencyError> {
    if key.trim().is_empty() {
        return Err(IdempotencyError::InvalidKey("キーが空です".into()));
    }
    Ok(())
}
