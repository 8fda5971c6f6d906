use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// 確定済みレコードから再生するレスポンス
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status_code: u16,
    pub response_data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub request_hash: String,
    /// None の間は処理中（ロックとして機能する）
    pub response_data: Option<serde_json::Value>,
    pub status_code: Option<u16>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// `now + secs`。表現できない範囲は `DateTime::<Utc>::MAX_UTC` に丸める。
fn expiry_after(now: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
    TimeDelta::try_seconds(secs)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl IdempotencyRecord {
    pub fn new(key: impl Into<String>, request_hash: impl Into<String>, ttl_secs: Option<i64>) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            request_hash: request_hash.into(),
            response_data: None,
            status_code: None,
            created_at: now,
            expires_at: ttl_secs.map(|secs| expiry_after(now, secs)),
            completed_at: None,
        }
    }

    /// クレーム無しで保存する場合に使う確定済みレコード
    pub fn finalized(
        key: impl Into<String>,
        request_hash: impl Into<String>,
        response_data: serde_json::Value,
        status_code: u16,
        ttl_secs: Option<i64>,
    ) -> Self {
        Self::new(key, request_hash, ttl_secs).complete(response_data, status_code)
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| exp <= Utc::now())
    }

    pub fn is_finalized(&self) -> bool {
        self.response_data.is_some()
    }

    pub fn complete(mut self, response_data: serde_json::Value, status_code: u16) -> Self {
        self.response_data = Some(response_data);
        self.status_code = Some(status_code);
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn cached_response(&self) -> Option<CachedResponse> {
        let response_data = self.response_data.clone()?;
        Some(CachedResponse {
            status_code: self.status_code.unwrap_or(200),
            response_data,
        })
    }
}
