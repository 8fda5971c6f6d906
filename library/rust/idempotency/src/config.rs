use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Idempotency-Key ヘッダー名
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// `ttl_secs` の上限（10 年）
pub const MAX_TTL_SECS: i64 = 10 * 365 * 24 * 60 * 60;

/// 冪等ストアとミドルウェアの設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// TTL（秒）。None の場合は無期限。
    pub ttl_secs: Option<i64>,
    /// ヘッダー名（デフォルト: "idempotency-key"）
    pub header_name: String,
    /// ハッシュ計算のためにバッファするリクエストボディの上限
    pub max_body_bytes: usize,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_secs: Some(86400), // 24時間
            header_name: IDEMPOTENCY_KEY_HEADER.to_string(),
            max_body_bytes: 1024 * 1024,
        }
    }
}

impl IdempotencyConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl_secs.is_some_and(|ttl| ttl <= 0) {
            return Err(ConfigError::Validation("ttl_secs must be > 0".into()));
        }
        if self.ttl_secs.is_some_and(|ttl| ttl > MAX_TTL_SECS) {
            return Err(ConfigError::Validation(format!(
                "ttl_secs must be <= {MAX_TTL_SECS}"
            )));
        }
        if self.header_name.trim().is_empty() {
            return Err(ConfigError::Validation("header_name is required".into()));
        }
        if http::HeaderName::from_bytes(self.header_name.as_bytes()).is_err() {
            return Err(ConfigError::Validation(format!(
                "header_name is not a valid HTTP header: {}",
                self.header_name
            )));
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::Validation(
                "max_body_bytes must be > 0".into(),
            ));
        }
        Ok(())
    }
}
