use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdempotencyError {
    /// ストレージの一意制約に違反した（同一キーの有効なレコードが既に存在する）
    #[error("重複リクエストです: key={key}")]
    Duplicate { key: String },
    #[error("無効な冪等キーです: {0}")]
    InvalidKey(String),
    #[error("シリアライズエラー: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("ストレージエラー: {0}")]
    StorageError(String),
}

impl IdempotencyError {
    /// 呼び出し側の判断で再試行してよいエラーかどうか。
    /// 再試行可能なエラーを「取得済み」とみなしてはならない。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageError(_) | Self::SerializationError(_))
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for IdempotencyError {
    fn from(err: sqlx::Error) -> Self {
        Self::StorageError(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),
    #[error("validation error: {0}")]
    Validation(String),
}
