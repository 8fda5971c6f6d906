use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{IdempotencyError, IdempotencyRecord};

/// 冪等レコードの永続化アダプタ。
///
/// `insert` はストレージ層の一意制約で原子的に行うこと。読み取ってから書き込む実装は競合する。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait IdempotencyBackend: Send + Sync {
    /// 新規レコードを挿入する（有効な同一キーが存在すれば Err(Duplicate)、期限切れなら置き換える）
    async fn insert(&self, record: IdempotencyRecord) -> Result<(), IdempotencyError>;
    /// レコードを取得する（期限切れは None を返す）
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError>;
    /// 確定済みレコードを保存する（行が無ければ挿入する）
    async fn finalize(&self, record: IdempotencyRecord) -> Result<(), IdempotencyError>;
    /// レコードを削除する
    async fn delete(&self, key: &str) -> Result<bool, IdempotencyError>;
    /// 未確定（処理中）のレコードだけを削除する。確認と削除は原子的に行うこと。
    async fn delete_in_flight(&self, key: &str) -> Result<bool, IdempotencyError>;
    /// `now` 時点で期限切れのレコードを削除し、削除件数を返す
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, IdempotencyError>;
}
