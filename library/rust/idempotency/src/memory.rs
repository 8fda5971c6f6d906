use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::backend::IdempotencyBackend;
use crate::{IdempotencyError, IdempotencyRecord};

/// プロセス内の冪等バックエンド。単一ノード構成とテストで使う。
#[derive(Clone)]
pub struct InMemoryIdempotencyBackend {
    data: Arc<RwLock<HashMap<String, IdempotencyRecord>>>,
}

impl InMemoryIdempotencyBackend {
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

impl Default for InMemoryIdempotencyBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyBackend for InMemoryIdempotencyBackend {
    async fn insert(&self, record: IdempotencyRecord) -> Result<(), IdempotencyError> {
        // 存在確認と挿入は同じ書き込みロック内で行う
        let mut map = self.data.write().await;
        if let Some(existing) = map.get(&record.key) {
            if !existing.is_expired() {
                return Err(IdempotencyError::Duplicate {
                    key: record.key.clone(),
                });
            }
        }
        map.insert(record.key.clone(), record);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        let map = self.data.read().await;
        Ok(map.get(key).filter(|r| !r.is_expired()).cloned())
    }

    async fn finalize(&self, record: IdempotencyRecord) -> Result<(), IdempotencyError> {
        let mut map = self.data.write().await;
        if let Some(existing) = map.get_mut(&record.key).filter(|r| !r.is_expired()) {
            existing.request_hash = record.request_hash;
            existing.response_data = record.response_data;
            existing.status_code = record.status_code;
            existing.completed_at = record.completed_at;
            return Ok(());
        }
        map.insert(record.key.clone(), record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, IdempotencyError> {
        let mut map = self.data.write().await;
        Ok(map.remove(key).is_some())
    }

    async fn delete_in_flight(&self, key: &str) -> Result<bool, IdempotencyError> {
        let mut map = self.data.write().await;
        if map.get(key).is_some_and(|r| !r.is_finalized()) {
            map.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, IdempotencyError> {
        let mut map = self.data.write().await;
        let before = map.len();
        map.retain(|_, record| record.expires_at.map_or(true, |exp| exp > now));
        Ok((before - map.len()) as u64)
    }
}
