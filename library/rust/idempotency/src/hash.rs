//! リクエストハッシュの計算
//!
//! 同一キーで異なるペイロードが送られたことを検出するために使う。

use sha2::{Digest, Sha256};

use crate::IdempotencyError;

pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// メソッド・パス・ボディを改行区切りで連結した SHA-256
pub fn hash_request(method: &str, path: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.to_ascii_uppercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// JSON をキー順に正規化してからハッシュする。フィールド順はハッシュに影響しない。
pub fn hash_json(value: &serde_json::Value) -> Result<String, IdempotencyError> {
    // preserve_order feature が有効でもキー順になるよう明示的に並べ替える
    let canonical = serde_json::to_vec(&canonicalize(value))?;
    Ok(hash_bytes(&canonical))
}

fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            serde_json::Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}
