pub mod backend;
pub mod config;
pub mod error;
pub mod hash;
pub mod layer;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod record;
pub mod store;

pub use backend::IdempotencyBackend;
pub use config::{IdempotencyConfig, IDEMPOTENCY_KEY_HEADER, MAX_TTL_SECS};
pub use error::{ConfigError, IdempotencyError};
pub use hash::{hash_bytes, hash_json, hash_request};
pub use layer::{
    idempotency_middleware, BodyEncoding, IdempotencyState, StoredResponseBody,
    IDEMPOTENT_REPLAYED_HEADER,
};
pub use memory::InMemoryIdempotencyBackend;
#[cfg(feature = "postgres")]
pub use postgres::PostgresIdempotencyBackend;
pub use record::{CachedResponse, IdempotencyRecord};
pub use store::{ClaimResult, IdempotencyStore};

#[cfg(feature = "mock")]
pub use backend::MockIdempotencyBackend;
