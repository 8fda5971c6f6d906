use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::breaker::CircuitBreaker;
use crate::config::{CircuitBreakerConfig, RegistryConfig};
use crate::metrics::CircuitBreakerMetrics;

pub const PAYMENTS: &str = "payments";
pub const AI_EXTRACTION: &str = "ai-extraction";
pub const DATABASE_CACHE: &str = "database-cache";
pub const DATABASE: &str = "database";

/// 論理的な依存先ごとに 1 つのブレーカーを共有するためのレジストリ。
///
/// アプリケーションの起動処理で生成し、`Arc` で各ハンドラーへ渡す。
pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            defaults,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// コア依存先（決済・AI 抽出・キャッシュ・DB）のブレーカーを登録済みのレジストリを返す。
    pub fn with_default_breakers() -> Self {
        let breakers = default_breakers()
            .into_iter()
            .map(|(name, config)| (name.to_string(), Arc::new(CircuitBreaker::new(name, config))))
            .collect();
        Self {
            defaults: CircuitBreakerConfig::default(),
            breakers: RwLock::new(breakers),
        }
    }

    pub fn from_config(config: RegistryConfig) -> Self {
        let breakers = config
            .breakers
            .into_iter()
            .map(|(name, cfg)| {
                let breaker = Arc::new(CircuitBreaker::new(name.clone(), cfg));
                (name, breaker)
            })
            .collect();
        Self {
            defaults: config.defaults,
            breakers: RwLock::new(breakers),
        }
    }

    /// 名前付きブレーカーを返す。未登録ならデフォルト設定で生成する。
    pub async fn get_breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(name) {
            return breaker.clone();
        }

        let mut map = self.breakers.write().await;
        map.entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(breaker = name, "デフォルト設定でサーキットブレーカーを生成します");
                Arc::new(CircuitBreaker::new(name, self.defaults.clone()))
            })
            .clone()
    }

    /// 指定設定でブレーカーを生成する。同名のブレーカーは置き換えられ、履歴は引き継がない。
    pub async fn create_breaker(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(name, config));
        let mut map = self.breakers.write().await;
        if map.insert(name.to_string(), breaker.clone()).is_some() {
            tracing::info!(breaker = name, "既存のサーキットブレーカーを置き換えました");
        }
        breaker
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.breakers.read().await.contains_key(name)
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().await.values().cloned().collect();
        for breaker in breakers {
            breaker.reset().await;
        }
    }

    pub async fn all_metrics(&self) -> Vec<CircuitBreakerMetrics> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().await.values().cloned().collect();
        let mut metrics = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            metrics.push(breaker.metrics().await);
        }
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::with_default_breakers()
    }
}

fn default_breakers() -> [(&'static str, CircuitBreakerConfig); 4] {
    [
        (
            PAYMENTS,
            CircuitBreakerConfig::new(3, 2, Duration::from_secs(30)),
        ),
        (
            AI_EXTRACTION,
            CircuitBreakerConfig::new(5, 2, Duration::from_secs(60))
                .with_window_size(Duration::from_secs(120)),
        ),
        (
            DATABASE_CACHE,
            CircuitBreakerConfig::new(10, 3, Duration::from_secs(10))
                .with_window_size(Duration::from_secs(30)),
        ),
        (
            DATABASE,
            CircuitBreakerConfig::new(5, 3, Duration::from_secs(15)),
        ),
    ]
}
