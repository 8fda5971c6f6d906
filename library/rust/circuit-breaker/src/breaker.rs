use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::error::CircuitBreakerError;
use crate::metrics::CircuitBreakerMetrics;

/// OPEN 中にフォールバック無しで呼ばれた場合のエラーメッセージ
pub const CIRCUIT_OPEN_MESSAGE: &str = "Circuit breaker is open";
/// フォールバック自体が失敗した場合のエラーメッセージ
pub const FALLBACK_FAILED_MESSAGE: &str = "Fallback also failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitBreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 状態遷移の通知先。ブレーカーのロック保持中に同期的に呼ばれる。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait StateChangeListener: Send + Sync {
    fn on_state_change(&self, name: &str, from: CircuitBreakerState, to: CircuitBreakerState);
}

/// `execute` 系の戻り値。想定内の失敗（OPEN・呼び出し失敗）はエラーではなくこの値で返す。
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub circuit_open: bool,
    pub state: CircuitBreakerState,
}

impl<T> ExecutionResult<T> {
    fn succeeded(data: T, circuit_open: bool, state: CircuitBreakerState) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            circuit_open,
            state,
        }
    }

    fn failed(error: impl Into<String>, circuit_open: bool, state: CircuitBreakerState) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            circuit_open,
            state,
        }
    }

    /// 成功なら `Ok(data)`、失敗ならエラーメッセージを返す。
    pub fn into_result(self) -> Result<T, String> {
        match self.data {
            Some(data) if self.success => Ok(data),
            _ => Err(self
                .error
                .unwrap_or_else(|| CIRCUIT_OPEN_MESSAGE.to_string())),
        }
    }
}

struct Inner {
    state: CircuitBreakerState,
    /// 状態遷移のたびに進む。遷移前に受け付けた呼び出しの結果を捨てるために使う。
    generation: u64,
    failure_count: u32,
    success_count: u32,
    state_changed_at: Instant,
    /// HALF_OPEN で試行中の呼び出しの開始時刻
    probe_started_at: Option<Instant>,
    last_failure: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    last_state_change: Option<DateTime<Utc>>,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    listener: Option<Arc<dyn StateChangeListener>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitBreakerState::Closed,
                generation: 0,
                failure_count: 0,
                success_count: 0,
                state_changed_at: Instant::now(),
                probe_started_at: None,
                last_failure: None,
                last_success: None,
                last_state_change: None,
            }),
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn StateChangeListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub async fn state(&self) -> CircuitBreakerState {
        let mut inner = self.inner.lock().await;
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    /// `f` をブレーカー越しに実行する。OPEN 中は `f` を呼ばずに即座に返す。
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> ExecutionResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let generation = match self.admit().await {
            Ok(generation) => generation,
            Err(state) => return ExecutionResult::failed(CIRCUIT_OPEN_MESSAGE, true, state),
        };

        match f().await {
            Ok(data) => {
                let state = self.on_success(generation).await;
                ExecutionResult::succeeded(data, false, state)
            }
            Err(e) => {
                let state = self.on_failure(generation).await;
                ExecutionResult::failed(e.to_string(), false, state)
            }
        }
    }

    /// `execute` と同様だが、OPEN 中または `f` の失敗時に `fallback` の結果を返す。
    pub async fn execute_with_fallback<F, Fut, G, GFut, T, E, GE>(
        &self,
        f: F,
        fallback: G,
    ) -> ExecutionResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T, GE>>,
        GE: fmt::Display,
    {
        let generation = match self.admit().await {
            Ok(generation) => generation,
            Err(state) => return self.run_fallback(fallback, true, state).await,
        };

        match f().await {
            Ok(data) => {
                let state = self.on_success(generation).await;
                ExecutionResult::succeeded(data, false, state)
            }
            Err(e) => {
                let state = self.on_failure(generation).await;
                tracing::warn!(
                    breaker = %self.name,
                    error = %e,
                    "呼び出しに失敗したためフォールバックを実行します"
                );
                self.run_fallback(fallback, false, state).await
            }
        }
    }

    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Ok(generation) = self.admit().await else {
            return Err(CircuitBreakerError::Open);
        };

        match f().await {
            Ok(result) => {
                self.on_success(generation).await;
                Ok(result)
            }
            Err(e) => {
                self.on_failure(generation).await;
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        self.apply_success(&mut inner);
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        self.apply_failure(&mut inner);
    }

    pub async fn metrics(&self) -> CircuitBreakerMetrics {
        let mut inner = self.inner.lock().await;
        self.maybe_transition_to_half_open(&mut inner);
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure: inner.last_failure,
            last_success: inner.last_success,
            last_state_change: inner.last_state_change,
        }
    }

    /// 現在の状態に関係なく CLOSED に戻し、カウンタを 0 にする。
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != CircuitBreakerState::Closed {
            self.transition(&mut inner, CircuitBreakerState::Closed);
        }
        inner.generation = inner.generation.wrapping_add(1);
        inner.failure_count = 0;
        inner.success_count = 0;
    }

    /// 運用上の強制遷移。通常の遷移ルールを経由しない。
    pub async fn force_state(&self, state: CircuitBreakerState) {
        let mut inner = self.inner.lock().await;
        tracing::warn!(
            breaker = %self.name,
            from = %inner.state,
            to = %state,
            "サーキットブレーカーの状態を強制変更します"
        );
        self.transition(&mut inner, state);
    }

    /// 呼び出しを受け付けるなら受付時の世代を、遮断するならその時点の状態を返す。
    /// HALF_OPEN では同時に 1 件だけ試行を通す。試行が `reset_timeout` を過ぎても
    /// 戻らない場合（呼び出し側のキャンセルなど）は次の呼び出しを試行として通す。
    async fn admit(&self) -> Result<u64, CircuitBreakerState> {
        let mut inner = self.inner.lock().await;
        self.maybe_transition_to_half_open(&mut inner);
        let state = inner.state;
        match state {
            CircuitBreakerState::Closed => Ok(inner.generation),
            CircuitBreakerState::Open => {
                tracing::debug!(breaker = %self.name, "サーキットが OPEN のため呼び出しを遮断しました");
                Err(CircuitBreakerState::Open)
            }
            CircuitBreakerState::HalfOpen => {
                let probing = inner
                    .probe_started_at
                    .is_some_and(|started| started.elapsed() < self.config.reset_timeout);
                if probing {
                    tracing::debug!(breaker = %self.name, "HALF_OPEN の試行中のため呼び出しを遮断しました");
                    return Err(CircuitBreakerState::HalfOpen);
                }
                inner.probe_started_at = Some(Instant::now());
                Ok(inner.generation)
            }
        }
    }

    async fn on_success(&self, generation: u64) -> CircuitBreakerState {
        let mut inner = self.inner.lock().await;
        if inner.generation == generation {
            self.apply_success(&mut inner);
        } else {
            tracing::debug!(breaker = %self.name, "状態遷移前に受け付けた呼び出しの成功を無視しました");
        }
        inner.state
    }

    async fn on_failure(&self, generation: u64) -> CircuitBreakerState {
        let mut inner = self.inner.lock().await;
        if inner.generation == generation {
            self.apply_failure(&mut inner);
        } else {
            tracing::debug!(breaker = %self.name, "状態遷移前に受け付けた呼び出しの失敗を無視しました");
        }
        inner.state
    }

    fn apply_success(&self, inner: &mut Inner) {
        inner.success_count = inner.success_count.saturating_add(1);
        inner.last_success = Some(Utc::now());
        inner.probe_started_at = None;

        if inner.state == CircuitBreakerState::HalfOpen
            && inner.success_count >= self.config.success_threshold
        {
            self.transition(inner, CircuitBreakerState::Closed);
        }
    }

    fn apply_failure(&self, inner: &mut Inner) {
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Utc::now());
        inner.probe_started_at = None;

        let state = inner.state;
        match state {
            CircuitBreakerState::HalfOpen => {
                self.transition(inner, CircuitBreakerState::Open);
            }
            CircuitBreakerState::Closed
                if inner.failure_count >= self.config.failure_threshold =>
            {
                self.transition(inner, CircuitBreakerState::Open);
            }
            _ => {}
        }
    }

    async fn run_fallback<G, GFut, T, GE>(
        &self,
        fallback: G,
        circuit_open: bool,
        state: CircuitBreakerState,
    ) -> ExecutionResult<T>
    where
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T, GE>>,
        GE: fmt::Display,
    {
        match fallback().await {
            Ok(data) => ExecutionResult::succeeded(data, circuit_open, state),
            Err(e) => {
                tracing::warn!(breaker = %self.name, error = %e, "フォールバックも失敗しました");
                ExecutionResult::failed(FALLBACK_FAILED_MESSAGE, circuit_open, state)
            }
        }
    }

    fn maybe_transition_to_half_open(&self, inner: &mut Inner) {
        if inner.state == CircuitBreakerState::Open
            && inner.state_changed_at.elapsed() >= self.config.reset_timeout
        {
            self.transition(inner, CircuitBreakerState::HalfOpen);
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitBreakerState) {
        let from = inner.state;
        inner.state = to;
        inner.generation = inner.generation.wrapping_add(1);
        inner.probe_started_at = None;
        inner.state_changed_at = Instant::now();
        inner.last_state_change = Some(Utc::now());

        match to {
            CircuitBreakerState::Closed => {
                inner.failure_count = 0;
                inner.success_count = 0;
            }
            CircuitBreakerState::Open | CircuitBreakerState::HalfOpen => {
                inner.success_count = 0;
            }
        }

        if to == CircuitBreakerState::Open {
            tracing::warn!(
                breaker = %self.name,
                from = %from,
                failure_count = inner.failure_count,
                "サーキットブレーカーが OPEN になりました"
            );
        } else {
            tracing::info!(breaker = %self.name, from = %from, to = %to, "サーキットブレーカーの状態遷移");
        }

        if let Some(listener) = &self.listener {
            listener.on_state_change(&self.name, from, to);
        }
    }
}
