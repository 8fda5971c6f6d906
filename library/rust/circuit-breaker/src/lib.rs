pub mod breaker;
pub mod config;
pub mod error;
pub mod metrics;
pub mod registry;

pub use breaker::{
    CircuitBreaker, CircuitBreakerState, ExecutionResult, StateChangeListener,
    CIRCUIT_OPEN_MESSAGE, FALLBACK_FAILED_MESSAGE,
};
pub use config::{CircuitBreakerConfig, RegistryConfig};
pub use error::{CircuitBreakerError, ConfigError};
pub use metrics::CircuitBreakerMetrics;
pub use registry::CircuitBreakerRegistry;

#[cfg(feature = "mock")]
pub use breaker::MockStateChangeListener;
