use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::breaker::CircuitBreakerState;

/// ダッシュボード・アラート向けのスナップショット
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitBreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_state_change: Option<DateTime<Utc>>,
}
