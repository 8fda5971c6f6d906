use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// サーキットブレーカーの閾値設定。
///
/// YAML ではミリ秒単位で `reset_timeout_ms` / `window_size_ms` を指定する。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// OPEN へ遷移するまでの失敗回数
    pub failure_threshold: u32,
    /// HALF_OPEN から CLOSED へ戻るのに必要な連続成功回数
    pub success_threshold: u32,
    /// OPEN から HALF_OPEN を試行するまでの待機時間
    #[serde(rename = "reset_timeout_ms", with = "duration_ms")]
    pub reset_timeout: Duration,
    /// 失敗集計ウィンドウ（参考値。失敗は CLOSED に戻るまで累積で数える）
    #[serde(rename = "window_size_ms", with = "duration_ms")]
    pub window_size: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
            window_size: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, success_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            reset_timeout,
            ..Self::default()
        }
    }

    pub fn with_window_size(mut self, window_size: Duration) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "failure_threshold must be > 0".into(),
            ));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::Validation(
                "success_threshold must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// レジストリ全体の設定。`breakers` に無い名前は `defaults` で生成される。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub defaults: CircuitBreakerConfig,
    pub breakers: HashMap<String, CircuitBreakerConfig>,
}

impl RegistryConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// YAML ファイルを読み込み RegistryConfig を返す。
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.defaults.validate()?;
        for (name, config) in &self.breakers {
            if name.is_empty() {
                return Err(ConfigError::Validation(
                    "breaker name must not be empty".into(),
                ));
            }
            config
                .validate()
                .map_err(|e| ConfigError::Validation(format!("breakers.{name}: {e}")))?;
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.success_threshold, 2);
        assert_eq!(config.reset_timeout, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_threshold_is_rejected() {
        let config = CircuitBreakerConfig::new(0, 1, Duration::from_secs(1));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("failure_threshold"));

        let config = CircuitBreakerConfig::new(1, 0, Duration::from_secs(1));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_registry_config_from_yaml() {
        let yaml = r"
defaults:
  failure_threshold: 4
  reset_timeout_ms: 15000
breakers:
  payments:
    failure_threshold: 3
    success_threshold: 1
    reset_timeout_ms: 30000
    window_size_ms: 120000
";
        let config = RegistryConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.defaults.failure_threshold, 4);
        // 省略したフィールドはデフォルト値
        assert_eq!(config.defaults.success_threshold, 2);
        assert_eq!(config.defaults.reset_timeout, Duration::from_millis(15000));

        let payments = &config.breakers["payments"];
        assert_eq!(payments.failure_threshold, 3);
        assert_eq!(payments.success_threshold, 1);
        assert_eq!(payments.reset_timeout, Duration::from_secs(30));
        assert_eq!(payments.window_size, Duration::from_secs(120));
    }

    #[test]
    fn test_registry_config_rejects_invalid_breaker() {
        let yaml = r"
breakers:
  database:
    failure_threshold: 0
";
        let err = RegistryConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("breakers.database"));
    }

    #[test]
    fn test_registry_config_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("breakers.yaml");
        std::fs::write(&path, "defaults:\n  failure_threshold: 7\n").unwrap();

        let config = RegistryConfig::load(&path).unwrap();
        assert_eq!(config.defaults.failure_threshold, 7);
        assert!(config.breakers.is_empty());
    }

    #[test]
    fn test_load_missing_file_returns_read_error() {
        let err = RegistryConfig::load("/nonexistent/breakers.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile(_)));
    }
}
