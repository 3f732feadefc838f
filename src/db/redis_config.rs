use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::app_config::RedisSettings;

/// Redis connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisPoolConfig {
    pub redis_url: String,
    pub pool_size: u32,
    pub connection_timeout: Duration,
    pub command_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
}

impl RedisPoolConfig {
    pub fn from_settings(settings: &RedisSettings) -> Self {
        Self {
            redis_url: settings.url.clone(),
            pool_size: settings.pool_size,
            connection_timeout: Duration::from_secs(settings.connection_timeout),
            command_timeout: Duration::from_secs(settings.command_timeout),
            retry_attempts: settings.retry_attempts,
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
        }
    }

    /// Validate configuration before the pool starts connecting
    pub fn validate(&self) -> Result<(), String> {
        if self.redis_url.is_empty() {
            return Err("Redis URL cannot be empty".to_string());
        }
        if self.pool_size == 0 {
            return Err("Pool size must be greater than 0".to_string());
        }
        if self.pool_size > 1000 {
            return Err("Pool size too large (max: 1000)".to_string());
        }
        if self.connection_timeout.is_zero() {
            return Err("Connection timeout must be greater than 0".to_string());
        }
        if self.retry_attempts == 0 {
            return Err("Retry attempts must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_config::AppConfig;

    #[test]
    fn test_from_settings() {
        let config = RedisPoolConfig::from_settings(&AppConfig::for_test().redis);
        assert!(config.validate().is_ok());
        assert_eq!(config.pool_size, 2);
    }

    #[test]
    fn test_validation_rejects_empty_url() {
        let mut config = RedisPoolConfig::from_settings(&AppConfig::for_test().redis);
        config.redis_url = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_pool() {
        let mut config = RedisPoolConfig::from_settings(&AppConfig::for_test().redis);
        config.pool_size = 0;
        assert!(config.validate().is_err());
    }
}
