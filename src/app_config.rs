// Centralized configuration management for the auth core
// Load ALL env vars ONCE at startup, validate, then hand out typed settings

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Global application configuration loaded once at startup.
///
/// Library consumers that construct services directly should prefer passing
/// explicit settings structs; the Lazy global exists for binary embedders.
pub static CONFIG: Lazy<AppConfig> = Lazy::new(|| {
    dotenv::dotenv().ok();
    AppConfig::from_env().expect("Failed to load configuration")
});

/// Convenience accessor for the global configuration
pub fn config() -> &'static AppConfig {
    &CONFIG
}

/// Parse a human-friendly duration string: `"<n>(s|m|h|d)"`.
///
/// Bare numbers are treated as seconds. Unparseable input falls back to
/// 3600 seconds so a typo in an env var degrades instead of breaking login.
pub fn parse_duration_secs(input: &str) -> u64 {
    const FALLBACK_SECS: u64 = 3600;

    let trimmed = input.trim();
    if trimmed.is_empty() {
        return FALLBACK_SECS;
    }

    if let Ok(n) = trimmed.parse::<u64>() {
        return n;
    }

    if !trimmed.is_char_boundary(trimmed.len() - 1) {
        return FALLBACK_SECS;
    }
    let (value, unit) = trimmed.split_at(trimmed.len() - 1);
    let multiplier = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => return FALLBACK_SECS,
    };

    match value.parse::<u64>() {
        Ok(n) => n.saturating_mul(multiplier),
        Err(_) => FALLBACK_SECS,
    }
}

/// Complete application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub environment: Environment,

    pub redis: RedisSettings,
    pub database: DatabaseSettings,
    pub jwt: JwtSettings,
    pub session: SessionSettings,
    pub cache: CacheSettings,
    pub security: SecuritySettings,
    pub threat: ThreatSettings,
    pub blacklist: BlacklistSettings,
    pub keycloak: KeycloakSettings,
    pub rate_limit: RateLimitSettings,
}

/// Environment type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Environment {
    Development,
    Test,
    Staging,
    Production,
}

impl From<String> for Environment {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "test" => Environment::Test,
            "staging" | "stage" => Environment::Staging,
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Test => write!(f, "test"),
            Environment::Staging => write!(f, "staging"),
            Environment::Production => write!(f, "production"),
        }
    }
}

/// Redis connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    pub url: String,
    pub pool_size: u32,
    pub connection_timeout: u64,
    pub command_timeout: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

/// User mirror database settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: u64,
    pub idle_timeout: u64,
    pub max_lifetime: u64,
}

/// JWT signing and validation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtSettings {
    pub secret: String,
    pub access_expiry: u64,
    pub refresh_expiry: u64,
    pub issuer: String,
    pub audience: String,
    /// Revoke the old refresh token jti after a successful refresh.
    pub rotate_refresh_tokens: bool,
}

/// Session lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    pub ttl: u64,
    pub refresh_threshold: u64,
    pub max_concurrent_sessions: usize,
    pub enforce_ip_consistency: bool,
    pub enforce_user_agent_consistency: bool,
    pub token_encryption: bool,
    pub rotation_interval: u64,
    pub encryption_master_key: String,
    pub key_derivation_iterations: u32,
}

/// Secure cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    pub enabled: bool,
    pub jwt_ttl: u64,
    pub api_key_ttl: u64,
    pub session_ttl: u64,
    pub user_info_ttl: u64,
    pub token_capacity: usize,
    pub data_capacity: usize,
}

/// API-key and comparison hardening settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySettings {
    pub constant_time_comparison: bool,
    pub api_key_hash_rounds: u32,
    pub api_key_prefix: String,
    pub api_key_preview_length: usize,
}

/// Threat detection thresholds (durations in seconds)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatSettings {
    pub max_failed_attempts: u32,
    pub lockout_duration: u64,
    pub brute_force_window: u64,
    pub ip_block_duration: u64,
    pub suspicious_activity_threshold: u32,
    pub enable_auto_lockout: bool,
    pub enable_ip_blocking: bool,
}

/// Token blacklist settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistSettings {
    pub key_prefix: String,
    pub circuit_breaker: CircuitBreakerSettings,
    pub performance: BlacklistPerformanceSettings,
    pub retention: RetentionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    pub threshold: u32,
    pub timeout_ms: u64,
    pub reset_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistPerformanceSettings {
    pub batch_size: usize,
    pub max_concurrent: usize,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionSettings {
    pub token_ttl_days: u64,
    pub user_ttl_days: u64,
    pub audit_ttl_days: u64,
}

/// Identity provider (Keycloak) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeycloakSettings {
    pub base_url: String,
    pub realm: String,
    pub client_id: String,
    pub client_secret: String,
    pub admin_username: String,
    pub admin_password: String,
    pub request_timeout: u64,
}

/// Sliding-window rate limit settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub login: WindowLimit,
    pub register: WindowLimit,
    pub refresh: WindowLimit,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowLimit {
    pub max_requests: u32,
    pub window_seconds: u64,
    pub block_duration: u64,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let jwt_secret =
            env::var("JWT_SECRET").map_err(|_| ConfigError::MissingVar("JWT_SECRET".into()))?;

        let config = Self {
            environment: Environment::from(env_or("ENVIRONMENT", "development")),

            redis: RedisSettings {
                url: env_or("REDIS_URL", "redis://127.0.0.1:6379"),
                pool_size: env_parse("REDIS_POOL_SIZE", 10),
                connection_timeout: env_parse("REDIS_CONNECTION_TIMEOUT", 5),
                command_timeout: env_parse("REDIS_COMMAND_TIMEOUT", 2),
                retry_attempts: env_parse("REDIS_RETRY_ATTEMPTS", 3),
                retry_delay_ms: env_parse("REDIS_RETRY_DELAY_MS", 100),
            },

            database: DatabaseSettings {
                url: env_or("DATABASE_URL", ""),
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: env_parse("DATABASE_MIN_CONNECTIONS", 1),
                connect_timeout: env_parse("DATABASE_CONNECT_TIMEOUT", 5),
                idle_timeout: env_parse("DATABASE_IDLE_TIMEOUT", 300),
                max_lifetime: env_parse("DATABASE_MAX_LIFETIME", 1800),
            },

            jwt: JwtSettings {
                secret: jwt_secret,
                access_expiry: parse_duration_secs(&env_or("JWT_EXPIRES_IN", "1h")),
                refresh_expiry: parse_duration_secs(&env_or("JWT_REFRESH_EXPIRES_IN", "7d")),
                issuer: env_or("JWT_ISSUER", "ntx-auth"),
                audience: env_or("JWT_AUDIENCE", "ntx-api"),
                rotate_refresh_tokens: env_bool("JWT_ROTATE_REFRESH_TOKENS", true),
            },

            session: SessionSettings {
                ttl: env_parse("SESSION_TTL", 3600),
                refresh_threshold: env_parse("SESSION_REFRESH_THRESHOLD", 300),
                max_concurrent_sessions: env_parse("SESSION_MAX_CONCURRENT", 5),
                enforce_ip_consistency: env_bool("SESSION_ENFORCE_IP", true),
                enforce_user_agent_consistency: env_bool("SESSION_ENFORCE_USER_AGENT", false),
                token_encryption: env_bool("SESSION_TOKEN_ENCRYPTION", true),
                rotation_interval: env_parse("SESSION_ROTATION_INTERVAL", 86400),
                encryption_master_key: env_or("SESSION_ENCRYPTION_KEY", ""),
                key_derivation_iterations: env_parse("KEY_DERIVATION_ITERATIONS", 100_000),
            },

            cache: CacheSettings {
                enabled: env_bool("CACHE_ENABLED", true),
                jwt_ttl: env_parse("CACHE_JWT_TTL", 300),
                api_key_ttl: env_parse("CACHE_API_KEY_TTL", 600),
                session_ttl: env_parse("CACHE_SESSION_TTL", 3600),
                user_info_ttl: env_parse("CACHE_USER_INFO_TTL", 1800),
                token_capacity: env_parse("CACHE_TOKEN_CAPACITY", 1000),
                data_capacity: env_parse("CACHE_DATA_CAPACITY", 10_000),
            },

            security: SecuritySettings {
                constant_time_comparison: env_bool("CONSTANT_TIME_COMPARISON", true),
                api_key_hash_rounds: env_parse("API_KEY_HASH_ROUNDS", 12),
                api_key_prefix: env_or("API_KEY_PREFIX", "ntx"),
                api_key_preview_length: env_parse("API_KEY_PREVIEW_LENGTH", 12),
            },

            threat: ThreatSettings {
                max_failed_attempts: env_parse("THREAT_MAX_FAILED_ATTEMPTS", 5),
                lockout_duration: env_parse("THREAT_LOCKOUT_DURATION", 900),
                brute_force_window: env_parse("THREAT_BRUTE_FORCE_WINDOW", 600),
                ip_block_duration: env_parse("THREAT_IP_BLOCK_DURATION", 3600),
                suspicious_activity_threshold: env_parse("THREAT_SUSPICIOUS_THRESHOLD", 10),
                enable_auto_lockout: env_bool("THREAT_AUTO_LOCKOUT", true),
                enable_ip_blocking: env_bool("THREAT_IP_BLOCKING", true),
            },

            blacklist: BlacklistSettings {
                key_prefix: env_or("BLACKLIST_KEY_PREFIX", ""),
                circuit_breaker: CircuitBreakerSettings {
                    threshold: env_parse("BLACKLIST_CB_THRESHOLD", 5),
                    timeout_ms: env_parse("BLACKLIST_CB_TIMEOUT_MS", 10_000),
                    reset_timeout_ms: env_parse("BLACKLIST_CB_RESET_TIMEOUT_MS", 30_000),
                },
                performance: BlacklistPerformanceSettings {
                    batch_size: env_parse("BLACKLIST_BATCH_SIZE", 100),
                    max_concurrent: env_parse("BLACKLIST_MAX_CONCURRENT", 10),
                    timeout_ms: env_parse("BLACKLIST_TIMEOUT_MS", 5000),
                },
                retention: RetentionSettings {
                    token_ttl_days: env_parse("BLACKLIST_TOKEN_TTL_DAYS", 7),
                    user_ttl_days: env_parse("BLACKLIST_USER_TTL_DAYS", 30),
                    audit_ttl_days: env_parse("BLACKLIST_AUDIT_TTL_DAYS", 90),
                },
            },

            keycloak: KeycloakSettings {
                base_url: env_or("KEYCLOAK_URL", "http://localhost:8080"),
                realm: env_or("KEYCLOAK_REALM", "master"),
                client_id: env_or("KEYCLOAK_CLIENT_ID", "ntx-auth"),
                client_secret: env_or("KEYCLOAK_CLIENT_SECRET", ""),
                admin_username: env_or("KEYCLOAK_ADMIN_USERNAME", ""),
                admin_password: env_or("KEYCLOAK_ADMIN_PASSWORD", ""),
                request_timeout: env_parse("KEYCLOAK_REQUEST_TIMEOUT", 10),
            },

            rate_limit: RateLimitSettings {
                enabled: env_bool("RATE_LIMIT_ENABLED", true),
                login: WindowLimit {
                    max_requests: env_parse("RATE_LIMIT_LOGIN_MAX", 10),
                    window_seconds: env_parse("RATE_LIMIT_LOGIN_WINDOW", 60),
                    block_duration: env_parse("RATE_LIMIT_LOGIN_BLOCK", 300),
                },
                register: WindowLimit {
                    max_requests: env_parse("RATE_LIMIT_REGISTER_MAX", 3),
                    window_seconds: env_parse("RATE_LIMIT_REGISTER_WINDOW", 3600),
                    block_duration: env_parse("RATE_LIMIT_REGISTER_BLOCK", 3600),
                },
                refresh: WindowLimit {
                    max_requests: env_parse("RATE_LIMIT_REFRESH_MAX", 30),
                    window_seconds: env_parse("RATE_LIMIT_REFRESH_WINDOW", 60),
                    block_duration: env_parse("RATE_LIMIT_REFRESH_BLOCK", 300),
                },
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration; invalid config aborts startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt.secret.len() < 32 {
            return Err(ConfigError::InvalidValue(
                "JWT_SECRET".into(),
                "must be at least 32 bytes".into(),
            ));
        }
        if self.jwt.access_expiry == 0 || self.jwt.refresh_expiry == 0 {
            return Err(ConfigError::InvalidValue(
                "JWT expiry".into(),
                "must be greater than 0".into(),
            ));
        }
        if self.jwt.refresh_expiry <= self.jwt.access_expiry {
            return Err(ConfigError::InvalidValue(
                "JWT_REFRESH_EXPIRES_IN".into(),
                "must exceed the access token expiry".into(),
            ));
        }
        if self.session.ttl == 0 {
            return Err(ConfigError::InvalidValue(
                "SESSION_TTL".into(),
                "must be greater than 0".into(),
            ));
        }
        if self.session.token_encryption && self.session.encryption_master_key.len() < 32 {
            return Err(ConfigError::InvalidValue(
                "SESSION_ENCRYPTION_KEY".into(),
                "must be at least 32 bytes when token encryption is enabled".into(),
            ));
        }
        if self.session.key_derivation_iterations < 100_000 {
            return Err(ConfigError::InvalidValue(
                "KEY_DERIVATION_ITERATIONS".into(),
                "must be at least 100000".into(),
            ));
        }
        if !(4..=31).contains(&self.security.api_key_hash_rounds) {
            return Err(ConfigError::InvalidValue(
                "API_KEY_HASH_ROUNDS".into(),
                "must be between 4 and 31".into(),
            ));
        }
        if self.security.api_key_prefix.is_empty()
            || !self
                .security
                .api_key_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric())
        {
            return Err(ConfigError::InvalidValue(
                "API_KEY_PREFIX".into(),
                "must be non-empty alphanumeric".into(),
            ));
        }
        if self.threat.max_failed_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "THREAT_MAX_FAILED_ATTEMPTS".into(),
                "must be greater than 0".into(),
            ));
        }
        if self.blacklist.performance.batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "BLACKLIST_BATCH_SIZE".into(),
                "must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    /// Deterministic configuration for tests, no environment access.
    pub fn for_test() -> Self {
        Self {
            environment: Environment::Test,
            redis: RedisSettings {
                url: "redis://127.0.0.1:6379".into(),
                pool_size: 2,
                connection_timeout: 1,
                command_timeout: 1,
                retry_attempts: 1,
                retry_delay_ms: 10,
            },
            database: DatabaseSettings {
                url: String::new(),
                max_connections: 2,
                min_connections: 1,
                connect_timeout: 1,
                idle_timeout: 60,
                max_lifetime: 300,
            },
            jwt: JwtSettings {
                secret: "test-jwt-secret-hs256-minimum-32-characters-long".into(),
                access_expiry: 3600,
                refresh_expiry: 604_800,
                issuer: "test.ntx-auth".into(),
                audience: "test.ntx-api".into(),
                rotate_refresh_tokens: true,
            },
            session: SessionSettings {
                ttl: 3600,
                refresh_threshold: 300,
                max_concurrent_sessions: 5,
                enforce_ip_consistency: true,
                enforce_user_agent_consistency: false,
                token_encryption: true,
                rotation_interval: 86_400,
                encryption_master_key: "test-session-master-key-at-least-32-bytes!".into(),
                key_derivation_iterations: 100_000,
            },
            cache: CacheSettings {
                enabled: true,
                jwt_ttl: 300,
                api_key_ttl: 600,
                session_ttl: 3600,
                user_info_ttl: 1800,
                token_capacity: 100,
                data_capacity: 1000,
            },
            security: SecuritySettings {
                constant_time_comparison: true,
                api_key_hash_rounds: 4,
                api_key_prefix: "ntx".into(),
                api_key_preview_length: 12,
            },
            threat: ThreatSettings {
                max_failed_attempts: 5,
                lockout_duration: 900,
                brute_force_window: 600,
                ip_block_duration: 3600,
                suspicious_activity_threshold: 10,
                enable_auto_lockout: true,
                enable_ip_blocking: true,
            },
            blacklist: BlacklistSettings {
                key_prefix: String::new(),
                circuit_breaker: CircuitBreakerSettings {
                    threshold: 5,
                    timeout_ms: 10_000,
                    reset_timeout_ms: 30_000,
                },
                performance: BlacklistPerformanceSettings {
                    batch_size: 100,
                    max_concurrent: 10,
                    timeout_ms: 5000,
                },
                retention: RetentionSettings {
                    token_ttl_days: 7,
                    user_ttl_days: 30,
                    audit_ttl_days: 90,
                },
            },
            keycloak: KeycloakSettings {
                base_url: "http://localhost:8080".into(),
                realm: "test".into(),
                client_id: "test-client".into(),
                client_secret: "test-secret".into(),
                admin_username: "admin".into(),
                admin_password: "admin".into(),
                request_timeout: 2,
            },
            rate_limit: RateLimitSettings {
                enabled: true,
                login: WindowLimit {
                    max_requests: 10,
                    window_seconds: 60,
                    block_duration: 300,
                },
                register: WindowLimit {
                    max_requests: 3,
                    window_seconds: 3600,
                    block_duration: 3600,
                },
                refresh: WindowLimit {
                    max_requests: 30,
                    window_seconds: 60,
                    block_duration: 300,
                },
            },
        }
    }
}
