// Library exports for the ntx auth core
// Authentication and authorization in front of a Keycloak-style identity
// provider: token lifecycle, sessions, RBAC, API keys, threat detection.

pub mod app_config;
pub mod cache;
pub mod config;
pub mod db;
pub mod models;
pub mod schema;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use app_config::{config, AppConfig, ConfigError, Environment};
pub use cache::{CacheStats, SecureCache};
pub use db::{
    DieselPool, KeyValueStore, KvError, KvOp, KvPipelineResult, MemoryKvStore, RedisKvStore,
    RedisPool, RedisPoolConfig,
};
pub use models::{
    Ability, AccessTokenClaims, ApiKey, ApiKeyAuth, AuthUser, Permission, RefreshTokenClaims,
    RevocationReason, Role, Session, SessionValidation, TokenPair,
};
pub use services::{
    AuthService, IdentityProvider, JwtConfig, JwtError, KeycloakAdapter, LoginRequest,
    LoginResponse, MetricsSink, MonitoringService, NoopSink, PermissionService, RegisterRequest,
    ServiceDependencies, SessionService, TokenBlacklistService, TokenService,
};
pub use utils::{AuthError, AuthErrorResponse};

use std::sync::Arc;
use tracing::info;

/// Build a fully wired auth service from the environment configuration.
///
/// Connects to Redis, optionally to the user mirror database, constructs the
/// identity provider adapter, and initializes the component graph. Library
/// consumers that want to inject their own stores or sinks should construct
/// `ServiceDependencies` directly instead.
pub async fn initialize_auth_service() -> anyhow::Result<AuthService> {
    dotenv::dotenv().ok();
    let config = app_config::config().clone();

    info!("Initializing Redis pool...");
    let redis_pool =
        RedisPool::new(RedisPoolConfig::from_settings(&config.redis)).await?;
    let kv: Arc<dyn KeyValueStore> = Arc::new(RedisKvStore::new(redis_pool));

    let db = if config.database.url.is_empty() {
        info!("No mirror database configured, running IdP-only");
        None
    } else {
        info!("Initializing mirror database pool...");
        let pool = db::create_diesel_pool(db::MirrorDbConfig::from_settings(&config.database))
            .await
            .map_err(|e| anyhow::anyhow!("mirror database init failed: {}", e))?;
        Some(pool)
    };

    let idp: Arc<dyn IdentityProvider> = Arc::new(KeycloakAdapter::new(config.keycloak.clone())?);

    let auth = AuthService::new(ServiceDependencies {
        config,
        kv,
        idp,
        db,
        sink: Arc::new(NoopSink),
    })?;

    auth.initialize().await?;
    auth.start_background_tasks();

    Ok(auth)
}
