// Auth orchestrator
// Composes the identity provider adapter, token engine, session manager,
// permission evaluator, API-key service, threat controller and rate
// limiter behind the user-facing operations. Internal errors never cross
// the boundary: every operation returns a typed result.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::app_config::AppConfig;
use crate::cache::SecureCache;
use crate::db::kv::KeyValueStore;
use crate::db::DieselPool;
use crate::models::api_key::{ApiKeyAuth, CreateApiKeyParams};
use crate::models::revocation::{RevocationContext, RevocationReason};
use crate::models::session::{DeviceInfo, Session};
use crate::models::auth::TokenPair;
use crate::models::user::{AuthUser, UserRecord, UserRecordUpdate};
use crate::services::api_key::{ApiKeyError, ApiKeyService};
use crate::services::blacklist::TokenBlacklistService;
use crate::services::jwt::{JwtConfig, JwtError, TokenService};
use crate::services::keycloak::{
    IdentityProvider, IdpUserUpdate, KeycloakError, NewIdpUser, UserFilter,
};
use crate::services::monitoring::{MetricsSink, MonitoringService};
use crate::services::permission::PermissionService;
use crate::services::rate_limit::{RateLimitOp, RateLimitService};
use crate::services::session::{SessionContext, SessionError, SessionService, SessionTokens};
use crate::services::threat::ThreatDetectionService;
use crate::utils::auth_errors::AuthError;
use crate::utils::crypto::TokenCipher;
use crate::utils::validation::{
    normalize_and_validate_email, validate_display_name, validate_password_policy,
};

/// Everything the orchestrator needs, injected at construction.
/// Sub-services receive typed references from here; none of them holds a
/// pointer back to the orchestrator.
pub struct ServiceDependencies {
    pub config: AppConfig,
    pub kv: Arc<dyn KeyValueStore>,
    pub idp: Arc<dyn IdentityProvider>,
    pub db: Option<DieselPool>,
    pub sink: Arc<dyn MetricsSink>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub device_info: Option<DeviceInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub name: String,
    #[serde(default)]
    pub roles: Option<Vec<String>>,
    #[serde(default)]
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateUserRequest {
    pub email: Option<String>,
    pub name: Option<String>,
    pub roles: Option<Vec<String>>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user: AuthUser,
    pub tokens: TokenPair,
    pub session: Session,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user: AuthUser,
    pub tokens: TokenPair,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub user: AuthUser,
    pub tokens: TokenPair,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub idp: bool,
    pub kv: bool,
    pub permissions: bool,
    pub cache: bool,
    pub threat: bool,
}

impl From<JwtError> for AuthError {
    fn from(err: JwtError) -> Self {
        match err {
            JwtError::TokenRevoked => AuthError::TokenRevoked,
            JwtError::TokenExpired => AuthError::TokenExpired,
            JwtError::InvalidToken
            | JwtError::InvalidFormat(_)
            | JwtError::NotRefreshToken
            | JwtError::MissingBearer
            | JwtError::EncodingError(_) => AuthError::Unauthorized,
            JwtError::Kv(e) => AuthError::Service(e.to_string()),
            JwtError::Blacklist(e) => AuthError::Service(e.to_string()),
        }
    }
}

impl From<KeycloakError> for AuthError {
    fn from(err: KeycloakError) -> Self {
        match err {
            KeycloakError::InvalidCredentials => AuthError::InvalidCredentials,
            KeycloakError::Conflict => AuthError::UserExists,
            KeycloakError::NotFound => AuthError::Validation("User not found".to_string()),
            KeycloakError::NotInitialized | KeycloakError::Service(_) => {
                AuthError::Service("identity provider error".to_string())
            },
        }
    }
}

impl From<SessionError> for AuthError {
    fn from(err: SessionError) -> Self {
        AuthError::Service(err.to_string())
    }
}

impl From<ApiKeyError> for AuthError {
    fn from(err: ApiKeyError) -> Self {
        match err {
            ApiKeyError::InvalidKey
            | ApiKeyError::NotFound
            | ApiKeyError::Inactive
            | ApiKeyError::Expired => AuthError::Unauthorized,
            other => AuthError::Service(other.to_string()),
        }
    }
}

pub struct AuthService {
    config: AppConfig,
    kv: Arc<dyn KeyValueStore>,
    cache: Arc<SecureCache>,
    idp: Arc<dyn IdentityProvider>,
    db: Option<DieselPool>,
    monitoring: Arc<MonitoringService>,
    blacklist: Arc<TokenBlacklistService>,
    tokens: Arc<TokenService>,
    sessions: Arc<SessionService>,
    permissions: Arc<PermissionService>,
    api_keys: Arc<ApiKeyService>,
    threat: Arc<ThreatDetectionService>,
    rate_limits: Arc<RateLimitService>,
}

impl AuthService {
    /// Wire up the component graph. Fails on invalid configuration or an
    /// unusable encryption master key.
    pub fn new(deps: ServiceDependencies) -> Result<Self, AuthError> {
        let ServiceDependencies {
            config,
            kv,
            idp,
            db,
            sink,
        } = deps;

        config
            .validate()
            .map_err(|e| AuthError::Validation(e.to_string()))?;

        let monitoring = Arc::new(MonitoringService::new(sink));
        let cache = Arc::new(SecureCache::new(&config.cache));

        let cipher = if config.session.token_encryption {
            Some(
                TokenCipher::process(
                    &config.session.encryption_master_key,
                    config.session.key_derivation_iterations,
                )
                .map_err(|e| AuthError::Validation(e.to_string()))?,
            )
        } else {
            None
        };

        let blacklist = Arc::new(TokenBlacklistService::new(
            kv.clone(),
            cache.clone(),
            config.blacklist.clone(),
            monitoring.clone(),
        ));
        let tokens = Arc::new(TokenService::new(
            JwtConfig::from_settings(config.jwt.clone()),
            kv.clone(),
            blacklist.clone(),
            cipher.clone(),
            monitoring.clone(),
        ));
        let sessions = Arc::new(SessionService::new(
            kv.clone(),
            cache.clone(),
            cipher,
            idp.clone(),
            config.session.clone(),
            monitoring.clone(),
        ));
        let permissions = Arc::new(PermissionService::new(kv.clone(), cache.clone()));
        let api_keys = Arc::new(ApiKeyService::new(
            kv.clone(),
            cache.clone(),
            config.security.clone(),
            config.cache.clone(),
            monitoring.clone(),
        ));
        let threat = Arc::new(ThreatDetectionService::new(
            config.threat.clone(),
            monitoring.clone(),
        ));
        let rate_limits = Arc::new(RateLimitService::new(
            kv.clone(),
            config.rate_limit.clone(),
            monitoring.clone(),
        ));

        Ok(Self {
            config,
            kv,
            cache,
            idp,
            db,
            monitoring,
            blacklist,
            tokens,
            sessions,
            permissions,
            api_keys,
            threat,
            rate_limits,
        })
    }

    /// Initialize the upstream adapters and warm the default roles.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), AuthError> {
        self.idp.initialize().await?;
        self.permissions.warm_role_mirror().await;
        info!("Auth service initialized");
        Ok(())
    }

    /// Spawn periodic maintenance (threat-state decay).
    pub fn start_background_tasks(&self) -> Vec<tokio::task::JoinHandle<()>> {
        vec![self.threat.spawn_cleanup_task()]
    }

    fn login_limit_key(email: &str, ip: Option<&str>) -> String {
        format!("{}:{}", ip.unwrap_or("unknown"), email)
    }

    /// Cache-through permission enrichment for a principal.
    async fn enrich_permissions(&self, user: &mut AuthUser) {
        if let Some(cached) = self.cache.get::<Vec<String>>("permissions", &user.id) {
            user.permissions = cached;
            return;
        }
        let merged = self.permissions.get_user_permissions(user);
        self.cache.set(
            "permissions",
            &user.id,
            &merged,
            Duration::from_secs(self.config.cache.user_info_ttl),
        );
        user.permissions = merged;
    }

    /// Resolve a principal from the IdP by email, including realm roles.
    async fn principal_from_idp(&self, email: &str) -> Result<AuthUser, AuthError> {
        let found = self
            .idp
            .find_users(UserFilter {
                email: Some(email.to_string()),
                ..Default::default()
            })
            .await?;
        let idp_user = found.into_iter().next().ok_or(AuthError::InvalidCredentials)?;

        let roles = match self.idp.list_user_roles(&idp_user.id).await {
            Ok(roles) if !roles.is_empty() => roles,
            Ok(_) => vec!["user".to_string()],
            Err(e) => {
                // Role listing is enrichment, not a gate
                warn!("Role listing failed for {}: {}", idp_user.id, e);
                vec!["user".to_string()]
            },
        };

        let mut user = AuthUser::new(
            idp_user.id.clone(),
            idp_user.email.clone().unwrap_or_else(|| email.to_string()),
            idp_user.display_name(),
        );
        user.roles = roles;
        user.is_active = idp_user.enabled;
        Ok(user)
    }

    /// Credential login: policy checks, Direct Grant, principal enrichment,
    /// token issue, session creation.
    #[instrument(skip(self, request), fields(ip = ?request.ip_address))]
    pub async fn login(&self, request: LoginRequest) -> Result<LoginResponse, AuthError> {
        let email = normalize_and_validate_email(&request.email)
            .map_err(AuthError::Validation)?;
        if request.password.is_empty() {
            return Err(AuthError::Validation("Password is required".to_string()));
        }
        let ip = request.ip_address.as_deref();

        let limit = self
            .rate_limits
            .check_rate_limit(RateLimitOp::Login, &Self::login_limit_key(&email, ip))
            .await;
        if !limit.allowed {
            self.monitoring.increment("auth.login.rate_limited");
            return Err(AuthError::RateLimited {
                retry_after_seconds: limit.retry_after.unwrap_or(60),
            });
        }

        if let Some(ip) = ip {
            if self.threat.is_ip_blocked(ip) || self.threat.check_ip_blocking(ip) {
                self.monitoring.increment("auth.login.ip_blocked");
                return Err(AuthError::IpBlocked);
            }
        }

        // Pre-authentication lockout accounting is keyed by the normalized
        // email; the canonical user id is unknown until the IdP answers.
        if self.threat.is_account_locked(&email) {
            let lockout_until = self
                .threat
                .get_lockout(&email)
                .map(|l| l.lockout_until)
                .unwrap_or_else(Utc::now);
            self.monitoring.increment("auth.login.locked");
            return Err(AuthError::AccountLocked { lockout_until });
        }

        let idp_tokens = match self
            .idp
            .authenticate_direct_grant(&email, &request.password)
            .await
        {
            Ok(tokens) => tokens,
            Err(KeycloakError::InvalidCredentials) => {
                self.threat.record_failed_attempt(
                    &email,
                    ip.unwrap_or("unknown"),
                    request.user_agent.as_deref(),
                    None,
                );
                self.monitoring.increment("auth.login.failed");
                return Err(AuthError::InvalidCredentials);
            },
            Err(e) => {
                self.monitoring.increment("auth.login.errors");
                return Err(e.into());
            },
        };

        let mut user = self.principal_from_idp(&email).await?;
        self.enrich_permissions(&mut user).await;

        let tokens = self.tokens.generate_tokens(&user).await?;

        let session = self
            .sessions
            .create_session(
                &user.id,
                SessionTokens::from(&idp_tokens),
                SessionContext {
                    ip_address: request.ip_address.clone(),
                    user_agent: request.user_agent.clone(),
                    device_info: request.device_info.clone(),
                    metadata: HashMap::new(),
                },
            )
            .await?;

        self.threat.record_successful_auth(&email, ip);
        self.monitoring.increment("auth.login.success");
        debug!(user_id = %user.id, "Login succeeded");

        Ok(LoginResponse {
            user,
            tokens,
            session,
        })
    }

    /// Register a user in the IdP, mirror the row, and issue tokens.
    #[instrument(skip(self, request))]
    pub async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse, AuthError> {
        let email = normalize_and_validate_email(&request.email)
            .map_err(AuthError::Validation)?;
        validate_password_policy(&request.password).map_err(AuthError::Validation)?;
        validate_display_name(&request.name).map_err(AuthError::Validation)?;

        let limit = self
            .rate_limits
            .check_rate_limit(
                RateLimitOp::Register,
                request.ip_address.as_deref().unwrap_or("unknown"),
            )
            .await;
        if !limit.allowed {
            return Err(AuthError::RateLimited {
                retry_after_seconds: limit.retry_after.unwrap_or(60),
            });
        }

        let existing = self
            .idp
            .find_users(UserFilter {
                email: Some(email.clone()),
                ..Default::default()
            })
            .await?;
        if !existing.is_empty() {
            return Err(AuthError::UserExists);
        }

        let (first_name, last_name) = match request.name.trim().split_once(' ') {
            Some((first, last)) => (Some(first.to_string()), Some(last.to_string())),
            None => (Some(request.name.trim().to_string()), None),
        };

        let idp_user = self
            .idp
            .create_user(NewIdpUser {
                email: email.clone(),
                password: request.password.clone(),
                first_name,
                last_name,
            })
            .await?;

        let roles = request.roles.unwrap_or_else(|| vec!["user".to_string()]);
        if let Err(e) = self.idp.assign_user_roles(&idp_user.id, &roles).await {
            warn!("Initial role assignment failed for {}: {}", idp_user.id, e);
        }

        let mut user = AuthUser::new(idp_user.id.clone(), email.clone(), request.name.clone());
        user.roles = roles;
        self.enrich_permissions(&mut user).await;

        self.mirror_insert(&user).await;

        let tokens = self.tokens.generate_tokens(&user).await?;
        self.monitoring.increment("auth.register.success");

        Ok(RegisterResponse { user, tokens })
    }

    /// Exchange a refresh token for a new pair, enriching the principal.
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<RefreshResponse, AuthError> {
        let (mut user, tokens) = self.tokens.refresh_token(refresh_token).await?;
        self.enrich_permissions(&mut user).await;
        Ok(RefreshResponse { user, tokens })
    }

    /// Verify a bearer token and return the enriched principal.
    pub async fn verify_token(&self, token: &str) -> Result<AuthUser, AuthError> {
        let mut user = self.tokens.verify_token(token).await?;
        self.enrich_permissions(&mut user).await;
        Ok(user)
    }

    /// Log out: revoke the presented token (or all of the user's tokens)
    /// and tear down sessions. Partial session teardown does not fail the
    /// logout.
    #[instrument(skip(self, token))]
    pub async fn logout(
        &self,
        user_id: &str,
        token: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<(), AuthError> {
        match token {
            Some(token) => {
                self.tokens
                    .revoke_token(
                        token,
                        RevocationReason::UserLogout,
                        RevocationContext {
                            session_id: session_id.map(String::from),
                            ..Default::default()
                        },
                    )
                    .await?;
            },
            None => {
                self.tokens
                    .revoke_all_user_tokens(user_id, RevocationReason::UserLogout, None)
                    .await?;
            },
        }

        // Best-effort IdP back-channel logout before sessions disappear
        if let Ok(sessions) = self.sessions.list_user_sessions(user_id).await {
            for session in &sessions {
                if let Ok(Some(refresh)) = self.sessions.decrypted_refresh_token(session) {
                    if let Err(e) = self.idp.logout(&refresh).await {
                        debug!("IdP logout failed for session {}: {}", session.id, e);
                    }
                    break;
                }
            }
        }

        let teardown = match session_id {
            Some(session_id) => self
                .sessions
                .destroy_session(session_id)
                .await
                .map(|_| 1usize),
            None => self.sessions.destroy_user_sessions(user_id).await,
        };
        if let Err(e) = teardown {
            warn!("Session teardown incomplete for {}: {}", user_id, e);
        }

        self.cache.invalidate("permissions", user_id);
        self.cache.invalidate("user_info", user_id);
        self.monitoring.increment("auth.logout");
        Ok(())
    }

    /// Fetch a principal by id: IdP first, mirror row as fallback.
    pub async fn get_user_by_id(&self, user_id: &str) -> Result<AuthUser, AuthError> {
        if let Some(cached) = self.cache.get::<AuthUser>("user_info", user_id) {
            return Ok(cached);
        }

        let user = match self.idp.get_user(user_id).await {
            Ok(idp_user) => {
                let roles = self
                    .idp
                    .list_user_roles(&idp_user.id)
                    .await
                    .unwrap_or_else(|_| vec!["user".to_string()]);
                let mut user = AuthUser::new(
                    idp_user.id.clone(),
                    idp_user.email.clone().unwrap_or_default(),
                    idp_user.display_name(),
                );
                user.roles = roles;
                user.is_active = idp_user.enabled;
                user
            },
            Err(KeycloakError::NotFound) => self
                .mirror_find(user_id)
                .await
                .ok_or_else(|| AuthError::Validation("User not found".to_string()))?,
            Err(e) => return Err(e.into()),
        };

        let mut user = user;
        self.enrich_permissions(&mut user).await;
        self.cache.set(
            "user_info",
            user_id,
            &user,
            Duration::from_secs(self.config.cache.user_info_ttl),
        );
        Ok(user)
    }

    /// Update a user in the IdP and the mirror. Role changes invalidate the
    /// permission caches immediately.
    #[instrument(skip(self, update))]
    pub async fn update_user(
        &self,
        user_id: &str,
        update: UpdateUserRequest,
    ) -> Result<AuthUser, AuthError> {
        self.idp
            .update_user(
                user_id,
                IdpUserUpdate {
                    email: update.email.clone(),
                    first_name: update.name.clone(),
                    last_name: None,
                    enabled: update.is_active,
                },
            )
            .await?;

        if let Some(roles) = &update.roles {
            self.idp.assign_user_roles(user_id, roles).await?;
        }

        self.mirror_update(user_id, &update).await;

        // Stale grants must not outlive this call
        self.cache.invalidate("permissions", user_id);
        self.cache.invalidate("user_info", user_id);

        self.get_user_by_id(user_id).await
    }

    /// Delete a user: revoke everything first, then soft-delete the mirror
    /// row, then remove from the IdP.
    #[instrument(skip(self))]
    pub async fn delete_user(&self, user_id: &str) -> Result<(), AuthError> {
        self.tokens
            .revoke_all_user_tokens(user_id, RevocationReason::AdminRevocation, None)
            .await?;
        if let Err(e) = self.sessions.destroy_user_sessions(user_id).await {
            warn!("Session teardown during delete failed for {}: {}", user_id, e);
        }

        self.mirror_soft_delete(user_id).await;
        self.idp.delete_user(user_id).await?;

        self.cache.invalidate("permissions", user_id);
        self.cache.invalidate("user_info", user_id);
        self.monitoring.increment("auth.user_deleted");
        Ok(())
    }

    /// Permission decision for a principal.
    pub fn can(
        &self,
        user: &AuthUser,
        action: &str,
        resource: &str,
        subject: Option<&serde_json::Value>,
    ) -> bool {
        self.permissions.can(user, action, resource, subject)
    }

    pub fn get_user_permissions(&self, user: &AuthUser) -> Vec<String> {
        self.permissions.get_user_permissions(user)
    }

    /// Create an API key for a user.
    pub async fn create_api_key(
        &self,
        user_id: &str,
        params: CreateApiKeyParams,
    ) -> Result<(crate::models::api_key::ApiKey, String), AuthError> {
        Ok(self.api_keys.create_api_key(user_id, params).await?)
    }

    /// Validate an API key and return its grants.
    pub async fn validate_api_key(&self, raw_key: &str) -> Result<ApiKeyAuth, AuthError> {
        Ok(self.api_keys.validate_api_key(raw_key).await?)
    }

    /// Aggregate component health.
    pub async fn health_check(&self) -> HealthStatus {
        let idp = self.idp.health_check().await;
        let kv = self.kv.ping().await.is_ok();
        let permissions = self.permissions.is_healthy();
        let cache = !self.config.cache.enabled || self.cache.stats().enabled;
        let threat = self.threat.is_healthy();

        HealthStatus {
            healthy: idp && kv && permissions && cache && threat,
            idp,
            kv,
            permissions,
            cache,
            threat,
        }
    }

    // -- mirror store helpers (best-effort; the IdP stays authoritative) --

    async fn mirror_conn(
        &self,
    ) -> Option<
        bb8::PooledConnection<
            '_,
            diesel_async::pooled_connection::AsyncDieselConnectionManager<
                diesel_async::AsyncPgConnection,
            >,
        >,
    > {
        match &self.db {
            Some(pool) => match pool.get().await {
                Ok(conn) => Some(conn),
                Err(e) => {
                    warn!("Mirror database unavailable: {}", e);
                    None
                },
            },
            None => None,
        }
    }

    async fn mirror_insert(&self, user: &AuthUser) {
        if let Some(mut conn) = self.mirror_conn().await {
            if let Err(e) = UserRecord::insert_mirror(&mut conn, user).await {
                warn!("Mirror insert failed for {}: {}", user.id, e);
            }
        }
    }

    async fn mirror_find(&self, user_id: &str) -> Option<AuthUser> {
        let mut conn = self.mirror_conn().await?;
        match UserRecord::find_by_id(&mut conn, user_id).await {
            Ok(record) => Some(AuthUser::from(record)),
            Err(_) => None,
        }
    }

    async fn mirror_update(&self, user_id: &str, update: &UpdateUserRequest) {
        if let Some(mut conn) = self.mirror_conn().await {
            let changes = UserRecordUpdate {
                email: update.email.clone(),
                display_name: update.name.clone(),
                roles: update.roles.as_ref().map(|r| serde_json::json!(r)),
                permissions: None,
                metadata: update
                    .metadata
                    .as_ref()
                    .and_then(|m| serde_json::to_value(m).ok()),
                is_active: update.is_active,
                updated_at: Utc::now(),
            };
            if let Err(e) = UserRecord::update_mirror(&mut conn, user_id, changes).await {
                warn!("Mirror update failed for {}: {}", user_id, e);
            }
        }
    }

    async fn mirror_soft_delete(&self, user_id: &str) {
        if let Some(mut conn) = self.mirror_conn().await {
            if let Err(e) = UserRecord::soft_delete(&mut conn, user_id).await {
                warn!("Mirror soft delete failed for {}: {}", user_id, e);
            }
        }
    }

    // -- component accessors for transport layers and operators --

    pub fn sessions(&self) -> &Arc<SessionService> {
        &self.sessions
    }

    pub fn tokens(&self) -> &Arc<TokenService> {
        &self.tokens
    }

    pub fn blacklist(&self) -> &Arc<TokenBlacklistService> {
        &self.blacklist
    }

    pub fn permissions(&self) -> &Arc<PermissionService> {
        &self.permissions
    }

    pub fn api_keys(&self) -> &Arc<ApiKeyService> {
        &self.api_keys
    }

    pub fn threat(&self) -> &Arc<ThreatDetectionService> {
        &self.threat
    }

    pub fn monitoring(&self) -> &Arc<MonitoringService> {
        &self.monitoring
    }
}
