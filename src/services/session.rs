// Session manager
// KV-backed session lifecycle with encrypted-at-rest tokens, context
// binding, a per-user concurrency cap, sliding expiry and rotation.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::app_config::SessionSettings;
use crate::cache::SecureCache;
use crate::db::kv::{KeyValueStore, KvError};
use crate::models::session::{DeviceInfo, Session, SessionValidation};
use crate::services::keycloak::{IdentityProvider, IdpTokens};
use crate::services::monitoring::MonitoringService;
use crate::utils::crypto::{CryptoError, TokenCipher};
use crate::utils::fingerprint::{fingerprints_match, generate_session_fingerprint};

/// Cache TTL for session snapshots
const SESSION_CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found")]
    NotFound,

    #[error("Key-value store error: {0}")]
    Kv(#[from] KvError),

    #[error("Token encryption error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Tokens to embed in a session, as returned by the IdP.
#[derive(Debug, Clone)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub keycloak_session_id: Option<String>,
    pub expires_in: u64,
    pub refresh_expires_in: Option<u64>,
}

impl From<&IdpTokens> for SessionTokens {
    fn from(tokens: &IdpTokens) -> Self {
        Self {
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
            id_token: tokens.id_token.clone(),
            keycloak_session_id: tokens.session_state.clone(),
            expires_in: tokens.expires_in,
            refresh_expires_in: tokens.refresh_expires_in,
        }
    }
}

/// Request context a session is created from / validated against
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub device_info: Option<DeviceInfo>,
    pub metadata: HashMap<String, serde_json::Value>,
}

pub struct SessionService {
    kv: Arc<dyn KeyValueStore>,
    cache: Arc<SecureCache>,
    cipher: Option<Arc<TokenCipher>>,
    idp: Arc<dyn IdentityProvider>,
    settings: SessionSettings,
    monitoring: Arc<MonitoringService>,
}

fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

fn user_index_key(user_id: &str) -> String {
    format!("user:{}:sessions", user_id)
}

impl SessionService {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        cache: Arc<SecureCache>,
        cipher: Option<Arc<TokenCipher>>,
        idp: Arc<dyn IdentityProvider>,
        settings: SessionSettings,
        monitoring: Arc<MonitoringService>,
    ) -> Self {
        Self {
            kv,
            cache,
            cipher,
            idp,
            settings,
            monitoring,
        }
    }

    fn seal(&self, token: &str) -> Result<String, SessionError> {
        if !self.settings.token_encryption {
            return Ok(token.to_string());
        }
        match &self.cipher {
            Some(cipher) => Ok(cipher.encrypt(token)?),
            None => Ok(token.to_string()),
        }
    }

    fn open(&self, stored: &str) -> Result<String, SessionError> {
        if !self.settings.token_encryption {
            return Ok(stored.to_string());
        }
        match &self.cipher {
            Some(cipher) => Ok(cipher.decrypt(stored)?),
            None => Ok(stored.to_string()),
        }
    }

    /// Decrypt the embedded access token of a loaded session.
    pub fn decrypted_access_token(&self, session: &Session) -> Result<String, SessionError> {
        self.open(&session.access_token)
    }

    /// Decrypt the embedded refresh token, if any.
    pub fn decrypted_refresh_token(
        &self,
        session: &Session,
    ) -> Result<Option<String>, SessionError> {
        session
            .refresh_token
            .as_deref()
            .map(|t| self.open(t))
            .transpose()
    }

    fn fingerprint_for(&self, user_id: &str, ctx: &SessionContext) -> String {
        let ip = if self.settings.enforce_ip_consistency {
            ctx.ip_address.as_deref()
        } else {
            None
        };
        generate_session_fingerprint(user_id, ctx.user_agent.as_deref(), ip)
    }

    async fn persist(&self, session: &Session) -> Result<(), SessionError> {
        let remaining = session.remaining_ttl_seconds(Utc::now()).max(1) as u64;
        let json = serde_json::to_string(session)?;
        self.kv.set_ex(&session_key(&session.id), remaining, &json).await?;
        self.cache.set(
            "sessions",
            &session.id,
            session,
            SESSION_CACHE_TTL.min(Duration::from_secs(remaining)),
        );
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<Session>, SessionError> {
        if let Some(session) = self.cache.get::<Session>("sessions", session_id) {
            return Ok(Some(session));
        }
        match self.kv.get(&session_key(session_id)).await {
            Ok(Some(raw)) => {
                let session: Session = serde_json::from_str(&raw)?;
                self.cache
                    .set("sessions", session_id, &session, SESSION_CACHE_TTL);
                Ok(Some(session))
            },
            Ok(None) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Create a session for a user. Fail-closed: the session either exists
    /// in the KV or this returns an error.
    #[instrument(skip(self, tokens, ctx))]
    pub async fn create_session(
        &self,
        user_id: &str,
        tokens: SessionTokens,
        ctx: SessionContext,
    ) -> Result<Session, SessionError> {
        self.enforce_concurrency_cap(user_id).await?;

        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            keycloak_session_id: tokens.keycloak_session_id,
            access_token: self.seal(&tokens.access_token)?,
            refresh_token: tokens
                .refresh_token
                .as_deref()
                .map(|t| self.seal(t))
                .transpose()?,
            id_token: tokens.id_token.as_deref().map(|t| self.seal(t)).transpose()?,
            token_expires_at: now + ChronoDuration::seconds(tokens.expires_in as i64),
            refresh_expires_at: tokens
                .refresh_expires_in
                .map(|secs| now + ChronoDuration::seconds(secs as i64)),
            fingerprint: self.fingerprint_for(user_id, &ctx),
            device_info: ctx.device_info,
            ip_address: ctx.ip_address,
            user_agent: ctx.user_agent,
            created_at: now,
            last_activity: now,
            expires_at: now + ChronoDuration::seconds(self.settings.ttl as i64),
            is_active: true,
            metadata: ctx.metadata,
        };

        self.persist(&session).await?;
        self.kv
            .sadd(&user_index_key(user_id), &session.id)
            .await?;

        self.monitoring.increment("session.created");
        debug!(session_id = %session.id, user_id, "Session created");
        Ok(session)
    }

    /// Evict oldest sessions until the user is under the concurrency cap.
    async fn enforce_concurrency_cap(&self, user_id: &str) -> Result<(), SessionError> {
        let mut sessions = self.list_user_sessions(user_id).await?;
        if sessions.len() < self.settings.max_concurrent_sessions {
            return Ok(());
        }

        sessions.sort_by_key(|s| s.created_at);
        let excess = sessions.len() + 1 - self.settings.max_concurrent_sessions;
        for session in sessions.into_iter().take(excess) {
            warn!(
                session_id = %session.id,
                user_id,
                "Concurrent session cap reached, evicting oldest session"
            );
            self.destroy_session(&session.id).await?;
            self.monitoring.increment("session.evicted");
        }
        Ok(())
    }

    async fn reject_and_destroy(
        &self,
        session_id: &str,
        reason: &str,
    ) -> SessionValidation {
        if let Err(e) = self.destroy_session(session_id).await {
            warn!("Failed to destroy session {}: {}", session_id, e);
        }
        self.monitoring.increment("session.security_violations");
        SessionValidation::rejected(reason)
    }

    /// Validate a session against the current request context.
    ///
    /// Security violations (binding mismatches) destroy the session;
    /// recoverable conditions (missing, lookup failure) only reject.
    #[instrument(skip(self, ctx))]
    pub async fn validate_session(
        &self,
        session_id: &str,
        ctx: SessionContext,
    ) -> SessionValidation {
        let mut session = match self.load(session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => return SessionValidation::rejected("Session not found"),
            Err(e) => {
                warn!("Session lookup failed for {}: {}", session_id, e);
                self.monitoring.increment("session.lookup_errors");
                return SessionValidation::rejected("Session lookup failed");
            },
        };

        let now = Utc::now();

        if !session.is_active {
            return SessionValidation::rejected("Session is inactive");
        }
        if session.is_expired(now) {
            if let Err(e) = self.destroy_session(session_id).await {
                debug!("Expired session cleanup failed: {}", e);
            }
            return SessionValidation::rejected("Session expired");
        }

        if self.settings.enforce_ip_consistency {
            if let (Some(bound), Some(current)) = (&session.ip_address, &ctx.ip_address) {
                if bound != current {
                    return self.reject_and_destroy(session_id, "IP address mismatch").await;
                }
            }
        }

        if self.settings.enforce_user_agent_consistency {
            if let (Some(bound), Some(current)) = (&session.user_agent, &ctx.user_agent) {
                if bound != current {
                    return self.reject_and_destroy(session_id, "User agent mismatch").await;
                }
            }
        }

        // Integrity of the stored binding itself
        let expected = {
            let stored_ctx = SessionContext {
                ip_address: session.ip_address.clone(),
                user_agent: session.user_agent.clone(),
                ..Default::default()
            };
            self.fingerprint_for(&session.user_id, &stored_ctx)
        };
        if !fingerprints_match(&expected, &session.fingerprint) {
            return self
                .reject_and_destroy(session_id, "Session fingerprint mismatch")
                .await;
        }

        // Refresh the embedded access token through the IdP when it expired
        if session.token_expires_at <= now {
            let refresh_token = match self.decrypted_refresh_token(&session) {
                Ok(Some(token)) => Some(token),
                Ok(None) => None,
                Err(e) => {
                    warn!("Embedded refresh token unreadable: {}", e);
                    None
                },
            };

            match refresh_token {
                Some(token) => match self.idp.refresh_access_token(&token).await {
                    Ok(new_tokens) => {
                        if let Err(e) = self.apply_refreshed_tokens(&mut session, &new_tokens) {
                            warn!("Failed to store refreshed tokens: {}", e);
                            return SessionValidation::rejected("Session token refresh failed");
                        }
                        self.monitoring.increment("session.tokens_refreshed");
                    },
                    Err(e) => {
                        debug!("IdP token refresh failed for {}: {}", session_id, e);
                        return SessionValidation::rejected("Session token refresh failed");
                    },
                },
                None => return SessionValidation::rejected("Session tokens expired"),
            }
        }

        let requires_rotation =
            session.age_seconds(now) >= self.settings.rotation_interval as i64;

        // Sliding window: extend when the remaining TTL dips below the
        // refresh threshold
        if session.remaining_ttl_seconds(now) < self.settings.refresh_threshold as i64 {
            session.expires_at = now + ChronoDuration::seconds(self.settings.ttl as i64);
            self.monitoring.increment("session.extended");
        }

        session.last_activity = now;
        if let Err(e) = self.persist(&session).await {
            warn!("Session activity write failed for {}: {}", session_id, e);
        }

        SessionValidation::ok(session, requires_rotation)
    }

    fn apply_refreshed_tokens(
        &self,
        session: &mut Session,
        tokens: &IdpTokens,
    ) -> Result<(), SessionError> {
        let now = Utc::now();
        session.access_token = self.seal(&tokens.access_token)?;
        if let Some(refresh) = &tokens.refresh_token {
            session.refresh_token = Some(self.seal(refresh)?);
        }
        if let Some(id_token) = &tokens.id_token {
            session.id_token = Some(self.seal(id_token)?);
        }
        session.token_expires_at = now + ChronoDuration::seconds(tokens.expires_in as i64);
        if let Some(refresh_expires_in) = tokens.refresh_expires_in {
            session.refresh_expires_at =
                Some(now + ChronoDuration::seconds(refresh_expires_in as i64));
        }
        Ok(())
    }

    /// Rotate a session: new id bound to the current context, same user,
    /// tokens and metadata; the old id dies.
    #[instrument(skip(self, ctx))]
    pub async fn rotate_session(
        &self,
        session_id: &str,
        ctx: SessionContext,
    ) -> Result<Session, SessionError> {
        let old = self
            .load(session_id)
            .await?
            .filter(|s| s.is_active && !s.is_expired(Utc::now()))
            .ok_or(SessionError::NotFound)?;

        let now = Utc::now();
        let new_session = Session {
            id: Uuid::new_v4().to_string(),
            user_id: old.user_id.clone(),
            keycloak_session_id: old.keycloak_session_id.clone(),
            access_token: old.access_token.clone(),
            refresh_token: old.refresh_token.clone(),
            id_token: old.id_token.clone(),
            token_expires_at: old.token_expires_at,
            refresh_expires_at: old.refresh_expires_at,
            fingerprint: self.fingerprint_for(&old.user_id, &ctx),
            device_info: ctx.device_info.or(old.device_info.clone()),
            ip_address: ctx.ip_address.or(old.ip_address.clone()),
            user_agent: ctx.user_agent.or(old.user_agent.clone()),
            created_at: now,
            last_activity: now,
            expires_at: now + ChronoDuration::seconds(self.settings.ttl as i64),
            is_active: true,
            metadata: old.metadata.clone(),
        };

        self.persist(&new_session).await?;
        self.kv
            .sadd(&user_index_key(&new_session.user_id), &new_session.id)
            .await?;
        self.destroy_session(session_id).await?;

        self.monitoring.increment("session.rotated");
        Ok(new_session)
    }

    /// Destroy a session. Fail-closed on the KV delete.
    #[instrument(skip(self))]
    pub async fn destroy_session(&self, session_id: &str) -> Result<(), SessionError> {
        let session = self.load(session_id).await.ok().flatten();

        self.kv.del(&[session_key(session_id)]).await?;
        if let Some(session) = &session {
            if let Err(e) = self
                .kv
                .srem(&user_index_key(&session.user_id), session_id)
                .await
            {
                debug!("Session index cleanup failed: {}", e);
            }
        }
        self.cache.invalidate("sessions", session_id);
        self.monitoring.increment("session.destroyed");
        Ok(())
    }

    /// Destroy every session a user holds, returning how many died.
    pub async fn destroy_user_sessions(&self, user_id: &str) -> Result<usize, SessionError> {
        let ids = self.kv.smembers(&user_index_key(user_id)).await?;
        let mut destroyed = 0;
        for id in &ids {
            match self.destroy_session(id).await {
                Ok(()) => destroyed += 1,
                Err(e) => warn!("Failed to destroy session {}: {}", id, e),
            }
        }
        if let Err(e) = self.kv.del(&[user_index_key(user_id)]).await {
            debug!("Session index delete failed for {}: {}", user_id, e);
        }
        Ok(destroyed)
    }

    /// Live sessions for a user, via the secondary index. Dead index
    /// entries are pruned as they are discovered.
    pub async fn list_user_sessions(&self, user_id: &str) -> Result<Vec<Session>, SessionError> {
        let ids = self.kv.smembers(&user_index_key(user_id)).await?;
        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(&id).await {
                Ok(Some(session)) if session.is_active => sessions.push(session),
                Ok(_) => {
                    let _ = self.kv.srem(&user_index_key(user_id), &id).await;
                },
                Err(e) => warn!("Session load failed for {}: {}", id, e),
            }
        }
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_config::AppConfig;
    use crate::db::MemoryKvStore;
    use crate::services::keycloak::{
        IdpRole, IdpUser, IdpUserUpdate, KeycloakError, NewIdpUser, UserFilter,
    };
    use async_trait::async_trait;

    /// IdP stub: refresh hands out a fixed new token, everything else is
    /// unreachable from these tests.
    struct StubIdp;

    #[async_trait]
    impl IdentityProvider for StubIdp {
        async fn initialize(&self) -> Result<(), KeycloakError> {
            Ok(())
        }
        async fn authenticate_direct_grant(
            &self,
            _username: &str,
            _password: &str,
        ) -> Result<IdpTokens, KeycloakError> {
            Err(KeycloakError::Service("not wired".into()))
        }
        async fn refresh_access_token(
            &self,
            _refresh_token: &str,
        ) -> Result<IdpTokens, KeycloakError> {
            Ok(IdpTokens {
                access_token: "refreshed-access".into(),
                refresh_token: Some("refreshed-refresh".into()),
                id_token: None,
                expires_in: 300,
                refresh_expires_in: Some(1800),
                session_state: None,
            })
        }
        async fn logout(&self, _refresh_token: &str) -> Result<(), KeycloakError> {
            Ok(())
        }
        async fn find_users(&self, _filter: UserFilter) -> Result<Vec<IdpUser>, KeycloakError> {
            Ok(Vec::new())
        }
        async fn get_user(&self, _user_id: &str) -> Result<IdpUser, KeycloakError> {
            Err(KeycloakError::NotFound)
        }
        async fn create_user(&self, _new_user: NewIdpUser) -> Result<IdpUser, KeycloakError> {
            Err(KeycloakError::Service("not wired".into()))
        }
        async fn update_user(
            &self,
            _user_id: &str,
            _update: IdpUserUpdate,
        ) -> Result<(), KeycloakError> {
            Ok(())
        }
        async fn delete_user(&self, _user_id: &str) -> Result<(), KeycloakError> {
            Ok(())
        }
        async fn list_user_roles(&self, _user_id: &str) -> Result<Vec<String>, KeycloakError> {
            Ok(Vec::new())
        }
        async fn assign_user_roles(
            &self,
            _user_id: &str,
            _role_names: &[String],
        ) -> Result<(), KeycloakError> {
            Ok(())
        }
        async fn list_realm_role_mappings(&self) -> Result<Vec<IdpRole>, KeycloakError> {
            Ok(Vec::new())
        }
        async fn health_check(&self) -> bool {
            true
        }
    }

    fn service_with(settings: SessionSettings) -> SessionService {
        let config = AppConfig::for_test();
        let cipher = Arc::new(
            TokenCipher::derive(
                &settings.encryption_master_key,
                settings.key_derivation_iterations,
            )
            .unwrap(),
        );
        SessionService::new(
            Arc::new(MemoryKvStore::new()),
            Arc::new(SecureCache::new(&config.cache)),
            Some(cipher),
            Arc::new(StubIdp),
            settings,
            Arc::new(MonitoringService::with_noop_sink()),
        )
    }

    fn service() -> SessionService {
        service_with(AppConfig::for_test().session)
    }

    fn tokens() -> SessionTokens {
        SessionTokens {
            access_token: "idp-access-token".into(),
            refresh_token: Some("idp-refresh-token".into()),
            id_token: None,
            keycloak_session_id: Some("kc-session".into()),
            expires_in: 300,
            refresh_expires_in: Some(1800),
        }
    }

    fn ctx(ip: &str) -> SessionContext {
        SessionContext {
            ip_address: Some(ip.to_string()),
            user_agent: Some("Mozilla/5.0".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_and_validate_session() {
        let sessions = service();
        let session = sessions
            .create_session("u1", tokens(), ctx("10.0.0.1"))
            .await
            .unwrap();

        // Stored token is encrypted, decrypts back to the original
        assert_ne!(session.access_token, "idp-access-token");
        assert_eq!(
            sessions.decrypted_access_token(&session).unwrap(),
            "idp-access-token"
        );

        let validation = sessions.validate_session(&session.id, ctx("10.0.0.1")).await;
        assert!(validation.valid, "validation failed: {:?}", validation.error);
        assert!(!validation.requires_rotation);
    }

    #[tokio::test]
    async fn test_ip_mismatch_destroys_session() {
        let sessions = service();
        let session = sessions
            .create_session("u1", tokens(), ctx("10.0.0.1"))
            .await
            .unwrap();

        let validation = sessions.validate_session(&session.id, ctx("10.0.0.3")).await;
        assert!(!validation.valid);
        assert_eq!(validation.error.as_deref(), Some("IP address mismatch"));

        // The session is gone, not just rejected
        let second = sessions.validate_session(&session.id, ctx("10.0.0.1")).await;
        assert_eq!(second.error.as_deref(), Some("Session not found"));
    }

    #[tokio::test]
    async fn test_user_agent_mismatch_when_enforced() {
        let mut settings = AppConfig::for_test().session;
        settings.enforce_user_agent_consistency = true;
        let sessions = service_with(settings);

        let session = sessions
            .create_session("u1", tokens(), ctx("10.0.0.1"))
            .await
            .unwrap();

        let mut other_ua = ctx("10.0.0.1");
        other_ua.user_agent = Some("curl/8.0".into());
        let validation = sessions.validate_session(&session.id, other_ua).await;
        assert!(!validation.valid);
        assert_eq!(validation.error.as_deref(), Some("User agent mismatch"));
    }

    #[tokio::test]
    async fn test_unknown_session_rejected() {
        let sessions = service();
        let validation = sessions.validate_session("nope", ctx("10.0.0.1")).await;
        assert!(!validation.valid);
        assert_eq!(validation.error.as_deref(), Some("Session not found"));
    }

    #[tokio::test]
    async fn test_concurrency_cap_evicts_oldest() {
        let mut settings = AppConfig::for_test().session;
        settings.max_concurrent_sessions = 2;
        let sessions = service_with(settings);

        let first = sessions
            .create_session("u1", tokens(), ctx("10.0.0.1"))
            .await
            .unwrap();
        let _second = sessions
            .create_session("u1", tokens(), ctx("10.0.0.1"))
            .await
            .unwrap();
        let _third = sessions
            .create_session("u1", tokens(), ctx("10.0.0.1"))
            .await
            .unwrap();

        let live = sessions.list_user_sessions("u1").await.unwrap();
        assert_eq!(live.len(), 2);
        assert!(
            live.iter().all(|s| s.id != first.id),
            "oldest session should have been evicted"
        );
    }

    #[tokio::test]
    async fn test_rotation_yields_new_id_and_kills_old() {
        let mut settings = AppConfig::for_test().session;
        settings.rotation_interval = 0; // every validation asks for rotation
        let sessions = service_with(settings);

        let session = sessions
            .create_session("u1", tokens(), ctx("10.0.0.1"))
            .await
            .unwrap();

        let validation = sessions.validate_session(&session.id, ctx("10.0.0.1")).await;
        assert!(validation.valid);
        assert!(validation.requires_rotation);

        let rotated = sessions
            .rotate_session(&session.id, ctx("10.0.0.1"))
            .await
            .unwrap();
        assert_ne!(rotated.id, session.id);

        let old = sessions.validate_session(&session.id, ctx("10.0.0.1")).await;
        assert!(!old.valid);

        let live = sessions.list_user_sessions("u1").await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, rotated.id);
    }

    #[tokio::test]
    async fn test_rotate_twice_leaves_one_session() {
        let sessions = service();
        let s1 = sessions
            .create_session("u1", tokens(), ctx("10.0.0.1"))
            .await
            .unwrap();
        let s2 = sessions.rotate_session(&s1.id, ctx("10.0.0.1")).await.unwrap();
        let s3 = sessions.rotate_session(&s2.id, ctx("10.0.0.1")).await.unwrap();

        assert_ne!(s2.id, s3.id);
        assert!(sessions.rotate_session(&s1.id, ctx("10.0.0.1")).await.is_err());

        let live = sessions.list_user_sessions("u1").await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, s3.id);
    }

    #[tokio::test]
    async fn test_sliding_window_extends_expiry() {
        let mut settings = AppConfig::for_test().session;
        settings.ttl = 100;
        settings.refresh_threshold = 300; // always below threshold
        let sessions = service_with(settings);

        let session = sessions
            .create_session("u1", tokens(), ctx("10.0.0.1"))
            .await
            .unwrap();
        let original_expiry = session.expires_at;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let validation = sessions.validate_session(&session.id, ctx("10.0.0.1")).await;
        assert!(validation.valid);
        assert!(
            validation.session.unwrap().expires_at > original_expiry,
            "expiry should slide forward"
        );
    }

    #[tokio::test]
    async fn test_expired_embedded_token_refreshes_through_idp() {
        let sessions = service();
        let mut expired_tokens = tokens();
        expired_tokens.expires_in = 0; // embedded access token already dead

        let session = sessions
            .create_session("u1", expired_tokens, ctx("10.0.0.1"))
            .await
            .unwrap();

        let validation = sessions.validate_session(&session.id, ctx("10.0.0.1")).await;
        assert!(validation.valid, "error: {:?}", validation.error);

        let refreshed = validation.session.unwrap();
        assert_eq!(
            sessions.decrypted_access_token(&refreshed).unwrap(),
            "refreshed-access"
        );
        assert!(refreshed.token_expires_at > Utc::now());
    }

    #[tokio::test]
    async fn test_destroy_user_sessions() {
        let sessions = service();
        sessions.create_session("u1", tokens(), ctx("10.0.0.1")).await.unwrap();
        sessions.create_session("u1", tokens(), ctx("10.0.0.1")).await.unwrap();
        sessions.create_session("u2", tokens(), ctx("10.0.0.9")).await.unwrap();

        let destroyed = sessions.destroy_user_sessions("u1").await.unwrap();
        assert_eq!(destroyed, 2);
        assert!(sessions.list_user_sessions("u1").await.unwrap().is_empty());
        assert_eq!(sessions.list_user_sessions("u2").await.unwrap().len(), 1);
    }
}
