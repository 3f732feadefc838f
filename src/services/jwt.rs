// Token engine
// HS256 issuance, verification, refresh and revocation orchestration.
// Every issued token is mirrored into the KV so user-wide revocation can
// enumerate live tokens.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::app_config::JwtSettings;
use crate::db::kv::{KeyValueStore, KvError};
use crate::models::auth::{
    AccessTokenClaims, RefreshTokenClaims, TokenPair, UnverifiedClaims, REFRESH_TOKEN_TYPE,
};
use crate::models::revocation::{RevocationContext, RevocationReason};
use crate::models::user::AuthUser;
use crate::services::blacklist::{BlacklistError, TokenBlacklistService};
use crate::services::monitoring::MonitoringService;
use crate::utils::crypto::{sha256_hex, TokenCipher};

#[derive(Error, Debug)]
pub enum JwtError {
    #[error("JWT encoding error: {0}")]
    EncodingError(String),

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Invalid token format: {0}")]
    InvalidFormat(String),

    #[error("Token revoked")]
    TokenRevoked,

    #[error("Not a refresh token")]
    NotRefreshToken,

    #[error("Missing or malformed Authorization header")]
    MissingBearer,

    #[error("Key-value store error: {0}")]
    Kv(#[from] KvError),

    #[error("Blacklist error: {0}")]
    Blacklist(#[from] BlacklistError),
}

impl From<jsonwebtoken::errors::Error> for JwtError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::ExpiredSignature => JwtError::TokenExpired,
            ErrorKind::InvalidToken => JwtError::InvalidToken,
            _ => JwtError::EncodingError(err.to_string()),
        }
    }
}

/// JWT configuration with prepared signing keys
#[derive(Clone)]
pub struct JwtConfig {
    pub settings: JwtSettings,
    pub algorithm: Algorithm,
    pub encoding_key: EncodingKey,
    pub decoding_key: DecodingKey,
}

impl std::fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtConfig")
            .field("access_expiry", &self.settings.access_expiry)
            .field("refresh_expiry", &self.settings.refresh_expiry)
            .field("issuer", &self.settings.issuer)
            .field("audience", &self.settings.audience)
            .field("algorithm", &self.algorithm)
            .field("encoding_key", &"<redacted>")
            .field("decoding_key", &"<redacted>")
            .finish()
    }
}

impl JwtConfig {
    pub fn from_settings(settings: JwtSettings) -> Self {
        let encoding_key = EncodingKey::from_secret(settings.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(settings.secret.as_bytes());
        Self {
            settings,
            algorithm: Algorithm::HS256,
            encoding_key,
            decoding_key,
        }
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn extract_bearer_token(header_value: &str) -> Result<&str, JwtError> {
    let token = header_value
        .strip_prefix("Bearer ")
        .ok_or(JwtError::MissingBearer)?;
    if token.is_empty() {
        return Err(JwtError::MissingBearer);
    }
    Ok(token)
}

/// Extract a token from a query string (`token` or `access_token`), the
/// WebSocket upgrade fallback.
pub fn extract_token_from_query(query: &str) -> Option<&str> {
    for pair in query.split('&') {
        if let Some((name, value)) = pair.split_once('=') {
            if (name == "token" || name == "access_token") && !value.is_empty() {
                return Some(value);
            }
        }
    }
    None
}

/// A well-formed JWT has exactly three non-empty dot-separated base64url
/// segments.
pub fn validate_token_format(token: &str) -> Result<(), JwtError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(JwtError::InvalidFormat(
            "expected three dot-separated segments".to_string(),
        ));
    }
    for part in parts {
        if part.is_empty() {
            return Err(JwtError::InvalidFormat("empty segment".to_string()));
        }
        if !part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(JwtError::InvalidFormat(
                "segment is not base64url".to_string(),
            ));
        }
    }
    Ok(())
}

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct TokenService {
    config: JwtConfig,
    kv: Arc<dyn KeyValueStore>,
    blacklist: Arc<TokenBlacklistService>,
    cipher: Option<Arc<TokenCipher>>,
    monitoring: Arc<MonitoringService>,
}

impl TokenService {
    pub fn new(
        config: JwtConfig,
        kv: Arc<dyn KeyValueStore>,
        blacklist: Arc<TokenBlacklistService>,
        cipher: Option<Arc<TokenCipher>>,
        monitoring: Arc<MonitoringService>,
    ) -> Self {
        Self {
            config,
            kv,
            blacklist,
            cipher,
            monitoring,
        }
    }

    fn mirror_key(&self, user_id: &str, token: &str) -> String {
        format!("token:{}:{}", user_id, sha256_hex(token))
    }

    fn mirror_value(&self, token: &str) -> String {
        match &self.cipher {
            Some(cipher) => cipher.encrypt(token).unwrap_or_else(|e| {
                warn!("Token mirror encryption failed: {} (storing plain)", e);
                token.to_string()
            }),
            None => token.to_string(),
        }
    }

    fn unmirror_value(&self, stored: &str) -> String {
        match &self.cipher {
            Some(cipher) => cipher
                .decrypt(stored)
                .unwrap_or_else(|_| stored.to_string()),
            None => stored.to_string(),
        }
    }

    /// Mirror an issued token into the KV for later enumeration. A mirror
    /// failure is tolerated: the user-wide revocation record subsumes
    /// non-enumerated tokens.
    async fn mirror_token(&self, user_id: &str, token: &str, ttl_secs: u64) {
        let key = self.mirror_key(user_id, token);
        let value = self.mirror_value(token);
        if let Err(e) = self.kv.set_ex(&key, ttl_secs, &value).await {
            warn!("Token mirror write failed for {}: {}", user_id, e);
            self.monitoring.increment("jwt.mirror.errors");
        }
    }

    /// Issue an access/refresh pair for a user. Roles and permissions are
    /// denormalized into both tokens.
    #[instrument(skip(self, user))]
    pub async fn generate_tokens(&self, user: &AuthUser) -> Result<TokenPair, JwtError> {
        let now = now_epoch_secs();
        let settings = &self.config.settings;

        let access_claims = AccessTokenClaims {
            sub: user.id.clone(),
            jti: Uuid::new_v4().to_string(),
            email: user.email.clone(),
            name: user.name.clone(),
            roles: user.roles.clone(),
            permissions: user.permissions.clone(),
            aud: settings.audience.clone(),
            iss: settings.issuer.clone(),
            iat: now,
            exp: now + settings.access_expiry,
        };

        let refresh_claims = RefreshTokenClaims {
            sub: user.id.clone(),
            jti: Uuid::new_v4().to_string(),
            email: user.email.clone(),
            name: user.name.clone(),
            roles: user.roles.clone(),
            permissions: user.permissions.clone(),
            aud: settings.audience.clone(),
            iss: settings.issuer.clone(),
            iat: now,
            exp: now + settings.refresh_expiry,
            token_type: REFRESH_TOKEN_TYPE.to_string(),
        };

        let header = Header::new(self.config.algorithm);
        let access_token = encode(&header, &access_claims, &self.config.encoding_key)?;
        let refresh_token = encode(&header, &refresh_claims, &self.config.encoding_key)?;

        self.mirror_token(&user.id, &access_token, settings.access_expiry)
            .await;
        self.mirror_token(&user.id, &refresh_token, settings.refresh_expiry)
            .await;

        self.monitoring.increment("jwt.issued");

        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: settings.access_expiry,
            refresh_expires_in: settings.refresh_expiry,
        })
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(self.config.algorithm);
        validation.set_audience(&[self.config.settings.audience.clone()]);
        validation.set_issuer(&[self.config.settings.issuer.clone()]);
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.leeway = 0;
        validation
    }

    /// Verify a bearer token and reconstruct the principal.
    ///
    /// Order matters: the blacklist is consulted before signature
    /// verification so a revoked token is rejected even when otherwise valid.
    #[instrument(skip(self, token))]
    pub async fn verify_token(&self, token: &str) -> Result<AuthUser, JwtError> {
        validate_token_format(token)?;

        if self.blacklist.is_revoked(token).await {
            self.monitoring.increment("jwt.rejected.revoked");
            return Err(JwtError::TokenRevoked);
        }

        let token_data =
            decode::<AccessTokenClaims>(token, &self.config.decoding_key, &self.validation())?;

        self.monitoring.increment("jwt.verified");
        Ok(token_data.claims.to_user())
    }

    /// Exchange a refresh token for a new pair.
    ///
    /// The refresh token is self-sufficient: the principal is rebuilt from
    /// its claims. With rotate-on-refresh enabled the old refresh jti is
    /// revoked after the new pair is issued; a failed revocation write is
    /// logged but does not fail the refresh.
    #[instrument(skip(self, refresh_token))]
    pub async fn refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<(AuthUser, TokenPair), JwtError> {
        validate_token_format(refresh_token)?;

        let token_data = decode::<RefreshTokenClaims>(
            refresh_token,
            &self.config.decoding_key,
            &self.validation(),
        )?;

        if !token_data.claims.is_refresh() {
            return Err(JwtError::NotRefreshToken);
        }

        if self.blacklist.is_revoked(refresh_token).await {
            self.monitoring.increment("jwt.rejected.revoked");
            return Err(JwtError::TokenRevoked);
        }

        let user = token_data.claims.to_user();
        let pair = self.generate_tokens(&user).await?;

        if self.config.settings.rotate_refresh_tokens {
            if let Err(e) = self
                .blacklist
                .store_revocation(
                    refresh_token,
                    RevocationReason::TokenRefresh,
                    RevocationContext::default(),
                )
                .await
            {
                warn!("Rotate-on-refresh revocation failed: {}", e);
                self.monitoring.increment("jwt.rotation.errors");
            }
        }

        self.monitoring.increment("jwt.refreshed");
        Ok((user, pair))
    }

    /// Revoke a single token. Idempotent.
    pub async fn revoke_token(
        &self,
        token: &str,
        reason: RevocationReason,
        context: RevocationContext,
    ) -> Result<(), JwtError> {
        self.blacklist.store_revocation(token, reason, context).await?;
        Ok(())
    }

    /// Revoke every live token for a user.
    ///
    /// Mirrored tokens are enumerated and revoked individually; the
    /// user-wide record written alongside subsumes any token that escaped
    /// enumeration.
    #[instrument(skip(self))]
    pub async fn revoke_all_user_tokens(
        &self,
        user_id: &str,
        reason: RevocationReason,
        revoked_by: Option<String>,
    ) -> Result<usize, JwtError> {
        let pattern = format!("token:{}:*", user_id);
        let mirror_keys = match self.kv.keys(&pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                // Enumeration is best-effort; the user-wide record below
                // still kills everything issued before now.
                warn!("Token enumeration failed for {}: {}", user_id, e);
                Vec::new()
            },
        };

        let mut tokens = Vec::with_capacity(mirror_keys.len());
        for key in &mirror_keys {
            if let Ok(Some(stored)) = self.kv.get(key).await {
                tokens.push(self.unmirror_value(&stored));
            }
        }

        let batch = self
            .blacklist
            .batch_revoke(&tokens, reason, RevocationContext::default())
            .await;

        self.blacklist
            .store_user_revocation(user_id, reason, revoked_by)
            .await?;

        if !mirror_keys.is_empty() {
            if let Err(e) = self.kv.del(&mirror_keys).await {
                debug!("Mirror cleanup failed for {}: {}", user_id, e);
            }
        }

        self.monitoring.increment("jwt.user_revocations");
        Ok(batch.revoked.len())
    }

    /// Decode claims without verification, for diagnostics only.
    pub fn decode_token_unverified(&self, token: &str) -> Result<UnverifiedClaims, JwtError> {
        UnverifiedClaims::decode(token).map_err(JwtError::InvalidFormat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_config::AppConfig;
    use crate::cache::SecureCache;
    use crate::db::MemoryKvStore;

    fn test_user() -> AuthUser {
        let mut user = AuthUser::new("user-1", "u1@example.com", "User One");
        user.roles = vec!["user".to_string()];
        user.permissions = vec!["read:document".to_string()];
        user
    }

    fn service() -> TokenService {
        let config = AppConfig::for_test();
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
        let cache = Arc::new(SecureCache::new(&config.cache));
        let monitoring = Arc::new(MonitoringService::with_noop_sink());
        let blacklist = Arc::new(TokenBlacklistService::new(
            kv.clone(),
            cache,
            config.blacklist.clone(),
            monitoring.clone(),
        ));
        TokenService::new(
            JwtConfig::from_settings(config.jwt),
            kv,
            blacklist,
            None,
            monitoring,
        )
    }

    #[tokio::test]
    async fn test_generate_and_verify_roundtrip() {
        let tokens = service();
        let pair = tokens.generate_tokens(&test_user()).await.unwrap();

        assert_eq!(pair.token_type, "Bearer");
        assert_eq!(pair.expires_in, 3600);
        assert_eq!(pair.refresh_expires_in, 604_800);

        let principal = tokens.verify_token(&pair.access_token).await.unwrap();
        assert_eq!(principal.id, "user-1");
        assert_eq!(principal.roles, vec!["user"]);
        assert_eq!(principal.permissions, vec!["read:document"]);
    }

    #[tokio::test]
    async fn test_verify_rejects_garbage() {
        let tokens = service();
        assert!(matches!(
            tokens.verify_token("nonsense").await,
            Err(JwtError::InvalidFormat(_))
        ));
        assert!(matches!(
            tokens.verify_token("a.b").await,
            Err(JwtError::InvalidFormat(_))
        ));
    }

    #[tokio::test]
    async fn test_verify_rejects_tampered_signature() {
        let tokens = service();
        let pair = tokens.generate_tokens(&test_user()).await.unwrap();

        let mut tampered = pair.access_token.clone();
        tampered.pop();
        tampered.push('A');
        assert!(tokens.verify_token(&tampered).await.is_err());
    }

    #[tokio::test]
    async fn test_revocation_beats_expiry() {
        let tokens = service();
        let pair = tokens.generate_tokens(&test_user()).await.unwrap();

        tokens
            .revoke_token(
                &pair.access_token,
                RevocationReason::UserLogout,
                RevocationContext::default(),
            )
            .await
            .unwrap();

        // The token is not expired, but it must be rejected
        assert!(matches!(
            tokens.verify_token(&pair.access_token).await,
            Err(JwtError::TokenRevoked)
        ));

        // Idempotent second revocation
        tokens
            .revoke_token(
                &pair.access_token,
                RevocationReason::UserLogout,
                RevocationContext::default(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_refresh_requires_refresh_type() {
        let tokens = service();
        let pair = tokens.generate_tokens(&test_user()).await.unwrap();

        // An access token cannot be used to refresh: it has no `type` claim
        assert!(tokens.refresh_token(&pair.access_token).await.is_err());

        let (user, new_pair) = tokens.refresh_token(&pair.refresh_token).await.unwrap();
        assert_eq!(user.id, "user-1");
        assert_ne!(new_pair.access_token, pair.access_token);
    }

    #[tokio::test]
    async fn test_rotate_on_refresh_revokes_old_token() {
        let tokens = service();
        let pair = tokens.generate_tokens(&test_user()).await.unwrap();

        tokens.refresh_token(&pair.refresh_token).await.unwrap();

        // Rotation policy is on in the test config: the old refresh token
        // must now be revoked
        assert!(matches!(
            tokens.refresh_token(&pair.refresh_token).await,
            Err(JwtError::TokenRevoked)
        ));
    }

    #[tokio::test]
    async fn test_revoke_all_user_tokens() {
        let tokens = service();
        let pair1 = tokens.generate_tokens(&test_user()).await.unwrap();
        let pair2 = tokens.generate_tokens(&test_user()).await.unwrap();

        let revoked = tokens
            .revoke_all_user_tokens("user-1", RevocationReason::PasswordChange, None)
            .await
            .unwrap();
        assert!(revoked >= 2, "expected at least both pairs, got {}", revoked);

        for token in [
            &pair1.access_token,
            &pair1.refresh_token,
            &pair2.access_token,
            &pair2.refresh_token,
        ] {
            assert!(
                matches!(tokens.verify_token(token).await, Err(JwtError::TokenRevoked)),
                "token survived user-wide revocation"
            );
        }
    }

    #[tokio::test]
    async fn test_token_serialization_subject() {
        let tokens = service();
        let pair = tokens.generate_tokens(&test_user()).await.unwrap();
        let claims = tokens.decode_token_unverified(&pair.access_token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert!(!claims.jti.is_empty());
    }

    #[test]
    fn test_extract_bearer_token() {
        assert_eq!(extract_bearer_token("Bearer abc.def.ghi").unwrap(), "abc.def.ghi");
        assert!(extract_bearer_token("bearer abc").is_err());
        assert!(extract_bearer_token("Basic abc").is_err());
        assert!(extract_bearer_token("Bearer ").is_err());
    }

    #[test]
    fn test_extract_token_from_query() {
        assert_eq!(
            extract_token_from_query("foo=1&token=abc&bar=2"),
            Some("abc")
        );
        assert_eq!(
            extract_token_from_query("access_token=xyz"),
            Some("xyz")
        );
        assert_eq!(extract_token_from_query("foo=1&bar=2"), None);
        assert_eq!(extract_token_from_query("token="), None);
    }

    #[test]
    fn test_validate_token_format() {
        assert!(validate_token_format("aaa.bbb.ccc").is_ok());
        assert!(validate_token_format("aaa.bbb").is_err());
        assert!(validate_token_format("aaa..ccc").is_err());
        assert!(validate_token_format("aaa.b+b.ccc").is_err());
        assert!(validate_token_format("a.b.c.d").is_err());
    }
}
