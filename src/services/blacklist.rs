// Token blacklist service
// Revocation store over the KV: fail-closed pipelined writes behind retry
// and a circuit breaker, fail-open reads, daily audit trail.

use chrono::Utc;
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, error, instrument, warn};

use crate::app_config::BlacklistSettings;
use crate::cache::SecureCache;
use crate::db::kv::{KeyValueStore, KvError, KvOp};
use crate::models::auth::UnverifiedClaims;
use crate::models::revocation::{
    RevocationContext, RevocationReason, RevocationRecord, UserRevocationRecord,
};
use crate::services::monitoring::MonitoringService;
use crate::utils::crypto::sha256_hex;

/// TTL of the legacy `revoked:<H(token)>` fast-path marker
const LEGACY_MARKER_TTL_SECS: u64 = 86_400;

/// Cache TTL for revocation lookups
const REVOCATION_CACHE_TTL: Duration = Duration::from_secs(300);

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 50;

#[derive(Error, Debug)]
pub enum BlacklistError {
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token already expired")]
    TokenExpired,

    #[error("Key-value store error: {0}")]
    Kv(#[from] KvError),

    #[error("Circuit breaker is open")]
    CircuitOpen,

    #[error("Revocation write incomplete: {0}")]
    WriteIncomplete(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// =============================================================================
// CIRCUIT BREAKER
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    status: BreakerStatus,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    last_failure: Option<Instant>,
}

/// Circuit breaker around the KV write path.
///
/// Closed: writes flow, failures count. Open: writes short-circuit until the
/// open timeout elapses. Half-open: one probe is allowed through; success
/// closes the breaker, failure re-opens it.
pub(crate) struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    threshold: u32,
    open_timeout: Duration,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    fn new(threshold: u32, open_timeout: Duration, reset_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                status: BreakerStatus::Closed,
                consecutive_failures: 0,
                opened_at: None,
                last_failure: None,
            }),
            threshold: threshold.max(1),
            open_timeout,
            reset_timeout,
        }
    }

    fn try_acquire(&self) -> Result<(), BlacklistError> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.status {
            BreakerStatus::Closed => {
                // A quiet period clears old failures
                if let Some(last) = inner.last_failure {
                    if last.elapsed() >= self.reset_timeout {
                        inner.consecutive_failures = 0;
                    }
                }
                Ok(())
            },
            BreakerStatus::Open => {
                let opened = inner.opened_at.unwrap_or_else(Instant::now);
                if opened.elapsed() >= self.open_timeout {
                    inner.status = BreakerStatus::HalfOpen;
                    Ok(())
                } else {
                    Err(BlacklistError::CircuitOpen)
                }
            },
            BreakerStatus::HalfOpen => Ok(()),
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.status = BreakerStatus::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures += 1;
        inner.last_failure = Some(Instant::now());
        if inner.status == BreakerStatus::HalfOpen
            || inner.consecutive_failures >= self.threshold
        {
            inner.status = BreakerStatus::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    fn is_open(&self) -> bool {
        self.inner.lock().expect("breaker lock poisoned").status == BreakerStatus::Open
    }
}

// =============================================================================
// BLACKLIST SERVICE
// =============================================================================

/// Per-token result of a batch revocation
#[derive(Debug)]
pub struct BatchRevokeResult {
    pub revoked: Vec<String>,
    pub failed: Vec<(usize, String)>,
}

#[derive(Debug, serde::Serialize)]
pub struct BlacklistStats {
    pub revoked_tokens: u64,
    pub revoked_users: u64,
    pub circuit_open: bool,
}

pub struct TokenBlacklistService {
    kv: Arc<dyn KeyValueStore>,
    cache: Arc<SecureCache>,
    settings: BlacklistSettings,
    breaker: CircuitBreaker,
    monitoring: Arc<MonitoringService>,
}

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl TokenBlacklistService {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        cache: Arc<SecureCache>,
        settings: BlacklistSettings,
        monitoring: Arc<MonitoringService>,
    ) -> Self {
        let breaker = CircuitBreaker::new(
            settings.circuit_breaker.threshold,
            Duration::from_millis(settings.circuit_breaker.timeout_ms),
            Duration::from_millis(settings.circuit_breaker.reset_timeout_ms),
        );
        Self {
            kv,
            cache,
            settings,
            breaker,
            monitoring,
        }
    }

    fn token_key(&self, jti: &str) -> String {
        format!("{}jwt:blacklist:token:{}", self.settings.key_prefix, jti)
    }

    fn user_key(&self, user_id: &str) -> String {
        format!(
            "{}jwt:blacklist:user:{}:revoked",
            self.settings.key_prefix, user_id
        )
    }

    fn user_tokens_key(&self, user_id: &str) -> String {
        format!(
            "{}jwt:blacklist:user:{}:tokens",
            self.settings.key_prefix, user_id
        )
    }

    fn audit_key(&self) -> String {
        format!(
            "{}jwt:blacklist:audit:{}",
            self.settings.key_prefix,
            Utc::now().format("%Y-%m-%d")
        )
    }

    fn legacy_key(&self, token: &str) -> String {
        format!("{}revoked:{}", self.settings.key_prefix, sha256_hex(token))
    }

    /// Structurally validate a token for revocation and pull out its claims.
    fn validate_for_revocation(&self, token: &str) -> Result<UnverifiedClaims, BlacklistError> {
        let claims = UnverifiedClaims::decode(token).map_err(BlacklistError::InvalidToken)?;
        if claims.exp <= now_epoch_secs() {
            return Err(BlacklistError::TokenExpired);
        }
        Ok(claims)
    }

    fn record_ttl_secs(&self, exp: u64) -> u64 {
        let remaining = exp.saturating_sub(now_epoch_secs());
        remaining + self.settings.retention.token_ttl_days * 86_400
    }

    /// Build the pipelined write for one revocation record.
    fn revocation_ops(
        &self,
        token: &str,
        claims: &UnverifiedClaims,
        record: &RevocationRecord,
    ) -> Result<Vec<KvOp>, BlacklistError> {
        let record_json = serde_json::to_string(record)?;
        let ttl = self.record_ttl_secs(claims.exp);
        let audit_ttl = self.settings.retention.audit_ttl_days * 86_400;

        Ok(vec![
            KvOp::SetEx {
                key: self.token_key(&claims.jti),
                ttl_secs: ttl,
                value: record_json.clone(),
            },
            KvOp::SetEx {
                key: self.legacy_key(token),
                ttl_secs: LEGACY_MARKER_TTL_SECS,
                value: "1".to_string(),
            },
            KvOp::SAdd {
                key: self.user_tokens_key(&claims.sub),
                member: claims.jti.clone(),
            },
            KvOp::Expire {
                key: self.user_tokens_key(&claims.sub),
                ttl_secs: ttl,
            },
            KvOp::ZAdd {
                key: self.audit_key(),
                score: record.revoked_at_millis as f64,
                member: record_json,
            },
            KvOp::Expire {
                key: self.audit_key(),
                ttl_secs: audit_ttl,
            },
        ])
    }

    /// Run a pipelined write under retry and the circuit breaker.
    /// Fail-closed: any incomplete outcome is an error and nothing is
    /// reported as stored.
    async fn guarded_pipeline(&self, ops: Vec<KvOp>) -> Result<(), BlacklistError> {
        self.breaker.try_acquire()?;

        let mut attempt = 0;
        let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);
        loop {
            attempt += 1;
            match self.kv.pipeline(ops.clone()).await {
                Ok(result) if result.is_complete() => {
                    self.breaker.record_success();
                    return Ok(());
                },
                Ok(result) => {
                    let detail = result
                        .failures
                        .iter()
                        .map(|(i, e)| format!("op {}: {}", i, e))
                        .collect::<Vec<_>>()
                        .join("; ");
                    if attempt >= RETRY_ATTEMPTS {
                        self.breaker.record_failure();
                        self.monitoring.increment("blacklist.write.failed");
                        return Err(BlacklistError::WriteIncomplete(detail));
                    }
                    warn!(
                        "Blacklist pipeline incomplete (attempt {}/{}): {}",
                        attempt, RETRY_ATTEMPTS, detail
                    );
                },
                Err(e) => {
                    if attempt >= RETRY_ATTEMPTS {
                        self.breaker.record_failure();
                        self.monitoring.increment("blacklist.write.failed");
                        return Err(e.into());
                    }
                    warn!(
                        "Blacklist pipeline error (attempt {}/{}): {}",
                        attempt, RETRY_ATTEMPTS, e
                    );
                },
            }

            let jitter = rand::thread_rng().gen_range(0..RETRY_BASE_DELAY_MS);
            tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
            delay *= 2;
        }
    }

    /// Revoke a single token. Idempotent: revoking an already revoked token
    /// rewrites the record and succeeds.
    #[instrument(skip(self, token, context))]
    pub async fn store_revocation(
        &self,
        token: &str,
        reason: RevocationReason,
        context: RevocationContext,
    ) -> Result<RevocationRecord, BlacklistError> {
        let claims = self.validate_for_revocation(token)?;
        let record = RevocationRecord::new(&claims.jti, &claims.sub, reason, context);

        let ops = self.revocation_ops(token, &claims, &record)?;
        self.guarded_pipeline(ops).await?;

        // Local read cache must observe the write immediately
        self.cache.invalidate("jwt", &format!("revoked:{}", claims.jti));
        self.monitoring.increment("blacklist.revocations");
        debug!(jti = %claims.jti, reason = reason.as_str(), "Token revoked");

        Ok(record)
    }

    /// Check whether a jti has a direct revocation record. Fail-open.
    pub async fn is_jti_revoked(&self, jti: &str) -> bool {
        let cache_key = format!("revoked:{}", jti);
        if let Some(cached) = self.cache.get::<bool>("jwt", &cache_key) {
            return cached;
        }

        match self.kv.get(&self.token_key(jti)).await {
            Ok(found) => {
                let revoked = found.is_some();
                self.cache
                    .set("jwt", &cache_key, &revoked, REVOCATION_CACHE_TTL);
                revoked
            },
            Err(e) => {
                warn!("Blacklist read failed for jti {}: {} (failing open)", jti, e);
                self.monitoring.increment("blacklist.read.errors");
                false
            },
        }
    }

    /// Full revocation check for a raw token: direct record OR user-wide
    /// revocation covering its issue time. Fail-open on KV errors; malformed
    /// tokens are reported as not revoked (signature validation rejects them
    /// downstream anyway).
    pub async fn is_revoked(&self, token: &str) -> bool {
        let claims = match UnverifiedClaims::decode(token) {
            Ok(claims) => claims,
            Err(_) => return false,
        };

        if self.is_jti_revoked(&claims.jti).await {
            return true;
        }

        match self.get_user_revocation(&claims.sub).await {
            Some(user_revocation) => user_revocation.covers_iat_secs(claims.iat),
            None => false,
        }
    }

    /// Revoke every token a user holds, including ones that cannot be
    /// enumerated: any token issued before this record's timestamp is dead.
    #[instrument(skip(self))]
    pub async fn store_user_revocation(
        &self,
        user_id: &str,
        reason: RevocationReason,
        revoked_by: Option<String>,
    ) -> Result<UserRevocationRecord, BlacklistError> {
        let record = UserRevocationRecord::new(user_id, reason, revoked_by);
        let record_json = serde_json::to_string(&record)?;
        let ttl = self.settings.retention.user_ttl_days * 86_400;
        let audit_ttl = self.settings.retention.audit_ttl_days * 86_400;

        let ops = vec![
            KvOp::SetEx {
                key: self.user_key(user_id),
                ttl_secs: ttl,
                value: record_json.clone(),
            },
            KvOp::ZAdd {
                key: self.audit_key(),
                score: record.revoked_at_millis as f64,
                member: record_json,
            },
            KvOp::Expire {
                key: self.audit_key(),
                ttl_secs: audit_ttl,
            },
        ];
        self.guarded_pipeline(ops).await?;

        self.cache
            .invalidate("jwt", &format!("user_revoked:{}", user_id));
        self.monitoring.increment("blacklist.user_revocations");

        Ok(record)
    }

    /// Fetch the user-wide revocation record, if any. Fail-open.
    pub async fn get_user_revocation(&self, user_id: &str) -> Option<UserRevocationRecord> {
        let cache_key = format!("user_revoked:{}", user_id);
        if let Some(cached) = self
            .cache
            .get::<Option<UserRevocationRecord>>("jwt", &cache_key)
        {
            return cached;
        }

        match self.kv.get(&self.user_key(user_id)).await {
            Ok(Some(raw)) => match serde_json::from_str::<UserRevocationRecord>(&raw) {
                Ok(record) => {
                    self.cache.set(
                        "jwt",
                        &cache_key,
                        &Some(record.clone()),
                        REVOCATION_CACHE_TTL,
                    );
                    Some(record)
                },
                Err(e) => {
                    error!("Corrupt user revocation record for {}: {}", user_id, e);
                    None
                },
            },
            Ok(None) => {
                self.cache.set(
                    "jwt",
                    &cache_key,
                    &Option::<UserRevocationRecord>::None,
                    REVOCATION_CACHE_TTL,
                );
                None
            },
            Err(e) => {
                warn!(
                    "User revocation read failed for {}: {} (failing open)",
                    user_id, e
                );
                self.monitoring.increment("blacklist.read.errors");
                None
            },
        }
    }

    /// Revoke a batch of tokens in chunked pipelines.
    /// Partial success is the success model: each token carries its own
    /// outcome.
    pub async fn batch_revoke(
        &self,
        tokens: &[String],
        reason: RevocationReason,
        context: RevocationContext,
    ) -> BatchRevokeResult {
        let mut result = BatchRevokeResult {
            revoked: Vec::new(),
            failed: Vec::new(),
        };

        for (chunk_index, chunk) in tokens.chunks(self.settings.performance.batch_size).enumerate()
        {
            let base = chunk_index * self.settings.performance.batch_size;
            let mut ops = Vec::new();
            let mut chunk_jtis = Vec::new();

            for (offset, token) in chunk.iter().enumerate() {
                match self.validate_for_revocation(token) {
                    Ok(claims) => {
                        let record = RevocationRecord::new(
                            &claims.jti,
                            &claims.sub,
                            reason,
                            context.clone(),
                        );
                        match self.revocation_ops(token, &claims, &record) {
                            Ok(mut token_ops) => {
                                ops.append(&mut token_ops);
                                chunk_jtis.push(claims.jti);
                            },
                            Err(e) => result.failed.push((base + offset, e.to_string())),
                        }
                    },
                    Err(e) => result.failed.push((base + offset, e.to_string())),
                }
            }

            if ops.is_empty() {
                continue;
            }

            match self.guarded_pipeline(ops).await {
                Ok(()) => {
                    for jti in &chunk_jtis {
                        self.cache.invalidate("jwt", &format!("revoked:{}", jti));
                    }
                    result.revoked.append(&mut chunk_jtis);
                },
                Err(e) => {
                    for offset in 0..chunk_jtis.len() {
                        result.failed.push((base + offset, e.to_string()));
                    }
                },
            }
        }

        self.monitoring
            .record_counter("blacklist.batch_revoked", result.revoked.len() as u64);
        result
    }

    pub async fn health_check(&self) -> bool {
        !self.breaker.is_open() && self.kv.ping().await.is_ok()
    }

    /// Count the still-live records. The KV's TTLs perform the actual
    /// deletion; this pass exists for operational visibility.
    pub async fn cleanup_expired_records(&self) -> Result<BlacklistStats, BlacklistError> {
        let stats = self.stats().await?;
        debug!(
            revoked_tokens = stats.revoked_tokens,
            revoked_users = stats.revoked_users,
            "Blacklist cleanup pass"
        );
        Ok(stats)
    }

    pub async fn stats(&self) -> Result<BlacklistStats, BlacklistError> {
        let token_pattern = format!("{}jwt:blacklist:token:*", self.settings.key_prefix);
        let user_pattern = format!("{}jwt:blacklist:user:*:revoked", self.settings.key_prefix);

        let revoked_tokens = self.kv.keys(&token_pattern).await?.len() as u64;
        let revoked_users = self.kv.keys(&user_pattern).await?.len() as u64;

        Ok(BlacklistStats {
            revoked_tokens,
            revoked_users,
            circuit_open: self.breaker.is_open(),
        })
    }
}
