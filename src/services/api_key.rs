// API key service
// Generation with prefix, bcrypt-hashed storage, constant-time validation
// bounded by a cleartext preview pre-filter, rotation with compensating
// revocation, usage accounting.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{Duration as ChronoDuration, Utc};
use rand::RngCore;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::app_config::{CacheSettings, SecuritySettings};
use crate::cache::SecureCache;
use crate::db::kv::{KeyValueStore, KvError};
use crate::models::api_key::{ApiKey, ApiKeyAuth, ApiKeySummary, CreateApiKeyParams};
use crate::services::monitoring::MonitoringService;
use crate::utils::crypto::sha256_hex;

/// Random bytes in a generated key (256 bits of entropy)
const KEY_MATERIAL_BYTES: usize = 32;

#[derive(Error, Debug)]
pub enum ApiKeyError {
    #[error("Invalid API key")]
    InvalidKey,

    #[error("API key not found")]
    NotFound,

    #[error("API key is inactive")]
    Inactive,

    #[error("API key has expired")]
    Expired,

    #[error("Hashing error: {0}")]
    Hash(String),

    #[error("Key-value store error: {0}")]
    Kv(#[from] KvError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<bcrypt::BcryptError> for ApiKeyError {
    fn from(err: bcrypt::BcryptError) -> Self {
        ApiKeyError::Hash(err.to_string())
    }
}

pub struct ApiKeyService {
    kv: Arc<dyn KeyValueStore>,
    cache: Arc<SecureCache>,
    settings: SecuritySettings,
    cache_settings: CacheSettings,
    monitoring: Arc<MonitoringService>,
    /// Old key ids whose revocation failed mid-rotation; drained by the
    /// cleanup pass.
    pending_revocations: Mutex<Vec<String>>,
}

fn key_record_key(key_id: &str) -> String {
    format!("apikey:{}", key_id)
}

fn preview_index_key(preview: &str) -> String {
    format!("apikey:preview:{}", preview)
}

fn user_index_key(user_id: &str) -> String {
    format!("user:{}:apikeys", user_id)
}

impl ApiKeyService {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        cache: Arc<SecureCache>,
        settings: SecuritySettings,
        cache_settings: CacheSettings,
        monitoring: Arc<MonitoringService>,
    ) -> Self {
        Self {
            kv,
            cache,
            settings,
            cache_settings,
            monitoring,
            pending_revocations: Mutex::new(Vec::new()),
        }
    }

    fn generate_raw_key(&self) -> String {
        let mut material = [0u8; KEY_MATERIAL_BYTES];
        rand::thread_rng().fill_bytes(&mut material);
        format!(
            "{}_{}",
            self.settings.api_key_prefix,
            URL_SAFE_NO_PAD.encode(material)
        )
    }

    fn preview_of(&self, raw_key: &str) -> String {
        raw_key
            .chars()
            .take(self.settings.api_key_preview_length)
            .collect()
    }

    async fn put_record(&self, record: &ApiKey) -> Result<(), ApiKeyError> {
        let json = serde_json::to_string(record)?;
        self.kv.set(&key_record_key(&record.id), &json).await?;
        Ok(())
    }

    async fn get_record(&self, key_id: &str) -> Result<Option<ApiKey>, ApiKeyError> {
        match self.kv.get(&key_record_key(key_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Create a key for a user. The raw key appears in the return value and
    /// nowhere else, ever.
    #[instrument(skip(self, params))]
    pub async fn create_api_key(
        &self,
        user_id: &str,
        params: CreateApiKeyParams,
    ) -> Result<(ApiKey, String), ApiKeyError> {
        let raw_key = self.generate_raw_key();
        let key_hash = bcrypt::hash(&raw_key, self.settings.api_key_hash_rounds)?;
        let preview = self.preview_of(&raw_key);

        let now = Utc::now();
        let record = ApiKey {
            id: Uuid::new_v4().to_string(),
            name: params.name,
            user_id: user_id.to_string(),
            key_hash,
            key_preview: preview.clone(),
            scopes: params.scopes,
            permissions: params.permissions,
            is_active: true,
            expires_at: params.expires_at,
            last_used_at: None,
            usage_count: 0,
            created_at: now,
            updated_at: now,
            metadata: params.metadata,
        };

        // Fail-closed: record first, then the lookup indexes
        self.put_record(&record).await?;
        self.kv
            .sadd(&preview_index_key(&preview), &record.id)
            .await?;
        self.kv.sadd(&user_index_key(user_id), &record.id).await?;

        self.monitoring.increment("apikey.created");
        debug!(key_id = %record.id, user_id, "API key created");
        Ok((record, raw_key))
    }

    /// Validate a raw key and account its use.
    ///
    /// The preview pre-filter keeps the bcrypt cost at one comparison per
    /// candidate sharing the same 12-char prefix, which in practice is one.
    #[instrument(skip(self, raw_key))]
    pub async fn validate_api_key(&self, raw_key: &str) -> Result<ApiKeyAuth, ApiKeyError> {
        let expected_prefix = format!("{}_", self.settings.api_key_prefix);
        if !raw_key.starts_with(&expected_prefix)
            || raw_key.len() < self.settings.api_key_preview_length
        {
            return Err(ApiKeyError::InvalidKey);
        }

        // Cached decision: maps H(raw) to the key id, then re-checks the
        // record so a revocation is effective immediately
        let decision_key = sha256_hex(raw_key);
        if let Some(key_id) = self.cache.get::<String>("apikey", &decision_key) {
            if let Some(record) = self.get_record(&key_id).await? {
                return self.authorize_record(record, None).await;
            }
            self.cache.invalidate("apikey", &decision_key);
        }

        let preview = self.preview_of(raw_key);
        let candidates = self.kv.smembers(&preview_index_key(&preview)).await?;

        for key_id in candidates {
            let Some(record) = self.get_record(&key_id).await? else {
                continue;
            };
            if bcrypt::verify(raw_key, &record.key_hash)? {
                self.cache.set(
                    "apikey",
                    &decision_key,
                    &record.id,
                    Duration::from_secs(self.cache_settings.api_key_ttl),
                );
                return self.authorize_record(record, Some(raw_key)).await;
            }
        }

        self.monitoring.increment("apikey.rejected");
        Err(ApiKeyError::InvalidKey)
    }

    /// Shared policy checks plus usage accounting for a matched record.
    async fn authorize_record(
        &self,
        mut record: ApiKey,
        _raw_key: Option<&str>,
    ) -> Result<ApiKeyAuth, ApiKeyError> {
        let now = Utc::now();
        if !record.is_active {
            self.monitoring.increment("apikey.rejected");
            return Err(ApiKeyError::Inactive);
        }
        if record.is_expired(now) {
            self.monitoring.increment("apikey.rejected");
            return Err(ApiKeyError::Expired);
        }

        record.usage_count += 1;
        record.last_used_at = Some(now);
        record.updated_at = now;
        if let Err(e) = self.put_record(&record).await {
            // Usage accounting must not block an otherwise valid request
            warn!("API key usage write failed for {}: {}", record.id, e);
        }

        self.monitoring.increment("apikey.validated");
        Ok(ApiKeyAuth {
            key_id: record.id,
            user_id: record.user_id,
            scopes: record.scopes,
            permissions: record.permissions,
        })
    }

    /// Rotate a key: issue a replacement, then revoke the original.
    ///
    /// The two steps are not transactional. If the revocation fails after
    /// the new key exists, the new key is still returned and the old id is
    /// queued for compensating revocation in the next cleanup pass.
    #[instrument(skip(self))]
    pub async fn rotate_api_key(&self, key_id: &str) -> Result<(ApiKey, String), ApiKeyError> {
        let old = self.get_record(key_id).await?.ok_or(ApiKeyError::NotFound)?;

        let params = CreateApiKeyParams {
            name: old.name.clone(),
            scopes: old.scopes.clone(),
            permissions: old.permissions.clone(),
            expires_at: old.expires_at,
            metadata: old.metadata.clone(),
        };
        let (new_key, raw_key) = self.create_api_key(&old.user_id, params).await?;

        if let Err(e) = self.revoke_api_key(key_id).await {
            warn!(
                "Rotation revoke failed for {}, queueing compensating revocation: {}",
                key_id, e
            );
            if let Ok(mut pending) = self.pending_revocations.lock() {
                pending.push(key_id.to_string());
            }
        }

        self.monitoring.increment("apikey.rotated");
        Ok((new_key, raw_key))
    }

    /// Revoke a key: flip inactive and persist. Fail-closed.
    #[instrument(skip(self))]
    pub async fn revoke_api_key(&self, key_id: &str) -> Result<(), ApiKeyError> {
        let mut record = self.get_record(key_id).await?.ok_or(ApiKeyError::NotFound)?;
        record.is_active = false;
        record.updated_at = Utc::now();
        self.put_record(&record).await?;

        self.monitoring.increment("apikey.revoked");
        Ok(())
    }

    /// Key summaries for a user. Hashes and raw keys never leave this
    /// service.
    pub async fn list_user_keys(&self, user_id: &str) -> Result<Vec<ApiKeySummary>, ApiKeyError> {
        let ids = self.kv.smembers(&user_index_key(user_id)).await?;
        let mut summaries = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get_record(&id).await? {
                summaries.push(record.summary());
            }
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(summaries)
    }

    /// Delete records expired beyond the grace period and drain pending
    /// compensating revocations.
    #[instrument(skip(self))]
    pub async fn cleanup_expired_keys(&self, grace: Duration) -> Result<usize, ApiKeyError> {
        let pending: Vec<String> = match self.pending_revocations.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for key_id in pending {
            if let Err(e) = self.revoke_api_key(&key_id).await {
                warn!("Compensating revocation failed for {}: {}", key_id, e);
                if let Ok(mut guard) = self.pending_revocations.lock() {
                    guard.push(key_id);
                }
            }
        }

        let cutoff = Utc::now() - ChronoDuration::seconds(grace.as_secs() as i64);
        let mut removed = 0;

        let keys = self.kv.keys("apikey:*").await?;
        for key in keys {
            // Skip the preview index entries that share the prefix
            if key.starts_with("apikey:preview:") {
                continue;
            }
            let Some(raw) = self.kv.get(&key).await? else {
                continue;
            };
            let Ok(record) = serde_json::from_str::<ApiKey>(&raw) else {
                warn!("Dropping corrupt API key record at {}", key);
                self.kv.del(&[key]).await?;
                removed += 1;
                continue;
            };
            if record.expires_at.is_some_and(|at| at < cutoff) {
                self.kv.del(&[key]).await?;
                self.kv
                    .srem(&preview_index_key(&record.key_preview), &record.id)
                    .await?;
                self.kv
                    .srem(&user_index_key(&record.user_id), &record.id)
                    .await?;
                removed += 1;
            }
        }

        if removed > 0 {
            self.monitoring
                .record_counter("apikey.cleaned", removed as u64);
        }
        Ok(removed)
    }
}
