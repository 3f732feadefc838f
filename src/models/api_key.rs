// API key records
// Only the bcrypt hash and a short cleartext preview are ever persisted;
// the raw key is returned to the caller exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub name: String,
    pub user_id: String,
    pub key_hash: String,
    pub key_preview: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ApiKey {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn summary(&self) -> ApiKeySummary {
        ApiKeySummary {
            id: self.id.clone(),
            name: self.name.clone(),
            user_id: self.user_id.clone(),
            key_preview: self.key_preview.clone(),
            scopes: self.scopes.clone(),
            is_active: self.is_active,
            expires_at: self.expires_at,
            last_used_at: self.last_used_at,
            usage_count: self.usage_count,
            created_at: self.created_at,
        }
    }
}

/// Listing view: never exposes the hash (or, obviously, the raw key).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeySummary {
    pub id: String,
    pub name: String,
    pub user_id: String,
    pub key_preview: String,
    pub scopes: Vec<String>,
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Parameters for creating a key
#[derive(Debug, Clone, Default)]
pub struct CreateApiKeyParams {
    pub name: String,
    pub scopes: Vec<String>,
    pub permissions: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Successful validation outcome: what the bearer of the key is allowed to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyAuth {
    pub key_id: String,
    pub user_id: String,
    pub scopes: Vec<String>,
    pub permissions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key() -> ApiKey {
        let now = Utc::now();
        ApiKey {
            id: "k1".into(),
            name: "ci key".into(),
            user_id: "u1".into(),
            key_hash: "$2b$04$hash".into(),
            key_preview: "ntx_abcd1234".into(),
            scopes: vec!["read".into()],
            permissions: vec!["read:document".into()],
            is_active: true,
            expires_at: None,
            last_used_at: None,
            usage_count: 0,
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let mut k = key();
        assert!(!k.is_expired(now));

        k.expires_at = Some(now - Duration::seconds(1));
        assert!(k.is_expired(now));
    }

    #[test]
    fn test_summary_never_contains_hash() {
        let summary = key().summary();
        let json = serde_json::to_string(&summary).unwrap();
        assert!(!json.contains("key_hash"));
        assert!(!json.contains("$2b$"));
        assert!(json.contains("ntx_abcd1234"));
    }
}
