// Session record
// Tokens inside the record are encrypted at rest by the session service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Device information captured at session creation
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceInfo {
    pub device_name: Option<String>,
    pub device_type: Option<String>,
    pub os: Option<String>,
}

/// Session record persisted under `session:<id>` in the KV.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keycloak_session_id: Option<String>,

    /// Encrypted at rest when token encryption is enabled
    pub access_token: String,
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,

    pub token_expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_expires_at: Option<DateTime<Utc>>,

    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_info: Option<DeviceInfo>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,

    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,

    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds()
    }

    pub fn remaining_ttl_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds()
    }
}

/// Result of a session validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
    pub requires_rotation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionValidation {
    pub fn ok(session: Session, requires_rotation: bool) -> Self {
        Self {
            valid: true,
            session: Some(session),
            requires_rotation,
            error: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            session: None,
            requires_rotation: false,
            error: Some(reason.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session() -> Session {
        let now = Utc::now();
        Session {
            id: "s1".into(),
            user_id: "u1".into(),
            keycloak_session_id: None,
            access_token: "ciphertext".into(),
            refresh_token: None,
            id_token: None,
            token_expires_at: now + Duration::hours(1),
            refresh_expires_at: None,
            fingerprint: "fp".into(),
            device_info: None,
            ip_address: Some("10.0.0.1".into()),
            user_agent: Some("test".into()),
            created_at: now,
            last_activity: now,
            expires_at: now + Duration::hours(1),
            is_active: true,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_expiry_and_age() {
        let s = session();
        let now = Utc::now();
        assert!(!s.is_expired(now));
        assert!(s.is_expired(now + Duration::hours(2)));
        assert!(s.age_seconds(now + Duration::minutes(5)) >= 300);
        assert!(s.remaining_ttl_seconds(now) <= 3600);
    }

    #[test]
    fn test_serialization_skips_empty_options() {
        let s = session();
        let value = serde_json::to_value(&s).unwrap();
        assert!(value.get("keycloak_session_id").is_none());
        assert!(value.get("id_token").is_none());
        let parsed: Session = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.id, "s1");
    }

    #[test]
    fn test_validation_constructors() {
        let ok = SessionValidation::ok(session(), true);
        assert!(ok.valid);
        assert!(ok.requires_rotation);

        let rejected = SessionValidation::rejected("IP address mismatch");
        assert!(!rejected.valid);
        assert_eq!(rejected.error.as_deref(), Some("IP address mismatch"));
    }
}
