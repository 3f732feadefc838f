// Revocation records for the token blacklist

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a token (or all of a user's tokens) was revoked
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    UserLogout,
    AdminRevocation,
    SecurityBreach,
    PasswordChange,
    AccountSuspended,
    TokenCompromised,
    TokenExpired,
    PolicyViolation,
    /// Old refresh token retired by rotate-on-refresh
    TokenRefresh,
}

impl RevocationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevocationReason::UserLogout => "user_logout",
            RevocationReason::AdminRevocation => "admin_revocation",
            RevocationReason::SecurityBreach => "security_breach",
            RevocationReason::PasswordChange => "password_change",
            RevocationReason::AccountSuspended => "account_suspended",
            RevocationReason::TokenCompromised => "token_compromised",
            RevocationReason::TokenExpired => "token_expired",
            RevocationReason::PolicyViolation => "policy_violation",
            RevocationReason::TokenRefresh => "token_refresh",
        }
    }
}

/// Additional context captured with a revocation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RevocationContext {
    pub revoked_by: Option<String>,
    pub session_id: Option<String>,
    pub device_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Per-token revocation record, stored under `jwt:blacklist:token:<jti>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevocationRecord {
    /// The revoked token's jti
    pub token_id: String,
    pub user_id: String,
    pub reason: RevocationReason,
    pub revoked_at: DateTime<Utc>,
    pub revoked_at_millis: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl RevocationRecord {
    pub fn new(
        token_id: impl Into<String>,
        user_id: impl Into<String>,
        reason: RevocationReason,
        context: RevocationContext,
    ) -> Self {
        let now = Utc::now();
        Self {
            token_id: token_id.into(),
            user_id: user_id.into(),
            reason,
            revoked_at: now,
            revoked_at_millis: now.timestamp_millis(),
            revoked_by: context.revoked_by,
            session_id: context.session_id,
            device_id: context.device_id,
            ip_address: context.ip_address,
            user_agent: context.user_agent,
            metadata: context.metadata,
        }
    }
}

/// User-wide revocation record: every token issued before
/// `revoked_at_millis` is dead, enumerated or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRevocationRecord {
    pub user_id: String,
    pub reason: RevocationReason,
    pub revoked_at: DateTime<Utc>,
    pub revoked_at_millis: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl UserRevocationRecord {
    pub fn new(
        user_id: impl Into<String>,
        reason: RevocationReason,
        revoked_by: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            reason,
            revoked_at: now,
            revoked_at_millis: now.timestamp_millis(),
            revoked_by,
            metadata: None,
        }
    }

    /// A token is covered by this record when it was issued strictly before
    /// the revocation instant.
    pub fn covers_iat_secs(&self, iat_secs: u64) -> bool {
        (iat_secs as i64) * 1000 < self.revoked_at_millis
    }
}
