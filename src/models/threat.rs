// Threat detection state types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Active lockout for a single account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountLockout {
    pub user_id: String,
    pub reason: String,
    pub lockout_until: DateTime<Utc>,
    pub failed_attempts: u32,
    pub last_attempt: DateTime<Utc>,
    pub ip_addresses: Vec<String>,
}

impl AccountLockout {
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lockout_until > now
    }
}

/// Brute-force accounting entry keyed by `"<ip>:<user_id>"`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BruteForceAttempt {
    pub ip_address: String,
    pub user_id: String,
    pub attempts: u32,
    pub first_attempt: DateTime<Utc>,
    pub last_attempt: DateTime<Utc>,
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_expires: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ThreatSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThreatEventKind {
    BruteForce,
    SuspiciousActivity,
    AccountLocked,
    IpBlocked,
}

/// Immutable threat event appended to the bounded in-process ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatEvent {
    pub id: String,
    pub kind: ThreatEventKind,
    pub severity: ThreatSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ThreatEvent {
    pub fn new(
        kind: ThreatEventKind,
        severity: ThreatSeverity,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            severity,
            user_id: None,
            ip_address: None,
            description: description.into(),
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }
}
