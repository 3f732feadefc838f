// Data model for the auth core

pub mod api_key;
pub mod auth;
pub mod revocation;
pub mod role;
pub mod session;
pub mod threat;
pub mod user;

pub use api_key::{ApiKey, ApiKeyAuth, ApiKeySummary, CreateApiKeyParams};
pub use auth::{
    AccessTokenClaims, RefreshTokenClaims, TokenPair, UnverifiedClaims, REFRESH_TOKEN_TYPE,
};
pub use revocation::{
    RevocationContext, RevocationReason, RevocationRecord, UserRevocationRecord,
};
pub use role::{
    parse_permission_string, Ability, Permission, Role, Rule, ACTION_MANAGE, RESOURCE_ALL,
};
pub use session::{DeviceInfo, Session, SessionValidation};
pub use threat::{
    AccountLockout, BruteForceAttempt, ThreatEvent, ThreatEventKind, ThreatSeverity,
};
pub use user::{AuthUser, NewUserRecord, UserError, UserRecord, UserRecordUpdate};
