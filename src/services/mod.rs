// Services module
// Business logic layer of the auth core

pub mod api_key;
pub mod auth;
pub mod blacklist;
pub mod jwt;
pub mod keycloak;
pub mod monitoring;
pub mod permission;
pub mod rate_limit;
pub mod session;
pub mod threat;

pub use api_key::{ApiKeyError, ApiKeyService};
pub use auth::{
    AuthService, HealthStatus, LoginRequest, LoginResponse, RefreshResponse, RegisterRequest,
    RegisterResponse, ServiceDependencies, UpdateUserRequest,
};
pub use blacklist::{BatchRevokeResult, BlacklistError, BlacklistStats, TokenBlacklistService};
pub use jwt::{
    extract_bearer_token, extract_token_from_query, validate_token_format, JwtConfig, JwtError,
    TokenService,
};
pub use keycloak::{
    IdentityProvider, IdpRole, IdpTokens, IdpUser, IdpUserUpdate, KeycloakAdapter, KeycloakError,
    NewIdpUser, UserFilter,
};
pub use monitoring::{AlertRule, MetricsSink, MonitoringService, NoopSink};
pub use permission::{PermissionError, PermissionService};
pub use rate_limit::{RateLimitOp, RateLimitResult, RateLimitService};
pub use session::{SessionContext, SessionError, SessionService, SessionTokens};
pub use threat::{ThreatDetectionService, ThreatStats};
