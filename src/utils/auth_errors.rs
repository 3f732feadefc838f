// Caller-visible authentication error taxonomy
// Internal component errors are converted to these at the orchestrator boundary

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Authentication and authorization errors visible to callers.
///
/// Messages are intentionally coarse: a failed login never reveals whether
/// the email exists, whether the password was wrong, or whether the IdP was
/// unreachable beyond the generic service error.
#[derive(Error, Debug, Clone)]
pub enum AuthError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Token has been revoked")]
    TokenRevoked,

    #[error("Token has expired")]
    TokenExpired,

    #[error("Forbidden")]
    Forbidden,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account is locked due to too many failed attempts")]
    AccountLocked { lockout_until: DateTime<Utc> },

    #[error("Access from this IP address is blocked")]
    IpBlocked,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("User already exists")]
    UserExists,

    #[error("Session has expired")]
    SessionExpired,

    #[error("Too many requests")]
    RateLimited { retry_after_seconds: u64 },

    #[error("Service error")]
    Service(String),
}

impl AuthError {
    /// Stable error code for API consumers
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthError::Unauthorized => "UNAUTHORIZED",
            AuthError::TokenRevoked => "TOKEN_REVOKED",
            AuthError::TokenExpired => "TOKEN_EXPIRED",
            AuthError::Forbidden => "FORBIDDEN",
            AuthError::InvalidCredentials => "INVALID_CREDENTIALS",
            AuthError::AccountLocked { .. } => "ACCOUNT_LOCKED",
            AuthError::IpBlocked => "IP_BLOCKED",
            AuthError::Validation(_) => "VALIDATION_ERROR",
            AuthError::UserExists => "USER_EXISTS",
            AuthError::SessionExpired => "SESSION_EXPIRED",
            AuthError::RateLimited { .. } => "RATE_LIMITED",
            AuthError::Service(_) => "SERVICE_ERROR",
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            AuthError::RateLimited {
                retry_after_seconds,
            } => Some(*retry_after_seconds),
            _ => None,
        }
    }

    pub fn lockout_until(&self) -> Option<DateTime<Utc>> {
        match self {
            AuthError::AccountLocked { lockout_until } => Some(*lockout_until),
            _ => None,
        }
    }
}

/// Serializable failure envelope returned across the API boundary
#[derive(Debug, Serialize)]
pub struct AuthErrorResponse {
    pub success: bool,
    pub code: String,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lockout_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl From<&AuthError> for AuthErrorResponse {
    fn from(err: &AuthError) -> Self {
        Self {
            success: false,
            code: err.error_code().to_string(),
            error: err.to_string(),
            lockout_until: err.lockout_until(),
            retry_after: err.retry_after(),
        }
    }
}

/// Log an authentication failure with request context
pub fn log_auth_failure(email: &str, ip: Option<&str>, error: &AuthError) {
    tracing::warn!(
        email = email,
        ip = ip.unwrap_or("unknown"),
        error_code = error.error_code(),
        "Authentication failure"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(AuthError::Unauthorized.error_code(), "UNAUTHORIZED");
        assert_eq!(
            AuthError::InvalidCredentials.error_code(),
            "INVALID_CREDENTIALS"
        );
        assert_eq!(AuthError::TokenRevoked.error_code(), "TOKEN_REVOKED");
        assert_eq!(
            AuthError::RateLimited {
                retry_after_seconds: 30
            }
            .error_code(),
            "RATE_LIMITED"
        );
    }

    #[test]
    fn test_response_envelope_carries_retry_after() {
        let err = AuthError::RateLimited {
            retry_after_seconds: 42,
        };
        let resp = AuthErrorResponse::from(&err);
        assert!(!resp.success);
        assert_eq!(resp.code, "RATE_LIMITED");
        assert_eq!(resp.retry_after, Some(42));
    }

    #[test]
    fn test_invalid_credentials_message_is_generic() {
        // The display string must not mention users, emails, or lockout state
        let msg = AuthError::InvalidCredentials.to_string();
        assert_eq!(msg, "Invalid credentials");
    }
}
