// Token claim structures
// Roles and permissions are denormalized into the token at issue time so
// verification can rebuild the principal without a user-store round trip.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::user::AuthUser;

/// Marker value of the `type` claim on refresh tokens
pub const REFRESH_TOKEN_TYPE: &str = "refresh";

/// Access token claims
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessTokenClaims {
    /// User ID (subject)
    pub sub: String,

    /// JWT ID for token revocation (UUID format)
    pub jti: String,

    pub email: String,
    pub name: String,

    pub roles: Vec<String>,
    pub permissions: Vec<String>,

    pub aud: String,
    pub iss: String,

    /// Issued at timestamp (Unix epoch seconds)
    pub iat: u64,

    /// Expires at timestamp (Unix epoch seconds)
    pub exp: u64,
}

/// Refresh token claims: the same identity payload plus the `type` marker,
/// so a refresh is self-sufficient without re-fetching the user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefreshTokenClaims {
    pub sub: String,
    pub jti: String,

    pub email: String,
    pub name: String,

    pub roles: Vec<String>,
    pub permissions: Vec<String>,

    pub aud: String,
    pub iss: String,

    pub iat: u64,
    pub exp: u64,

    #[serde(rename = "type")]
    pub token_type: String,
}

impl AccessTokenClaims {
    pub fn is_expired(&self, now: u64) -> bool {
        self.exp <= now
    }

    /// Rebuild the principal from claims. Valid for this request only;
    /// authoritative role state lives with the permission service.
    pub fn to_user(&self) -> AuthUser {
        let mut user = AuthUser::new(self.sub.clone(), self.email.clone(), self.name.clone());
        user.roles = self.roles.clone();
        user.permissions = self.permissions.clone();
        user
    }
}

impl RefreshTokenClaims {
    pub fn is_expired(&self, now: u64) -> bool {
        self.exp <= now
    }

    pub fn is_refresh(&self) -> bool {
        self.token_type == REFRESH_TOKEN_TYPE
    }

    pub fn to_user(&self) -> AuthUser {
        let mut user = AuthUser::new(self.sub.clone(), self.email.clone(), self.name.clone());
        user.roles = self.roles.clone();
        user.permissions = self.permissions.clone();
        user
    }
}

/// Issued token pair returned to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: u64,
    /// Refresh token lifetime in seconds
    pub refresh_expires_in: u64,
}

/// Minimal claims decoded without signature verification.
///
/// Used by the blacklist for structural validation and by user-wide
/// revocation to recover jtis from mirrored tokens. Never used to authorize.
#[derive(Debug, Clone, Deserialize)]
pub struct UnverifiedClaims {
    pub sub: String,
    pub jti: String,
    #[serde(default)]
    pub iat: u64,
    #[serde(default)]
    pub exp: u64,
    #[serde(rename = "type", default)]
    pub token_type: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl UnverifiedClaims {
    /// Decode the payload segment of a JWT without verifying the signature.
    ///
    /// The structure is still validated: exactly three non-empty base64url
    /// segments, a JSON payload, and non-empty `sub`/`jti` claims.
    pub fn decode(token: &str) -> Result<Self, String> {
        use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return Err("token must have exactly three non-empty segments".to_string());
        }

        let payload = URL_SAFE_NO_PAD
            .decode(parts[1])
            .map_err(|_| "payload segment is not valid base64url".to_string())?;

        let claims: UnverifiedClaims = serde_json::from_slice(&payload)
            .map_err(|e| format!("payload is not valid claims JSON: {}", e))?;

        if claims.sub.is_empty() || claims.jti.is_empty() {
            return Err("token is missing sub or jti".to_string());
        }

        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access_claims() -> AccessTokenClaims {
        AccessTokenClaims {
            sub: "user-1".into(),
            jti: "jti-1".into(),
            email: "u1@example.com".into(),
            name: "User One".into(),
            roles: vec!["user".into()],
            permissions: vec!["read:document".into()],
            aud: "test.ntx-api".into(),
            iss: "test.ntx-auth".into(),
            iat: 1_700_000_000,
            exp: 1_700_003_600,
        }
    }

    #[test]
    fn test_access_claims_roundtrip() {
        let claims = access_claims();
        let json = serde_json::to_string(&claims).unwrap();
        let parsed: AccessTokenClaims = serde_json::from_str(&json).unwrap();
        assert_eq!(claims, parsed);
    }

    #[test]
    fn test_refresh_type_claim_serializes_as_type() {
        let claims = RefreshTokenClaims {
            sub: "user-1".into(),
            jti: "jti-2".into(),
            email: "u1@example.com".into(),
            name: "User One".into(),
            roles: vec![],
            permissions: vec![],
            aud: "a".into(),
            iss: "i".into(),
            iat: 0,
            exp: 1,
            token_type: REFRESH_TOKEN_TYPE.into(),
        };

        let value = serde_json::to_value(&claims).unwrap();
        assert_eq!(value["type"], "refresh");
        assert!(claims.is_refresh());
    }

    #[test]
    fn test_expiry_check() {
        let claims = access_claims();
        assert!(!claims.is_expired(claims.exp - 1));
        assert!(claims.is_expired(claims.exp));
    }

    #[test]
    fn test_principal_reconstruction() {
        let claims = access_claims();
        let user = claims.to_user();
        assert_eq!(user.id, "user-1");
        assert_eq!(user.roles, vec!["user"]);
        assert_eq!(user.permissions, vec!["read:document"]);
    }

    #[test]
    fn test_unverified_claims_tolerate_extra_fields() {
        let json = r#"{"sub":"u","jti":"j","iat":10,"exp":20,"custom":"x"}"#;
        let claims: UnverifiedClaims = serde_json::from_str(json).unwrap();
        assert_eq!(claims.sub, "u");
        assert_eq!(claims.token_type, None);
        assert!(claims.extra.contains_key("custom"));
    }
}
