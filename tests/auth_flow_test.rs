// End-to-end authentication flows over the in-memory KV and mock IdP
// Login, revocation, lockout, registration and refresh

mod common;

use common::{auth_service, auth_service_with, MockIdentityProvider};
use ntx_auth_core::app_config::AppConfig;
use ntx_auth_core::models::auth::UnverifiedClaims;
use ntx_auth_core::services::LoginRequest;
use ntx_auth_core::services::RegisterRequest;
use ntx_auth_core::utils::auth_errors::AuthError;
use serial_test::serial;
use std::sync::Arc;
use uuid::Uuid;

fn login_request(email: &str, password: &str, ip: &str) -> LoginRequest {
    LoginRequest {
        email: email.to_string(),
        password: password.to_string(),
        ip_address: Some(ip.to_string()),
        user_agent: Some("Mozilla/5.0 (integration test)".to_string()),
        device_info: None,
    }
}

#[tokio::test]
async fn test_login_happy_path() {
    let (auth, idp) = auth_service();
    idp.seed_user("u1@x", "p@ss-W0rd!", &["user"]);
    auth.initialize().await.unwrap();

    let response = auth
        .login(login_request("u1@x", "p@ss-W0rd!", "10.0.0.1"))
        .await
        .unwrap();

    assert!(response.user.roles.contains(&"user".to_string()));
    assert!(response.user.is_active);

    // Access token lives one hour, refresh seven days
    let access = UnverifiedClaims::decode(&response.tokens.access_token).unwrap();
    assert_eq!(access.exp - access.iat, 3600);
    let refresh = UnverifiedClaims::decode(&response.tokens.refresh_token).unwrap();
    assert_eq!(refresh.exp - refresh.iat, 604_800);
    assert_eq!(access.sub, response.user.id);

    // Session id is a UUID, expiry roughly now + session ttl
    assert!(Uuid::parse_str(&response.session.id).is_ok());
    let remaining = response
        .session
        .remaining_ttl_seconds(chrono::Utc::now());
    assert!((3590..=3600).contains(&remaining), "remaining={}", remaining);
}

#[tokio::test]
async fn test_login_wrong_password_is_generic() {
    let (auth, idp) = auth_service();
    idp.seed_user("u1@x", "p@ss-W0rd!", &["user"]);

    let err = auth
        .login(login_request("u1@x", "wrong", "10.0.0.1"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_CREDENTIALS");

    // Unknown users produce the exact same error
    let err = auth
        .login(login_request("ghost@x", "whatever1", "10.0.0.1"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_CREDENTIALS");
}

#[tokio::test]
async fn test_revocation_beats_expiry() {
    let (auth, idp) = auth_service();
    idp.seed_user("u1@x", "p@ss-W0rd!", &["user"]);

    let response = auth
        .login(login_request("u1@x", "p@ss-W0rd!", "10.0.0.1"))
        .await
        .unwrap();
    let access_token = response.tokens.access_token.clone();

    // Valid before revocation
    let principal = auth.verify_token(&access_token).await.unwrap();
    assert_eq!(principal.id, response.user.id);

    auth.logout(&response.user.id, Some(&access_token), None)
        .await
        .unwrap();

    // Not expired, still rejected
    let err = auth.verify_token(&access_token).await.unwrap_err();
    assert_eq!(err.error_code(), "TOKEN_REVOKED");
}

#[tokio::test]
async fn test_logout_without_token_revokes_everything() {
    let (auth, idp) = auth_service();
    idp.seed_user("u1@x", "p@ss-W0rd!", &["user"]);

    let first = auth
        .login(login_request("u1@x", "p@ss-W0rd!", "10.0.0.1"))
        .await
        .unwrap();
    let second = auth
        .login(login_request("u1@x", "p@ss-W0rd!", "10.0.0.1"))
        .await
        .unwrap();

    auth.logout(&first.user.id, None, None).await.unwrap();

    for token in [&first.tokens.access_token, &second.tokens.access_token] {
        let err = auth.verify_token(token).await.unwrap_err();
        assert_eq!(err.error_code(), "TOKEN_REVOKED");
    }
    assert!(auth
        .sessions()
        .list_user_sessions(&first.user.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
#[serial]
async fn test_brute_force_lockout_and_recovery() {
    let mut config = AppConfig::for_test();
    config.threat.max_failed_attempts = 5;
    config.threat.lockout_duration = 1; // recover quickly in tests
    let idp = Arc::new(MockIdentityProvider::new());
    idp.seed_user("u1@x", "p@ss-W0rd!", &["user"]);
    let auth = auth_service_with(config, idp);

    for _ in 0..5 {
        let err = auth
            .login(login_request("u1@x", "wrong", "10.0.0.2"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CREDENTIALS");
    }

    // The sixth attempt is refused before reaching the IdP, even with the
    // correct password
    let err = auth
        .login(login_request("u1@x", "p@ss-W0rd!", "10.0.0.2"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "ACCOUNT_LOCKED");
    assert!(err.lockout_until().is_some());
    assert!(auth.threat().is_account_locked("u1@x"));

    // After the lockout lapses the correct password succeeds and clears
    // the counters
    tokio::time::sleep(std::time::Duration::from_millis(1200)).await;
    assert!(!auth.threat().is_account_locked("u1@x"));
    let response = auth
        .login(login_request("u1@x", "p@ss-W0rd!", "10.0.0.2"))
        .await
        .unwrap();
    assert!(response.user.roles.contains(&"user".to_string()));
}

#[tokio::test]
async fn test_register_then_login() {
    let (auth, _idp) = auth_service();

    let registered = auth
        .register(RegisterRequest {
            email: "new@x".to_string(),
            password: "s3cure-pass".to_string(),
            name: "New User".to_string(),
            roles: None,
            ip_address: Some("10.0.0.5".to_string()),
        })
        .await
        .unwrap();

    assert_eq!(registered.user.roles, vec!["user".to_string()]);
    assert!(!registered.tokens.access_token.is_empty());

    // Registration collision
    let err = auth
        .register(RegisterRequest {
            email: "new@x".to_string(),
            password: "another-pass1".to_string(),
            name: "Imposter".to_string(),
            roles: None,
            ip_address: Some("10.0.0.5".to_string()),
        })
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "USER_EXISTS");

    let response = auth
        .login(login_request("new@x", "s3cure-pass", "10.0.0.5"))
        .await
        .unwrap();
    assert_eq!(response.user.email, "new@x");
}

#[tokio::test]
async fn test_register_validation() {
    let (auth, _idp) = auth_service();

    let err = auth
        .register(RegisterRequest {
            email: "not-an-email".to_string(),
            password: "s3cure-pass".to_string(),
            name: "X".to_string(),
            roles: None,
            ip_address: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");

    let err = auth
        .register(RegisterRequest {
            email: "ok@x".to_string(),
            password: "short".to_string(),
            name: "X".to_string(),
            roles: None,
            ip_address: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_refresh_flow_rotates_old_token() {
    let (auth, idp) = auth_service();
    idp.seed_user("u1@x", "p@ss-W0rd!", &["user"]);

    let response = auth
        .login(login_request("u1@x", "p@ss-W0rd!", "10.0.0.1"))
        .await
        .unwrap();

    let refreshed = auth
        .refresh_token(&response.tokens.refresh_token)
        .await
        .unwrap();
    assert_eq!(refreshed.user.id, response.user.id);
    assert!(auth.verify_token(&refreshed.tokens.access_token).await.is_ok());

    // Rotate-on-refresh: the old refresh token is spent
    let err = auth
        .refresh_token(&response.tokens.refresh_token)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "TOKEN_REVOKED");
}

#[tokio::test]
async fn test_delete_user_revokes_tokens() {
    let (auth, idp) = auth_service();
    idp.seed_user("u1@x", "p@ss-W0rd!", &["user"]);

    let response = auth
        .login(login_request("u1@x", "p@ss-W0rd!", "10.0.0.1"))
        .await
        .unwrap();

    auth.delete_user(&response.user.id).await.unwrap();

    let err = auth
        .verify_token(&response.tokens.access_token)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "TOKEN_REVOKED");

    // The user is gone from the IdP too
    let err = auth
        .login(login_request("u1@x", "p@ss-W0rd!", "10.0.0.1"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_CREDENTIALS");
}

#[tokio::test]
async fn test_health_check_aggregates_components() {
    let (auth, idp) = auth_service();
    auth.initialize().await.unwrap();

    let health = auth.health_check().await;
    assert!(health.healthy);
    assert!(health.idp && health.kv && health.permissions && health.threat);

    idp.set_healthy(false);
    let health = auth.health_check().await;
    assert!(!health.healthy);
    assert!(!health.idp);
    assert!(health.kv);
}

#[tokio::test]
async fn test_malformed_bearer_is_unauthorized() {
    let (auth, _idp) = auth_service();
    let err = auth.verify_token("not.a.jwt").await.unwrap_err();
    assert!(matches!(
        err,
        AuthError::Unauthorized | AuthError::TokenExpired
    ));
}
