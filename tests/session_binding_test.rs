// Session binding, rotation and concurrency invariants through the full
// service stack

mod common;

use common::{auth_service, auth_service_with, MockIdentityProvider};
use ntx_auth_core::app_config::AppConfig;
use ntx_auth_core::services::{LoginRequest, SessionContext};
use std::sync::Arc;

fn login_request(email: &str, password: &str, ip: &str) -> LoginRequest {
    LoginRequest {
        email: email.to_string(),
        password: password.to_string(),
        ip_address: Some(ip.to_string()),
        user_agent: Some("Mozilla/5.0 (integration test)".to_string()),
        device_info: None,
    }
}

fn ctx(ip: &str) -> SessionContext {
    SessionContext {
        ip_address: Some(ip.to_string()),
        user_agent: Some("Mozilla/5.0 (integration test)".to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_ip_bound_session_rejected_from_other_ip() {
    let (auth, idp) = auth_service();
    idp.seed_user("u1@x", "p@ss-W0rd!", &["user"]);

    let response = auth
        .login(login_request("u1@x", "p@ss-W0rd!", "10.0.0.1"))
        .await
        .unwrap();
    let session_id = response.session.id.clone();

    // Same IP validates
    let ok = auth.sessions().validate_session(&session_id, ctx("10.0.0.1")).await;
    assert!(ok.valid);

    // Different IP is rejected and the session is destroyed
    let rejected = auth
        .sessions()
        .validate_session(&session_id, ctx("10.0.0.3"))
        .await;
    assert!(!rejected.valid);
    assert_eq!(rejected.error.as_deref(), Some("IP address mismatch"));

    let gone = auth
        .sessions()
        .validate_session(&session_id, ctx("10.0.0.1"))
        .await;
    assert!(!gone.valid);
    assert_eq!(gone.error.as_deref(), Some("Session not found"));
}

#[tokio::test]
async fn test_session_rotation_invalidates_old_id() {
    let mut config = AppConfig::for_test();
    config.session.rotation_interval = 0;
    let idp = Arc::new(MockIdentityProvider::new());
    idp.seed_user("u1@x", "p@ss-W0rd!", &["user"]);
    let auth = auth_service_with(config, idp);

    let response = auth
        .login(login_request("u1@x", "p@ss-W0rd!", "10.0.0.1"))
        .await
        .unwrap();
    let old_id = response.session.id.clone();

    let validation = auth.sessions().validate_session(&old_id, ctx("10.0.0.1")).await;
    assert!(validation.valid);
    assert!(validation.requires_rotation);

    let rotated = auth
        .sessions()
        .rotate_session(&old_id, ctx("10.0.0.1"))
        .await
        .unwrap();
    assert_ne!(rotated.id, old_id);

    // The old id is invalid on the subsequent request
    let stale = auth.sessions().validate_session(&old_id, ctx("10.0.0.1")).await;
    assert!(!stale.valid);

    // Rotating again yields a third distinct id and exactly one live session
    let rotated_again = auth
        .sessions()
        .rotate_session(&rotated.id, ctx("10.0.0.1"))
        .await
        .unwrap();
    assert_ne!(rotated_again.id, rotated.id);

    let live = auth
        .sessions()
        .list_user_sessions(&response.user.id)
        .await
        .unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, rotated_again.id);
}

#[tokio::test]
async fn test_concurrent_session_cap() {
    let mut config = AppConfig::for_test();
    config.session.max_concurrent_sessions = 3;
    // Keep the login limiter out of the way for six logins
    config.rate_limit.login.max_requests = 20;
    let idp = Arc::new(MockIdentityProvider::new());
    idp.seed_user("u1@x", "p@ss-W0rd!", &["user"]);
    let auth = auth_service_with(config, idp);

    let mut session_ids = Vec::new();
    for _ in 0..6 {
        let response = auth
            .login(login_request("u1@x", "p@ss-W0rd!", "10.0.0.1"))
            .await
            .unwrap();
        session_ids.push(response.session.id.clone());
    }

    let user_id = {
        let validation = auth
            .sessions()
            .validate_session(session_ids.last().unwrap(), ctx("10.0.0.1"))
            .await;
        assert!(validation.valid);
        validation.session.unwrap().user_id
    };

    let live = auth.sessions().list_user_sessions(&user_id).await.unwrap();
    assert!(
        live.len() <= 3,
        "expected at most 3 live sessions, got {}",
        live.len()
    );

    // The newest sessions survive; the first ones were evicted
    let live_ids: Vec<&str> = live.iter().map(|s| s.id.as_str()).collect();
    assert!(live_ids.contains(&session_ids[5].as_str()));
    assert!(!live_ids.contains(&session_ids[0].as_str()));
    assert!(!live_ids.contains(&session_ids[1].as_str()));
}
