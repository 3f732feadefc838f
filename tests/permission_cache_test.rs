// Permission evaluation and cache coherence across role mutations

mod common;

use common::auth_service;
use ntx_auth_core::models::role::Permission;
use ntx_auth_core::services::LoginRequest;

fn login_request(email: &str, password: &str) -> LoginRequest {
    LoginRequest {
        email: email.to_string(),
        password: password.to_string(),
        ip_address: Some("10.0.0.1".to_string()),
        user_agent: Some("Mozilla/5.0 (integration test)".to_string()),
        device_info: None,
    }
}

#[tokio::test]
async fn test_permission_change_is_visible_immediately() {
    let (auth, idp) = auth_service();
    idp.seed_user("u1@x", "p@ss-W0rd!", &["user"]);

    let user = auth
        .login(login_request("u1@x", "p@ss-W0rd!"))
        .await
        .unwrap()
        .user;

    assert!(!auth.can(&user, "delete", "document", None));

    auth.permissions()
        .add_permission_to_role("user", Permission::new("delete", "document"))
        .await
        .unwrap();

    // No stale cache: the very next decision reflects the new grant
    assert!(auth.can(&user, "delete", "document", None));
}

#[tokio::test]
async fn test_permission_removal_is_monotonic() {
    let (auth, idp) = auth_service();
    idp.seed_user("u1@x", "p@ss-W0rd!", &["user"]);

    let user = auth
        .login(login_request("u1@x", "p@ss-W0rd!"))
        .await
        .unwrap()
        .user;

    auth.permissions()
        .add_permission_to_role("user", Permission::new("export", "report"))
        .await
        .unwrap();
    assert!(auth.can(&user, "export", "report", None));

    auth.permissions()
        .remove_permission_from_role("user", "export", "report")
        .await
        .unwrap();
    assert!(!auth.can(&user, "export", "report", None));

    // Reinstating restores the grant
    auth.permissions()
        .add_permission_to_role("user", Permission::new("export", "report"))
        .await
        .unwrap();
    assert!(auth.can(&user, "export", "report", None));
}

#[tokio::test]
async fn test_admin_manage_all() {
    let (auth, idp) = auth_service();
    idp.seed_user("root@x", "p@ss-W0rd!", &["admin"]);

    let admin = auth
        .login(login_request("root@x", "p@ss-W0rd!"))
        .await
        .unwrap()
        .user;

    assert!(auth.can(&admin, "delete", "anything", None));
    let permissions = auth.get_user_permissions(&admin);
    assert!(permissions.contains(&"manage:all".to_string()));
}

#[tokio::test]
async fn test_verify_token_enriches_permissions() {
    let (auth, idp) = auth_service();
    idp.seed_user("u1@x", "p@ss-W0rd!", &["user"]);

    let tokens = auth
        .login(login_request("u1@x", "p@ss-W0rd!"))
        .await
        .unwrap()
        .tokens;

    let principal = auth.verify_token(&tokens.access_token).await.unwrap();
    assert!(principal
        .permissions
        .contains(&"read:profile".to_string()));
}
