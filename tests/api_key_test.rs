// API key lifecycle through the orchestrator

mod common;

use common::auth_service;
use ntx_auth_core::models::api_key::CreateApiKeyParams;
use std::collections::HashMap;

fn params(name: &str) -> CreateApiKeyParams {
    CreateApiKeyParams {
        name: name.to_string(),
        scopes: vec!["read".to_string()],
        permissions: vec!["read:document".to_string()],
        expires_at: None,
        metadata: HashMap::new(),
    }
}

#[tokio::test]
async fn test_key_rotation_swaps_validity() {
    let (auth, _idp) = auth_service();

    let (record, raw1) = auth.create_api_key("u1", params("k")).await.unwrap();
    assert!(raw1.starts_with("ntx_"));

    let valid = auth.validate_api_key(&raw1).await.unwrap();
    assert_eq!(valid.user_id, "u1");

    let (_new_record, raw2) = auth.api_keys().rotate_api_key(&record.id).await.unwrap();

    // Old raw key dies, the replacement works and keeps the owner
    assert!(auth.validate_api_key(&raw1).await.is_err());
    let rotated = auth.validate_api_key(&raw2).await.unwrap();
    assert_eq!(rotated.user_id, "u1");
    assert_eq!(rotated.scopes, vec!["read"]);
}

#[tokio::test]
async fn test_validation_errors_are_unauthorized() {
    let (auth, _idp) = auth_service();
    auth.create_api_key("u1", params("k")).await.unwrap();

    let err = auth
        .validate_api_key("ntx_never-issued-key-material-here")
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "UNAUTHORIZED");
}

#[tokio::test]
async fn test_raw_key_returned_exactly_once() {
    let (auth, _idp) = auth_service();
    let (record, raw) = auth.create_api_key("u1", params("k")).await.unwrap();

    // Nothing listable contains the raw key or the hash
    let listed = auth.api_keys().list_user_keys("u1").await.unwrap();
    assert_eq!(listed.len(), 1);
    let json = serde_json::to_string(&listed).unwrap();
    assert!(!json.contains(&raw));
    assert!(!json.contains(&record.key_hash));
    assert!(json.contains(&record.key_preview));
}
