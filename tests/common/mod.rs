// Shared fixtures for integration tests
// In-memory KV plus a scriptable identity provider stand-in; no external
// services are required.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use ntx_auth_core::app_config::AppConfig;
use ntx_auth_core::db::MemoryKvStore;
use ntx_auth_core::services::keycloak::{
    IdentityProvider, IdpRole, IdpTokens, IdpUser, IdpUserUpdate, KeycloakError, NewIdpUser,
    UserFilter,
};
use ntx_auth_core::services::{AuthService, NoopSink, ServiceDependencies};

#[derive(Debug, Clone)]
struct MockUser {
    id: String,
    email: String,
    password: String,
    first_name: Option<String>,
    last_name: Option<String>,
    enabled: bool,
    roles: Vec<String>,
}

/// Identity provider double with an in-memory user table.
#[derive(Default)]
pub struct MockIdentityProvider {
    users: Mutex<HashMap<String, MockUser>>,
    healthy: AtomicBool,
}

impl MockIdentityProvider {
    pub fn new() -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn seed_user(&self, email: &str, password: &str, roles: &[&str]) -> String {
        let id = Uuid::new_v4().to_string();
        let user = MockUser {
            id: id.clone(),
            email: email.to_string(),
            password: password.to_string(),
            first_name: Some("Test".to_string()),
            last_name: Some("User".to_string()),
            enabled: true,
            roles: roles.iter().map(|r| r.to_string()).collect(),
        };
        self.users.lock().unwrap().insert(id.clone(), user);
        id
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    fn to_idp_user(user: &MockUser) -> IdpUser {
        IdpUser {
            id: user.id.clone(),
            username: user.email.clone(),
            email: Some(user.email.clone()),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            enabled: user.enabled,
            attributes: None,
        }
    }

    fn issue_tokens() -> IdpTokens {
        IdpTokens {
            access_token: format!("idp-access-{}", Uuid::new_v4()),
            refresh_token: Some(format!("idp-refresh-{}", Uuid::new_v4())),
            id_token: None,
            expires_in: 300,
            refresh_expires_in: Some(1800),
            session_state: Some(Uuid::new_v4().to_string()),
        }
    }
}

#[async_trait]
impl IdentityProvider for MockIdentityProvider {
    async fn initialize(&self) -> Result<(), KeycloakError> {
        Ok(())
    }

    async fn authenticate_direct_grant(
        &self,
        username: &str,
        password: &str,
    ) -> Result<IdpTokens, KeycloakError> {
        let users = self.users.lock().unwrap();
        let found = users
            .values()
            .find(|u| u.email == username && u.enabled && u.password == password);
        match found {
            Some(_) => Ok(Self::issue_tokens()),
            None => Err(KeycloakError::InvalidCredentials),
        }
    }

    async fn refresh_access_token(
        &self,
        _refresh_token: &str,
    ) -> Result<IdpTokens, KeycloakError> {
        Ok(Self::issue_tokens())
    }

    async fn logout(&self, _refresh_token: &str) -> Result<(), KeycloakError> {
        Ok(())
    }

    async fn find_users(&self, filter: UserFilter) -> Result<Vec<IdpUser>, KeycloakError> {
        let users = self.users.lock().unwrap();
        Ok(users
            .values()
            .filter(|u| {
                filter
                    .email
                    .as_deref()
                    .map_or(true, |email| u.email == email)
                    && filter
                        .username
                        .as_deref()
                        .map_or(true, |username| u.email == username)
            })
            .map(Self::to_idp_user)
            .collect())
    }

    async fn get_user(&self, user_id: &str) -> Result<IdpUser, KeycloakError> {
        let users = self.users.lock().unwrap();
        users
            .get(user_id)
            .map(Self::to_idp_user)
            .ok_or(KeycloakError::NotFound)
    }

    async fn create_user(&self, new_user: NewIdpUser) -> Result<IdpUser, KeycloakError> {
        let mut users = self.users.lock().unwrap();
        if users.values().any(|u| u.email == new_user.email) {
            return Err(KeycloakError::Conflict);
        }
        let id = Uuid::new_v4().to_string();
        let user = MockUser {
            id: id.clone(),
            email: new_user.email,
            password: new_user.password,
            first_name: new_user.first_name,
            last_name: new_user.last_name,
            enabled: true,
            roles: Vec::new(),
        };
        let idp_user = Self::to_idp_user(&user);
        users.insert(id, user);
        Ok(idp_user)
    }

    async fn update_user(
        &self,
        user_id: &str,
        update: IdpUserUpdate,
    ) -> Result<(), KeycloakError> {
        let mut users = self.users.lock().unwrap();
        let user = users.get_mut(user_id).ok_or(KeycloakError::NotFound)?;
        if let Some(email) = update.email {
            user.email = email;
        }
        if let Some(first_name) = update.first_name {
            user.first_name = Some(first_name);
        }
        if let Some(last_name) = update.last_name {
            user.last_name = Some(last_name);
        }
        if let Some(enabled) = update.enabled {
            user.enabled = enabled;
        }
        Ok(())
    }

    async fn delete_user(&self, user_id: &str) -> Result<(), KeycloakError> {
        let mut users = self.users.lock().unwrap();
        users
            .remove(user_id)
            .map(|_| ())
            .ok_or(KeycloakError::NotFound)
    }

    async fn list_user_roles(&self, user_id: &str) -> Result<Vec<String>, KeycloakError> {
        let users = self.users.lock().unwrap();
        users
            .get(user_id)
            .map(|u| u.roles.clone())
            .ok_or(KeycloakError::NotFound)
    }

    async fn assign_user_roles(
        &self,
        user_id: &str,
        role_names: &[String],
    ) -> Result<(), KeycloakError> {
        let mut users = self.users.lock().unwrap();
        let user = users.get_mut(user_id).ok_or(KeycloakError::NotFound)?;
        for role in role_names {
            if !user.roles.contains(role) {
                user.roles.push(role.clone());
            }
        }
        Ok(())
    }

    async fn list_realm_role_mappings(&self) -> Result<Vec<IdpRole>, KeycloakError> {
        Ok(["admin", "user", "guest"]
            .iter()
            .map(|name| IdpRole {
                id: format!("realm-role-{}", name),
                name: name.to_string(),
                description: None,
            })
            .collect())
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// Build an auth service over the in-memory KV and the mock IdP.
pub fn auth_service_with(config: AppConfig, idp: Arc<MockIdentityProvider>) -> AuthService {
    AuthService::new(ServiceDependencies {
        config,
        kv: Arc::new(MemoryKvStore::new()),
        idp,
        db: None,
        sink: Arc::new(NoopSink),
    })
    .expect("auth service construction failed")
}

pub fn auth_service() -> (AuthService, Arc<MockIdentityProvider>) {
    let idp = Arc::new(MockIdentityProvider::new());
    (auth_service_with(AppConfig::for_test(), idp.clone()), idp)
}
