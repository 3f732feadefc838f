// Identity provider adapter (Keycloak)
// Admin-API user CRUD, Direct Grant login, token refresh, role assignment.
// Error surface is deliberately coarse: callers can distinguish bad
// credentials from a broken upstream, and nothing else.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, instrument, warn};

use crate::app_config::KeycloakSettings;

/// Refresh the cached admin token this long before it actually expires.
const ADMIN_TOKEN_SLACK: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum KeycloakError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("User already exists")]
    Conflict,

    #[error("Not found")]
    NotFound,

    #[error("Identity provider not initialized")]
    NotInitialized,

    #[error("Identity provider error: {0}")]
    Service(String),
}

impl From<reqwest::Error> for KeycloakError {
    fn from(err: reqwest::Error) -> Self {
        // Transport errors never reveal user state
        KeycloakError::Service(err.to_string())
    }
}

/// Tokens returned by the IdP
#[derive(Debug, Clone)]
pub struct IdpTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub expires_in: u64,
    pub refresh_expires_in: Option<u64>,
    pub session_state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    expires_in: u64,
    #[serde(default)]
    refresh_expires_in: Option<u64>,
    #[serde(default)]
    session_state: Option<String>,
}

impl From<TokenResponse> for IdpTokens {
    fn from(resp: TokenResponse) -> Self {
        Self {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            id_token: resp.id_token,
            expires_in: resp.expires_in,
            refresh_expires_in: resp.refresh_expires_in,
            session_state: resp.session_state,
        }
    }
}

/// User representation from the IdP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdpUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(rename = "firstName", default)]
    pub first_name: Option<String>,
    #[serde(rename = "lastName", default)]
    pub last_name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<serde_json::Value>,
}

fn default_true() -> bool {
    true
}

impl IdpUser {
    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => format!("{} {}", first, last),
            (Some(first), None) => first.clone(),
            (None, Some(last)) => last.clone(),
            (None, None) => self.username.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UserFilter {
    pub email: Option<String>,
    pub username: Option<String>,
    pub max: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct NewIdpUser {
    pub email: String,
    pub password: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct IdpUserUpdate {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdpRole {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Contract between the auth core and the identity provider.
///
/// Implementations must keep error messages coarse: only "invalid
/// credentials" and "service error" may be distinguished by callers.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn initialize(&self) -> Result<(), KeycloakError>;
    async fn authenticate_direct_grant(
        &self,
        username: &str,
        password: &str,
    ) -> Result<IdpTokens, KeycloakError>;
    async fn refresh_access_token(&self, refresh_token: &str)
        -> Result<IdpTokens, KeycloakError>;
    async fn logout(&self, refresh_token: &str) -> Result<(), KeycloakError>;
    async fn find_users(&self, filter: UserFilter) -> Result<Vec<IdpUser>, KeycloakError>;
    async fn get_user(&self, user_id: &str) -> Result<IdpUser, KeycloakError>;
    async fn create_user(&self, new_user: NewIdpUser) -> Result<IdpUser, KeycloakError>;
    async fn update_user(
        &self,
        user_id: &str,
        update: IdpUserUpdate,
    ) -> Result<(), KeycloakError>;
    async fn delete_user(&self, user_id: &str) -> Result<(), KeycloakError>;
    async fn list_user_roles(&self, user_id: &str) -> Result<Vec<String>, KeycloakError>;
    async fn assign_user_roles(
        &self,
        user_id: &str,
        role_names: &[String],
    ) -> Result<(), KeycloakError>;
    async fn list_realm_role_mappings(&self) -> Result<Vec<IdpRole>, KeycloakError>;
    async fn health_check(&self) -> bool;
}

struct AdminToken {
    access_token: String,
    expires_at: Instant,
}

/// Keycloak-backed identity provider
pub struct KeycloakAdapter {
    settings: KeycloakSettings,
    client: reqwest::Client,
    admin_token: RwLock<Option<AdminToken>>,
}

impl KeycloakAdapter {
    pub fn new(settings: KeycloakSettings) -> Result<Self, KeycloakError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout))
            .build()?;
        Ok(Self {
            settings,
            client,
            admin_token: RwLock::new(None),
        })
    }

    fn token_endpoint(&self) -> String {
        format!(
            "{}/realms/{}/protocol/openid-connect/token",
            self.settings.base_url, self.settings.realm
        )
    }

    fn logout_endpoint(&self) -> String {
        format!(
            "{}/realms/{}/protocol/openid-connect/logout",
            self.settings.base_url, self.settings.realm
        )
    }

    fn admin_url(&self, path: &str) -> String {
        format!(
            "{}/admin/realms/{}{}",
            self.settings.base_url, self.settings.realm, path
        )
    }

    async fn request_admin_token(&self) -> Result<TokenResponse, KeycloakError> {
        // Service accounts authenticate with client credentials; a
        // configured admin user falls back to the password grant.
        let mut form: Vec<(&str, &str)> = vec![("client_id", &self.settings.client_id)];
        if !self.settings.client_secret.is_empty() {
            form.push(("client_secret", &self.settings.client_secret));
        }
        if self.settings.admin_username.is_empty() {
            form.push(("grant_type", "client_credentials"));
        } else {
            form.push(("grant_type", "password"));
            form.push(("username", &self.settings.admin_username));
            form.push(("password", &self.settings.admin_password));
        }

        let response = self
            .client
            .post(self.token_endpoint())
            .form(&form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            error!("Admin authentication failed with status {}", status);
            return Err(KeycloakError::Service(format!(
                "admin authentication failed ({})",
                status
            )));
        }

        Ok(response.json::<TokenResponse>().await?)
    }

    async fn admin_bearer(&self) -> Result<String, KeycloakError> {
        {
            let guard = self.admin_token.read().await;
            if let Some(token) = guard.as_ref() {
                if token.expires_at > Instant::now() + ADMIN_TOKEN_SLACK {
                    return Ok(token.access_token.clone());
                }
            }
        }

        let response = self.request_admin_token().await?;
        let access_token = response.access_token.clone();
        *self.admin_token.write().await = Some(AdminToken {
            access_token: access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(response.expires_in),
        });
        Ok(access_token)
    }

    fn grant_form<'a>(&'a self, username: &'a str, password: &'a str) -> Vec<(&'a str, &'a str)> {
        let mut form = vec![
            ("grant_type", "password"),
            ("client_id", self.settings.client_id.as_str()),
            ("username", username),
            ("password", password),
            ("scope", "openid"),
        ];
        if !self.settings.client_secret.is_empty() {
            form.push(("client_secret", self.settings.client_secret.as_str()));
        }
        form
    }
}

#[async_trait]
impl IdentityProvider for KeycloakAdapter {
    #[instrument(skip(self))]
    async fn initialize(&self) -> Result<(), KeycloakError> {
        self.admin_bearer().await?;
        debug!("Identity provider admin session established");
        Ok(())
    }

    async fn authenticate_direct_grant(
        &self,
        username: &str,
        password: &str,
    ) -> Result<IdpTokens, KeycloakError> {
        let response = self
            .client
            .post(self.token_endpoint())
            .form(&self.grant_form(username, password))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<TokenResponse>().await?.into());
        }
        if status.as_u16() == 400 || status.as_u16() == 401 {
            // Wrong password, unknown user, disabled account: all the same
            return Err(KeycloakError::InvalidCredentials);
        }
        Err(KeycloakError::Service(format!(
            "direct grant failed ({})",
            status
        )))
    }

    async fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> Result<IdpTokens, KeycloakError> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("client_id", self.settings.client_id.as_str()),
            ("refresh_token", refresh_token),
        ];
        if !self.settings.client_secret.is_empty() {
            form.push(("client_secret", self.settings.client_secret.as_str()));
        }

        let response = self
            .client
            .post(self.token_endpoint())
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<TokenResponse>().await?.into());
        }
        if status.as_u16() == 400 || status.as_u16() == 401 {
            return Err(KeycloakError::InvalidCredentials);
        }
        Err(KeycloakError::Service(format!(
            "token refresh failed ({})",
            status
        )))
    }

    async fn logout(&self, refresh_token: &str) -> Result<(), KeycloakError> {
        let mut form = vec![
            ("client_id", self.settings.client_id.as_str()),
            ("refresh_token", refresh_token),
        ];
        if !self.settings.client_secret.is_empty() {
            form.push(("client_secret", self.settings.client_secret.as_str()));
        }

        let response = self
            .client
            .post(self.logout_endpoint())
            .form(&form)
            .send()
            .await?;

        if !response.status().is_success() {
            warn!("IdP logout returned {}", response.status());
        }
        Ok(())
    }

    async fn find_users(&self, filter: UserFilter) -> Result<Vec<IdpUser>, KeycloakError> {
        let bearer = self.admin_bearer().await?;
        let mut request = self.client.get(self.admin_url("/users")).bearer_auth(bearer);

        if let Some(email) = &filter.email {
            request = request.query(&[("email", email.as_str()), ("exact", "true")]);
        }
        if let Some(username) = &filter.username {
            request = request.query(&[("username", username.as_str())]);
        }
        if let Some(max) = filter.max {
            request = request.query(&[("max", max)]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(KeycloakError::Service(format!(
                "user search failed ({})",
                response.status()
            )));
        }
        Ok(response.json::<Vec<IdpUser>>().await?)
    }

    async fn get_user(&self, user_id: &str) -> Result<IdpUser, KeycloakError> {
        let bearer = self.admin_bearer().await?;
        let response = self
            .client
            .get(self.admin_url(&format!("/users/{}", user_id)))
            .bearer_auth(bearer)
            .send()
            .await?;

        match response.status().as_u16() {
            404 => Err(KeycloakError::NotFound),
            s if (200..300).contains(&s) => Ok(response.json::<IdpUser>().await?),
            s => Err(KeycloakError::Service(format!("user fetch failed ({})", s))),
        }
    }

    #[instrument(skip(self, new_user))]
    async fn create_user(&self, new_user: NewIdpUser) -> Result<IdpUser, KeycloakError> {
        let bearer = self.admin_bearer().await?;
        let body = serde_json::json!({
            "username": new_user.email,
            "email": new_user.email,
            "firstName": new_user.first_name,
            "lastName": new_user.last_name,
            "enabled": true,
            "emailVerified": false,
            "credentials": [{
                "type": "password",
                "value": new_user.password,
                "temporary": false,
            }],
        });

        let response = self
            .client
            .post(self.admin_url("/users"))
            .bearer_auth(bearer)
            .json(&body)
            .send()
            .await?;

        match response.status().as_u16() {
            409 => return Err(KeycloakError::Conflict),
            s if (200..300).contains(&s) => {},
            s => return Err(KeycloakError::Service(format!("user create failed ({})", s))),
        }

        // Creation returns no body; resolve the new id by exact email match
        let created = self
            .find_users(UserFilter {
                email: Some(new_user.email.clone()),
                ..Default::default()
            })
            .await?;
        created
            .into_iter()
            .next()
            .ok_or_else(|| KeycloakError::Service("created user not found".to_string()))
    }

    async fn update_user(
        &self,
        user_id: &str,
        update: IdpUserUpdate,
    ) -> Result<(), KeycloakError> {
        let bearer = self.admin_bearer().await?;

        let mut body = serde_json::Map::new();
        if let Some(email) = update.email {
            body.insert("email".to_string(), serde_json::json!(email));
        }
        if let Some(first_name) = update.first_name {
            body.insert("firstName".to_string(), serde_json::json!(first_name));
        }
        if let Some(last_name) = update.last_name {
            body.insert("lastName".to_string(), serde_json::json!(last_name));
        }
        if let Some(enabled) = update.enabled {
            body.insert("enabled".to_string(), serde_json::json!(enabled));
        }

        let response = self
            .client
            .put(self.admin_url(&format!("/users/{}", user_id)))
            .bearer_auth(bearer)
            .json(&serde_json::Value::Object(body))
            .send()
            .await?;

        match response.status().as_u16() {
            404 => Err(KeycloakError::NotFound),
            s if (200..300).contains(&s) => Ok(()),
            s => Err(KeycloakError::Service(format!("user update failed ({})", s))),
        }
    }

    async fn delete_user(&self, user_id: &str) -> Result<(), KeycloakError> {
        let bearer = self.admin_bearer().await?;
        let response = self
            .client
            .delete(self.admin_url(&format!("/users/{}", user_id)))
            .bearer_auth(bearer)
            .send()
            .await?;

        match response.status().as_u16() {
            404 => Err(KeycloakError::NotFound),
            s if (200..300).contains(&s) => Ok(()),
            s => Err(KeycloakError::Service(format!("user delete failed ({})", s))),
        }
    }

    async fn list_user_roles(&self, user_id: &str) -> Result<Vec<String>, KeycloakError> {
        let bearer = self.admin_bearer().await?;
        let response = self
            .client
            .get(self.admin_url(&format!("/users/{}/role-mappings/realm", user_id)))
            .bearer_auth(bearer)
            .send()
            .await?;

        match response.status().as_u16() {
            404 => Err(KeycloakError::NotFound),
            s if (200..300).contains(&s) => {
                let roles = response.json::<Vec<IdpRole>>().await?;
                Ok(roles.into_iter().map(|r| r.name).collect())
            },
            s => Err(KeycloakError::Service(format!("role listing failed ({})", s))),
        }
    }

    async fn assign_user_roles(
        &self,
        user_id: &str,
        role_names: &[String],
    ) -> Result<(), KeycloakError> {
        if role_names.is_empty() {
            return Ok(());
        }

        let realm_roles = self.list_realm_role_mappings().await?;
        let to_assign: Vec<&IdpRole> = realm_roles
            .iter()
            .filter(|r| role_names.contains(&r.name))
            .collect();

        if to_assign.len() != role_names.len() {
            let known: Vec<&str> = to_assign.iter().map(|r| r.name.as_str()).collect();
            warn!(
                "Some roles are missing in the realm: requested {:?}, resolvable {:?}",
                role_names, known
            );
        }
        if to_assign.is_empty() {
            return Ok(());
        }

        let body: Vec<serde_json::Value> = to_assign
            .iter()
            .map(|r| serde_json::json!({"id": r.id, "name": r.name}))
            .collect();

        let bearer = self.admin_bearer().await?;
        let response = self
            .client
            .post(self.admin_url(&format!("/users/{}/role-mappings/realm", user_id)))
            .bearer_auth(bearer)
            .json(&body)
            .send()
            .await?;

        match response.status().as_u16() {
            404 => Err(KeycloakError::NotFound),
            s if (200..300).contains(&s) => Ok(()),
            s => Err(KeycloakError::Service(format!(
                "role assignment failed ({})",
                s
            ))),
        }
    }

    async fn list_realm_role_mappings(&self) -> Result<Vec<IdpRole>, KeycloakError> {
        let bearer = self.admin_bearer().await?;
        let response = self
            .client
            .get(self.admin_url("/roles"))
            .bearer_auth(bearer)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(KeycloakError::Service(format!(
                "realm role listing failed ({})",
                response.status()
            )));
        }
        Ok(response.json::<Vec<IdpRole>>().await?)
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/realms/{}", self.settings.base_url, self.settings.realm);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!("IdP health check failed: {}", e);
                false
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_fallbacks() {
        let mut user = IdpUser {
            id: "id".into(),
            username: "u1@example.com".into(),
            email: Some("u1@example.com".into()),
            first_name: Some("Ada".into()),
            last_name: Some("Lovelace".into()),
            enabled: true,
            attributes: None,
        };
        assert_eq!(user.display_name(), "Ada Lovelace");

        user.last_name = None;
        assert_eq!(user.display_name(), "Ada");

        user.first_name = None;
        assert_eq!(user.display_name(), "u1@example.com");
    }

    #[test]
    fn test_idp_user_deserialization_defaults() {
        let json = r#"{"id":"abc","username":"u"}"#;
        let user: IdpUser = serde_json::from_str(json).unwrap();
        assert!(user.enabled);
        assert!(user.email.is_none());
    }

    #[test]
    fn test_token_response_into_idp_tokens() {
        let json = r#"{
            "access_token": "at",
            "refresh_token": "rt",
            "expires_in": 300,
            "refresh_expires_in": 1800,
            "session_state": "ss"
        }"#;
        let tokens: IdpTokens = serde_json::from_str::<TokenResponse>(json).unwrap().into();
        assert_eq!(tokens.access_token, "at");
        assert_eq!(tokens.refresh_token.as_deref(), Some("rt"));
        assert_eq!(tokens.expires_in, 300);
        assert_eq!(tokens.session_state.as_deref(), Some("ss"));
    }

    #[test]
    fn test_endpoints() {
        let adapter = KeycloakAdapter::new(crate::app_config::AppConfig::for_test().keycloak)
            .unwrap();
        assert_eq!(
            adapter.token_endpoint(),
            "http://localhost:8080/realms/test/protocol/openid-connect/token"
        );
        assert_eq!(
            adapter.admin_url("/users"),
            "http://localhost:8080/admin/realms/test/users"
        );
    }
}
