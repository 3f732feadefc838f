// Permission evaluator
// RBAC with composite roles and per-permission conditions. The in-memory
// role map is authoritative per process; the KV copy under `role:<name>`
// is an advisory cache. Ability evaluation is synchronous and cached per
// user + role version.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::cache::SecureCache;
use crate::config::default_roles;
use crate::db::kv::KeyValueStore;
use crate::models::role::{parse_permission_string, Ability, Permission, Role, Rule};
use crate::models::user::AuthUser;
use crate::utils::crypto::sha256_hex;

/// Advisory role mirror TTL in the KV
const ROLE_MIRROR_TTL_SECS: u64 = 3600;

#[derive(Error, Debug)]
pub enum PermissionError {
    #[error("Role not found: {0}")]
    RoleNotFound(String),

    #[error("Role already exists: {0}")]
    RoleExists(String),

    #[error("Invalid permission: action and resource must be non-empty")]
    InvalidPermission,
}

pub struct PermissionService {
    roles: RwLock<HashMap<String, Role>>,
    /// Bumped on every role mutation; stale ability cache keys die with it.
    role_version: AtomicU64,
    abilities: DashMap<String, Arc<Ability>>,
    kv: Arc<dyn KeyValueStore>,
    cache: Arc<SecureCache>,
}

impl PermissionService {
    pub fn new(kv: Arc<dyn KeyValueStore>, cache: Arc<SecureCache>) -> Self {
        let mut roles = HashMap::new();
        for role in default_roles() {
            roles.insert(role.name.clone(), role);
        }
        Self {
            roles: RwLock::new(roles),
            role_version: AtomicU64::new(0),
            abilities: DashMap::new(),
            kv,
            cache,
        }
    }

    fn role_key(name: &str) -> String {
        format!("role:{}", name)
    }

    /// Write the advisory copy of a role to the KV. Best-effort: the
    /// in-memory map stays authoritative.
    async fn mirror_role(&self, role: &Role) {
        match serde_json::to_string(role) {
            Ok(json) => {
                if let Err(e) = self
                    .kv
                    .set_ex(&Self::role_key(&role.name), ROLE_MIRROR_TTL_SECS, &json)
                    .await
                {
                    warn!("Role mirror write failed for {}: {}", role.name, e);
                }
            },
            Err(e) => warn!("Role serialization failed for {}: {}", role.name, e),
        }
    }

    async fn drop_role_mirror(&self, name: &str) {
        if let Err(e) = self.kv.del(&[Self::role_key(name)]).await {
            warn!("Role mirror delete failed for {}: {}", name, e);
        }
    }

    /// Push all roles' advisory copies, used at startup warm-up.
    pub async fn warm_role_mirror(&self) {
        let roles: Vec<Role> = {
            let map = self.roles.read().expect("role map lock poisoned");
            map.values().cloned().collect()
        };
        for role in roles {
            self.mirror_role(&role).await;
        }
    }

    fn bump_version(&self) {
        self.role_version.fetch_add(1, Ordering::SeqCst);
        self.abilities.clear();
        self.cache.invalidate_pattern("permissions:*");
        self.cache.invalidate_pattern("roles:*");
    }

    fn ability_cache_key(&self, user: &AuthUser) -> String {
        let version = self.role_version.load(Ordering::SeqCst);
        // The key covers the user's role set and direct permissions: two
        // tokens for the same user with different grants get distinct
        // abilities.
        let grants = format!("{}|{}", user.roles.join(","), user.permissions.join(","));
        format!("{}:{}:{}", user.id, version, &sha256_hex(&grants)[..16])
    }

    fn build_ability(&self, user: &AuthUser) -> Ability {
        let mut rules = Vec::new();
        {
            let roles = self.roles.read().expect("role map lock poisoned");
            for role_name in &user.roles {
                let Some(role) = roles.get(role_name) else {
                    debug!("User {} holds unknown role {}", user.id, role_name);
                    continue;
                };
                for permission in &role.permissions {
                    rules.push(Rule {
                        action: permission.action.clone(),
                        resource: permission.resource.clone(),
                        conditions: permission.conditions.clone(),
                        fields: permission.fields.clone(),
                        invert: false,
                    });
                }
            }
        }

        for permission_string in &user.permissions {
            if let Some((action, resource)) = parse_permission_string(permission_string) {
                rules.push(Rule {
                    action,
                    resource,
                    conditions: None,
                    fields: Vec::new(),
                    invert: false,
                });
            }
        }

        Ability::new(rules)
    }

    fn ability_for(&self, user: &AuthUser) -> Arc<Ability> {
        let key = self.ability_cache_key(user);
        if let Some(ability) = self.abilities.get(&key) {
            return ability.clone();
        }
        let ability = Arc::new(self.build_ability(user));
        self.abilities.insert(key, ability.clone());
        ability
    }

    /// Fast per-request decision.
    pub fn can(
        &self,
        user: &AuthUser,
        action: &str,
        resource: &str,
        subject: Option<&serde_json::Value>,
    ) -> bool {
        self.ability_for(user).can(action, resource, subject)
    }

    /// Union of role-derived and direct permission strings, deduplicated,
    /// stable order.
    pub fn get_user_permissions(&self, user: &AuthUser) -> Vec<String> {
        let mut permissions = Vec::new();
        {
            let roles = self.roles.read().expect("role map lock poisoned");
            for role_name in &user.roles {
                if let Some(role) = roles.get(role_name) {
                    for permission in &role.permissions {
                        let s = permission.as_string();
                        if !permissions.contains(&s) {
                            permissions.push(s);
                        }
                    }
                }
            }
        }
        for direct in &user.permissions {
            if !permissions.contains(direct) {
                permissions.push(direct.clone());
            }
        }
        permissions
    }

    pub fn get_permitted_fields(
        &self,
        user: &AuthUser,
        action: &str,
        resource: &str,
    ) -> Vec<String> {
        self.ability_for(user).permitted_fields(action, resource)
    }

    pub fn get_role(&self, name: &str) -> Option<Role> {
        self.roles
            .read()
            .expect("role map lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn list_roles(&self) -> Vec<Role> {
        let mut roles: Vec<Role> = self
            .roles
            .read()
            .expect("role map lock poisoned")
            .values()
            .cloned()
            .collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        roles
    }

    fn validate_permissions(permissions: &[Permission]) -> Result<(), PermissionError> {
        if permissions.iter().any(|p| !p.is_valid()) {
            return Err(PermissionError::InvalidPermission);
        }
        Ok(())
    }

    #[instrument(skip(self, role))]
    pub async fn add_role(&self, role: Role) -> Result<(), PermissionError> {
        Self::validate_permissions(&role.permissions)?;
        {
            let mut roles = self.roles.write().expect("role map lock poisoned");
            if roles.contains_key(&role.name) {
                return Err(PermissionError::RoleExists(role.name));
            }
            roles.insert(role.name.clone(), role.clone());
        }
        self.mirror_role(&role).await;
        self.bump_version();
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn remove_role(&self, name: &str) -> Result<(), PermissionError> {
        {
            let mut roles = self.roles.write().expect("role map lock poisoned");
            if roles.remove(name).is_none() {
                return Err(PermissionError::RoleNotFound(name.to_string()));
            }
        }
        self.drop_role_mirror(name).await;
        self.bump_version();
        Ok(())
    }

    #[instrument(skip(self, permission))]
    pub async fn add_permission_to_role(
        &self,
        role_name: &str,
        permission: Permission,
    ) -> Result<(), PermissionError> {
        if !permission.is_valid() {
            return Err(PermissionError::InvalidPermission);
        }
        let updated = {
            let mut roles = self.roles.write().expect("role map lock poisoned");
            let role = roles
                .get_mut(role_name)
                .ok_or_else(|| PermissionError::RoleNotFound(role_name.to_string()))?;
            if !role.permissions.contains(&permission) {
                role.permissions.push(permission);
            }
            role.clone()
        };
        self.mirror_role(&updated).await;
        self.bump_version();
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn remove_permission_from_role(
        &self,
        role_name: &str,
        action: &str,
        resource: &str,
    ) -> Result<(), PermissionError> {
        let updated = {
            let mut roles = self.roles.write().expect("role map lock poisoned");
            let role = roles
                .get_mut(role_name)
                .ok_or_else(|| PermissionError::RoleNotFound(role_name.to_string()))?;
            role.permissions
                .retain(|p| !(p.action == action && p.resource == resource));
            role.clone()
        };
        self.mirror_role(&updated).await;
        self.bump_version();
        Ok(())
    }

    /// Internal consistency check for health reporting.
    pub fn is_healthy(&self) -> bool {
        self.roles
            .read()
            .map(|roles| !roles.is_empty())
            .unwrap_or(false)
    }
}
