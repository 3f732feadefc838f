// User principal and mirror database model
// The identity provider owns user records; the mirror row exists for fast
// lookups and soft deletes, and is written through on registration/update.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::schema::users;

/// Authenticated principal returned by login and token verification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthUser {
    pub id: String,
    pub email: String,
    pub name: String,
    pub roles: Vec<String>,
    /// Direct permission strings in `"<action>:<resource>"` form, merged
    /// with role-derived permissions at evaluation time.
    pub permissions: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AuthUser {
    pub fn new(id: impl Into<String>, email: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            email: email.into(),
            name: name.into(),
            roles: Vec::new(),
            permissions: Vec::new(),
            metadata: HashMap::new(),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

#[derive(Error, Debug)]
pub enum UserError {
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("User not found")]
    NotFound,

    #[error("Invalid user id: {0}")]
    InvalidId(String),

    #[error("Connection pool error: {0}")]
    Pool(String),
}

/// Mirror row for a user
#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = users)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub roles: serde_json::Value,
    pub permissions: serde_json::Value,
    pub metadata: serde_json::Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUserRecord {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub roles: serde_json::Value,
    pub permissions: serde_json::Value,
    pub metadata: serde_json::Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, AsChangeset)]
#[diesel(table_name = users)]
pub struct UserRecordUpdate {
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub roles: Option<serde_json::Value>,
    pub permissions: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
    pub is_active: Option<bool>,
    pub updated_at: DateTime<Utc>,
}

fn string_vec(value: &serde_json::Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

impl From<UserRecord> for AuthUser {
    fn from(record: UserRecord) -> Self {
        let metadata = record
            .metadata
            .as_object()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        AuthUser {
            id: record.id.to_string(),
            email: record.email,
            name: record.display_name,
            roles: string_vec(&record.roles),
            permissions: string_vec(&record.permissions),
            metadata,
            is_active: record.is_active,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

impl UserRecord {
    fn parse_id(user_id: &str) -> Result<Uuid, UserError> {
        Uuid::parse_str(user_id).map_err(|_| UserError::InvalidId(user_id.to_string()))
    }

    pub async fn find_by_id(
        conn: &mut AsyncPgConnection,
        user_id: &str,
    ) -> Result<UserRecord, UserError> {
        use crate::schema::users::dsl::*;

        let uid = Self::parse_id(user_id)?;
        users
            .filter(id.eq(uid))
            .first::<UserRecord>(conn)
            .await
            .optional()?
            .ok_or(UserError::NotFound)
    }

    pub async fn find_by_email(
        conn: &mut AsyncPgConnection,
        lookup_email: &str,
    ) -> Result<Option<UserRecord>, UserError> {
        use crate::schema::users::dsl::*;

        Ok(users
            .filter(email.eq(lookup_email))
            .first::<UserRecord>(conn)
            .await
            .optional()?)
    }

    /// Insert a mirror row for a freshly registered user.
    pub async fn insert_mirror(
        conn: &mut AsyncPgConnection,
        user: &AuthUser,
    ) -> Result<UserRecord, UserError> {
        let now = Utc::now();
        let record = NewUserRecord {
            id: Self::parse_id(&user.id)?,
            email: user.email.clone(),
            display_name: user.name.clone(),
            roles: serde_json::json!(user.roles),
            permissions: serde_json::json!(user.permissions),
            metadata: serde_json::to_value(&user.metadata).unwrap_or(serde_json::json!({})),
            is_active: user.is_active,
            created_at: now,
            updated_at: now,
        };

        Ok(diesel::insert_into(users::table)
            .values(&record)
            .get_result(conn)
            .await?)
    }

    pub async fn update_mirror(
        conn: &mut AsyncPgConnection,
        user_id: &str,
        changes: UserRecordUpdate,
    ) -> Result<UserRecord, UserError> {
        use crate::schema::users::dsl::*;

        let uid = Self::parse_id(user_id)?;
        Ok(diesel::update(users.filter(id.eq(uid)))
            .set(&changes)
            .get_result(conn)
            .await?)
    }

    /// Soft delete: the row stays for audit, the flag flips.
    pub async fn soft_delete(
        conn: &mut AsyncPgConnection,
        user_id: &str,
    ) -> Result<usize, UserError> {
        use crate::schema::users::dsl::*;

        let uid = Self::parse_id(user_id)?;
        Ok(diesel::update(users.filter(id.eq(uid)))
            .set((is_active.eq(false), updated_at.eq(Utc::now())))
            .execute(conn)
            .await?)
    }
}
