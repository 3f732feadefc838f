// Role and permission model
// Abilities are plain value types: an ordered rule list evaluated linearly,
// last matching rule wins, `invert` rules subtract.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Wildcard action: matches any action
pub const ACTION_MANAGE: &str = "manage";
/// Wildcard resource: matches any resource
pub const RESOURCE_ALL: &str = "all";

/// A single permission on a role.
///
/// Conditions are attribute matchers evaluated against the candidate subject
/// at decision time; they are interpreted, not compiled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Permission {
    pub action: String,
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
}

impl Permission {
    pub fn new(action: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            resource: resource.into(),
            conditions: None,
            fields: Vec::new(),
        }
    }

    pub fn with_conditions(mut self, conditions: BTreeMap<String, serde_json::Value>) -> Self {
        self.conditions = Some(conditions);
        self
    }

    /// A permission must name both an action and a resource.
    pub fn is_valid(&self) -> bool {
        !self.action.trim().is_empty() && !self.resource.trim().is_empty()
    }

    /// Canonical `"<action>:<resource>"` form
    pub fn as_string(&self) -> String {
        format!("{}:{}", self.action, self.resource)
    }
}

/// Parse a direct permission string of the form `"<action>:<resource>"`.
pub fn parse_permission_string(input: &str) -> Option<(String, String)> {
    let (action, resource) = input.split_once(':')?;
    if action.trim().is_empty() || resource.trim().is_empty() {
        return None;
    }
    Some((action.trim().to_string(), resource.trim().to_string()))
}

/// A named role holding an ordered permission list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Role {
    pub id: String,
    pub name: String,
    pub description: String,
    pub permissions: Vec<Permission>,
}

impl Role {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: format!("role-{}", name),
            name,
            description: description.into(),
            permissions: Vec::new(),
        }
    }

    pub fn with_permissions(mut self, permissions: Vec<Permission>) -> Self {
        self.permissions = permissions;
        self
    }
}

/// One evaluated rule inside an ability
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub action: String,
    pub resource: String,
    pub conditions: Option<BTreeMap<String, serde_json::Value>>,
    pub fields: Vec<String>,
    pub invert: bool,
}

impl Rule {
    fn matches(&self, action: &str, resource: &str, subject: Option<&serde_json::Value>) -> bool {
        let action_match = self.action == ACTION_MANAGE || self.action == action;
        let resource_match = self.resource == RESOURCE_ALL || self.resource == resource;
        if !action_match || !resource_match {
            return false;
        }
        self.conditions_hold(subject)
    }

    fn conditions_hold(&self, subject: Option<&serde_json::Value>) -> bool {
        let Some(conditions) = &self.conditions else {
            return true;
        };
        // Without a structured subject there is nothing to test: conditions
        // are vacuously true against a bare resource name.
        let Some(subject) = subject else {
            return true;
        };
        conditions
            .iter()
            .all(|(attr, expected)| subject.get(attr) == Some(expected))
    }
}

/// The evaluated permission set for one user at one moment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ability {
    rules: Vec<Rule>,
}

impl Ability {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Linear match over the ordered rule list; the last matching rule wins.
    pub fn can(&self, action: &str, resource: &str, subject: Option<&serde_json::Value>) -> bool {
        let mut allowed = false;
        for rule in &self.rules {
            if rule.matches(action, resource, subject) {
                allowed = !rule.invert;
            }
        }
        allowed
    }

    /// Union of `fields` on matching positive rules.
    pub fn permitted_fields(&self, action: &str, resource: &str) -> Vec<String> {
        let mut fields = Vec::new();
        for rule in &self.rules {
            if !rule.invert && rule.matches(action, resource, None) {
                for field in &rule.fields {
                    if !fields.contains(field) {
                        fields.push(field.clone());
                    }
                }
            }
        }
        fields
    }
}
