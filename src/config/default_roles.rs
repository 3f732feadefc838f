// Default role seeding
// Three roles exist in every realm: admin, user, guest. Realm-specific
// roles are added through the permission service at runtime.

use crate::models::role::{Permission, Role, ACTION_MANAGE, RESOURCE_ALL};

/// Roles seeded into the permission service at startup.
pub fn default_roles() -> Vec<Role> {
    vec![
        Role::new("admin", "Full administrative access").with_permissions(vec![Permission::new(
            ACTION_MANAGE,
            RESOURCE_ALL,
        )]),
        Role::new("user", "Standard authenticated user").with_permissions(vec![
            Permission::new("read", "user"),
            Permission::new("read", "profile"),
            Permission::new("update", "profile"),
        ]),
        Role::new("guest", "Unauthenticated read-only access")
            .with_permissions(vec![Permission::new("read", "user")]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_roles_present() {
        let roles = default_roles();
        let names: Vec<&str> = roles.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["admin", "user", "guest"]);
    }

    #[test]
    fn test_admin_holds_manage_all() {
        let roles = default_roles();
        let admin = roles.iter().find(|r| r.name == "admin").unwrap();
        assert!(admin
            .permissions
            .iter()
            .any(|p| p.action == ACTION_MANAGE && p.resource == RESOURCE_ALL));
    }

    #[test]
    fn test_all_seeded_permissions_are_valid() {
        for role in default_roles() {
            for permission in &role.permissions {
                assert!(permission.is_valid(), "invalid permission on {}", role.name);
            }
        }
    }
}
