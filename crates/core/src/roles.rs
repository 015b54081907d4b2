//! Well-known role name constants.
//!
//! These must match the seed data in the `roles` migration.

pub const ROLE_SUPER_ADMIN: &str = "super_admin";
pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_AGENT: &str = "agent";

/// Roles that unlock elevated broadcast channels and admin routes.
pub const ELEVATED_ROLES: &[&str] = &[ROLE_SUPER_ADMIN, ROLE_ADMIN];

/// Whether any of `roles` is an elevated role.
pub fn has_elevated_role<S: AsRef<str>>(roles: &[S]) -> bool {
    roles
        .iter()
        .any(|r| ELEVATED_ROLES.contains(&r.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_and_super_admin_are_elevated() {
        assert!(has_elevated_role(&["agent", "admin"]));
        assert!(has_elevated_role(&[ROLE_SUPER_ADMIN.to_string()]));
        assert!(!has_elevated_role(&[ROLE_AGENT]));
        assert!(!has_elevated_role::<&str>(&[]));
    }
}
