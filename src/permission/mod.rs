//! PermissionEngine - Role/Permission Evaluation
//!
//! ## Responsibilities
//!
//! - Role name -> permission set mapping (4 baseline roles + custom roles)
//! - Effective permission resolution (role ∪ extra grants)
//! - Read/write checks as non-empty intersection tests
//!
//! Holds no session or identity state.

mod types;

pub use types::*;

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;

const BASELINE_ROLES: [&str; 4] = [roles::ADMIN, roles::OPERATOR, roles::VIEWER, roles::GUEST];

/// PermissionEngine instance
pub struct PermissionEngine {
    roles: RwLock<HashMap<String, PermissionSet>>,
}

impl PermissionEngine {
    /// Create engine with the baseline roles
    pub fn new() -> Self {
        let mut map = HashMap::new();
        map.insert(roles::ADMIN.to_string(), PermissionSet::all());
        map.insert(
            roles::OPERATOR.to_string(),
            PermissionSet::of(&[
                Permission::DeviceRead,
                Permission::DeviceWrite,
                Permission::MediaRead,
                Permission::MediaWrite,
                Permission::StorageRead,
                Permission::StorageWrite,
                Permission::SystemRead,
                Permission::SystemReboot,
            ]),
        );
        map.insert(roles::VIEWER.to_string(), PermissionSet::all_read());
        map.insert(roles::GUEST.to_string(), PermissionSet::empty());

        Self {
            roles: RwLock::new(map),
        }
    }

    /// Define (or replace) a custom role. Baseline roles are fixed.
    pub fn define_role(&self, name: &str, permissions: PermissionSet) -> Result<()> {
        if BASELINE_ROLES.contains(&name) {
            return Err(Error::Conflict(format!("Baseline role {} cannot be redefined", name)));
        }

        self.roles.write().insert(name.to_string(), permissions);
        tracing::info!(role = %name, permissions = %permissions, "Custom role defined");
        Ok(())
    }

    /// Permission set of a role
    pub fn role_permissions(&self, name: &str) -> Option<PermissionSet> {
        self.roles.read().get(name).copied()
    }

    /// Build a requester context from role plus individually granted extras
    pub fn resolve(&self, identity: &str, role: &str, extra: PermissionSet) -> Result<UserContext> {
        let base = self
            .role_permissions(role)
            .ok_or_else(|| Error::UnknownRole(role.to_string()))?;

        Ok(UserContext::new(identity, role, base.union(extra)))
    }

    pub fn can_read(permissions: &PermissionSet, read_permissions: &PermissionSet) -> bool {
        permissions.intersects(read_permissions)
    }

    pub fn can_write(permissions: &PermissionSet, write_permissions: &PermissionSet) -> bool {
        permissions.intersects(write_permissions)
    }
}

impl Default for PermissionEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseline_roles() {
        let engine = PermissionEngine::new();

        let admin = engine.role_permissions(roles::ADMIN).unwrap();
        assert_eq!(admin, PermissionSet::all());

        let viewer = engine.role_permissions(roles::VIEWER).unwrap();
        assert!(viewer.contains(Permission::DeviceRead));
        assert!(viewer.contains(Permission::NetworkRead));
        assert!(!viewer.contains(Permission::DeviceWrite));
        assert!(viewer.iter().all(|p| p.is_read()));

        let operator = engine.role_permissions(roles::OPERATOR).unwrap();
        assert!(operator.contains(Permission::SystemReboot));
        assert!(!operator.contains(Permission::NetworkWrite));
        assert!(!operator.contains(Permission::UserWrite));

        assert!(engine.role_permissions(roles::GUEST).unwrap().is_empty());
    }

    #[test]
    fn test_intersection_not_subset() {
        let cell_read = PermissionSet::of(&[Permission::DeviceRead, Permission::DeviceWrite]);
        let writer_only = PermissionSet::of(&[Permission::DeviceWrite]);

        assert!(PermissionEngine::can_read(&writer_only, &cell_read));
        assert!(!PermissionEngine::can_read(&PermissionSet::empty(), &cell_read));
    }

    #[test]
    fn test_resolve_unions_extra_grants() {
        let engine = PermissionEngine::new();
        let ctx = engine
            .resolve("alice", roles::VIEWER, PermissionSet::of(&[Permission::DeviceWrite]))
            .unwrap();

        assert_eq!(ctx.identity, "alice");
        assert!(ctx.permissions.contains(Permission::DeviceWrite));
        assert!(ctx.permissions.contains(Permission::MediaRead));
    }

    #[test]
    fn test_unknown_role() {
        let engine = PermissionEngine::new();
        let result = engine.resolve("bob", "installer", PermissionSet::empty());
        assert!(matches!(result, Err(Error::UnknownRole(_))));
    }

    #[test]
    fn test_custom_role() {
        let engine = PermissionEngine::new();
        let installer = PermissionSet::of(&[Permission::NetworkRead, Permission::NetworkWrite]);
        engine.define_role("installer", installer).unwrap();
        assert_eq!(engine.role_permissions("installer"), Some(installer));

        assert!(engine.define_role(roles::ADMIN, PermissionSet::empty()).is_err());
    }

    #[test]
    fn test_permission_set_serializes_as_names() {
        let set = PermissionSet::of(&[Permission::DeviceRead, Permission::SystemReboot]);
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["device_read","system_reboot"]"#);

        let back: PermissionSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }
}
