//! Permission types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Permission flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    DeviceRead,
    DeviceWrite,
    MediaRead,
    MediaWrite,
    NetworkRead,
    NetworkWrite,
    StorageRead,
    StorageWrite,
    UserRead,
    UserWrite,
    FirmwareRead,
    FirmwareWrite,
    SystemRead,
    SystemReboot,
}

impl Permission {
    pub const ALL: [Permission; 14] = [
        Permission::DeviceRead,
        Permission::DeviceWrite,
        Permission::MediaRead,
        Permission::MediaWrite,
        Permission::NetworkRead,
        Permission::NetworkWrite,
        Permission::StorageRead,
        Permission::StorageWrite,
        Permission::UserRead,
        Permission::UserWrite,
        Permission::FirmwareRead,
        Permission::FirmwareWrite,
        Permission::SystemRead,
        Permission::SystemReboot,
    ];

    fn bit(self) -> u32 {
        1 << (self as u32)
    }

    pub fn is_read(self) -> bool {
        matches!(
            self,
            Permission::DeviceRead
                | Permission::MediaRead
                | Permission::NetworkRead
                | Permission::StorageRead
                | Permission::UserRead
                | Permission::FirmwareRead
                | Permission::SystemRead
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Permission::DeviceRead => "device_read",
            Permission::DeviceWrite => "device_write",
            Permission::MediaRead => "media_read",
            Permission::MediaWrite => "media_write",
            Permission::NetworkRead => "network_read",
            Permission::NetworkWrite => "network_write",
            Permission::StorageRead => "storage_read",
            Permission::StorageWrite => "storage_write",
            Permission::UserRead => "user_read",
            Permission::UserWrite => "user_write",
            Permission::FirmwareRead => "firmware_read",
            Permission::FirmwareWrite => "firmware_write",
            Permission::SystemRead => "system_read",
            Permission::SystemReboot => "system_reboot",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Permission::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown permission: {}", s))
    }
}

/// Set of permission flags (bitset)
///
/// Serialized as a list of flag names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<Permission>", into = "Vec<Permission>")]
pub struct PermissionSet(u32);

impl PermissionSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Self::of(&Permission::ALL)
    }

    pub fn of(permissions: &[Permission]) -> Self {
        permissions.iter().fold(Self::empty(), |set, p| set.with(*p))
    }

    /// Every read flag across domains
    pub fn all_read() -> Self {
        Permission::ALL
            .iter()
            .filter(|p| p.is_read())
            .fold(Self::empty(), |set, p| set.with(*p))
    }

    pub fn with(mut self, permission: Permission) -> Self {
        self.insert(permission);
        self
    }

    pub fn insert(&mut self, permission: Permission) {
        self.0 |= permission.bit();
    }

    pub fn contains(&self, permission: Permission) -> bool {
        self.0 & permission.bit() != 0
    }

    pub fn union(self, other: PermissionSet) -> Self {
        Self(self.0 | other.0)
    }

    /// Non-empty intersection, the only access test the engine performs
    pub fn intersects(&self, other: &PermissionSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Permission> + '_ {
        Permission::ALL.iter().copied().filter(|p| self.contains(*p))
    }
}

impl From<Vec<Permission>> for PermissionSet {
    fn from(permissions: Vec<Permission>) -> Self {
        Self::of(&permissions)
    }
}

impl From<PermissionSet> for Vec<Permission> {
    fn from(set: PermissionSet) -> Self {
        set.iter().collect()
    }
}

impl fmt::Display for PermissionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|p| p.as_str()).collect();
        f.write_str(&names.join(", "))
    }
}

/// Role name constants
pub mod roles {
    pub const ADMIN: &str = "admin";
    pub const OPERATOR: &str = "operator";
    pub const VIEWER: &str = "viewer";
    pub const GUEST: &str = "guest";
}

/// Resolved requester identity
///
/// Produced by the authentication collaborator; the engine never computes it
/// from credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    pub identity: String,
    pub role: String,
    pub permissions: PermissionSet,
}

impl UserContext {
    pub fn new(identity: impl Into<String>, role: impl Into<String>, permissions: PermissionSet) -> Self {
        Self {
            identity: identity.into(),
            role: role.into(),
            permissions,
        }
    }

    /// Full-permission context for in-process hardware collaborators
    pub fn system(identity: impl Into<String>) -> Self {
        Self::new(identity, "system", PermissionSet::all())
    }
}
