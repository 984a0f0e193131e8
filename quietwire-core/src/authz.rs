//! Role-based authorization: a flat, closed permission set.
//!
//! No hierarchy, no wildcard, no implication. A role holds exactly the
//! atoms assigned to it, and the gate is a single set lookup.

use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// The closed enumeration of permission atoms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Permission {
    CreateUser,
    DeactivateUser,
    ResetPassword,
    ViewLogs,
    Broadcast,
    ManageRoles,
}

impl Permission {
    pub const ALL: [Permission; 6] = [
        Permission::CreateUser,
        Permission::DeactivateUser,
        Permission::ResetPassword,
        Permission::ViewLogs,
        Permission::Broadcast,
        Permission::ManageRoles,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Permission::CreateUser => "create-user",
            Permission::DeactivateUser => "deactivate-user",
            Permission::ResetPassword => "reset-password",
            Permission::ViewLogs => "view-logs",
            Permission::Broadcast => "broadcast",
            Permission::ManageRoles => "manage-roles",
        }
    }
}

impl FromStr for Permission {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create-user" => Ok(Permission::CreateUser),
            "deactivate-user" => Ok(Permission::DeactivateUser),
            "reset-password" => Ok(Permission::ResetPassword),
            "view-logs" => Ok(Permission::ViewLogs),
            "broadcast" => Ok(Permission::Broadcast),
            "manage-roles" => Ok(Permission::ManageRoles),
            other => Err(Error::InvalidInput(format!(
                "Unknown permission '{}'",
                other
            ))),
        }
    }
}

/// A named set of permission atoms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub permissions: BTreeSet<Permission>,
}

impl Role {
    /// The built-in role holding every atom.
    pub fn administrator() -> Self {
        Role {
            name: "administrator".to_string(),
            permissions: Permission::ALL.into_iter().collect(),
        }
    }

    /// The built-in role holding none. Messaging needs no atom.
    pub fn member() -> Self {
        Role {
            name: "member".to_string(),
            permissions: BTreeSet::new(),
        }
    }

    pub fn grants(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

/// The authorization gate. Exactly one question: does this role hold
/// this atom.
pub fn authorize(role: &Role, permission: Permission) -> Result<()> {
    if role.grants(permission) {
        Ok(())
    } else {
        Err(Error::Forbidden)
    }
}
