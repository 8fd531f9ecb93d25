//! Member roles within a group.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PermsError;

/// Role of a member (agent or `everyone`) in a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    /// Can read the group's values.
    Reader,
    /// Can read and write the group's values.
    Writer,
    /// Can read, write and change member roles.
    Admin,
    /// Can write, and read only their own changes.
    WriteOnly,
    /// No access.
    Revoked,
}

/// Member key that applies to every agent.
pub const EVERYONE: &str = "everyone";

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Reader => "reader",
            Role::Writer => "writer",
            Role::Admin => "admin",
            Role::WriteOnly => "writeOnly",
            Role::Revoked => "revoked",
        }
    }

    pub fn can_admin(self) -> bool {
        self == Role::Admin
    }

    pub fn can_write(self) -> bool {
        matches!(self, Role::Admin | Role::Writer | Role::WriteOnly)
    }

    pub fn can_read(self) -> bool {
        matches!(self, Role::Admin | Role::Writer | Role::Reader)
    }

    /// Roles a child group picks up from a parent it extends.
    pub fn is_inheritable(self) -> bool {
        matches!(self, Role::Admin | Role::Writer | Role::Reader)
    }

    /// Roles that may be assigned to `everyone`.
    pub fn is_assignable_to_everyone(self) -> bool {
        matches!(
            self,
            Role::Reader | Role::Writer | Role::WriteOnly | Role::Revoked
        )
    }

    /// Strict ordering used when merging inherited roles:
    /// admin > writer > reader, and anything beats nothing or revoked.
    pub fn is_higher_than(self, other: Option<Role>) -> bool {
        if self == Role::Revoked {
            return false;
        }
        match other {
            None | Some(Role::Revoked) => true,
            Some(Role::Admin) => false,
            Some(_) if self == Role::Admin => true,
            Some(Role::Reader) => self == Role::Writer,
            Some(_) => false,
        }
    }

    /// The higher of two optional roles.
    pub fn max(a: Option<Role>, b: Option<Role>) -> Option<Role> {
        match (a, b) {
            (Some(a), b) if a.is_higher_than(b) => Some(a),
            (a, None) => a,
            (_, b) => b,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = PermsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reader" => Ok(Role::Reader),
            "writer" => Ok(Role::Writer),
            "admin" => Ok(Role::Admin),
            "writeOnly" => Ok(Role::WriteOnly),
            "revoked" => Ok(Role::Revoked),
            other => Err(PermsError::InvalidRole(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_ordering() {
        assert!(Role::Admin.is_higher_than(Some(Role::Writer)));
        assert!(Role::Writer.is_higher_than(Some(Role::Reader)));
        assert!(Role::Reader.is_higher_than(None));
        assert!(Role::Reader.is_higher_than(Some(Role::Revoked)));
        assert!(!Role::Reader.is_higher_than(Some(Role::Writer)));
        assert!(!Role::Revoked.is_higher_than(None));
        assert!(!Role::Writer.is_higher_than(Some(Role::Admin)));
    }

    #[test]
    fn test_max() {
        assert_eq!(Role::max(Some(Role::Reader), Some(Role::Admin)), Some(Role::Admin));
        assert_eq!(Role::max(None, Some(Role::Writer)), Some(Role::Writer));
        assert_eq!(Role::max(Some(Role::Writer), None), Some(Role::Writer));
        assert_eq!(Role::max(None, None), None);
    }

    #[test]
    fn test_string_roundtrip() {
        for role in [Role::Reader, Role::Writer, Role::Admin, Role::WriteOnly, Role::Revoked] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
            assert_eq!(serde_json::to_value(role).unwrap(), role.as_str());
        }
        assert!("superuser".parse::<Role>().is_err());
    }
}
