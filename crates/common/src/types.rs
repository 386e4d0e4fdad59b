// Core domain types shared across Loam crates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A collaborator's role on an entity subtree.
///
/// Roles are totally ordered: `Admin > Editor > Collaborator > Viewer`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Editor,
    Collaborator,
    Viewer,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Editor => "editor",
            Self::Collaborator => "collaborator",
            Self::Viewer => "viewer",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "admin" => Some(Self::Admin),
            "editor" => Some(Self::Editor),
            "collaborator" => Some(Self::Collaborator),
            "viewer" => Some(Self::Viewer),
            _ => None,
        }
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Admin => 3,
            Self::Editor => 2,
            Self::Collaborator => 1,
            Self::Viewer => 0,
        }
    }

    /// True when `self` grants at least the permissions of `minimum`.
    pub const fn at_least(self, minimum: Role) -> bool {
        self.rank() >= minimum.rank()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::Role;

    #[test]
    fn roles_are_ordered() {
        assert!(Role::Admin.at_least(Role::Editor));
        assert!(Role::Editor.at_least(Role::Editor));
        assert!(Role::Collaborator.at_least(Role::Viewer));
        assert!(!Role::Viewer.at_least(Role::Collaborator));
        assert!(!Role::Editor.at_least(Role::Admin));
    }

    #[test]
    fn role_round_trips_through_strings() {
        for role in [Role::Admin, Role::Editor, Role::Collaborator, Role::Viewer] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
            assert_eq!(role.to_string(), role.as_str());
        }
        assert_eq!(Role::parse("owner"), None);
    }
}
