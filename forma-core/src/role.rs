use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Role of a participant inside a room.
///
/// Ordered by authority: owner > editor > reviewer > viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Role {
    Owner,
    #[default]
    Editor,
    Reviewer,
    Viewer,
}

impl Role {
    /// Whether this role may submit content-changing operations.
    pub fn can_write(self) -> bool {
        matches!(self, Role::Owner | Role::Editor)
    }

    /// Numeric rank used by the priority resolution strategy.
    pub fn rank(self) -> u8 {
        match self {
            Role::Owner => 3,
            Role::Editor => 2,
            Role::Reviewer => 1,
            Role::Viewer => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Editor => "editor",
            Role::Reviewer => "reviewer",
            Role::Viewer => "viewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "owner" => Ok(Role::Owner),
            "editor" => Ok(Role::Editor),
            "reviewer" => Ok(Role::Reviewer),
            "viewer" => Ok(Role::Viewer),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}
