//! Role lookup for room participants.
//!
//! Identities arrive already authenticated; this seam only maps a user to
//! the role they hold in a room. Roles are resolved on join and kept for the
//! lifetime of the membership.

use std::collections::HashMap;

use async_trait::async_trait;
use forma_core::Role;
use uuid::Uuid;

#[async_trait]
pub trait RoleResolver: Send + Sync {
    async fn resolve_role(&self, room_id: Uuid, user_id: &str) -> Role;
}

/// Fixed role table with a fallback for unknown users.
#[derive(Debug, Clone, Default)]
pub struct StaticRoleResolver {
    default_role: Role,
    global: HashMap<String, Role>,
    per_room: HashMap<(Uuid, String), Role>,
}

impl StaticRoleResolver {
    pub fn new(default_role: Role) -> Self {
        Self {
            default_role,
            ..Self::default()
        }
    }

    pub fn with_role(mut self, user_id: impl Into<String>, role: Role) -> Self {
        self.global.insert(user_id.into(), role);
        self
    }

    /// Role in one room only; takes precedence over [`Self::with_role`].
    pub fn with_room_role(mut self, room_id: Uuid, user_id: impl Into<String>, role: Role) -> Self {
        self.per_room.insert((room_id, user_id.into()), role);
        self
    }
}

#[async_trait]
impl RoleResolver for StaticRoleResolver {
    async fn resolve_role(&self, room_id: Uuid, user_id: &str) -> Role {
        self.per_room
            .get(&(room_id, user_id.to_string()))
            .or_else(|| self.global.get(user_id))
            .copied()
            .unwrap_or(self.default_role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_roles() {
        let room = Uuid::new_v4();
        let roles = StaticRoleResolver::new(Role::Editor)
            .with_role("vera", Role::Viewer)
            .with_room_role(room, "vera", Role::Owner);

        assert_eq!(roles.resolve_role(room, "vera").await, Role::Owner);
        assert_eq!(roles.resolve_role(Uuid::new_v4(), "vera").await, Role::Viewer);
        assert_eq!(roles.resolve_role(room, "anyone").await, Role::Editor);
    }
}
