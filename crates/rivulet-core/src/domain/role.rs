//! Roles and the participants that hold them

use crate::types::{ParticipantId, RoleId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Access-control grouping required by activities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Role identifier
    pub id: RoleId,

    /// Display name
    #[serde(default)]
    pub name: Option<String>,
}

impl Role {
    /// Create a role
    pub fn new(id: impl Into<RoleId>, name: Option<&str>) -> Self {
        Self {
            id: id.into(),
            name: name.map(str::to_string),
        }
    }
}

/// Roles known to a process definition or instance
#[derive(Debug, Clone, Default)]
pub struct RoleCollection {
    roles: Vec<Role>,
}

impl RoleCollection {
    /// Build a collection from a list of roles
    pub fn new(roles: Vec<Role>) -> Self {
        Self { roles }
    }

    /// Look up a role
    pub fn get(&self, id: &RoleId) -> Option<&Role> {
        self.roles.iter().find(|role| &role.id == id)
    }

    /// Whether the role exists
    pub fn contains(&self, id: &RoleId) -> bool {
        self.get(id).is_some()
    }

    /// Iterate over every role in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &Role> {
        self.roles.iter()
    }

    /// Clone the roles out as a plain list
    pub fn to_vec(&self) -> Vec<Role> {
        self.roles.clone()
    }
}

/// Someone (or something) that performs work items
///
/// The engine only needs identity and role membership; the participant
/// directory itself belongs to the host application.
pub trait Participant: Send + Sync {
    /// Participant identifier
    fn id(&self) -> ParticipantId;

    /// Display name
    fn name(&self) -> Option<String>;

    /// Whether the participant holds `role`
    fn has_role(&self, role: &RoleId) -> bool;
}

/// Serializable record of the participant that acted on a work item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRef {
    /// Participant identifier
    pub id: ParticipantId,

    /// Display name at the time of the action
    #[serde(default)]
    pub name: Option<String>,
}

impl ParticipantRef {
    /// Capture the identity of a participant
    pub fn of(participant: &dyn Participant) -> Self {
        Self {
            id: participant.id(),
            name: participant.name(),
        }
    }
}

/// Participant backed by a fixed set of roles
#[derive(Debug, Clone)]
pub struct SimpleParticipant {
    id: ParticipantId,
    name: Option<String>,
    roles: HashSet<RoleId>,
}

impl SimpleParticipant {
    /// Create a participant holding the given roles
    pub fn new<I, R>(id: impl Into<ParticipantId>, roles: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<RoleId>,
    {
        Self {
            id: id.into(),
            name: None,
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl Participant for SimpleParticipant {
    fn id(&self) -> ParticipantId {
        self.id.clone()
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    fn has_role(&self, role: &RoleId) -> bool {
        self.roles.contains(role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_collection_lookup() {
        let roles = RoleCollection::new(vec![
            Role::new("clerk", Some("Clerk")),
            Role::new("manager", None),
        ]);

        assert!(roles.contains(&RoleId::new("clerk")));
        assert!(!roles.contains(&RoleId::new("auditor")));
        assert_eq!(
            roles.get(&RoleId::new("clerk")).unwrap().name.as_deref(),
            Some("Clerk")
        );
        assert_eq!(roles.iter().count(), 2);
    }

    #[test]
    fn test_simple_participant() {
        let participant = SimpleParticipant::new("alice", ["clerk"]).with_name("Alice");

        assert!(participant.has_role(&RoleId::new("clerk")));
        assert!(!participant.has_role(&RoleId::new("manager")));

        let reference = ParticipantRef::of(&participant);
        assert_eq!(reference.id, ParticipantId::new("alice"));
        assert_eq!(reference.name.as_deref(), Some("Alice"));
    }
}
