//! Group Registry - Membership of Conversation Groups
//!
//! Clients can form ad-hoc groups that converse with their AI personas in
//! turn. The registry keeps two independent indexes under one lock:
//!
//! ```text
//! clients: ClientId ──▶ Option<GroupId>
//! groups:  GroupId  ──▶ Group { owner, members }
//! ```
//!
//! # Invariants
//!
//! - A client belongs to at most one group.
//! - A group left with one member or fewer is deleted.
//! - When the owner leaves a group that survives, ownership moves to a
//!   remaining member (the lowest id, so the choice is stable).
//! - Every mutation happens under a single write lock and returns the complete
//!   resulting membership, so callers can push consistent updates to everyone
//!   affected without re-reading.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GroupError;
use crate::session::ClientId;

/// Unique identifier for a group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    /// Generate a new unique group ID
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("group-{}", Uuid::new_v4()))
    }

    /// Get the ID as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for GroupId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A conversation group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    /// Group identifier
    pub id: GroupId,
    /// Client allowed to remove others
    pub owner: ClientId,
    /// Every member, owner included
    pub members: BTreeSet<ClientId>,
}

impl Group {
    /// Members in stable order
    #[must_use]
    pub fn member_list(&self) -> Vec<ClientId> {
        self.members.iter().cloned().collect()
    }

    /// Whether `client` is a member
    #[must_use]
    pub fn contains(&self, client: &ClientId) -> bool {
        self.members.contains(client)
    }

    /// Number of members
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True for a group without members
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Complete outcome of a membership mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    /// The group that was changed
    pub group_id: GroupId,
    /// The group after the change, `None` if it was deleted
    pub group: Option<Group>,
    /// Clients that ended up without a group because of this change
    pub released: Vec<ClientId>,
    /// The new owner, if ownership moved
    pub new_owner: Option<ClientId>,
}

impl MembershipChange {
    /// Whether the change deleted the group
    #[must_use]
    pub fn dissolved(&self) -> bool {
        self.group.is_none()
    }

    /// Everyone whose view of the group changed: remaining members plus
    /// released clients
    #[must_use]
    pub fn affected(&self) -> Vec<ClientId> {
        let mut affected: BTreeSet<ClientId> = self.released.iter().cloned().collect();
        if let Some(group) = &self.group {
            affected.extend(group.members.iter().cloned());
        }
        affected.into_iter().collect()
    }

    /// Members still in the group
    #[must_use]
    pub fn remaining(&self) -> Vec<ClientId> {
        self.group
            .as_ref()
            .map(Group::member_list)
            .unwrap_or_default()
    }
}

/// Both indexes, always mutated together
#[derive(Debug, Default)]
struct GroupIndex {
    /// Known clients and the group each is in
    clients: HashMap<ClientId, Option<GroupId>>,
    /// Live groups
    groups: HashMap<GroupId, Group>,
}

impl GroupIndex {
    fn group_of(&self, client: &ClientId) -> Option<&Group> {
        let group_id = self.clients.get(client)?.as_ref()?;
        self.groups.get(group_id)
    }

    /// Take `client` out of its group, applying deletion and ownership rules
    fn detach(&mut self, client: &ClientId) -> Option<MembershipChange> {
        let group_id = self.clients.get_mut(client)?.take()?;
        let mut group = self.groups.remove(&group_id)?;
        group.members.remove(client);

        let mut released = vec![client.clone()];
        if group.members.len() <= 1 {
            for member in &group.members {
                if let Some(slot) = self.clients.get_mut(member) {
                    *slot = None;
                }
                released.push(member.clone());
            }
            tracing::info!(group = %group_id, "Group dissolved");
            return Some(MembershipChange {
                group_id,
                group: None,
                released,
                new_owner: None,
            });
        }

        let mut new_owner = None;
        if group.owner == *client {
            if let Some(successor) = group.members.iter().next().cloned() {
                tracing::info!(group = %group_id, owner = %successor, "Group ownership transferred");
                group.owner = successor.clone();
                new_owner = Some(successor);
            }
        }

        self.groups.insert(group_id.clone(), group.clone());
        Some(MembershipChange {
            group_id,
            group: Some(group),
            released,
            new_owner,
        })
    }
}

/// Registry of clients and the groups they form
///
/// Cheap to clone; clones share the same indexes.
#[derive(Clone, Default)]
pub struct GroupRegistry {
    inner: Arc<RwLock<GroupIndex>>,
}

impl GroupRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a client known (and ungrouped)
    pub fn register(&self, client: ClientId) {
        self.inner.write().clients.entry(client).or_insert(None);
    }

    /// Forget a client, leaving its group first
    ///
    /// Returns the resulting change if the client was grouped.
    pub fn unregister(&self, client: &ClientId) -> Option<MembershipChange> {
        let mut index = self.inner.write();
        let change = index.detach(client);
        index.clients.remove(client);
        change
    }

    /// Whether a client is known
    #[must_use]
    pub fn is_registered(&self, client: &ClientId) -> bool {
        self.inner.read().clients.contains_key(client)
    }

    /// Create a group owned by `owner`
    ///
    /// # Errors
    ///
    /// [`GroupError::UnknownClient`] for an unregistered owner,
    /// [`GroupError::AlreadyGrouped`] if the owner is already in a group.
    pub fn create_group(&self, owner: &ClientId) -> Result<Group, GroupError> {
        let mut index = self.inner.write();
        match index.clients.get(owner) {
            None => return Err(GroupError::UnknownClient(owner.clone())),
            Some(Some(_)) => return Err(GroupError::AlreadyGrouped(owner.clone())),
            Some(None) => {}
        }

        let group = Group {
            id: GroupId::generate(),
            owner: owner.clone(),
            members: BTreeSet::from([owner.clone()]),
        };
        index.clients.insert(owner.clone(), Some(group.id.clone()));
        index.groups.insert(group.id.clone(), group.clone());
        tracing::info!(group = %group.id, owner = %owner, "Group created");
        Ok(group)
    }

    /// Add `invitee` to the inviter's group, creating one if needed
    ///
    /// # Errors
    ///
    /// Fails without changing anything for a self-invite, an unknown inviter
    /// or invitee, or an invitee that is already grouped.
    pub fn invite(
        &self,
        inviter: &ClientId,
        invitee: &ClientId,
    ) -> Result<MembershipChange, GroupError> {
        if inviter == invitee {
            return Err(GroupError::SelfInvite);
        }

        let mut index = self.inner.write();
        let Some(inviter_group) = index.clients.get(inviter).cloned() else {
            return Err(GroupError::UnknownClient(inviter.clone()));
        };
        match index.clients.get(invitee) {
            None => return Err(GroupError::UnknownInvitee(invitee.clone())),
            Some(Some(_)) => return Err(GroupError::AlreadyGrouped(invitee.clone())),
            Some(None) => {}
        }

        let group_id = match inviter_group {
            Some(group_id) => group_id,
            None => {
                let group = Group {
                    id: GroupId::generate(),
                    owner: inviter.clone(),
                    members: BTreeSet::from([inviter.clone()]),
                };
                let id = group.id.clone();
                index.clients.insert(inviter.clone(), Some(id.clone()));
                index.groups.insert(id.clone(), group);
                tracing::info!(group = %id, owner = %inviter, "Group created");
                id
            }
        };

        let Some(group) = index.groups.get_mut(&group_id) else {
            return Err(GroupError::UnknownClient(inviter.clone()));
        };
        group.members.insert(invitee.clone());
        let group = group.clone();
        index.clients.insert(invitee.clone(), Some(group_id.clone()));

        tracing::info!(group = %group_id, inviter = %inviter, invitee = %invitee, "Client joined group");
        Ok(MembershipChange {
            group_id,
            group: Some(group),
            released: Vec::new(),
            new_owner: None,
        })
    }

    /// Remove `target` from its group
    ///
    /// # Errors
    ///
    /// [`GroupError::NotInGroup`] if the target is ungrouped,
    /// [`GroupError::NotPermitted`] unless the remover owns the target's group
    /// or is the target.
    pub fn remove(
        &self,
        remover: &ClientId,
        target: &ClientId,
    ) -> Result<MembershipChange, GroupError> {
        let mut index = self.inner.write();
        let Some(group) = index.group_of(target) else {
            return Err(GroupError::NotInGroup(target.clone()));
        };
        if remover != target && *remover != group.owner {
            return Err(GroupError::NotPermitted);
        }

        let change = index
            .detach(target)
            .ok_or_else(|| GroupError::NotInGroup(target.clone()))?;
        tracing::info!(group = %change.group_id, remover = %remover, target = %target, "Client left group");
        Ok(change)
    }

    /// Members of the client's group, empty when ungrouped
    #[must_use]
    pub fn members_of(&self, client: &ClientId) -> Vec<ClientId> {
        self.inner
            .read()
            .group_of(client)
            .map(Group::member_list)
            .unwrap_or_default()
    }

    /// The client's group
    #[must_use]
    pub fn group_of(&self, client: &ClientId) -> Option<Group> {
        self.inner.read().group_of(client).cloned()
    }

    /// A group by ID
    #[must_use]
    pub fn group(&self, id: &GroupId) -> Option<Group> {
        self.inner.read().groups.get(id).cloned()
    }

    /// Whether `client` owns its group
    #[must_use]
    pub fn is_owner(&self, client: &ClientId) -> bool {
        self.inner
            .read()
            .group_of(client)
            .is_some_and(|g| g.owner == *client)
    }

    /// Number of live groups
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.inner.read().groups.len()
    }
}

impl fmt::Debug for GroupRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let index = self.inner.read();
        f.debug_struct("GroupRegistry")
            .field("clients", &index.clients.len())
            .field("groups", &index.groups.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn id(s: &str) -> ClientId {
        ClientId::from(s)
    }

    fn registry_with(clients: &[&str]) -> GroupRegistry {
        let registry = GroupRegistry::new();
        for c in clients {
            registry.register(id(c));
        }
        registry
    }

    /// Every index entry agrees with the group records
    fn assert_consistent(registry: &GroupRegistry) {
        let index = registry.inner.read();
        for (client, group_id) in &index.clients {
            if let Some(group_id) = group_id {
                let group = index.groups.get(group_id).expect("indexed group exists");
                assert!(group.contains(client), "{client} missing from {group_id}");
            }
        }
        for (group_id, group) in &index.groups {
            assert!(group.len() >= 2, "{group_id} should have been deleted");
            assert!(group.contains(&group.owner), "{group_id} owner not a member");
            for member in &group.members {
                assert_eq!(index.clients.get(member), Some(&Some(group_id.clone())));
            }
        }
    }

    // ========================================================================
    // Invite Tests
    // ========================================================================

    #[test]
    fn test_invite_creates_group_owned_by_inviter() {
        let registry = registry_with(&["a", "b"]);
        let change = registry.invite(&id("a"), &id("b")).unwrap();

        let group = change.group.unwrap();
        assert_eq!(group.owner, id("a"));
        assert_eq!(group.member_list(), vec![id("a"), id("b")]);
        assert_eq!(registry.members_of(&id("b")), vec![id("a"), id("b")]);
        assert!(registry.is_owner(&id("a")));
        assert!(!registry.is_owner(&id("b")));
    }

    #[test]
    fn test_invite_into_existing_group() {
        let registry = registry_with(&["a", "b", "c"]);
        let first = registry.invite(&id("a"), &id("b")).unwrap();
        // Any member may invite
        let second = registry.invite(&id("b"), &id("c")).unwrap();

        assert_eq!(first.group_id, second.group_id);
        assert_eq!(second.remaining(), vec![id("a"), id("b"), id("c")]);
        assert_eq!(registry.group_count(), 1);
    }

    #[test]
    fn test_invite_failures_change_nothing() {
        let registry = registry_with(&["a", "b", "c", "d"]);
        registry.invite(&id("a"), &id("b")).unwrap();

        assert_eq!(
            registry.invite(&id("c"), &id("ghost")),
            Err(GroupError::UnknownInvitee(id("ghost")))
        );
        assert_eq!(
            registry.invite(&id("c"), &id("b")),
            Err(GroupError::AlreadyGrouped(id("b")))
        );
        assert_eq!(registry.invite(&id("c"), &id("c")), Err(GroupError::SelfInvite));
        assert_eq!(
            registry.invite(&id("ghost"), &id("d")),
            Err(GroupError::UnknownClient(id("ghost")))
        );

        assert!(registry.members_of(&id("c")).is_empty());
        assert!(registry.members_of(&id("d")).is_empty());
        assert_eq!(registry.group_count(), 1);
        assert_consistent(&registry);
    }

    #[test]
    fn test_create_group() {
        let registry = registry_with(&["a"]);
        let group = registry.create_group(&id("a")).unwrap();
        assert_eq!(group.owner, id("a"));
        assert_eq!(registry.group_of(&id("a")), Some(group));
        assert_eq!(
            registry.create_group(&id("a")),
            Err(GroupError::AlreadyGrouped(id("a")))
        );
    }

    // ========================================================================
    // Remove Tests
    // ========================================================================

    #[test]
    fn test_remove_last_non_owner_deletes_group() {
        let registry = registry_with(&["a", "b"]);
        let joined = registry.invite(&id("a"), &id("b")).unwrap();

        let change = registry.remove(&id("a"), &id("b")).unwrap();
        assert!(change.dissolved());
        assert_eq!(change.group_id, joined.group_id);
        assert_eq!(change.released, vec![id("b"), id("a")]);
        assert!(registry.group(&joined.group_id).is_none());
        assert!(registry.members_of(&id("a")).is_empty());
        assert_consistent(&registry);
    }

    #[test]
    fn test_remove_owner_transfers_ownership() {
        let registry = registry_with(&["a", "b", "c"]);
        registry.invite(&id("a"), &id("b")).unwrap();
        registry.invite(&id("a"), &id("c")).unwrap();

        let change = registry.remove(&id("a"), &id("a")).unwrap();
        let group = change.group.clone().unwrap();
        assert_eq!(group.member_list(), vec![id("b"), id("c")]);
        assert_eq!(change.new_owner, Some(id("b")));
        assert!(group.contains(&group.owner));
        assert_eq!(change.affected(), vec![id("a"), id("b"), id("c")]);
        assert_consistent(&registry);
    }

    #[test]
    fn test_remove_owner_from_pair_deletes_group() {
        let registry = registry_with(&["a", "b"]);
        registry.invite(&id("a"), &id("b")).unwrap();

        let change = registry.remove(&id("a"), &id("a")).unwrap();
        assert!(change.dissolved());
        assert_eq!(registry.group_count(), 0);
    }

    #[test]
    fn test_remove_permissions() {
        let registry = registry_with(&["a", "b", "c", "d"]);
        registry.invite(&id("a"), &id("b")).unwrap();
        registry.invite(&id("a"), &id("c")).unwrap();

        assert_eq!(registry.remove(&id("b"), &id("c")), Err(GroupError::NotPermitted));
        // An outsider cannot remove anyone either
        assert_eq!(registry.remove(&id("d"), &id("c")), Err(GroupError::NotPermitted));
        assert_eq!(
            registry.remove(&id("a"), &id("d")),
            Err(GroupError::NotInGroup(id("d")))
        );

        // Leaving on your own is always allowed
        let change = registry.remove(&id("b"), &id("b")).unwrap();
        assert_eq!(change.remaining(), vec![id("a"), id("c")]);
        assert_eq!(change.new_owner, None);
    }

    #[test]
    fn test_unregister_leaves_group() {
        let registry = registry_with(&["a", "b", "c"]);
        registry.invite(&id("a"), &id("b")).unwrap();
        registry.invite(&id("a"), &id("c")).unwrap();

        let change = registry.unregister(&id("a")).unwrap();
        assert_eq!(change.new_owner, Some(id("b")));
        assert!(!registry.is_registered(&id("a")));
        assert!(registry.is_owner(&id("b")));

        assert!(registry.unregister(&id("ghost")).is_none());
        assert_consistent(&registry);
    }

    // ========================================================================
    // Property Tests
    // ========================================================================

    #[test]
    fn test_random_operations_keep_invariants() {
        let names = ["a", "b", "c", "d", "e", "f"];
        let registry = registry_with(&names);
        let mut rng = StdRng::seed_from_u64(0x9E37_79B9_7F4A_7C15);

        for _ in 0..2_000 {
            let x = id(names[rng.gen_range(0..names.len())]);
            let y = id(names[rng.gen_range(0..names.len())]);
            match rng.gen_range(0..4) {
                0 | 1 => {
                    let _ = registry.invite(&x, &y);
                }
                2 => {
                    let _ = registry.remove(&x, &y);
                }
                _ => {
                    registry.unregister(&x);
                    registry.register(x.clone());
                }
            }

            assert_consistent(&registry);
            for name in names {
                let members = registry.members_of(&id(name));
                assert!(members.is_empty() || members.contains(&id(name)));
            }
        }
    }
}
