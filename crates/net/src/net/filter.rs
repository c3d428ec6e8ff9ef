use std::collections::BTreeSet;

use super::events::{GroupId, PeerId};
use super::registry::ConnectionRegistry;

/// The set of peers one message goes to, and whether it goes reliably.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientFilter {
    users: BTreeSet<PeerId>,
    reliable: bool,
}

impl Default for RecipientFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl RecipientFilter {
    pub fn new() -> Self {
        Self {
            users: BTreeSet::new(),
            reliable: true,
        }
    }

    pub fn single(peer: PeerId) -> Self {
        let mut filter = Self::new();
        filter.add_user(peer);
        filter
    }

    /// Every peer currently known to `registry`.
    pub fn all(registry: &ConnectionRegistry) -> Self {
        let mut filter = Self::new();
        filter.add_all_users(registry);
        filter
    }

    pub fn add_user(&mut self, peer: PeerId) -> &mut Self {
        self.users.insert(peer);
        self
    }

    pub fn add_all_users(&mut self, registry: &ConnectionRegistry) -> &mut Self {
        self.users.extend(registry.connected_peers());
        self
    }

    pub fn add_group(&mut self, registry: &ConnectionRegistry, group: GroupId) -> &mut Self {
        self.users.extend(registry.peers_in_group(group));
        self
    }

    pub fn remove_user(&mut self, peer: PeerId) -> bool {
        self.users.remove(&peer)
    }

    pub fn make_reliable(&mut self) -> &mut Self {
        self.reliable = true;
        self
    }

    pub fn make_unreliable(&mut self) -> &mut Self {
        self.reliable = false;
        self
    }

    pub fn is_reliable(&self) -> bool {
        self.reliable
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.users.contains(&peer)
    }

    pub fn users(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.users.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
