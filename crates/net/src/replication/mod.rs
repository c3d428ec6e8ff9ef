mod entity;
mod error;
mod manager;
mod role;
mod variable;

pub use entity::{AsAny, Entity, EntityType};
pub use error::ReplicationError;
pub use manager::{
    ClientEntityManager, ENTITY_CREATE, ENTITY_DESTROY, ENTITY_UPDATE, EntityManager,
    ReplicationBatch, ServerEntityManager,
};
pub use role::{Client, Role, Server};
pub use variable::{Binding, ChangeNotifier, ReplicatedVariable, Variable};

use serde::{Deserialize, Serialize};

use crate::net::MAX_PAYLOAD_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u16);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

/// Position of a variable in its entity's declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariableIndex(pub u8);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Size of the entity id pool.
    pub max_entities: usize,
    /// Update messages larger than this are split.
    pub max_message_size: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_entities: 1024,
            max_message_size: MAX_PAYLOAD_SIZE,
        }
    }
}
