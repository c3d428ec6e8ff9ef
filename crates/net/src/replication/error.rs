use thiserror::Error;

use crate::message::MessageError;
use crate::wire::WireError;

use super::EntityId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicationError {
    #[error("no entity type registered as {0:?}")]
    UnknownType(String),
    #[error("entity id pool exhausted ({max} in use)")]
    PoolExhausted { max: usize },
    #[error("{type_name} declares {expected} variables but has {found}")]
    VariableMismatch {
        type_name: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("unknown {0}")]
    UnknownEntity(EntityId),
    #[error("{entity} has no variable {name:?}")]
    UnknownVariable { entity: EntityId, name: String },
    #[error("unknown entity message {0:?}")]
    UnknownMessage(String),
    #[error("not an entity message")]
    NotEntityMessage,
    #[error("malformed entity message: {0}")]
    Malformed(#[from] WireError),
    #[error(transparent)]
    Message(#[from] MessageError),
}
