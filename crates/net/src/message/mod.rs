mod builder;
mod decoder;

pub use builder::OutgoingMessage;
pub use decoder::IncomingMessage;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::wire::WireError;

/// First byte of every application payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageClass {
    Entity = 0,
    User = 1,
}

impl TryFrom<u8> for MessageClass {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Entity),
            1 => Ok(Self::User),
            other => Err(MessageError::UnknownClass(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("unknown message class {0}")]
    UnknownClass(u8),
    #[error("malformed message: {0}")]
    Malformed(#[from] WireError),
    #[error("message body could not be written")]
    WriteFailed,
}
