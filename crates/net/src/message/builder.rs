use crate::net::{ConnectionRegistry, MAX_PAYLOAD_SIZE, RecipientFilter};
use crate::wire::{WireEncode, WireWriter};

use super::{MessageClass, MessageError};

const LOG_TARGET: &str = "tether::message";

/// An application payload: class byte, null-terminated name, then fields
/// in write order.
#[derive(Debug)]
pub struct OutgoingMessage {
    class: MessageClass,
    name: String,
    writer: WireWriter,
}

impl OutgoingMessage {
    pub fn new(class: MessageClass, name: &str) -> Self {
        Self::with_capacity(class, name, MAX_PAYLOAD_SIZE)
    }

    pub fn with_capacity(class: MessageClass, name: &str, capacity: usize) -> Self {
        let mut writer = WireWriter::new(capacity);
        writer.write(&(class as u8));
        writer.write(name);
        Self {
            class,
            name: name.to_owned(),
            writer,
        }
    }

    pub fn user(name: &str) -> Self {
        Self::new(MessageClass::User, name)
    }

    pub fn entity(name: &str) -> Self {
        Self::new(MessageClass::Entity, name)
    }

    pub fn class(&self) -> MessageClass {
        self.class
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn write<T: WireEncode + ?Sized>(&mut self, value: &T) -> &mut Self {
        self.writer.write(value);
        self
    }

    pub fn write_byte(&mut self, value: u8) -> &mut Self {
        self.write(&value)
    }

    pub fn write_int(&mut self, value: i32) -> &mut Self {
        self.write(&value)
    }

    pub fn write_float(&mut self, value: f32) -> &mut Self {
        self.write(&value)
    }

    pub fn write_string(&mut self, value: &str) -> &mut Self {
        self.write(value)
    }

    /// Raw bytes; the reader has to know the length.
    pub fn write_array(&mut self, bytes: &[u8]) -> &mut Self {
        self.writer.write_array(bytes);
        self
    }

    pub fn len(&self) -> usize {
        self.writer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writer.is_empty()
    }

    pub fn remaining_capacity(&self) -> usize {
        self.writer.remaining_capacity()
    }

    pub fn has_failed(&self) -> bool {
        self.writer.has_failed()
    }

    pub fn bytes(&self) -> &[u8] {
        self.writer.as_bytes()
    }

    pub fn into_bytes(self) -> Result<Vec<u8>, MessageError> {
        if self.writer.has_failed() {
            return Err(MessageError::WriteFailed);
        }
        Ok(self.writer.into_bytes())
    }

    /// Sends to every peer in `filter`. Ids the registry no longer knows are
    /// pruned from the filter once the fan-out is done. Returns how many
    /// peers took the message.
    pub fn send(&self, filter: &mut RecipientFilter, registry: &ConnectionRegistry) -> usize {
        if self.writer.has_failed() {
            log::warn!(
                target: LOG_TARGET,
                "Not sending {:?} message {:?}: body overflowed",
                self.class,
                self.name
            );
            return 0;
        }

        let fanout = registry.send_many(filter.users(), self.bytes(), filter.is_reliable());
        for peer in fanout.missing {
            log::debug!(target: LOG_TARGET, "Pruning stale recipient {}", peer);
            filter.remove_user(peer);
        }
        fanout.sent
    }
}
