use crate::wire::{WireDecode, WireError, WireReader};

use super::{MessageClass, MessageError};

/// Reads back what an [`OutgoingMessage`](super::OutgoingMessage) wrote.
#[derive(Debug, Clone)]
pub struct IncomingMessage<'a> {
    class: MessageClass,
    name: String,
    reader: WireReader<'a>,
}

impl<'a> IncomingMessage<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, MessageError> {
        let mut reader = WireReader::new(bytes);
        let class = MessageClass::try_from(reader.try_read::<u8>()?)?;
        let name = reader.try_read::<String>()?;
        Ok(Self {
            class,
            name,
            reader,
        })
    }

    pub fn class(&self) -> MessageClass {
        self.class
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is(&self, class: MessageClass, name: &str) -> bool {
        self.class == class && self.name == name
    }

    pub fn try_read<T: WireDecode>(&mut self) -> Result<T, WireError> {
        self.reader.try_read()
    }

    /// Zero value and a sticky failure when the body runs short.
    pub fn read<T: WireDecode + Default>(&mut self) -> T {
        self.reader.read()
    }

    pub fn read_byte(&mut self) -> u8 {
        self.read()
    }

    pub fn read_int(&mut self) -> i32 {
        self.read()
    }

    pub fn read_float(&mut self) -> f32 {
        self.read()
    }

    pub fn read_string(&mut self) -> String {
        self.read()
    }

    pub fn read_array(&mut self, len: usize) -> Vec<u8> {
        self.reader.read_array(len)
    }

    pub fn position(&self) -> usize {
        self.reader.position()
    }

    pub fn set_position(&mut self, position: usize) -> Result<(), WireError> {
        self.reader.set_position(position)
    }

    pub fn remaining(&self) -> usize {
        self.reader.remaining()
    }

    pub fn has_failed(&self) -> bool {
        self.reader.has_failed()
    }

    pub fn reader(&mut self) -> &mut WireReader<'a> {
        &mut self.reader
    }
}
