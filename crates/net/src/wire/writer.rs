use super::error::WireError;
use super::value::WireEncode;

/// Append-only buffer bounded by a declared capacity.
#[derive(Debug, Clone)]
pub struct WireWriter {
    buffer: Vec<u8>,
    capacity: usize,
    failed: bool,
}

impl WireWriter {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity.min(crate::net::MAX_PACKET_SIZE)),
            capacity,
            failed: false,
        }
    }

    pub fn try_write<T: WireEncode + ?Sized>(&mut self, value: &T) -> Result<(), WireError> {
        let needed = value.encoded_len();
        let remaining = self.remaining_capacity();
        if needed > remaining {
            self.failed = true;
            return Err(WireError::Overflow { needed, remaining });
        }

        let mark = self.buffer.len();
        value.encode(&mut self.buffer).inspect_err(|_| {
            self.buffer.truncate(mark);
            self.failed = true;
        })
    }

    pub fn write<T: WireEncode + ?Sized>(&mut self, value: &T) -> bool {
        match self.try_write(value) {
            Ok(()) => true,
            Err(e) => {
                log::debug!(target: "tether::wire", "Write failed: {}", e);
                false
            }
        }
    }

    /// Raw copy, no byte-order normalization. The length is not written.
    pub fn write_array(&mut self, bytes: &[u8]) -> bool {
        let remaining = self.remaining_capacity();
        if bytes.len() > remaining {
            log::debug!(
                target: "tether::wire",
                "Array of {} bytes exceeds capacity ({} left)",
                bytes.len(),
                remaining
            );
            self.failed = true;
            return false;
        }
        self.buffer.extend_from_slice(bytes);
        true
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.buffer.len())
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}
