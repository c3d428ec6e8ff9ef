use super::error::WireError;
use super::value::WireDecode;

/// Cursor over a received buffer.
///
/// A failed read leaves the cursor where it was and latches
/// [`has_failed`](Self::has_failed), so a decoder can issue a run of reads and
/// check once at the end.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    data: &'a [u8],
    position: usize,
    failed: bool,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            position: 0,
            failed: false,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, position: usize) -> Result<(), WireError> {
        if position > self.data.len() {
            self.failed = true;
            return Err(WireError::InvalidPosition {
                position,
                len: self.data.len(),
            });
        }
        self.position = position;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    pub fn clear_error(&mut self) {
        self.failed = false;
    }

    pub fn try_read<T: WireDecode>(&mut self) -> Result<T, WireError> {
        let start = self.position;
        T::decode(self).inspect_err(|e| {
            log::debug!(target: "tether::wire", "Read failed at {}: {}", start, e);
            self.position = start;
            self.failed = true;
        })
    }

    /// Reads a value, yielding the type's zero value on failure.
    pub fn read<T: WireDecode + Default>(&mut self) -> T {
        self.try_read().unwrap_or_default()
    }

    pub fn try_read_array(&mut self, len: usize) -> Result<Vec<u8>, WireError> {
        match self.take(len) {
            Ok(bytes) => Ok(bytes.to_vec()),
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }

    /// Copies `len` raw bytes; empty on failure.
    pub fn read_array(&mut self, len: usize) -> Vec<u8> {
        self.try_read_array(len).unwrap_or_default()
    }

    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.position..]
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(WireError::Truncated {
                needed: len,
                remaining,
            });
        }
        let bytes = &self.data[self.position..self.position + len];
        self.position += len;
        Ok(bytes)
    }

    pub fn take_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let bytes = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    /// Returns the bytes before the next zero byte and steps past the zero.
    pub fn take_until_nul(&mut self) -> Result<&'a [u8], WireError> {
        let rest = self.rest();
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(WireError::Unterminated)?;
        self.position += end + 1;
        Ok(&rest[..end])
    }
}
