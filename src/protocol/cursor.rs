use bytes::{Buf, Bytes};

use crate::protocol::ProtocolError;

/// Read-only view over a single message body.
///
/// Reads narrow the unread view of the underlying [`Bytes`]; the storage itself
/// is never modified. Every read checks the remaining length first, so a short
/// message fails with [`ProtocolError::TruncatedInput`] instead of panicking.
#[derive(Debug, Clone)]
pub struct ByteCursor {
    buf: Bytes,
}

impl ByteCursor {
    pub fn new(buf: impl Into<Bytes>) -> Self {
        Self { buf: buf.into() }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    /// Reads a big-endian u32.
    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    /// Reads a big-endian i32.
    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    /// Reads a null-terminated byte string and advances past the terminator.
    ///
    /// The content is returned as-is, with no encoding check.
    pub fn read_cstring_bytes(&mut self) -> Result<Bytes, ProtocolError> {
        let Some(null_pos) = self.buf.iter().position(|&b| b == 0) else {
            return Err(ProtocolError::MissingTerminator);
        };

        let bytes = self.buf.split_to(null_pos);
        self.buf.advance(1);
        Ok(bytes)
    }

    /// Like [`read_cstring_bytes`](Self::read_cstring_bytes), but requires UTF-8.
    pub fn read_cstring(&mut self) -> Result<String, ProtocolError> {
        let bytes = self.read_cstring_bytes()?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    fn ensure(&self, n: usize) -> Result<(), ProtocolError> {
        if self.buf.len() < n {
            return Err(ProtocolError::TruncatedInput);
        }
        Ok(())
    }
}
