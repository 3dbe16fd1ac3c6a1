use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::{BackendMessage, ByteCursor, ProtocolError};

/// Size of the `type + length` envelope in front of every steady-state frame.
pub const HEADER_LEN: usize = 5;

/// Default cap on a steady-state payload (16 MB). Larger frames end the session.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// The `type + length` envelope of a steady-state frame.
///
/// `length` counts itself but not the tag byte, so the payload that follows is
/// `length - 4` bytes long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub tag: u8,
    pub length: u32,
}

impl FrameHeader {
    /// Decodes a header from the front of `src`.
    pub fn decode(src: &mut ByteCursor) -> Result<Self, ProtocolError> {
        let tag = src.read_u8()?;
        let length = src.read_u32()?;
        if length < 4 {
            return Err(ProtocolError::InvalidLength(length));
        }
        Ok(Self { tag, length })
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.tag);
        dst.put_u32(self.length);
    }

    /// Number of payload bytes following this header.
    pub fn payload_len(&self) -> usize {
        self.length.saturating_sub(4) as usize
    }
}

/// A complete steady-state frame: its header plus exactly `payload_len()` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn tag(&self) -> u8 {
        self.header.tag
    }

    /// Writes the frame back out exactly as it appeared on the wire.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN + self.payload.len());
        self.header.encode(dst);
        dst.put_slice(&self.payload);
    }
}

/// Outbound frame under construction.
///
/// The length slot is filled in by [`OutputFrame::finalize`], which consumes the
/// builder so a frame cannot be finalized twice.
#[derive(Debug)]
pub struct OutputFrame {
    buf: BytesMut,
}

impl OutputFrame {
    pub fn new(tag: u8) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(tag);
        buf.put_u32(0); // length placeholder
        Self { buf }
    }

    pub fn put_u8(&mut self, b: u8) -> &mut Self {
        self.buf.put_u8(b);
        self
    }

    pub fn put_slice(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_slice(bytes);
        self
    }

    /// Appends a null-terminated string.
    pub fn put_cstring(&mut self, s: &str) -> &mut Self {
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
        self
    }

    /// Writes the length field and returns the frame ready for transmission.
    pub fn finalize(mut self) -> Bytes {
        let len = self.buf.len() - 1;
        debug_assert!(len <= i32::MAX as usize, "frame length overflows i32");
        self.buf[1..HEADER_LEN].copy_from_slice(&(len as u32).to_be_bytes());
        self.buf.freeze()
    }
}

/// Codec for the steady-state phase.
///
/// Decodes [`Frame`]s and encodes [`BackendMessage`]s. A stream that ends cleanly
/// between frames yields `None`; one that ends inside a frame yields
/// [`ProtocolError::TruncatedInput`].
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Peek at the length (bytes 1-4, don't consume yet)
        let length = u32::from_be_bytes([src[1], src[2], src[3], src[4]]);
        if length < 4 {
            return Err(ProtocolError::InvalidLength(length));
        }
        let payload_len = (length - 4) as usize;
        if payload_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                len: payload_len,
                max: self.max_frame_size,
            });
        }

        let total = HEADER_LEN + payload_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut payload = src.split_to(total).freeze();
        let header = FrameHeader::decode(&mut ByteCursor::new(payload.split_to(HEADER_LEN)))?;
        Ok(Some(Frame { header, payload }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::TruncatedInput),
        }
    }
}

impl Encoder<BackendMessage> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: BackendMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}
