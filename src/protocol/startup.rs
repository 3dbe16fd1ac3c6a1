use std::borrow::Cow;
use std::fmt;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::{BackendMessage, ByteCursor, ProtocolError};

/// Protocol version 3.0, encoded as `major << 16 | minor`.
pub const PROTOCOL_VERSION_3_0: u32 = 3 << 16; // 196608

/// SSLRequest magic number
pub const SSL_REQUEST_CODE: u32 = (1234 << 16) | 5679; // 80877103

/// CancelRequest magic number
pub const CANCEL_REQUEST_CODE: u32 = (1234 << 16) | 5678; // 80877102

/// Largest startup frame accepted, matching PostgreSQL's own startup packet limit.
pub const DEFAULT_MAX_STARTUP_SIZE: usize = 10_000;

/// Smallest valid startup frame: the length field plus the code.
const MIN_STARTUP_LEN: u32 = 8;

/// A negotiated protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const V3_0: ProtocolVersion = ProtocolVersion { major: 3, minor: 0 };

    pub fn from_code(code: u32) -> Self {
        Self {
            major: (code >> 16) as u16,
            minor: (code & 0xFFFF) as u16,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Session parameters sent by the client in its startup message.
///
/// Keys and values are kept as the raw bytes the client sent; clients are free
/// to use any client encoding. Keys keep the order in which the client sent
/// them and a repeated key replaces the earlier value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupParameters {
    entries: Vec<(Bytes, Bytes)>,
}

impl StartupParameters {
    /// Decodes `key\0value\0 ... \0` from the rest of a startup body.
    ///
    /// The empty key must be present and must be the last byte of the body.
    pub fn decode(src: &mut ByteCursor) -> Result<Self, ProtocolError> {
        let mut params = StartupParameters::default();

        loop {
            if src.is_empty() {
                return Err(ProtocolError::MalformedParameterList(
                    "list ended without terminator".to_string(),
                ));
            }

            let name = src.read_cstring_bytes()?;

            // Empty name signals end of parameters
            if name.is_empty() {
                break;
            }

            if src.is_empty() {
                return Err(ProtocolError::MalformedParameterList(format!(
                    "parameter \"{}\" has no value",
                    String::from_utf8_lossy(&name)
                )));
            }
            let value = src.read_cstring_bytes()?;
            params.insert(name, value);
        }

        if !src.is_empty() {
            return Err(ProtocolError::MalformedParameterList(format!(
                "{} trailing bytes after terminator",
                src.remaining()
            )));
        }

        Ok(params)
    }

    pub fn insert(&mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) {
        let (name, value) = (name.into(), value.into());
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Raw value of `name`.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(k, _)| k == name.as_bytes())
            .map(|(_, v)| v.as_ref())
    }

    /// Value of `name` for display; invalid UTF-8 is replaced, not rejected.
    pub fn get_lossy(&self, name: &str) -> Option<Cow<'_, str>> {
        self.get(name).map(String::from_utf8_lossy)
    }

    pub fn user(&self) -> Option<Cow<'_, str>> {
        self.get_lossy("user")
    }

    pub fn database(&self) -> Option<Cow<'_, str>> {
        self.get_lossy("database")
    }

    pub fn application_name(&self) -> Option<Cow<'_, str>> {
        self.get_lossy("application_name")
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_ref(), v.as_ref()))
    }
}

impl<K: Into<Bytes>, V: Into<Bytes>> FromIterator<(K, V)> for StartupParameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = StartupParameters::default();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

/// A completed version-3 startup message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupMessage {
    pub version: ProtocolVersion,
    pub parameters: StartupParameters,
}

/// Classification of one startup frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupRequest {
    /// SSLRequest - client asks whether encrypted transport is available
    SslProbe,
    /// CancelRequest - client wants a running query on another connection cancelled
    Cancel { process_id: i32, secret_key: i32 },
    /// StartupMessage - normal connection startup
    Startup(StartupMessage),
}

/// Codec for the startup phase.
///
/// Startup frames have no tag byte: `[i32 length][body]` where the length counts
/// itself. Each decoded item is the body that follows the length field.
#[derive(Debug)]
pub struct StartupCodec {
    max_startup_size: usize,
}

impl StartupCodec {
    pub fn new(max_startup_size: usize) -> Self {
        Self { max_startup_size }
    }
}

impl Default for StartupCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STARTUP_SIZE)
    }
}

impl Decoder for StartupCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        // Peek at the length (don't consume yet)
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if len < MIN_STARTUP_LEN {
            return Err(ProtocolError::InvalidLength(len));
        }
        let len = len as usize;
        if len > self.max_startup_size {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_startup_size,
            });
        }

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(len).freeze();
        frame.advance(4);
        Ok(Some(frame))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::TruncatedInput),
        }
    }
}

impl Encoder<BackendMessage> for StartupCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: BackendMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}
