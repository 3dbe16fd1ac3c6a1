/// Protocol parsing errors.
///
/// Every variant is terminal for the connection it was raised on.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The input ended in the middle of a field or frame.
    #[error("truncated input")]
    TruncatedInput,
    /// A string field has no zero terminator before the end of the message.
    #[error("missing string terminator")]
    MissingTerminator,
    /// The startup frame carries a code that is neither a supported protocol
    /// version nor a recognised special request.
    #[error("unsupported protocol code {0} (0x{0:08X})")]
    UnsupportedProtocol(u32),
    /// The startup parameter list is not a sequence of key/value pairs closed by
    /// an empty key.
    #[error("malformed parameter list: {0}")]
    MalformedParameterList(String),
    /// The peer closed the stream cleanly before sending anything.
    #[error("connection closed")]
    ConnectionClosed,
    /// A length field smaller than the fixed part of the frame it describes.
    #[error("invalid frame length: {0}")]
    InvalidLength(u32),
    #[error("frame of {len} bytes exceeds the limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    /// A startup frame arrived after the handshake already reached a terminal phase.
    #[error("unexpected startup frame after handshake completed")]
    UnexpectedStartupFrame,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
