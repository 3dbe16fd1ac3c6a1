use bytes::{BufMut, BytesMut};

use crate::protocol::{ErrorFieldCode, OutputFrame, TransactionStatus};

/// Messages sent by the proxy to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    /// Single unframed byte answering an SSLRequest: 'S' to proceed, 'N' to refuse.
    SslResponse { accepted: bool },
    /// 'Z' - Ready for query
    ReadyForQuery { status: TransactionStatus },
    /// 'E' - Error response
    ErrorResponse { fields: Vec<ErrorField> },
}

impl BackendMessage {
    /// Builds a FATAL ErrorResponse with the given SQLSTATE and message.
    pub fn fatal(code: &str, message: impl Into<String>) -> Self {
        BackendMessage::ErrorResponse {
            fields: vec![
                ErrorField::new(ErrorFieldCode::Severity, "FATAL"),
                ErrorField::new(ErrorFieldCode::SeverityNonLocalized, "FATAL"),
                ErrorField::new(ErrorFieldCode::SqlState, code),
                ErrorField::new(ErrorFieldCode::Message, message),
            ],
        }
    }

    /// Appends the wire encoding of this message to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            BackendMessage::SslResponse { accepted } => {
                dst.put_u8(if *accepted { b'S' } else { b'N' });
            }
            BackendMessage::ReadyForQuery { status } => {
                let mut frame = OutputFrame::new(b'Z');
                frame.put_u8(status.as_byte());
                dst.put_slice(&frame.finalize());
            }
            BackendMessage::ErrorResponse { fields } => {
                let mut frame = OutputFrame::new(b'E');
                for field in fields {
                    frame.put_u8(field.code.as_u8()).put_cstring(&field.value);
                }
                frame.put_u8(0); // terminator
                dst.put_slice(&frame.finalize());
            }
        }
    }
}

/// One field of an ErrorResponse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorField {
    pub code: ErrorFieldCode,
    pub value: String,
}

impl ErrorField {
    pub fn new(code: ErrorFieldCode, value: impl Into<String>) -> Self {
        Self {
            code,
            value: value.into(),
        }
    }
}
