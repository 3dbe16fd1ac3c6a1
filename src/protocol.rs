//! PostgreSQL wire protocol framing.
//!
//! This module implements the parts of the v3.0 protocol the proxy needs to
//! take a connection through its startup handshake and then split the client's
//! byte stream into frames. Message bodies are not interpreted.
//!
//! ## Architecture
//!
//! ```text
//! +----------+   startup frames    +--------------+
//! |  Client  |  --- StartupCodec ->|  Handshake   |
//! |  (psql)  |                     +--------------+
//! |          |   tagged frames     +--------------+
//! |          |  --- FrameCodec --->|    Relay     |
//! +----------+  <- BackendMessage  +--------------+
//! ```
//!
//! ## Terminology
//!
//! - **ByteCursor**: bounds-checked reader over one message body
//! - **OutputFrame**: builder for an outbound tagged frame
//! - **FrameHeader**: the `tag + length` envelope of a steady-state frame
//! - **StartupRequest**: classification of an untagged startup frame (Startup, SSL, Cancel)
//! - **BackendMessage**: the few messages the proxy itself sends to the client

pub mod backend;
pub mod cursor;
pub mod error;
pub mod frame;
pub mod startup;
pub mod types;

pub use backend::{BackendMessage, ErrorField};
pub use cursor::ByteCursor;
pub use error::ProtocolError;
pub use frame::{DEFAULT_MAX_FRAME_SIZE, Frame, FrameCodec, FrameHeader, OutputFrame};
pub use startup::{
    CANCEL_REQUEST_CODE, DEFAULT_MAX_STARTUP_SIZE, PROTOCOL_VERSION_3_0, ProtocolVersion,
    SSL_REQUEST_CODE, StartupCodec, StartupMessage, StartupParameters, StartupRequest,
};
pub use types::{ErrorFieldCode, TransactionStatus, frontend_tag_name, sql_state};
