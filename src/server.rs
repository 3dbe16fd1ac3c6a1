//! TCP server side of the proxy.
//!
//! ## Architecture
//!
//! ```text
//! +--------+
//! | Server |  <- Accepts TCP connections, one task each
//! +--------+
//!      |
//!      v
//! +---------+     +-----------+
//! | Session | --> | Handshake |  <- SSL probe / Startup / Cancel negotiation
//! +---------+     +-----------+
//!      |
//!      v
//! +-------+
//! | Relay |  <- Receives every frame after ReadyForQuery
//! +-------+
//! ```
//!
//! ## Terminology
//!
//! - **Server**: TCP listener that spawns sessions and drains them on shutdown
//! - **Session**: Per-client driver owning the socket for its whole life
//! - **Handshake**: Startup negotiation state machine plus its I/O loop
//! - **Relay**: Collaborator that receives decoded frames
//! - **Observer**: Optional hook notified of phase changes and frames

pub mod handshake;
pub mod listener;
pub mod observer;
pub mod relay;
pub mod session;
pub mod tcp;

pub use handshake::{Handshake, HandshakeOutcome, HandshakePhase, Negotiation};
pub use listener::{AcceptBackoff, Server};
pub use observer::{NoopObserver, SessionObserver, TracingObserver};
pub use relay::{LogRelay, LogRelayFactory, Relay, RelayError, RelayFactory, probe_upstream};
pub use session::{Session, SessionError, SessionId, SessionOutcome};
