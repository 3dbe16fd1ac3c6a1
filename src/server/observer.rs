use tracing::{debug, trace};

use crate::protocol::{FrameHeader, frontend_tag_name};
use crate::server::handshake::HandshakePhase;
use crate::server::session::SessionId;

/// Hook invoked at fixed points of a session's life.
///
/// Implementations must not block; they run inline on the session task.
/// Nothing in the protocol path depends on what an observer does.
pub trait SessionObserver: Send + Sync {
    /// Called on every handshake phase transition.
    fn phase_changed(&self, _session: SessionId, _from: &HandshakePhase, _to: &HandshakePhase) {}

    /// Called for every steady-state frame before it is handed to the relay.
    fn frame_received(&self, _session: SessionId, _header: &FrameHeader) {}
}

/// Observer that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

/// Observer that emits `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SessionObserver for TracingObserver {
    fn phase_changed(&self, session: SessionId, from: &HandshakePhase, to: &HandshakePhase) {
        debug!(%session, %from, %to, "handshake phase");
    }

    fn frame_received(&self, session: SessionId, header: &FrameHeader) {
        trace!(
            %session,
            tag = %char::from(header.tag),
            kind = frontend_tag_name(header.tag),
            payload = header.payload_len(),
            "frame received"
        );
    }
}
