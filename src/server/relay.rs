//! The hand-off point between the proxy core and whatever consumes client frames.

use std::future::Future;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::UpstreamTarget;
use crate::protocol::{ByteCursor, Frame, StartupMessage, frontend_tag_name};
use crate::server::session::SessionId;

/// Relay errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Creates one [`Relay`] per accepted session.
pub trait RelayFactory: Send + Sync + 'static {
    type Relay: Relay;

    /// Opens the upstream side for a session whose handshake was accepted.
    fn connect(
        &self,
        session: SessionId,
        startup: &StartupMessage,
    ) -> impl Future<Output = Result<Self::Relay, RelayError>> + Send;
}

/// Receives a session's steady-state frames in arrival order.
pub trait Relay: Send {
    fn relay(&mut self, frame: Frame) -> impl Future<Output = Result<(), RelayError>> + Send;
}

/// Relay that only observes: it logs every frame and the text of simple queries.
#[derive(Debug)]
pub struct LogRelay {
    session: SessionId,
    frames: u64,
    bytes: u64,
}

impl LogRelay {
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            frames: 0,
            bytes: 0,
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Relay for LogRelay {
    async fn relay(&mut self, frame: Frame) -> Result<(), RelayError> {
        self.frames += 1;
        self.bytes += u64::from(frame.header.length) + 1;

        debug!(
            session = %self.session,
            kind = frontend_tag_name(frame.tag()),
            len = frame.header.length,
            "frame"
        );
        if frame.tag() == b'Q'
            && let Ok(query) = ByteCursor::new(frame.payload).read_cstring()
        {
            debug!(session = %self.session, %query, "simple query");
        }
        Ok(())
    }
}

impl Drop for LogRelay {
    fn drop(&mut self) {
        debug!(session = %self.session, frames = self.frames(), bytes = self.bytes(), "relay closed");
    }
}

/// Factory for [`LogRelay`].
///
/// Every accepted session first checks that the upstream still accepts
/// connections; a session whose upstream is gone fails with
/// [`RelayError::UpstreamUnavailable`].
#[derive(Debug, Clone)]
pub struct LogRelayFactory {
    upstream: UpstreamTarget,
    connect_timeout: Duration,
}

impl LogRelayFactory {
    pub fn new(upstream: UpstreamTarget, connect_timeout: Duration) -> Self {
        Self {
            upstream,
            connect_timeout,
        }
    }
}

impl RelayFactory for LogRelayFactory {
    type Relay = LogRelay;

    async fn connect(
        &self,
        session: SessionId,
        startup: &StartupMessage,
    ) -> Result<Self::Relay, RelayError> {
        probe_upstream(&self.upstream, self.connect_timeout).await?;

        let params = &startup.parameters;
        for (key, value) in params.iter() {
            debug!(
                %session,
                key = %String::from_utf8_lossy(key),
                value = %String::from_utf8_lossy(value),
                "startup parameter"
            );
        }
        info!(
            %session,
            version = %startup.version,
            parameters = params.len(),
            user = params.user().as_deref().unwrap_or("-"),
            database = params.database().as_deref().unwrap_or("-"),
            application = params.application_name().as_deref().unwrap_or("-"),
            upstream = %self.upstream,
            "session started"
        );
        Ok(LogRelay::new(session))
    }
}

/// Checks that the upstream server accepts TCP connections.
pub async fn probe_upstream(target: &UpstreamTarget, timeout: Duration) -> Result<(), RelayError> {
    match tokio::time::timeout(timeout, TcpStream::connect(target.socket_addr())).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(RelayError::UpstreamUnavailable(format!("{target}: {e}"))),
        Err(_) => Err(RelayError::UpstreamUnavailable(format!(
            "{target}: no answer within {timeout:?}"
        ))),
    }
}
