use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::protocol::{
    BackendMessage, FrameCodec, ProtocolError, StartupCodec, TransactionStatus, sql_state,
};
use crate::server::handshake::{Handshake, HandshakeOutcome};
use crate::server::observer::SessionObserver;
use crate::server::relay::{Relay, RelayError, RelayFactory};

/// Identifier of one accepted connection, unique within a server run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Session errors. All of them end the connection.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("handshake not completed within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),
}

/// How a session that did not fail came to an end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The connection only carried a CancelRequest.
    CancelRequested { process_id: i32, secret_key: i32 },
    /// The client closed the stream after `frames` steady-state frames.
    Closed { frames: u64 },
}

/// Drives a single client connection from its first byte to its close.
///
/// The handshake runs under `handshake_timeout`. Once it is accepted the
/// session answers with ReadyForQuery and forwards every following frame to a
/// relay, with no deadline.
pub struct Session<S> {
    id: SessionId,
    io: S,
    config: Arc<ServerConfig>,
    observer: Arc<dyn SessionObserver>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        id: SessionId,
        io: S,
        config: Arc<ServerConfig>,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        Self {
            id,
            io,
            config,
            observer,
        }
    }

    pub async fn run<F: RelayFactory>(self, relays: &F) -> Result<SessionOutcome, SessionError> {
        let Session {
            id,
            io,
            config,
            observer,
        } = self;

        let mut framed = Framed::new(io, StartupCodec::new(config.max_startup_size));
        let mut handshake = Handshake::new(id, observer.clone());

        let result = tokio::time::timeout(config.handshake_timeout, handshake.run(&mut framed)).await;
        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                if config.reject_with_error {
                    notify_rejection(&mut framed, rejection_notice(&e)).await;
                }
                return Err(e.into());
            }
            Err(_) => {
                debug!(session = %id, phase = %handshake.phase(), "handshake deadline passed");
                handshake.reject("handshake timeout");
                if config.reject_with_error {
                    let notice = BackendMessage::fatal(
                        sql_state::IDLE_SESSION_TIMEOUT,
                        "startup handshake timed out",
                    );
                    notify_rejection(&mut framed, notice).await;
                }
                return Err(SessionError::HandshakeTimeout(config.handshake_timeout));
            }
        };

        let startup = match outcome {
            HandshakeOutcome::CancelRequested {
                process_id,
                secret_key,
            } => {
                return Ok(SessionOutcome::CancelRequested {
                    process_id,
                    secret_key,
                });
            }
            HandshakeOutcome::Accepted(startup) => startup,
        };

        let mut relay = match relays.connect(id, &startup).await {
            Ok(relay) => relay,
            Err(e) => {
                if config.reject_with_error {
                    let notice = BackendMessage::fatal(sql_state::CONNECTION_FAILURE, e.to_string());
                    notify_rejection(&mut framed, notice).await;
                }
                return Err(e.into());
            }
        };

        framed
            .send(BackendMessage::ReadyForQuery {
                status: TransactionStatus::Idle,
            })
            .await?;
        debug!(session = %id, "sent ReadyForQuery");

        let mut frames = into_query_phase(framed, FrameCodec::new(config.max_frame_size));
        let mut count = 0u64;
        while let Some(frame) = frames.next().await {
            let frame = frame?;
            observer.frame_received(id, &frame.header);
            relay.relay(frame).await?;
            count += 1;
        }

        Ok(SessionOutcome::Closed { frames: count })
    }
}

/// Swaps the startup codec for the steady-state codec, keeping any bytes the
/// client already pipelined behind its startup frame.
fn into_query_phase<S>(framed: Framed<S, StartupCodec>, codec: FrameCodec) -> Framed<S, FrameCodec>
where
    S: AsyncRead + AsyncWrite,
{
    let parts = framed.into_parts();
    let mut next = FramedParts::new::<BackendMessage>(parts.io, codec);
    next.read_buf = parts.read_buf;
    next.write_buf = parts.write_buf;
    Framed::from_parts(next)
}

fn rejection_notice(e: &ProtocolError) -> BackendMessage {
    match e {
        ProtocolError::UnsupportedProtocol(_) => {
            BackendMessage::fatal(sql_state::FEATURE_NOT_SUPPORTED, e.to_string())
        }
        _ => BackendMessage::fatal(sql_state::PROTOCOL_VIOLATION, e.to_string()),
    }
}

/// Best-effort ErrorResponse before closing; the connection is going away
/// either way.
async fn notify_rejection<S>(framed: &mut Framed<S, StartupCodec>, notice: BackendMessage)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = framed.send(notice).await {
        info!(error = %e, "could not send rejection notice");
    }
}
