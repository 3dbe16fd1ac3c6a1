use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::protocol::{
    BackendMessage, ByteCursor, CANCEL_REQUEST_CODE, PROTOCOL_VERSION_3_0, ProtocolError,
    ProtocolVersion, SSL_REQUEST_CODE, StartupCodec, StartupMessage, StartupParameters,
    StartupRequest,
};
use crate::server::observer::SessionObserver;
use crate::server::session::SessionId;

/// Phase of the startup negotiation.
///
/// ```text
/// AwaitingFirstFrame -> SslProbe -> AwaitingFirstFrame -> ...
/// AwaitingFirstFrame -> VersionNegotiated -> ParsingParameters -> Accepted
/// AwaitingFirstFrame -> CancelRequested
/// any non-terminal   -> Rejected
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakePhase {
    AwaitingFirstFrame,
    SslProbe,
    VersionNegotiated,
    ParsingParameters,
    Accepted,
    CancelRequested,
    Rejected(String),
}

impl HandshakePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HandshakePhase::Accepted | HandshakePhase::CancelRequested | HandshakePhase::Rejected(_)
        )
    }
}

impl fmt::Display for HandshakePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakePhase::AwaitingFirstFrame => f.write_str("awaiting-first-frame"),
            HandshakePhase::SslProbe => f.write_str("ssl-probe"),
            HandshakePhase::VersionNegotiated => f.write_str("version-negotiated"),
            HandshakePhase::ParsingParameters => f.write_str("parsing-parameters"),
            HandshakePhase::Accepted => f.write_str("accepted"),
            HandshakePhase::CancelRequested => f.write_str("cancel-requested"),
            HandshakePhase::Rejected(reason) => write!(f, "rejected ({reason})"),
        }
    }
}

/// How a successful handshake ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Startup accepted; the connection moves on to the query phase.
    Accepted(StartupMessage),
    /// The connection only carried a CancelRequest.
    CancelRequested { process_id: i32, secret_key: i32 },
}

/// The startup negotiation state machine.
///
/// Consumes startup frame bodies (length prefix already stripped) one at a time
/// and performs no I/O of its own.
pub struct Negotiation {
    session: SessionId,
    phase: HandshakePhase,
    observer: Arc<dyn SessionObserver>,
}

impl Negotiation {
    pub fn new(session: SessionId, observer: Arc<dyn SessionObserver>) -> Self {
        Self {
            session,
            phase: HandshakePhase::AwaitingFirstFrame,
            observer,
        }
    }

    pub fn phase(&self) -> &HandshakePhase {
        &self.phase
    }

    /// Classifies one startup frame body and advances the phase.
    ///
    /// Only valid while awaiting a frame. Any error moves the machine to
    /// [`HandshakePhase::Rejected`].
    pub fn advance(&mut self, body: Bytes) -> Result<StartupRequest, ProtocolError> {
        if self.phase != HandshakePhase::AwaitingFirstFrame {
            return Err(ProtocolError::UnexpectedStartupFrame);
        }

        let result = self.classify(ByteCursor::new(body));
        if let Err(e) = &result {
            self.reject(e.to_string());
        }
        result
    }

    /// Returns to [`HandshakePhase::AwaitingFirstFrame`] once an SSL probe has
    /// been answered.
    pub fn await_next_frame(&mut self) {
        if self.phase == HandshakePhase::SslProbe {
            self.transition(HandshakePhase::AwaitingFirstFrame);
        }
    }

    /// Moves the machine to [`HandshakePhase::Rejected`] unless it already
    /// reached a terminal phase.
    pub fn reject(&mut self, reason: impl Into<String>) {
        if !self.phase.is_terminal() {
            self.transition(HandshakePhase::Rejected(reason.into()));
        }
    }

    fn classify(&mut self, mut src: ByteCursor) -> Result<StartupRequest, ProtocolError> {
        let code = src.read_u32()?;
        match code {
            PROTOCOL_VERSION_3_0 => {
                self.transition(HandshakePhase::VersionNegotiated);
                self.transition(HandshakePhase::ParsingParameters);
                let parameters = StartupParameters::decode(&mut src)?;
                self.transition(HandshakePhase::Accepted);
                Ok(StartupRequest::Startup(StartupMessage {
                    version: ProtocolVersion::from_code(code),
                    parameters,
                }))
            }
            SSL_REQUEST_CODE => {
                self.transition(HandshakePhase::SslProbe);
                Ok(StartupRequest::SslProbe)
            }
            CANCEL_REQUEST_CODE => {
                let process_id = src.read_i32()?;
                let secret_key = src.read_i32()?;
                if !src.is_empty() {
                    // Length field plus code plus the two keys.
                    return Err(ProtocolError::InvalidLength((16 + src.remaining()) as u32));
                }
                self.transition(HandshakePhase::CancelRequested);
                Ok(StartupRequest::Cancel {
                    process_id,
                    secret_key,
                })
            }
            other => Err(ProtocolError::UnsupportedProtocol(other)),
        }
    }

    fn transition(&mut self, to: HandshakePhase) {
        self.observer.phase_changed(self.session, &self.phase, &to);
        self.phase = to;
    }
}

/// Drives a [`Negotiation`] over a framed startup stream.
///
/// SSL probes are acknowledged with a single `'S'` byte; the connection then
/// carries on unencrypted and the client's next startup frame is read.
pub struct Handshake {
    negotiation: Negotiation,
}

impl Handshake {
    pub fn new(session: SessionId, observer: Arc<dyn SessionObserver>) -> Self {
        Self {
            negotiation: Negotiation::new(session, observer),
        }
    }

    pub fn phase(&self) -> &HandshakePhase {
        self.negotiation.phase()
    }

    pub fn reject(&mut self, reason: impl Into<String>) {
        self.negotiation.reject(reason);
    }

    pub async fn run<S>(
        &mut self,
        framed: &mut Framed<S, StartupCodec>,
    ) -> Result<HandshakeOutcome, ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let body = match framed.next().await {
                Some(Ok(body)) => body,
                Some(Err(e)) => return Err(self.fail(e)),
                None => return Err(self.fail(ProtocolError::ConnectionClosed)),
            };

            match self.negotiation.advance(body)? {
                StartupRequest::SslProbe => {
                    // No TLS: claim support and expect the client to go on in plaintext.
                    if let Err(e) = framed
                        .send(BackendMessage::SslResponse { accepted: true })
                        .await
                    {
                        return Err(self.fail(e));
                    }
                    self.negotiation.await_next_frame();
                }
                StartupRequest::Cancel {
                    process_id,
                    secret_key,
                } => {
                    return Ok(HandshakeOutcome::CancelRequested {
                        process_id,
                        secret_key,
                    });
                }
                StartupRequest::Startup(message) => {
                    return Ok(HandshakeOutcome::Accepted(message));
                }
            }
        }
    }

    fn fail(&mut self, e: ProtocolError) -> ProtocolError {
        self.negotiation.reject(e.to_string());
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use bytes::BufMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::server::observer::NoopObserver;

    /// Records every phase the machine enters.
    #[derive(Default)]
    struct Recorder {
        phases: Mutex<Vec<HandshakePhase>>,
    }

    impl SessionObserver for Recorder {
        fn phase_changed(&self, _session: SessionId, _from: &HandshakePhase, to: &HandshakePhase) {
            self.phases.lock().unwrap().push(to.clone());
        }
    }

    impl Recorder {
        fn phases(&self) -> Vec<HandshakePhase> {
            self.phases.lock().unwrap().clone()
        }
    }

    fn startup_body(code: u32, rest: &[u8]) -> Bytes {
        let mut buf = Vec::new();
        buf.put_u32(code);
        buf.extend_from_slice(rest);
        Bytes::from(buf)
    }

    fn startup_frame(code: u32, rest: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u32((8 + rest.len()) as u32);
        buf.put_u32(code);
        buf.extend_from_slice(rest);
        buf
    }

    fn negotiation() -> (Negotiation, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (Negotiation::new(SessionId(1), recorder.clone()), recorder)
    }

    #[test]
    fn test_accepts_version_3_startup() {
        let (mut machine, recorder) = negotiation();

        let request = machine
            .advance(startup_body(PROTOCOL_VERSION_3_0, b"user\0alice\0\0"))
            .unwrap();

        let StartupRequest::Startup(message) = request else {
            panic!("expected Startup, got {request:?}");
        };
        assert_eq!(message.version, ProtocolVersion::V3_0);
        assert_eq!(
            message.parameters.iter().collect::<Vec<_>>(),
            vec![(&b"user"[..], &b"alice"[..])]
        );
        assert_eq!(
            recorder.phases(),
            vec![
                HandshakePhase::VersionNegotiated,
                HandshakePhase::ParsingParameters,
                HandshakePhase::Accepted,
            ]
        );
    }

    #[test]
    fn test_ssl_probe_then_startup() {
        let (mut machine, recorder) = negotiation();

        let request = machine.advance(startup_body(SSL_REQUEST_CODE, b"")).unwrap();
        assert_eq!(request, StartupRequest::SslProbe);
        assert_eq!(machine.phase(), &HandshakePhase::SslProbe);

        machine.await_next_frame();
        assert_eq!(machine.phase(), &HandshakePhase::AwaitingFirstFrame);

        machine
            .advance(startup_body(PROTOCOL_VERSION_3_0, b"\0"))
            .unwrap();
        assert_eq!(machine.phase(), &HandshakePhase::Accepted);
        assert_eq!(
            &recorder.phases()[..2],
            &[HandshakePhase::SslProbe, HandshakePhase::AwaitingFirstFrame]
        );
    }

    #[test]
    fn test_repeated_ssl_probes() {
        let (mut machine, _) = negotiation();
        for _ in 0..3 {
            let request = machine.advance(startup_body(SSL_REQUEST_CODE, b"")).unwrap();
            assert_eq!(request, StartupRequest::SslProbe);
            machine.await_next_frame();
        }
        assert_eq!(machine.phase(), &HandshakePhase::AwaitingFirstFrame);
    }

    #[test]
    fn test_unsupported_code_rejected_before_parameters() {
        let (mut machine, recorder) = negotiation();

        let result = machine.advance(startup_body(1, b"user\0alice\0\0"));

        assert!(matches!(result, Err(ProtocolError::UnsupportedProtocol(1))));
        let phases = recorder.phases();
        assert_eq!(phases.len(), 1);
        assert!(matches!(phases[0], HandshakePhase::Rejected(_)));
        assert!(!phases.contains(&HandshakePhase::ParsingParameters));
    }

    #[test]
    fn test_protocol_3_1_rejected() {
        let (mut machine, _) = negotiation();
        let result = machine.advance(startup_body(0x0003_0001, b"\0"));
        assert!(matches!(
            result,
            Err(ProtocolError::UnsupportedProtocol(0x0003_0001))
        ));
    }

    #[test]
    fn test_cancel_request() {
        let (mut machine, _) = negotiation();
        let mut rest = Vec::new();
        rest.put_i32(4242);
        rest.put_i32(-17);

        let request = machine.advance(startup_body(CANCEL_REQUEST_CODE, &rest)).unwrap();

        assert_eq!(
            request,
            StartupRequest::Cancel {
                process_id: 4242,
                secret_key: -17
            }
        );
        assert_eq!(machine.phase(), &HandshakePhase::CancelRequested);
    }

    #[test]
    fn test_cancel_request_truncated() {
        let (mut machine, _) = negotiation();
        let result = machine.advance(startup_body(CANCEL_REQUEST_CODE, &[0, 0, 0, 1]));
        assert!(matches!(result, Err(ProtocolError::TruncatedInput)));
        assert!(matches!(machine.phase(), HandshakePhase::Rejected(_)));
    }

    #[test]
    fn test_cancel_request_with_extra_bytes() {
        let (mut machine, _) = negotiation();
        let mut rest = Vec::new();
        rest.put_i32(4242);
        rest.put_i32(-17);
        rest.put_u8(0);

        let result = machine.advance(startup_body(CANCEL_REQUEST_CODE, &rest));

        assert!(matches!(result, Err(ProtocolError::InvalidLength(17))));
        assert!(matches!(machine.phase(), HandshakePhase::Rejected(_)));
    }

    #[test]
    fn test_malformed_parameters_rejected() {
        let (mut machine, recorder) = negotiation();
        let result = machine.advance(startup_body(PROTOCOL_VERSION_3_0, b"user\0alice\0"));
        assert!(matches!(result, Err(ProtocolError::MalformedParameterList(_))));
        assert!(matches!(
            recorder.phases().last(),
            Some(HandshakePhase::Rejected(_))
        ));
    }

    #[test]
    fn test_frame_after_accept_is_error() {
        let (mut machine, _) = negotiation();
        machine
            .advance(startup_body(PROTOCOL_VERSION_3_0, b"\0"))
            .unwrap();
        assert!(matches!(
            machine.advance(startup_body(PROTOCOL_VERSION_3_0, b"\0")),
            Err(ProtocolError::UnexpectedStartupFrame)
        ));
        // A terminal phase is never overwritten.
        assert_eq!(machine.phase(), &HandshakePhase::Accepted);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(HandshakePhase::SslProbe.to_string(), "ssl-probe");
        assert_eq!(
            HandshakePhase::Rejected("bad".into()).to_string(),
            "rejected (bad)"
        );
    }

    #[tokio::test]
    async fn test_run_answers_ssl_probe_with_single_byte() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut framed = Framed::new(server, StartupCodec::default());
        let mut handshake = Handshake::new(SessionId(1), Arc::new(NoopObserver));

        let client_task = tokio::spawn(async move {
            client
                .write_all(&startup_frame(SSL_REQUEST_CODE, b""))
                .await
                .unwrap();
            let mut answer = [0u8; 1];
            client.read_exact(&mut answer).await.unwrap();
            client
                .write_all(&startup_frame(PROTOCOL_VERSION_3_0, b"user\0alice\0\0"))
                .await
                .unwrap();
            client.shutdown().await.unwrap();

            let mut rest = Vec::new();
            client.read_to_end(&mut rest).await.unwrap();
            (answer, rest)
        });

        let outcome = handshake.run(&mut framed).await.unwrap();
        drop(framed);

        let (answer, rest) = client_task.await.unwrap();
        assert_eq!(&answer, b"S");
        assert!(rest.is_empty(), "nothing but 'S' may be written");
        let HandshakeOutcome::Accepted(message) = outcome else {
            panic!("expected Accepted, got {outcome:?}");
        };
        assert_eq!(message.parameters.user().as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_run_concrete_startup_bytes() {
        let bytes: [u8; 20] = [
            0x00, 0x00, 0x00, 0x14, 0x00, 0x03, 0x00, 0x00, 0x75, 0x73, 0x65, 0x72, 0x00, 0x61,
            0x6C, 0x69, 0x63, 0x65, 0x00, 0x00,
        ];
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&bytes).await.unwrap();

        let mut framed = Framed::new(server, StartupCodec::default());
        let mut handshake = Handshake::new(SessionId(1), Arc::new(NoopObserver));
        let outcome = handshake.run(&mut framed).await.unwrap();

        let expected: StartupParameters = [("user", "alice")].into_iter().collect();
        assert_eq!(
            outcome,
            HandshakeOutcome::Accepted(StartupMessage {
                version: ProtocolVersion::V3_0,
                parameters: expected,
            })
        );
        assert_eq!(handshake.phase(), &HandshakePhase::Accepted);
    }

    #[tokio::test]
    async fn test_run_truncated_frame() {
        let (mut client, server) = tokio::io::duplex(64);
        // Declares 23 bytes, delivers 20, then closes.
        let mut frame = startup_frame(PROTOCOL_VERSION_3_0, b"user\0alice\0\0");
        frame[3] = 23;
        client.write_all(&frame).await.unwrap();
        drop(client);

        let mut framed = Framed::new(server, StartupCodec::default());
        let mut handshake = Handshake::new(SessionId(1), Arc::new(NoopObserver));
        let result = handshake.run(&mut framed).await;

        assert!(matches!(result, Err(ProtocolError::TruncatedInput)));
        assert!(matches!(handshake.phase(), HandshakePhase::Rejected(_)));
    }

    #[tokio::test]
    async fn test_run_closed_before_any_byte() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);

        let mut framed = Framed::new(server, StartupCodec::default());
        let mut handshake = Handshake::new(SessionId(1), Arc::new(NoopObserver));

        assert!(matches!(
            handshake.run(&mut framed).await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }
}
