//! Test utilities for proxy integration tests.
//!
//! Starts a real server on an ephemeral port with a relay that records every
//! frame it receives, and provides raw wire helpers for clients.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::BufMut;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use pgsniff::config::ServerConfig;
use pgsniff::protocol::{Frame, PROTOCOL_VERSION_3_0, SSL_REQUEST_CODE, StartupMessage};
use pgsniff::server::{
    Relay, RelayError, RelayFactory, Server, SessionId, SessionObserver, TracingObserver,
};

/// Frames seen by every session of a test server, in arrival order.
#[derive(Clone, Default)]
pub struct Recorded(Arc<Mutex<Vec<(SessionId, Frame)>>>);

impl Recorded {
    pub fn frames(&self) -> Vec<(SessionId, Frame)> {
        self.0.lock().unwrap().clone()
    }

    pub fn tags(&self) -> Vec<u8> {
        self.frames().iter().map(|(_, f)| f.tag()).collect()
    }
}

#[derive(Clone, Default)]
pub struct RecordingFactory {
    recorded: Recorded,
}

pub struct RecordingRelay {
    session: SessionId,
    recorded: Recorded,
}

impl RelayFactory for RecordingFactory {
    type Relay = RecordingRelay;

    async fn connect(
        &self,
        session: SessionId,
        _startup: &StartupMessage,
    ) -> Result<RecordingRelay, RelayError> {
        Ok(RecordingRelay {
            session,
            recorded: self.recorded.clone(),
        })
    }
}

impl Relay for RecordingRelay {
    async fn relay(&mut self, frame: Frame) -> Result<(), RelayError> {
        self.recorded.0.lock().unwrap().push((self.session, frame));
        Ok(())
    }
}

/// A test server wrapper that handles setup and teardown.
///
/// The server is aborted when dropped unless [`ProxyTestServer::shutdown`]
/// was awaited first.
pub struct ProxyTestServer {
    addr: SocketAddr,
    recorded: Recorded,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ProxyTestServer {
    pub async fn start() -> Self {
        Self::start_with(ServerConfig::default()).await
    }

    pub async fn start_with(config: ServerConfig) -> Self {
        Self::start_observed(config, Arc::new(TracingObserver)).await
    }

    pub async fn start_observed(config: ServerConfig, observer: Arc<dyn SessionObserver>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let factory = RecordingFactory::default();
        let recorded = factory.recorded.clone();

        let server = Server::new(listener, config, factory).with_observer(observer);
        let addr = server.local_addr().unwrap();

        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            server
                .serve_with_shutdown(async {
                    let _ = rx.await;
                })
                .await;
        });

        Self {
            addr,
            recorded,
            shutdown: Some(tx),
            handle: Some(handle),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn recorded(&self) -> &Recorded {
        &self.recorded
    }

    pub async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.unwrap()
    }

    /// Signals shutdown and returns the task, which completes once every
    /// session has finished.
    pub fn shutdown(&mut self) -> JoinHandle<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.handle.take().expect("server already shut down")
    }
}

impl Drop for ProxyTestServer {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

pub fn ssl_request() -> Vec<u8> {
    let mut buf = Vec::new();
    buf.put_u32(8);
    buf.put_u32(SSL_REQUEST_CODE);
    buf
}

pub fn startup_message(params: &[(&str, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (k, v) in params {
        body.extend_from_slice(k.as_bytes());
        body.push(0);
        body.extend_from_slice(v.as_bytes());
        body.push(0);
    }
    body.push(0);
    raw_startup(PROTOCOL_VERSION_3_0, &body)
}

pub fn raw_startup(code: u32, rest: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.put_u32((8 + rest.len()) as u32);
    buf.put_u32(code);
    buf.extend_from_slice(rest);
    buf
}

pub fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![tag];
    buf.put_u32((4 + payload.len()) as u32);
    buf.extend_from_slice(payload);
    buf
}

pub fn query(sql: &str) -> Vec<u8> {
    let mut payload = sql.as_bytes().to_vec();
    payload.push(0);
    frame(b'Q', &payload)
}

/// Reads one backend message and returns its tag and body.
pub async fn read_message(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let tag = stream.read_u8().await.unwrap();
    let len = stream.read_u32().await.unwrap();
    let mut body = vec![0; len as usize - 4];
    stream.read_exact(&mut body).await.unwrap();
    (tag, body)
}

/// Polls until `cond` holds, panicking after two seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
