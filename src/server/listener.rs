use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::ServerConfig;
use crate::protocol::ProtocolError;
use crate::server::observer::{SessionObserver, TracingObserver};
use crate::server::relay::RelayFactory;
use crate::server::session::{Session, SessionError, SessionId, SessionOutcome};
use crate::server::tcp::configure_socket;

/// TCP front end of the proxy.
///
/// Accepts connections and runs one [`Session`] task per connection, with at
/// most `max_connections` running at once. Sessions share nothing but the
/// relay factory and observer.
pub struct Server<F: RelayFactory> {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    relays: Arc<F>,
    observer: Arc<dyn SessionObserver>,
}

impl<F: RelayFactory> Server<F> {
    /// Creates a new server with a given listener, configuration and relay factory.
    pub fn new(listener: TcpListener, config: ServerConfig, relays: F) -> Self {
        Self {
            listener,
            config: Arc::new(config),
            relays: Arc::new(relays),
            observer: Arc::new(TracingObserver),
        }
    }

    /// Replaces the default [`TracingObserver`].
    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` resolves, then closes the listener
    /// and waits for every running session to finish.
    ///
    /// Sessions are not cancelled on shutdown; they end when their client
    /// disconnects or their I/O fails.
    pub async fn serve_with_shutdown(self, shutdown: impl Future<Output = ()>) {
        let Server {
            listener,
            config,
            relays,
            observer,
        } = self;

        let limit = Arc::new(Semaphore::new(config.max_connections));
        let mut backoff = AcceptBackoff::new(config.accept_backoff_base, config.accept_backoff_max);
        let mut sessions = JoinSet::new();
        let mut next_id = 1u64;

        if let Ok(addr) = listener.local_addr() {
            info!(%addr, max_connections = config.max_connections, "listening");
        }

        tokio::pin!(shutdown);

        loop {
            while let Some(res) = sessions.try_join_next() {
                log_join_error(res);
            }

            let permit = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                permit = limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (socket, peer) = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                res = listener.accept() => match res {
                    Ok(conn) => {
                        backoff.reset();
                        conn
                    }
                    Err(e) => {
                        drop(permit);
                        let delay = backoff.next_delay();
                        warn!(error = %e, ?delay, "accept error; retrying");
                        tokio::select! {
                            _ = &mut shutdown => break,
                            _ = tokio::time::sleep(delay) => continue,
                        }
                    }
                },
            };

            let id = SessionId(next_id);
            next_id += 1;

            configure_socket(&socket, config.tcp_keepalive);
            let session = Session::new(id, socket, config.clone(), observer.clone());
            let relays = relays.clone();
            let span = info_span!("session", id = %id, %peer);

            sessions.spawn(
                async move {
                    let _permit = permit;
                    debug!("accepted connection");
                    log_session_end(session.run(&*relays).await);
                }
                .instrument(span),
            );
        }

        // The listener is owned here and dropped exactly once.
        drop(listener);
        info!(active = sessions.len(), "listener closed; draining sessions");

        while let Some(res) = sessions.join_next().await {
            log_join_error(res);
        }
        info!("all sessions finished");
    }
}

fn log_session_end(result: Result<SessionOutcome, SessionError>) {
    match result {
        Ok(SessionOutcome::Closed { frames }) => info!(frames, "connection closed"),
        Ok(SessionOutcome::CancelRequested { process_id, .. }) => {
            info!(process_id, "cancel request received; closing")
        }
        Err(SessionError::Protocol(ProtocolError::ConnectionClosed)) => {
            debug!("client closed before startup")
        }
        Err(e) => warn!(error = %e, "session terminated"),
    }
}

fn log_join_error(res: Result<(), JoinError>) {
    if let Err(e) = res
        && e.is_panic()
    {
        error!(error = %e, "session task panicked");
    }
}

/// Exponential delay between failed accepts.
///
/// Starts at `base`, doubles on every consecutive failure up to `max`, and
/// starts over after a successful accept.
#[derive(Debug, Clone)]
pub struct AcceptBackoff {
    base: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl AcceptBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: None,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => self.base,
            Some(d) => d.saturating_mul(2),
        }
        .min(self.max);
        self.current = Some(delay);
        delay
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_ceiling() {
        let mut backoff = AcceptBackoff::new(Duration::from_millis(5), Duration::from_secs(1));
        let delays: Vec<_> = (0..10).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(
            delays,
            vec![5, 10, 20, 40, 80, 160, 320, 640, 1000, 1000]
        );
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = AcceptBackoff::new(Duration::from_millis(5), Duration::from_secs(1));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
    }

    #[test]
    fn test_backoff_base_above_ceiling() {
        let mut backoff = AcceptBackoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}
