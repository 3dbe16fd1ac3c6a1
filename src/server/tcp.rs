//! Socket options for accepted client connections.

use std::time::Duration;

use socket2::SockRef;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Sets TCP_NODELAY and TCP keepalive on an accepted socket.
///
/// Failures are logged and otherwise ignored; the connection works without them.
pub fn configure_socket(stream: &TcpStream, keepalive: Option<Duration>) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    let Some(idle) = keepalive else {
        return;
    };

    let socket = SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(idle)
        .with_interval(idle / 2 + Duration::from_secs(1));

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    let keepalive = keepalive.with_retries(3);

    if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
        warn!("Failed to configure TCP keepalive: {}", e);
    } else {
        debug!("TCP keepalive configured: {:?}", idle);
    }
}
