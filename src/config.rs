//! Proxy configuration.
//!
//! [`ServerConfig`] holds the per-connection limits the server hands to every
//! session. [`UpstreamTarget`] is the parsed upstream connection string.

use std::fmt;
use std::time::Duration;

use url::Url;

use crate::protocol::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_STARTUP_SIZE};

pub const DEFAULT_UPSTREAM_HOST: &str = "localhost";
pub const DEFAULT_UPSTREAM_PORT: u16 = 5432;

/// Limits and policies applied to every accepted connection.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bound on the whole startup handshake, SSL probes included.
    pub handshake_timeout: Duration,
    /// Maximum number of connections served at once.
    pub max_connections: usize,
    /// Largest steady-state payload accepted from a client.
    pub max_frame_size: usize,
    /// Largest startup frame accepted from a client.
    pub max_startup_size: usize,
    /// TCP keepalive idle time; `None` leaves the OS default.
    pub tcp_keepalive: Option<Duration>,
    /// Send a FATAL ErrorResponse before closing a rejected connection.
    pub reject_with_error: bool,
    /// First delay after a failed accept.
    pub accept_backoff_base: Duration,
    /// Ceiling for the accept retry delay.
    pub accept_backoff_max: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            max_connections: 1024,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_startup_size: DEFAULT_MAX_STARTUP_SIZE,
            tcp_keepalive: Some(Duration::from_secs(60)),
            reject_with_error: false,
            accept_backoff_base: Duration::from_millis(5),
            accept_backoff_max: Duration::from_secs(1),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("empty upstream connection string")]
    Empty,
    #[error("invalid upstream URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("invalid upstream port: {0}")]
    InvalidPort(String),
    #[error("malformed connection string entry: {0}")]
    MalformedEntry(String),
}

/// Where the upstream PostgreSQL server lives.
///
/// Parsed from either URL form (`postgres://user:secret@db:5432/shop`) or
/// key=value form (`host=db port=5432 user=app dbname=shop`). The password is
/// never retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub database: Option<String>,
}

impl UpstreamTarget {
    pub fn parse(conn: &str) -> Result<Self, ConfigError> {
        let conn = conn.trim();
        if conn.is_empty() {
            return Err(ConfigError::Empty);
        }

        if conn.starts_with("postgres://") || conn.starts_with("postgresql://") {
            Self::parse_url(conn)
        } else {
            Self::parse_key_value(conn)
        }
    }

    fn parse_url(conn: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(conn)?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .unwrap_or(DEFAULT_UPSTREAM_HOST)
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let user = Some(url.username())
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        let database = Some(url.path().trim_start_matches('/'))
            .filter(|d| !d.is_empty())
            .map(str::to_string);

        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_UPSTREAM_PORT),
            user,
            database,
        })
    }

    fn parse_key_value(conn: &str) -> Result<Self, ConfigError> {
        let mut target = Self {
            host: DEFAULT_UPSTREAM_HOST.to_string(),
            port: DEFAULT_UPSTREAM_PORT,
            user: None,
            database: None,
        };

        for entry in conn.split_whitespace() {
            let Some((key, value)) = entry.split_once('=') else {
                return Err(ConfigError::MalformedEntry(entry.to_string()));
            };
            match key {
                "host" => target.host = value.to_string(),
                "port" => {
                    target.port = value
                        .parse()
                        .map_err(|_| ConfigError::InvalidPort(value.to_string()))?;
                }
                "user" => target.user = Some(value.to_string()),
                "dbname" => target.database = Some(value.to_string()),
                // password, sslmode and friends are irrelevant to reachability
                _ => {}
            }
        }

        Ok(target)
    }

    /// `host:port` suitable for `TcpStream::connect`.
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())?;
        if let Some(database) = &self.database {
            write!(f, "/{database}")?;
        }
        Ok(())
    }
}
