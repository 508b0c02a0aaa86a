//! Connection parameters.
//!
//! Plain configuration values. Loading them from files, environment or
//! connection URLs is left to the caller.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default server port.
pub const DEFAULT_PORT: u16 = 6379;

/// Transport selected by [`ConnectionParameters::scheme`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Plain TCP (`tcp`).
    Tcp,
    /// Plain TCP (`redis`).
    Redis,
    /// Unix domain socket (`unix`).
    Unix,
    /// TLS over TCP (`tls` or `rediss`).
    Tls,
}

impl Scheme {
    /// Parse a scheme name, ignoring ASCII case.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] naming the value for anything else.
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Scheme::Tcp),
            "redis" => Ok(Scheme::Redis),
            "unix" => Ok(Scheme::Unix),
            "tls" | "rediss" => Ok(Scheme::Tls),
            _ => Err(Error::InvalidArgument(format!(
                "Invalid scheme: '{value}'."
            ))),
        }
    }

    /// Returns true for the schemes that connect over TCP.
    pub fn is_tcp(self) -> bool {
        !matches!(self, Scheme::Unix)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scheme::Tcp => "tcp",
            Scheme::Redis => "redis",
            Scheme::Unix => "unix",
            Scheme::Tls => "tls",
        })
    }
}

/// Everything needed to open and prepare one node connection.
///
/// Two parameter sets with the same [`endpoint`](Self::endpoint) share a
/// connection in a [`NodeRegistry`](crate::NodeRegistry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionParameters {
    /// `tcp`, `redis`, `unix`, `tls` or `rediss`.
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Socket path for the `unix` scheme.
    pub path: Option<String>,
    /// Database selected with `SELECT` after every connect.
    pub database: Option<i64>,
    /// ACL username, only sent together with a password.
    pub username: Option<String>,
    pub password: Option<String>,
    pub tcp_nodelay: bool,
    /// Connect timeout.
    pub timeout: Duration,
    /// Read and write timeout. `None` blocks indefinitely.
    pub read_write_timeout: Option<Duration>,
    /// Caller-chosen tag for long-lived connections.
    pub persistent_id: Option<String>,
    /// Caller-chosen name for this connection.
    pub alias: Option<String>,
    /// SNI name for TLS. Defaults to `host`.
    pub tls_server_name: Option<String>,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self {
            scheme: "tcp".to_string(),
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            path: None,
            database: None,
            username: None,
            password: None,
            tcp_nodelay: true,
            timeout: DEFAULT_CONNECT_TIMEOUT,
            read_write_timeout: None,
            persistent_id: None,
            alias: None,
            tls_server_name: None,
        }
    }
}

impl ConnectionParameters {
    /// TCP parameters for `host:port` with all other fields defaulted.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Unix socket parameters for `path`.
    pub fn unix(path: impl Into<String>) -> Self {
        Self {
            scheme: "unix".to_string(),
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Parse a `host:port` endpoint as reported by cluster redirects.
    ///
    /// The split happens at the last `:` so bracketed IPv6 hosts work.
    pub fn from_endpoint(endpoint: &str) -> Result<Self> {
        let (host, port) = endpoint
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidArgument(format!("Invalid endpoint: '{endpoint}'.")))?;
        let port = port
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("Invalid endpoint: '{endpoint}'.")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "Invalid endpoint: '{endpoint}'."
            )));
        }
        Ok(Self::tcp(host, port))
    }

    /// Copy of `self` pointing at `endpoint`, keeping credentials and options.
    pub fn with_endpoint(&self, endpoint: &str) -> Result<Self> {
        let target = Self::from_endpoint(endpoint)?;
        Ok(Self {
            host: target.host,
            port: target.port,
            path: None,
            scheme: if self.scheme().ok() == Some(Scheme::Unix) {
                "tcp".to_string()
            } else {
                self.scheme.clone()
            },
            ..self.clone()
        })
    }

    /// Set the scheme.
    pub fn scheme_name(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// Set the database index.
    pub fn database(mut self, database: i64) -> Self {
        self.database = Some(database);
        self
    }

    /// Set the password, and optionally an ACL username.
    pub fn credentials(mut self, username: Option<&str>, password: &str) -> Self {
        self.username = username.map(str::to_string);
        self.password = Some(password.to_string());
        self
    }

    /// Set `TCP_NODELAY`.
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    /// Set the connect timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the read and write timeout.
    pub fn read_write_timeout(mut self, timeout: Duration) -> Self {
        self.read_write_timeout = Some(timeout);
        self
    }

    /// Set the persistent id.
    pub fn persistent_id(mut self, id: impl Into<String>) -> Self {
        self.persistent_id = Some(id.into());
        self
    }

    /// Set the alias.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Set the TLS server name.
    pub fn tls_server_name(mut self, name: impl Into<String>) -> Self {
        self.tls_server_name = Some(name.into());
        self
    }

    /// The parsed scheme.
    pub fn scheme(&self) -> Result<Scheme> {
        Scheme::parse(&self.scheme)
    }

    /// Check the parameters without touching the network.
    pub fn validate(&self) -> Result<Scheme> {
        let scheme = self.scheme()?;
        match scheme {
            Scheme::Unix if self.path.as_deref().is_none_or(str::is_empty) => Err(
                Error::InvalidArgument("Missing socket path for scheme 'unix'.".to_string()),
            ),
            Scheme::Tcp | Scheme::Redis | Scheme::Tls if self.host.is_empty() => Err(
                Error::InvalidArgument(format!("Missing host for scheme '{}'.", self.scheme)),
            ),
            _ => Ok(scheme),
        }
    }

    /// Identity of the server these parameters point at: `host:port`, or the
    /// socket path for `unix`.
    pub fn endpoint(&self) -> String {
        match (self.scheme(), &self.path) {
            (Ok(Scheme::Unix), Some(path)) => path.clone(),
            _ if self.host.contains(':') => format!("[{}]:{}", self.host, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }
}
