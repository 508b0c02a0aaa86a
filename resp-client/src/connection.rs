//! Node connections.
//!
//! A [`NodeConnection`] owns one socket to one server. It is created from
//! [`ConnectionParameters`] without any I/O and opens its socket on the first
//! write (or an explicit [`Connection::connect`]). Every open is followed by
//! the connect commands (AUTH, SELECT, then user-registered ones) so that
//! authentication and database selection survive reconnects.
//!
//! Connections are not internally synchronized. Every I/O method takes
//! `&mut self`; one caller drives a connection at a time.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use resp_proto::{Command, ParseOptions, Value};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::params::{ConnectionParameters, Scheme};

/// Bytes requested from the socket per read call.
const READ_CHUNK: usize = 16 * 1024;

// ── Capability interface ────────────────────────────────────────────────

/// The execution contract shared by single-node and cluster connections.
///
/// Pipelines and other coordinators depend only on this trait.
pub trait Connection {
    /// Open the connection. A no-op when already connected.
    fn connect(&mut self) -> Result<()>;

    /// Close the connection and drop any buffered reply bytes.
    fn disconnect(&mut self);

    /// Returns true while the socket is open. Performs no I/O.
    fn is_connected(&self) -> bool;

    /// Encode and send a command without waiting for its reply.
    fn write_request(&mut self, command: &Command) -> Result<()>;

    /// Send several commands back to back without waiting for replies.
    fn write_requests(&mut self, commands: &[Command]) -> Result<()> {
        for command in commands {
            self.write_request(command)?;
        }
        Ok(())
    }

    /// Block until one complete reply has been read.
    ///
    /// Server error replies are returned as [`Value::Error`], not as `Err`.
    fn read(&mut self) -> Result<Value>;

    /// Write a command and read its reply as one unit. No retries.
    fn execute_command(&mut self, command: &Command) -> Result<Value> {
        self.write_request(command)?;
        self.read()
    }

    /// The parameters this connection was built from.
    fn parameters(&self) -> &ConnectionParameters;
}

// ── State ───────────────────────────────────────────────────────────────

/// Lifecycle of a [`NodeConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket. The next write opens one if auto-reconnect is enabled.
    Disconnected,
    /// The socket is being opened or the connect commands are running.
    Connecting,
    /// The socket is open and prepared.
    Connected,
}

impl ConnectionState {
    fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Transport ───────────────────────────────────────────────────────────

enum Transport {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Transport::Unix(s) => s.read(buf),
            Transport::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Transport::Unix(s) => s.write(buf),
            Transport::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Transport::Unix(s) => s.flush(),
            Transport::Tls(s) => s.flush(),
        }
    }
}

impl Transport {
    fn close(self) {
        match self {
            Transport::Tcp(s) => {
                let _ = s.shutdown(std::net::Shutdown::Both);
            }
            #[cfg(unix)]
            Transport::Unix(s) => {
                let _ = s.shutdown(std::net::Shutdown::Both);
            }
            Transport::Tls(mut s) => {
                s.conn.send_close_notify();
                let _ = s.flush();
                let _ = s.sock.shutdown(std::net::Shutdown::Both);
            }
        }
    }
}

/// Root store built from the bundled webpki roots.
pub fn default_tls_config() -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

// ── NodeConnection ──────────────────────────────────────────────────────

/// One connection to one server endpoint.
pub struct NodeConnection {
    parameters: Arc<ConnectionParameters>,
    scheme: Scheme,
    endpoint: String,
    connect_commands: Vec<Command>,
    state: ConnectionState,
    transport: Option<Transport>,
    read_buf: BytesMut,
    write_buf: Vec<u8>,
    auto_reconnect: bool,
    tls_config: Option<Arc<rustls::ClientConfig>>,
    parse_options: ParseOptions,
}

impl NodeConnection {
    /// Create a disconnected connection. Performs no I/O.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an unsupported scheme or
    /// incomplete parameters.
    pub fn new(parameters: impl Into<Arc<ConnectionParameters>>) -> Result<Self> {
        let parameters = parameters.into();
        let scheme = parameters.validate()?;
        let endpoint = parameters.endpoint();
        Ok(Self {
            parameters,
            scheme,
            endpoint,
            connect_commands: Vec::new(),
            state: ConnectionState::Disconnected,
            transport: None,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: Vec::new(),
            auto_reconnect: true,
            tls_config: None,
            parse_options: ParseOptions::default(),
        })
    }

    /// Create a disconnected connection from a saved configuration.
    pub fn from_config(config: ConnectionConfig) -> Result<Self> {
        let mut conn = Self::new(config.parameters)?;
        conn.connect_commands = config.connect_commands;
        Ok(conn)
    }

    /// The configuration needed to recreate this connection.
    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig {
            parameters: (*self.parameters).clone(),
            connect_commands: self.connect_commands.clone(),
        }
    }

    /// The shared parameter value passed at construction.
    pub fn shared_parameters(&self) -> &Arc<ConnectionParameters> {
        &self.parameters
    }

    /// `host:port` or the socket path.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Register a command to run after every connect, after AUTH and SELECT.
    ///
    /// Takes effect on the next connect.
    pub fn add_connect_command(&mut self, command: Command) {
        self.connect_commands.push(command);
    }

    /// The user-registered connect commands, in registration order.
    pub fn connect_commands(&self) -> &[Command] {
        &self.connect_commands
    }

    /// Whether a write on a disconnected connection opens a new socket.
    pub fn set_auto_reconnect(&mut self, enabled: bool) {
        self.auto_reconnect = enabled;
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    /// Use a custom TLS client configuration for `tls` connections.
    pub fn set_tls_config(&mut self, config: Arc<rustls::ClientConfig>) {
        self.tls_config = Some(config);
    }

    /// Replace the reply parsing limits.
    pub fn set_parse_options(&mut self, options: ParseOptions) {
        self.parse_options = options;
    }

    /// Execute a command and turn an error reply into [`Error::Redis`].
    pub fn execute_checked(&mut self, command: &Command) -> Result<Value> {
        match self.execute_command(command)? {
            Value::Error(msg) => Err(Error::Redis(String::from_utf8_lossy(&msg).into_owned())),
            value => Ok(value),
        }
    }

    /// Commands run after each connect: AUTH, SELECT, then the user's.
    fn handshake_commands(&self) -> Vec<Command> {
        let mut commands = Vec::with_capacity(2 + self.connect_commands.len());
        if let Some(password) = &self.parameters.password {
            commands.push(Command::auth(self.parameters.username.as_deref(), password));
        }
        if let Some(db) = self.parameters.database {
            commands.push(Command::select(db));
        }
        commands.extend(self.connect_commands.iter().cloned());
        commands
    }

    fn io_error(&self, source: io::Error) -> Error {
        Error::Connection {
            endpoint: self.endpoint.clone(),
            source,
        }
    }

    fn not_connected(&self) -> Error {
        self.io_error(io::Error::new(
            io::ErrorKind::NotConnected,
            "connection is not open",
        ))
    }

    fn open(&self) -> Result<Transport> {
        let params = &*self.parameters;
        match self.scheme {
            Scheme::Tcp | Scheme::Redis => Ok(Transport::Tcp(self.open_tcp()?)),
            Scheme::Tls => {
                let tcp = self.open_tcp()?;
                let name = params.tls_server_name.as_deref().unwrap_or(&params.host);
                let server_name = rustls::pki_types::ServerName::try_from(name.to_owned())
                    .map_err(|e| {
                        self.io_error(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            format!("invalid server name: {e}"),
                        ))
                    })?;
                let config = self.tls_config.clone().unwrap_or_else(default_tls_config);
                let conn = rustls::ClientConnection::new(config, server_name)
                    .map_err(|e| self.io_error(io::Error::other(e)))?;
                Ok(Transport::Tls(Box::new(rustls::StreamOwned::new(conn, tcp))))
            }
            #[cfg(unix)]
            Scheme::Unix => {
                let path = params.path.as_deref().unwrap_or_default();
                let stream = UnixStream::connect(path).map_err(|e| self.io_error(e))?;
                let timeout = rw_timeout(params.read_write_timeout);
                if let Err(e) = stream.set_read_timeout(timeout) {
                    warn!(endpoint = %self.endpoint, error = %e, "failed to set read timeout");
                }
                if let Err(e) = stream.set_write_timeout(timeout) {
                    warn!(endpoint = %self.endpoint, error = %e, "failed to set write timeout");
                }
                Ok(Transport::Unix(stream))
            }
            #[cfg(not(unix))]
            Scheme::Unix => Err(self.io_error(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not supported on this platform",
            ))),
        }
    }

    fn open_tcp(&self) -> Result<TcpStream> {
        let params = &*self.parameters;
        let addrs = (params.host.as_str(), params.port)
            .to_socket_addrs()
            .map_err(|e| self.io_error(e))?;

        let mut last_err = None;
        let mut stream = None;
        for addr in addrs {
            let attempt = if params.timeout.is_zero() {
                TcpStream::connect(addr)
            } else {
                TcpStream::connect_timeout(&addr, params.timeout)
            };
            match attempt {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let stream = stream.ok_or_else(|| {
            self.io_error(last_err.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
            }))
        })?;

        if let Err(e) = stream.set_nodelay(params.tcp_nodelay) {
            warn!(endpoint = %self.endpoint, error = %e, "failed to set TCP_NODELAY");
        }
        let timeout = rw_timeout(params.read_write_timeout);
        if let Err(e) = stream.set_read_timeout(timeout) {
            warn!(endpoint = %self.endpoint, error = %e, "failed to set read timeout");
        }
        if let Err(e) = stream.set_write_timeout(timeout) {
            warn!(endpoint = %self.endpoint, error = %e, "failed to set write timeout");
        }
        Ok(stream)
    }

    fn run_handshake(&mut self) -> Result<()> {
        for command in self.handshake_commands() {
            self.send(&command)?;
            if let Value::Error(msg) = self.read_reply()? {
                return Err(Error::ConnectCommand {
                    endpoint: self.endpoint.clone(),
                    command: command.name(),
                    message: String::from_utf8_lossy(&msg).into_owned(),
                });
            }
        }
        Ok(())
    }

    fn ensure_connected(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Connected => Ok(()),
            _ if self.auto_reconnect => self.connect(),
            _ => Err(self.not_connected()),
        }
    }

    /// Write one encoded command on the open socket.
    fn send(&mut self, command: &Command) -> Result<()> {
        self.write_buf.clear();
        command.encode_to(&mut self.write_buf);
        self.flush_write_buf()
    }

    fn flush_write_buf(&mut self) -> Result<()> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(self.not_connected());
        };
        let result = transport
            .write_all(&self.write_buf)
            .and_then(|()| transport.flush());
        if let Err(e) = result {
            self.disconnect();
            return Err(self.io_error(e));
        }
        Ok(())
    }

    /// Read one reply from the socket, buffering any bytes past it.
    fn read_reply(&mut self) -> Result<Value> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match Value::parse_with_options(&self.read_buf, &self.parse_options) {
                Ok((value, consumed)) => {
                    self.read_buf.advance(consumed);
                    return Ok(value);
                }
                Err(e) if e.is_incomplete() => {}
                Err(e) => {
                    warn!(
                        endpoint = %self.endpoint,
                        error = %e,
                        "protocol desynchronized, dropping connection"
                    );
                    self.disconnect();
                    return Err(Error::Protocol {
                        endpoint: self.endpoint.clone(),
                        source: e,
                    });
                }
            }

            let Some(transport) = self.transport.as_mut() else {
                return Err(self.not_connected());
            };
            match transport.read(&mut chunk) {
                Ok(0) => {
                    debug!(endpoint = %self.endpoint, "connection closed by peer");
                    self.disconnect();
                    return Err(Error::ConnectionClosed {
                        endpoint: self.endpoint.clone(),
                    });
                }
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.disconnect();
                    return Err(self.io_error(e));
                }
            }
        }
    }
}

/// Zero durations mean "no timeout" for std sockets, which reject `Some(0)`.
fn rw_timeout(timeout: Option<Duration>) -> Option<Duration> {
    timeout.filter(|t| !t.is_zero())
}

impl Connection for NodeConnection {
    fn connect(&mut self) -> Result<()> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        self.read_buf.clear();
        let transport = match self.open() {
            Ok(t) => t,
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                debug!(endpoint = %self.endpoint, error = %e, "connect failed");
                return Err(e);
            }
        };
        self.transport = Some(transport);

        if let Err(e) = self.run_handshake() {
            self.disconnect();
            return Err(e);
        }

        self.state = ConnectionState::Connected;
        debug!(endpoint = %self.endpoint, scheme = %self.scheme, "connected");
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close();
            debug!(endpoint = %self.endpoint, "disconnected");
        }
        self.read_buf.clear();
        self.state = ConnectionState::Disconnected;
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    fn write_request(&mut self, command: &Command) -> Result<()> {
        self.ensure_connected()?;
        self.send(command)
    }

    fn write_requests(&mut self, commands: &[Command]) -> Result<()> {
        self.ensure_connected()?;
        self.write_buf.clear();
        for command in commands {
            command.encode_to(&mut self.write_buf);
        }
        self.flush_write_buf()
    }

    fn read(&mut self) -> Result<Value> {
        if self.state != ConnectionState::Connected {
            return Err(self.not_connected());
        }
        self.read_reply()
    }

    fn parameters(&self) -> &ConnectionParameters {
        &self.parameters
    }
}

impl Drop for NodeConnection {
    fn drop(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
    }
}

impl fmt::Debug for NodeConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConnection")
            .field("endpoint", &self.endpoint)
            .field("scheme", &self.scheme)
            .field("state", &self.state)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("connect_commands", &self.connect_commands.len())
            .finish()
    }
}

// ── Serialization ───────────────────────────────────────────────────────

/// The persistent part of a [`NodeConnection`]: parameters plus the
/// user-registered connect commands. Sockets are never serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub parameters: ConnectionParameters,
    #[serde(default)]
    pub connect_commands: Vec<Command>,
}

#[derive(Serialize)]
struct ConnectionConfigRef<'a> {
    parameters: &'a ConnectionParameters,
    connect_commands: &'a [Command],
}

impl Serialize for NodeConnection {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        ConnectionConfigRef {
            parameters: &self.parameters,
            connect_commands: &self.connect_commands,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for NodeConnection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let config = ConnectionConfig::deserialize(deserializer)?;
        NodeConnection::from_config(config).map_err(serde::de::Error::custom)
    }
}
