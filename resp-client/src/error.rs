use std::io;

use resp_proto::{ParseError, RedirectKind};

/// Errors returned by the RESP client.
///
/// Transport and protocol variants name the endpoint they came from.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed configuration, rejected before any I/O.
    #[error("{0}")]
    InvalidArgument(String),

    /// The socket could not be opened, written or read.
    #[error("connection error [{endpoint}]: {source}")]
    Connection {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// The server closed the connection.
    #[error("connection closed [{endpoint}]")]
    ConnectionClosed { endpoint: String },

    /// The reply stream is desynchronized. The connection has been dropped.
    #[error("{source} [{endpoint}]")]
    Protocol {
        endpoint: String,
        #[source]
        source: ParseError,
    },

    /// A connect command (AUTH, SELECT, ...) was rejected by the server.
    #[error("connect command {command} failed [{endpoint}]: {message}")]
    ConnectCommand {
        endpoint: String,
        command: String,
        message: String,
    },

    /// The server returned an error reply where the caller needed a value.
    #[error("redis error: {0}")]
    Redis(String),

    /// The reply type did not match what the operation expects.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// The command has no key to route by.
    #[error("command {0} has no key to route by")]
    NoKey(String),

    /// The command's keys hash to different slots.
    #[error("CROSSSLOT keys in request for {0} don't hash to the same slot")]
    CrossSlot(String),

    /// No node is known for the slot, even after a topology refresh.
    #[error("no node serves slot {0}")]
    NoNodeForSlot(u16),

    /// No known node answered `CLUSTER SLOTS` with a usable table.
    #[error("cluster topology unavailable: {0}")]
    TopologyUnavailable(String),

    /// The redirect limit for a single command was exceeded.
    #[error("too many {kind} redirects for slot {slot} (last: {endpoint})")]
    TooManyRedirects {
        kind: RedirectKind,
        slot: u16,
        endpoint: String,
    },

    /// EXEC returned a nil array: a watched key changed.
    #[error("transaction aborted: a watched key was modified")]
    TransactionAborted,

    /// The transaction operation is not valid in the current state.
    #[error("invalid transaction state: cannot {operation} while {state}")]
    InvalidTransactionState {
        operation: &'static str,
        state: &'static str,
    },
}

impl Error {
    /// Returns true for transport and protocol failures, after which the
    /// connection is no longer open.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Connection { .. } | Error::ConnectionClosed { .. } | Error::Protocol { .. }
        )
    }
}

/// Convenience alias for client results.
pub type Result<T> = std::result::Result<T, Error>;
