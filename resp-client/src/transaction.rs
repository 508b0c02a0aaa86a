//! Optimistic transactions: WATCH / MULTI / EXEC / DISCARD.

use resp_proto::{Command, Value};

use crate::connection::{Connection, NodeConnection};
use crate::error::{Error, Result};

/// Where a [`Transaction`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Nothing watched, no MULTI sent.
    Idle,
    /// WATCH sent; MULTI not yet.
    Watching,
    /// MULTI sent; commands are being queued server-side.
    Queuing,
    /// EXEC ran the queued commands.
    Executed,
    /// EXEC was refused (watched key changed, or the queue was rejected),
    /// or the connection was lost mid-transaction.
    Aborted,
}

impl TransactionState {
    fn as_str(self) -> &'static str {
        match self {
            TransactionState::Idle => "idle",
            TransactionState::Watching => "watching",
            TransactionState::Queuing => "queuing",
            TransactionState::Executed => "executed",
            TransactionState::Aborted => "aborted",
        }
    }

    /// Holds server-side state that a reconnect would silently lose.
    fn is_open(self) -> bool {
        matches!(self, TransactionState::Watching | TransactionState::Queuing)
    }
}

/// A transaction on one node connection.
///
/// Borrowing the connection mutably keeps other traffic off it until the
/// transaction is dropped. Dropping performs no I/O; a transaction left in
/// `Queuing` should be [`discard`](Transaction::discard)ed first.
///
/// ```no_run
/// use resp_client::{ConnectionParameters, Error, NodeConnection, Transaction};
/// use resp_proto::Command;
///
/// # fn example() -> resp_client::Result<()> {
/// let mut conn = NodeConnection::new(ConnectionParameters::default())?;
/// let mut tx = Transaction::new(&mut conn);
/// tx.watch(["balance"])?;
/// tx.multi()?;
/// tx.queue(Command::new("DECRBY").key("balance").arg("10"))?;
/// tx.queue(Command::new("INCRBY").key("spent").arg("10"))?;
/// match tx.exec() {
///     Ok(replies) => assert_eq!(replies.len(), 2),
///     Err(Error::TransactionAborted) => { /* balance changed; retry */ }
///     Err(e) => return Err(e),
/// }
/// # Ok(())
/// # }
/// ```
pub struct Transaction<'c> {
    conn: &'c mut NodeConnection,
    state: TransactionState,
    queued: Vec<Command>,
}

impl<'c> Transaction<'c> {
    pub fn new(conn: &'c mut NodeConnection) -> Self {
        Self {
            conn,
            state: TransactionState::Idle,
            queued: Vec::new(),
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Commands accepted since MULTI, in submission order.
    pub fn queued(&self) -> &[Command] {
        &self.queued
    }

    fn require(&self, operation: &'static str, allowed: &[TransactionState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidTransactionState {
                operation,
                state: self.state.as_str(),
            })
        }
    }

    /// Execute on the borrowed connection, refusing to silently reconnect
    /// while server-side transaction state exists.
    fn execute(&mut self, command: &Command) -> Result<Value> {
        if self.state.is_open() && !self.conn.is_connected() {
            self.state = TransactionState::Aborted;
            return Err(Error::ConnectionClosed {
                endpoint: self.conn.endpoint().to_string(),
            });
        }
        match self.conn.execute_command(command) {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_connection_error() && self.state.is_open() {
                    self.state = TransactionState::Aborted;
                }
                Err(e)
            }
        }
    }

    fn expect_ok(&mut self, command: &Command) -> Result<()> {
        match self.execute(command)? {
            Value::SimpleString(_) => Ok(()),
            Value::Error(msg) => Err(Error::Redis(String::from_utf8_lossy(&msg).into_owned())),
            other => Err(Error::UnexpectedResponse(format!(
                "{} returned {other:?}",
                command.name()
            ))),
        }
    }

    const READY: &'static [TransactionState] = &[
        TransactionState::Idle,
        TransactionState::Watching,
        TransactionState::Executed,
        TransactionState::Aborted,
    ];

    /// WATCH `keys`. EXEC will abort if any of them changes before it runs.
    pub fn watch<I, K>(&mut self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        self.require("watch", Self::READY)?;
        let command = Command::watch(keys);
        if command.arguments().is_empty() {
            return Err(Error::InvalidArgument(
                "WATCH needs at least one key".to_string(),
            ));
        }
        self.expect_ok(&command)?;
        self.state = TransactionState::Watching;
        Ok(())
    }

    /// UNWATCH every key.
    pub fn unwatch(&mut self) -> Result<()> {
        self.require("unwatch", &[TransactionState::Idle, TransactionState::Watching])?;
        self.expect_ok(&Command::unwatch())?;
        self.state = TransactionState::Idle;
        Ok(())
    }

    /// Send MULTI and start queuing.
    pub fn multi(&mut self) -> Result<()> {
        self.require("multi", Self::READY)?;
        self.expect_ok(&Command::multi())?;
        self.queued.clear();
        self.state = TransactionState::Queuing;
        Ok(())
    }

    /// Queue a command. The immediate reply is `+QUEUED`; the command's real
    /// reply arrives with [`exec`](Transaction::exec).
    ///
    /// A rejected command (`-ERR ...`) is returned as [`Error::Redis`] and
    /// makes the server refuse the EXEC.
    pub fn queue(&mut self, command: Command) -> Result<Value> {
        self.require("queue", &[TransactionState::Queuing])?;
        match self.execute(&command)? {
            reply if reply.is_status("QUEUED") => {
                self.queued.push(command);
                Ok(reply)
            }
            Value::Error(msg) => Err(Error::Redis(String::from_utf8_lossy(&msg).into_owned())),
            other => Err(Error::UnexpectedResponse(format!(
                "expected QUEUED for {}, got {other:?}",
                command.name()
            ))),
        }
    }

    /// Send EXEC and return the queued commands' replies in order.
    ///
    /// # Errors
    ///
    /// [`Error::TransactionAborted`] when a watched key changed (EXEC
    /// replied with a nil array). An empty transaction returns `Ok` with no
    /// replies instead.
    pub fn exec(&mut self) -> Result<Vec<Value>> {
        self.require("exec", &[TransactionState::Queuing])?;
        let reply = self.execute(&Command::exec())?;
        match reply {
            Value::Array(replies) => {
                self.state = TransactionState::Executed;
                Ok(replies)
            }
            Value::NullArray => {
                self.state = TransactionState::Aborted;
                Err(Error::TransactionAborted)
            }
            Value::Error(msg) => {
                self.state = TransactionState::Aborted;
                Err(Error::Redis(String::from_utf8_lossy(&msg).into_owned()))
            }
            other => {
                self.state = TransactionState::Aborted;
                Err(Error::UnexpectedResponse(format!("EXEC returned {other:?}")))
            }
        }
    }

    /// Send DISCARD, dropping everything queued, and return to idle.
    pub fn discard(&mut self) -> Result<()> {
        self.require("discard", &[TransactionState::Queuing])?;
        self.expect_ok(&Command::discard())?;
        self.queued.clear();
        self.state = TransactionState::Idle;
        Ok(())
    }
}
