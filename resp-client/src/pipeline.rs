//! Pipelines: many commands, one round trip.

use resp_proto::{Command, Value};

use crate::connection::Connection;
use crate::error::Result;

/// Commands buffered for a single batched write.
///
/// Queuing performs no I/O. [`flush`](Pipeline::flush) writes every queued
/// command back to back, then reads exactly that many replies; reply `i`
/// belongs to the command whose [`queue`](Pipeline::queue) call returned `i`.
/// Server error replies come back as [`Value::Error`] in their slot.
///
/// ```no_run
/// use resp_client::{ConnectionParameters, NodeConnection, Pipeline};
/// use resp_proto::Command;
///
/// # fn example() -> resp_client::Result<()> {
/// let mut conn = NodeConnection::new(ConnectionParameters::default())?;
/// let mut pipeline = Pipeline::new(&mut conn);
/// pipeline.queue(Command::new("INCR").key("counter"));
/// pipeline.queue(Command::new("GET").key("counter"));
/// let replies = pipeline.flush()?;
/// assert_eq!(replies.len(), 2);
/// # Ok(())
/// # }
/// ```
pub struct Pipeline<'c, C: Connection + ?Sized> {
    conn: &'c mut C,
    commands: Vec<Command>,
}

impl<'c, C: Connection + ?Sized> Pipeline<'c, C> {
    pub fn new(conn: &'c mut C) -> Self {
        Self {
            conn,
            commands: Vec::new(),
        }
    }

    /// Buffer a command. Returns the index of its reply in the flush result.
    pub fn queue(&mut self, command: Command) -> usize {
        self.commands.push(command);
        self.commands.len() - 1
    }

    /// Number of buffered commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Write all buffered commands, then read their replies in order.
    ///
    /// The buffer is emptied either way, so the pipeline can be reused.
    pub fn flush(&mut self) -> Result<Vec<Value>> {
        let commands = std::mem::take(&mut self.commands);
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        self.conn.write_requests(&commands)?;

        let mut replies = Vec::with_capacity(commands.len());
        for _ in 0..commands.len() {
            replies.push(self.conn.read()?);
        }
        Ok(replies)
    }
}
