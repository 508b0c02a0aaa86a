//! Blocking RESP client.
//!
//! - [`NodeConnection`]: one socket to one server (TCP, Unix or TLS), opened
//!   lazily, with connect commands replayed after every reconnect
//! - [`ClusterConnection`]: routes commands by hash slot and follows
//!   MOVED/ASK redirects
//! - [`Pipeline`] and [`Transaction`]: batching and WATCH/MULTI/EXEC on top
//!
//! Both connection types implement [`Connection`], so code written against
//! the trait works for a standalone server and a cluster alike.
//!
//! Commands are plain [`resp_proto::Command`] values: a name and positional
//! arguments. Replies are [`resp_proto::Value`]s; server error replies are
//! data, not `Err`.
//!
//! # Example
//!
//! ```no_run
//! use resp_client::{Connection, ConnectionParameters, NodeConnection};
//! use resp_proto::{Command, Value};
//!
//! fn example() -> resp_client::Result<()> {
//!     let params = ConnectionParameters::tcp("127.0.0.1", 6379).database(15);
//!     let mut conn = NodeConnection::new(params)?;
//!     assert!(conn.execute_command(&Command::ping())?.is_status("PONG"));
//!     let reply = conn.execute_command(&Command::new("GET").key("missing"))?;
//!     assert_eq!(reply, Value::Null);
//!     Ok(())
//! }
//! ```
//!
//! The library logs through `tracing` and never installs a subscriber.

pub mod cluster;
pub mod connection;
mod error;
pub mod params;
pub mod pipeline;
pub mod pool;
pub mod slots;
pub mod transaction;

pub use cluster::{ClusterConfig, ClusterConnection, RedirectLimits, slot_for};
pub use connection::{
    Connection, ConnectionConfig, ConnectionState, NodeConnection, default_tls_config,
};
pub use error::{Error, Result};
pub use params::{ConnectionParameters, Scheme};
pub use pipeline::Pipeline;
pub use pool::NodeRegistry;
pub use slots::SlotMap;
pub use transaction::{Transaction, TransactionState};
