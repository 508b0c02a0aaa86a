//! RESP2 protocol codec.
//!
//! Pure transforms with no I/O:
//!
//! - **Values**: parse and encode replies (status, error, integer, bulk
//!   string, array and both nil forms)
//! - **Commands**: encode requests as arrays of bulk strings, and parse them
//!   back
//! - **Cluster**: key hash slots, MOVED/ASK redirects, `CLUSTER SLOTS`
//!
//! Parsing distinguishes a buffer that simply ends early
//! ([`ParseError::Incomplete`]) from one that can never become a valid reply.
//! The latter means the stream is desynchronized.
//!
//! # Example
//!
//! ```
//! use protocol_resp::{Command, Value};
//!
//! let request = Command::new("GET").key("mykey").to_vec();
//! assert_eq!(request, b"*2\r\n$3\r\nGET\r\n$5\r\nmykey\r\n");
//!
//! let (value, consumed) = Value::parse(b"$5\r\nhello\r\n").unwrap();
//! assert_eq!(value.as_bytes(), Some(&b"hello"[..]));
//! assert_eq!(consumed, 11);
//! ```

pub mod cluster;
mod command;
mod error;
mod request;
mod value;

pub use cluster::{
    NodeInfo, Redirect, RedirectKind, SLOT_COUNT, SlotRange, crc16, hash_slot, hash_tag,
    parse_cluster_slots, parse_redirect,
};
pub use command::Command;
pub use error::ParseError;
pub use request::{encode_command, encode_request, request_len};
pub use value::{
    DEFAULT_MAX_BULK_STRING_LEN, DEFAULT_MAX_COLLECTION_ELEMENTS, DEFAULT_MAX_DEPTH,
    DEFAULT_MAX_TOTAL_ITEMS, ParseOptions, Value,
};
