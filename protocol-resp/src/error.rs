//! Error types for RESP protocol parsing.

/// Error type for RESP parsing operations.
///
/// Every variant except [`ParseError::Incomplete`] means the byte stream no
/// longer lines up with RESP framing. A connection that produced one of them
/// cannot be trusted for further replies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Need more data to complete parsing.
    /// This is not a fatal error - the caller should buffer more data and retry.
    #[error("incomplete data")]
    Incomplete,

    /// Invalid type prefix byte.
    #[error("Protocol error, got '{}' as reply type byte", escape_byte(.0))]
    InvalidPrefix(u8),

    /// Invalid integer format.
    #[error("Protocol error, invalid integer: {0}")]
    InvalidInteger(String),

    /// Invalid bulk string or array length.
    #[error("Protocol error, invalid length: {0}")]
    InvalidLength(String),

    /// Protocol violation.
    #[error("Protocol error, {0}")]
    Protocol(String),

    /// Collection size exceeds maximum allowed limit.
    #[error("collection too large: {0} elements exceeds limit")]
    CollectionTooLarge(usize),

    /// Nesting depth exceeds maximum allowed limit.
    #[error("nesting too deep: depth {0} exceeds limit")]
    NestingTooDeep(usize),

    /// Bulk string exceeds maximum allowed size.
    #[error("bulk string too long: {len} bytes exceeds {max} byte limit")]
    BulkStringTooLong { len: usize, max: usize },
}

fn escape_byte(byte: &u8) -> std::ascii::EscapeDefault {
    std::ascii::escape_default(*byte)
}

impl ParseError {
    /// Returns true if this error indicates more data is needed.
    #[inline]
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ParseError::Incomplete)
    }

    /// Returns true if the stream is desynchronized and must be discarded.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        !self.is_incomplete()
    }
}
