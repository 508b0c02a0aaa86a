//! RESP reply values and their parsing/encoding.
//!
//! RESP2 defines the following reply types, selected by the leading byte:
//! - Status (simple string): `+OK\r\n`
//! - Error: `-ERR message\r\n`
//! - Integer: `:1000\r\n`
//! - Bulk String: `$6\r\nfoobar\r\n`
//! - Nil Bulk String: `$-1\r\n`
//! - Array: `*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n`
//! - Nil Array: `*-1\r\n`
//!
//! Any other leading byte means the stream is desynchronized.

use crate::error::ParseError;
use bytes::Bytes;
use std::io::Write;

/// Default maximum size of a bulk string in bytes (512MB, the server-side
/// `proto-max-bulk-len` default).
pub const DEFAULT_MAX_BULK_STRING_LEN: usize = 512 * 1024 * 1024;

/// Default maximum number of elements in a single array.
pub const DEFAULT_MAX_COLLECTION_ELEMENTS: usize = 1 << 24;

/// Default maximum nesting depth for arrays of arrays.
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Default maximum total items across all arrays in a single parse.
///
/// Caps nested allocation at a linear budget instead of
/// `max_collection_elements ^ max_depth`.
pub const DEFAULT_MAX_TOTAL_ITEMS: usize = 1 << 24;

/// Upper bound on the capacity reserved up front for an array.
///
/// The declared length comes from the peer, so large arrays grow as their
/// elements actually arrive.
const MAX_PREALLOCATED_ELEMENTS: usize = 1024;

/// Resource limits applied while parsing replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOptions {
    /// Maximum number of elements in a single array.
    pub max_collection_elements: usize,
    /// Maximum size of a bulk string in bytes.
    pub max_bulk_string_len: usize,
    /// Maximum nesting depth for arrays.
    pub max_depth: usize,
    /// Maximum total items across all arrays in a single parse.
    pub max_total_items: usize,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl ParseOptions {
    /// Create new parse options with default values.
    pub const fn new() -> Self {
        Self {
            max_collection_elements: DEFAULT_MAX_COLLECTION_ELEMENTS,
            max_bulk_string_len: DEFAULT_MAX_BULK_STRING_LEN,
            max_depth: DEFAULT_MAX_DEPTH,
            max_total_items: DEFAULT_MAX_TOTAL_ITEMS,
        }
    }

    /// Set the maximum collection element count.
    pub const fn max_collection_elements(mut self, count: usize) -> Self {
        self.max_collection_elements = count;
        self
    }

    /// Set the maximum bulk string length.
    pub const fn max_bulk_string_len(mut self, len: usize) -> Self {
        self.max_bulk_string_len = len;
        self
    }

    /// Set the maximum nesting depth.
    pub const fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Set the maximum total items across all arrays.
    pub const fn max_total_items(mut self, count: usize) -> Self {
        self.max_total_items = count;
        self
    }
}

/// A RESP reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Status reply: `+OK\r\n`
    SimpleString(Bytes),
    /// Error reply: `-ERR message\r\n`
    Error(Bytes),
    /// Integer reply: `:1000\r\n`
    Integer(i64),
    /// Bulk string: `$6\r\nfoobar\r\n`
    BulkString(Bytes),
    /// Nil bulk string: `$-1\r\n`
    Null,
    /// Array: `*2\r\n...`
    Array(Vec<Value>),
    /// Nil array: `*-1\r\n`
    ///
    /// Kept apart from [`Value::Null`] because EXEC answers a transaction
    /// aborted by WATCH with a nil array, which must not be confused with an
    /// empty result.
    NullArray,
}

impl Value {
    /// Encoded `+OK\r\n`.
    pub const OK: &'static [u8] = b"+OK\r\n";

    /// Encoded `+PONG\r\n`.
    pub const PONG: &'static [u8] = b"+PONG\r\n";

    /// Encoded `+QUEUED\r\n`.
    pub const QUEUED: &'static [u8] = b"+QUEUED\r\n";

    /// Encoded nil bulk string.
    pub const NULL_BULK: &'static [u8] = b"$-1\r\n";

    /// Encoded nil array.
    pub const NULL_ARRAY: &'static [u8] = b"*-1\r\n";

    // ========================================================================
    // Constructors
    // ========================================================================

    /// Create a status value.
    #[inline]
    pub fn simple_string(s: &[u8]) -> Self {
        Value::SimpleString(Bytes::copy_from_slice(s))
    }

    /// Create an error value.
    #[inline]
    pub fn error(msg: &[u8]) -> Self {
        Value::Error(Bytes::copy_from_slice(msg))
    }

    /// Create an integer value.
    #[inline]
    pub fn integer(n: i64) -> Self {
        Value::Integer(n)
    }

    /// Create a bulk string value.
    #[inline]
    pub fn bulk_string(data: &[u8]) -> Self {
        Value::BulkString(Bytes::copy_from_slice(data))
    }

    /// Create a nil bulk string.
    #[inline]
    pub fn null() -> Self {
        Value::Null
    }

    /// Create an array value.
    #[inline]
    pub fn array(elements: Vec<Value>) -> Self {
        Value::Array(elements)
    }

    // ========================================================================
    // Type checks
    // ========================================================================

    /// Returns true for either nil form (`$-1` or `*-1`).
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null | Value::NullArray)
    }

    /// Returns true for the nil array (`*-1`).
    #[inline]
    pub fn is_null_array(&self) -> bool {
        matches!(self, Value::NullArray)
    }

    /// Returns true if this is an error value.
    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    /// Returns true if this is a status value.
    #[inline]
    pub fn is_simple_string(&self) -> bool {
        matches!(self, Value::SimpleString(_))
    }

    /// Returns true if this is a bulk string.
    #[inline]
    pub fn is_bulk_string(&self) -> bool {
        matches!(self, Value::BulkString(_))
    }

    /// Returns true if this is an integer.
    #[inline]
    pub fn is_integer(&self) -> bool {
        matches!(self, Value::Integer(_))
    }

    /// Returns true if this is an array.
    #[inline]
    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    /// Returns true if this is a status reply equal to `status`,
    /// ignoring ASCII case.
    #[inline]
    pub fn is_status(&self, status: &str) -> bool {
        match self {
            Value::SimpleString(s) => s.eq_ignore_ascii_case(status.as_bytes()),
            _ => false,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Returns the value as bytes if it's a string type (status, error or bulk).
    #[inline]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::SimpleString(s) | Value::BulkString(s) | Value::Error(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as an integer.
    #[inline]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the value as an array.
    #[inline]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Returns the error code of an error reply: the first space-delimited
    /// token (`ERR`, `WRONGTYPE`, `MOVED`, ...).
    pub fn error_code(&self) -> Option<&str> {
        let Value::Error(line) = self else {
            return None;
        };
        let code = match memchr::memchr(b' ', line) {
            Some(pos) => &line[..pos],
            None => &line[..],
        };
        std::str::from_utf8(code).ok()
    }

    /// Returns the message of an error reply: everything after the code.
    ///
    /// An error line without a space has an empty message.
    pub fn error_message(&self) -> Option<&[u8]> {
        let Value::Error(line) = self else {
            return None;
        };
        Some(match memchr::memchr(b' ', line) {
            Some(pos) => &line[pos + 1..],
            None => &[],
        })
    }

    // ========================================================================
    // Parsing
    // ========================================================================

    /// Parse exactly one RESP reply from a byte buffer.
    ///
    /// Returns the parsed value and the number of bytes consumed. Bytes past
    /// the end of the first reply are left untouched.
    ///
    /// # Errors
    ///
    /// Returns `ParseError::Incomplete` if the buffer holds a valid but
    /// unfinished prefix of a reply. Every other error means the stream is
    /// desynchronized.
    #[inline]
    pub fn parse(data: &[u8]) -> Result<(Self, usize), ParseError> {
        Self::parse_with_options(data, &ParseOptions::default())
    }

    /// Parse a RESP reply with custom resource limits.
    pub fn parse_with_options(
        data: &[u8],
        options: &ParseOptions,
    ) -> Result<(Self, usize), ParseError> {
        let mut total_items = 0;
        Self::parse_internal(data, options, 0, &mut total_items)
    }

    /// Internal parsing function that tracks nesting depth and total items.
    fn parse_internal(
        data: &[u8],
        options: &ParseOptions,
        depth: usize,
        total_items: &mut usize,
    ) -> Result<(Self, usize), ParseError> {
        if data.is_empty() {
            return Err(ParseError::Incomplete);
        }

        match data[0] {
            b'+' => parse_simple_string(data),
            b'-' => parse_error(data),
            b':' => parse_integer(data),
            b'$' => parse_bulk_string(data, options),
            b'*' => parse_array(data, options, depth, total_items),
            other => Err(ParseError::InvalidPrefix(other)),
        }
    }

    // ========================================================================
    // Encoding
    // ========================================================================

    /// Encode this value into a byte buffer.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is too small. Use `encoded_len()` to check the required size.
    #[inline]
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        match self {
            Value::SimpleString(s) => encode_line(buf, b'+', s),
            Value::Error(msg) => encode_line(buf, b'-', msg),
            Value::Integer(n) => encode_integer(buf, *n),
            Value::BulkString(data) => encode_bulk_string(buf, data),
            Value::Null => {
                buf[..5].copy_from_slice(Self::NULL_BULK);
                5
            }
            Value::Array(elements) => encode_array(buf, elements),
            Value::NullArray => {
                buf[..5].copy_from_slice(Self::NULL_ARRAY);
                5
            }
        }
    }

    /// Encode this value into a freshly allocated buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];
        let len = self.encode(&mut buf);
        buf.truncate(len);
        buf
    }

    /// Calculate the encoded length of this value.
    pub fn encoded_len(&self) -> usize {
        match self {
            Value::SimpleString(s) => 1 + s.len() + 2, // +<data>\r\n
            Value::Error(msg) => 1 + msg.len() + 2,    // -<data>\r\n
            Value::Integer(n) => {
                let mut buf = itoa::Buffer::new();
                1 + buf.format(*n).len() + 2 // :<int>\r\n
            }
            Value::BulkString(data) => {
                let mut buf = itoa::Buffer::new();
                1 + buf.format(data.len()).len() + 2 + data.len() + 2 // $<len>\r\n<data>\r\n
            }
            Value::Null | Value::NullArray => 5,
            Value::Array(elements) => {
                let mut buf = itoa::Buffer::new();
                let header_len = 1 + buf.format(elements.len()).len() + 2;
                header_len + elements.iter().map(|e| e.encoded_len()).sum::<usize>()
            }
        }
    }
}

// ============================================================================
// Parsing helpers
// ============================================================================

/// Find the position of the `\r` of the first `\r\n` in `data`.
///
/// A `\r` as the very last byte may still be followed by `\n`, so it is
/// incomplete. A `\r` followed by anything else breaks line framing.
#[inline]
fn find_crlf(data: &[u8]) -> Result<usize, ParseError> {
    match memchr::memchr(b'\r', data) {
        Some(pos) if pos + 1 < data.len() => {
            if data[pos + 1] == b'\n' {
                Ok(pos)
            } else {
                Err(ParseError::Protocol("expected LF after CR".to_string()))
            }
        }
        _ => Err(ParseError::Incomplete),
    }
}

/// Read the line following the type byte, returning `(line, bytes consumed)`.
#[inline]
fn read_line(data: &[u8]) -> Result<(&[u8], usize), ParseError> {
    let end = find_crlf(data)?;
    Ok((&data[1..end], end + 2))
}

/// Parse a signed length header (`$` or `*`).
///
/// A partial header is rejected as soon as it contains a byte that can never
/// belong to a length, so garbage is reported without waiting for a CRLF.
fn read_length(data: &[u8]) -> Result<(i64, usize), ParseError> {
    let (line, consumed) = match read_line(data) {
        Ok(found) => found,
        Err(ParseError::Incomplete) => {
            let partial = &data[1..];
            let partial = partial.strip_suffix(b"\r").unwrap_or(partial);
            let digits = partial.strip_prefix(b"-").unwrap_or(partial);
            if digits.iter().all(u8::is_ascii_digit) {
                return Err(ParseError::Incomplete);
            }
            return Err(ParseError::InvalidLength(
                String::from_utf8_lossy(partial).into_owned(),
            ));
        }
        Err(e) => return Err(e),
    };

    match parse_decimal(line) {
        Some(len) if len >= -1 => Ok((len, consumed)),
        _ => Err(ParseError::InvalidLength(
            String::from_utf8_lossy(line).into_owned(),
        )),
    }
}

/// An optional `-` followed by one or more ASCII digits, and nothing else.
fn parse_decimal(line: &[u8]) -> Option<i64> {
    let digits = line.strip_prefix(b"-").unwrap_or(line);
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(line).ok()?.parse().ok()
}

/// Parse a status reply: +OK\r\n
fn parse_simple_string(data: &[u8]) -> Result<(Value, usize), ParseError> {
    let (line, consumed) = read_line(data)?;
    Ok((Value::SimpleString(Bytes::copy_from_slice(line)), consumed))
}

/// Parse an error: -ERR message\r\n
fn parse_error(data: &[u8]) -> Result<(Value, usize), ParseError> {
    let (line, consumed) = read_line(data)?;
    Ok((Value::Error(Bytes::copy_from_slice(line)), consumed))
}

/// Parse an integer: :1000\r\n
fn parse_integer(data: &[u8]) -> Result<(Value, usize), ParseError> {
    let (line, consumed) = read_line(data)?;
    let value = parse_decimal(line)
        .ok_or_else(|| ParseError::InvalidInteger(String::from_utf8_lossy(line).into_owned()))?;
    Ok((Value::Integer(value), consumed))
}

/// Parse a bulk string: $6\r\nfoobar\r\n or $-1\r\n
fn parse_bulk_string(data: &[u8], options: &ParseOptions) -> Result<(Value, usize), ParseError> {
    let (len, data_start) = read_length(data)?;

    if len < 0 {
        return Ok((Value::Null, data_start));
    }

    let len = len as usize;
    if len > options.max_bulk_string_len {
        return Err(ParseError::BulkStringTooLong {
            len,
            max: options.max_bulk_string_len,
        });
    }

    let data_end = data_start + len;
    let total_end = data_end + 2;

    if data.len() < total_end {
        // The payload itself is opaque, but a terminator that has already
        // arrived must be correct.
        if data.len() > data_end && data[data_end] != b'\r' {
            return Err(ParseError::Protocol("missing trailing CRLF".to_string()));
        }
        return Err(ParseError::Incomplete);
    }

    if data[data_end] != b'\r' || data[data_end + 1] != b'\n' {
        return Err(ParseError::Protocol("missing trailing CRLF".to_string()));
    }

    let content = Bytes::copy_from_slice(&data[data_start..data_end]);
    Ok((Value::BulkString(content), total_end))
}

/// Parse an array: *2\r\n... or *-1\r\n
fn parse_array(
    data: &[u8],
    options: &ParseOptions,
    depth: usize,
    total_items: &mut usize,
) -> Result<(Value, usize), ParseError> {
    if depth >= options.max_depth {
        return Err(ParseError::NestingTooDeep(depth + 1));
    }

    let (len, mut pos) = read_length(data)?;

    if len < 0 {
        return Ok((Value::NullArray, pos));
    }

    let len = len as usize;
    if len > options.max_collection_elements {
        return Err(ParseError::CollectionTooLarge(len));
    }

    *total_items = total_items
        .checked_add(len)
        .ok_or(ParseError::CollectionTooLarge(usize::MAX))?;
    if *total_items > options.max_total_items {
        return Err(ParseError::CollectionTooLarge(*total_items));
    }

    let mut elements = Vec::with_capacity(len.min(MAX_PREALLOCATED_ELEMENTS));

    for _ in 0..len {
        if pos >= data.len() {
            return Err(ParseError::Incomplete);
        }
        let (value, consumed) =
            Value::parse_internal(&data[pos..], options, depth + 1, total_items)?;
        elements.push(value);
        pos += consumed;
    }

    Ok((Value::Array(elements), pos))
}

// ============================================================================
// Encoding helpers
// ============================================================================

/// Encode a line-framed reply: <prefix><data>\r\n
fn encode_line(buf: &mut [u8], prefix: u8, s: &[u8]) -> usize {
    buf[0] = prefix;
    buf[1..1 + s.len()].copy_from_slice(s);
    buf[1 + s.len()] = b'\r';
    buf[2 + s.len()] = b'\n';
    3 + s.len()
}

/// Encode an integer: :<n>\r\n
fn encode_integer(buf: &mut [u8], n: i64) -> usize {
    buf[0] = b':';
    let mut cursor = std::io::Cursor::new(&mut buf[1..]);
    write!(cursor, "{}\r\n", n).unwrap();
    1 + cursor.position() as usize
}

/// Encode a bulk string: $<len>\r\n<data>\r\n
fn encode_bulk_string(buf: &mut [u8], data: &[u8]) -> usize {
    buf[0] = b'$';
    let mut cursor = std::io::Cursor::new(&mut buf[1..]);
    write!(cursor, "{}\r\n", data.len()).unwrap();
    let header_len = 1 + cursor.position() as usize;

    buf[header_len..header_len + data.len()].copy_from_slice(data);
    buf[header_len + data.len()] = b'\r';
    buf[header_len + data.len() + 1] = b'\n';
    header_len + data.len() + 2
}

/// Encode an array: *<len>\r\n<elements>
fn encode_array(buf: &mut [u8], elements: &[Value]) -> usize {
    buf[0] = b'*';
    let mut cursor = std::io::Cursor::new(&mut buf[1..]);
    write!(cursor, "{}\r\n", elements.len()).unwrap();
    let mut pos = 1 + cursor.position() as usize;

    for element in elements {
        pos += element.encode(&mut buf[pos..]);
    }
    pos
}
