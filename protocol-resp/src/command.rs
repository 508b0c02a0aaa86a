//! Commands: a name plus positional byte-string arguments.
//!
//! A [`Command`] is what the client sends. It encodes to the RESP request
//! framing (an array of bulk strings) and can be parsed back from it, which
//! mock servers and tests rely on.

use crate::error::ParseError;
use crate::request::{encode_command, request_len};
use crate::value::ParseOptions;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Maximum number of arguments accepted when parsing request framing.
const MAX_ARGS: usize = 1024 * 1024;

/// An owned command: name, arguments and the positions of its key arguments.
///
/// Arguments are binary safe; lengths are byte lengths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    name: Bytes,
    args: Vec<Bytes>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    key_indexes: Vec<usize>,
}

impl Command {
    /// Start building a command with the given name.
    pub fn new(name: impl AsRef<[u8]>) -> Self {
        Self {
            name: Bytes::copy_from_slice(name.as_ref()),
            args: Vec::new(),
            key_indexes: Vec::new(),
        }
    }

    /// Append a positional argument.
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    /// Append an argument that is also a key, used for slot routing.
    pub fn key(mut self, key: impl AsRef<[u8]>) -> Self {
        self.key_indexes.push(self.args.len());
        self.args.push(Bytes::copy_from_slice(key.as_ref()));
        self
    }

    /// Append several positional arguments.
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        self.args
            .extend(args.into_iter().map(|a| Bytes::copy_from_slice(a.as_ref())));
        self
    }

    /// The command name upper-cased, for comparisons and diagnostics.
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.name).to_ascii_uppercase()
    }

    /// The command name exactly as it will be sent.
    pub fn raw_name(&self) -> &[u8] {
        &self.name
    }

    /// Returns true if this command's name equals `name`, ignoring ASCII case.
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name.as_bytes())
    }

    /// The positional arguments, excluding the name.
    pub fn arguments(&self) -> &[Bytes] {
        &self.args
    }

    /// The keys this command touches.
    ///
    /// Arguments added with [`Command::key`] are returned in order. A command
    /// without declared keys is assumed to take its key as the first argument.
    pub fn keys(&self) -> Vec<&[u8]> {
        if self.key_indexes.is_empty() {
            return self.args.first().map(|a| a.as_ref()).into_iter().collect();
        }
        self.key_indexes
            .iter()
            .filter_map(|&i| self.args.get(i))
            .map(|a| a.as_ref())
            .collect()
    }

    /// Returns true if at least one argument was declared as a key.
    pub fn has_declared_keys(&self) -> bool {
        !self.key_indexes.is_empty()
    }

    // ========================================================================
    // Commands issued by the client itself
    // ========================================================================

    /// PING
    pub fn ping() -> Self {
        Self::new("PING")
    }

    /// SELECT db
    pub fn select(db: i64) -> Self {
        let mut buf = itoa::Buffer::new();
        Self::new("SELECT").arg(buf.format(db))
    }

    /// AUTH [username] password
    pub fn auth(username: Option<&str>, password: &str) -> Self {
        let cmd = Self::new("AUTH");
        match username {
            Some(user) => cmd.arg(user).arg(password),
            None => cmd.arg(password),
        }
    }

    /// ASKING, sent before retrying a command after an ASK redirect.
    pub fn asking() -> Self {
        Self::new("ASKING")
    }

    /// CLUSTER SLOTS
    pub fn cluster_slots() -> Self {
        Self::new("CLUSTER").arg("SLOTS")
    }

    /// WATCH key [key ...]
    pub fn watch<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        keys.into_iter().fold(Self::new("WATCH"), |cmd, k| cmd.key(k))
    }

    /// UNWATCH
    pub fn unwatch() -> Self {
        Self::new("UNWATCH")
    }

    /// MULTI
    pub fn multi() -> Self {
        Self::new("MULTI")
    }

    /// EXEC
    pub fn exec() -> Self {
        Self::new("EXEC")
    }

    /// DISCARD
    pub fn discard() -> Self {
        Self::new("DISCARD")
    }

    // ========================================================================
    // Encoding
    // ========================================================================

    fn parts(&self) -> impl Iterator<Item = &[u8]> {
        std::iter::once(self.name.as_ref()).chain(self.args.iter().map(|a| a.as_ref()))
    }

    /// Exact number of bytes [`Command::encode`] writes.
    pub fn encoded_len(&self) -> usize {
        request_len(self.parts())
    }

    /// Encode into `buf`, returning the number of bytes written.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is shorter than [`Command::encoded_len`].
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        encode_command(buf, 1 + self.args.len(), self.parts())
    }

    /// Append the encoding to a growable buffer.
    pub fn encode_to(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.resize(start + self.encoded_len(), 0);
        let written = self.encode(&mut out[start..]);
        out.truncate(start + written);
    }

    /// Encode into a freshly allocated buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_to(&mut out);
        out
    }

    // ========================================================================
    // Parsing
    // ========================================================================

    /// Parse one request (array of bulk strings) from a byte buffer.
    ///
    /// Returns the command and the number of bytes consumed. Declared key
    /// positions are not part of the wire format, so the parsed command falls
    /// back to first-argument key semantics.
    ///
    /// # Errors
    ///
    /// Returns `ParseError::Incomplete` if more data is needed.
    #[inline]
    pub fn parse(buffer: &[u8]) -> Result<(Self, usize), ParseError> {
        Self::parse_with_options(buffer, &ParseOptions::default())
    }

    /// Parse a request with custom limits on bulk string size.
    pub fn parse_with_options(
        buffer: &[u8],
        options: &ParseOptions,
    ) -> Result<(Self, usize), ParseError> {
        let mut cursor = Cursor::new(buffer, options.max_bulk_string_len);

        if cursor.remaining() < 1 {
            return Err(ParseError::Incomplete);
        }
        let prefix = cursor.get_u8();
        if prefix != b'*' {
            return Err(ParseError::InvalidPrefix(prefix));
        }

        let count = cursor.read_integer()?;
        if count < 1 {
            return Err(ParseError::Protocol(
                "request must have at least 1 element".to_string(),
            ));
        }
        if count > MAX_ARGS {
            return Err(ParseError::CollectionTooLarge(count));
        }

        let name = cursor.read_bulk_string()?;
        let mut args = Vec::with_capacity((count - 1).min(64));
        for _ in 1..count {
            args.push(Bytes::copy_from_slice(cursor.read_bulk_string()?));
        }

        let command = Command {
            name: Bytes::copy_from_slice(name),
            args,
            key_indexes: Vec::new(),
        };
        Ok((command, cursor.position()))
    }
}

/// Cursor over a request buffer.
struct Cursor<'a> {
    buffer: &'a [u8],
    pos: usize,
    max_bulk_string_len: usize,
}

impl<'a> Cursor<'a> {
    fn new(buffer: &'a [u8], max_bulk_string_len: usize) -> Self {
        Self {
            buffer,
            pos: 0,
            max_bulk_string_len,
        }
    }

    #[inline]
    fn remaining(&self) -> usize {
        self.buffer.len() - self.pos
    }

    #[inline]
    fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    fn get_u8(&mut self) -> u8 {
        let b = self.buffer[self.pos];
        self.pos += 1;
        b
    }

    fn read_integer(&mut self) -> Result<usize, ParseError> {
        let line = self.read_line()?;

        if line.is_empty() {
            return Err(ParseError::InvalidLength("empty length".to_string()));
        }

        // usize::MAX is at most 20 digits, so 19 is a safe limit.
        if line.len() > 19 {
            return Err(ParseError::InvalidLength("length too large".to_string()));
        }

        let mut result = 0usize;
        for &byte in line {
            if !byte.is_ascii_digit() {
                return Err(ParseError::InvalidLength(
                    String::from_utf8_lossy(line).into_owned(),
                ));
            }
            result = result
                .checked_mul(10)
                .and_then(|r| r.checked_add((byte - b'0') as usize))
                .ok_or_else(|| ParseError::InvalidLength("length overflow".to_string()))?;
        }
        Ok(result)
    }

    fn read_bulk_string(&mut self) -> Result<&'a [u8], ParseError> {
        if self.remaining() < 1 {
            return Err(ParseError::Incomplete);
        }

        let prefix = self.get_u8();
        if prefix != b'$' {
            return Err(ParseError::InvalidPrefix(prefix));
        }

        let len = self.read_integer()?;
        if len > self.max_bulk_string_len {
            return Err(ParseError::BulkStringTooLong {
                len,
                max: self.max_bulk_string_len,
            });
        }

        if self.remaining() < len + 2 {
            return Err(ParseError::Incomplete);
        }

        let data = &self.buffer[self.pos..self.pos + len];
        self.pos += len;

        if self.get_u8() != b'\r' || self.get_u8() != b'\n' {
            return Err(ParseError::Protocol(
                "expected CRLF after bulk string".to_string(),
            ));
        }

        Ok(data)
    }

    fn read_line(&mut self) -> Result<&'a [u8], ParseError> {
        let start = self.pos;
        let slice = &self.buffer[start..];

        if let Some(pos) = memchr::memchr(b'\r', slice)
            && pos + 1 < slice.len()
        {
            if slice[pos + 1] != b'\n' {
                return Err(ParseError::Protocol("expected LF after CR".to_string()));
            }
            let end = start + pos;
            let line = &self.buffer[start..end];
            self.pos = end + 2;
            return Ok(line);
        }

        Err(ParseError::Incomplete)
    }
}
