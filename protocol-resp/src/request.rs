//! Request framing: an array of bulk strings.
//!
//! ```text
//! *<argc>\r\n
//! $<len>\r\n<bytes>\r\n   (repeated argc times)
//! ```
//!
//! Lengths are byte counts, so arguments are binary safe.

use std::io::Write;

/// Calculate the encoded length of a request made of `parts`.
pub fn request_len<'a, I>(parts: I) -> usize
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut buf = itoa::Buffer::new();
    let mut count = 0usize;
    let mut len = 0usize;
    for part in parts {
        count += 1;
        // $<len>\r\n<data>\r\n
        len += 1 + buf.format(part.len()).len() + 2 + part.len() + 2;
    }
    // *<count>\r\n
    len + 1 + buf.format(count).len() + 2
}

/// Encode `count` parts as a request into `buf`.
///
/// Returns the number of bytes written.
///
/// # Panics
///
/// Panics if the buffer is too small. Use [`request_len`] to size it.
pub fn encode_command<'a, I>(buf: &mut [u8], count: usize, parts: I) -> usize
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut pos = 0;

    // Write array header: *<count>\r\n
    buf[pos] = b'*';
    pos += 1;
    let mut cursor = std::io::Cursor::new(&mut buf[pos..]);
    write!(cursor, "{}\r\n", count).unwrap();
    pos += cursor.position() as usize;

    for arg in parts {
        // $<len>\r\n
        buf[pos] = b'$';
        pos += 1;
        let mut cursor = std::io::Cursor::new(&mut buf[pos..]);
        write!(cursor, "{}\r\n", arg.len()).unwrap();
        pos += cursor.position() as usize;

        // <data>\r\n
        buf[pos..pos + arg.len()].copy_from_slice(arg);
        pos += arg.len();
        buf[pos] = b'\r';
        buf[pos + 1] = b'\n';
        pos += 2;
    }

    pos
}

/// Encode borrowed arguments into a new buffer.
///
/// Useful when the caller already holds the arguments and does not need a
/// [`Command`](crate::Command).
pub fn encode_request(args: &[&[u8]]) -> Vec<u8> {
    let mut buf = vec![0u8; request_len(args.iter().copied())];
    let len = encode_command(&mut buf, args.len(), args.iter().copied());
    buf.truncate(len);
    buf
}
