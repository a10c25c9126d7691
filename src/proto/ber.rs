//! Minimal BER primitives for the LDAPMessage envelope.
//!
//! Only definite lengths are accepted (LDAP forbids the indefinite form).

use bytes::{BufMut, BytesMut};

use crate::proto::PduError;

pub const SEQUENCE: u8 = 0x30;
pub const INTEGER: u8 = 0x02;
pub const ENUMERATED: u8 = 0x0a;
pub const OCTET_STRING: u8 = 0x04;

/// Context-specific primitive [0], used for the simple password and the
/// extended request name.
pub const CONTEXT_0: u8 = 0x80;

/// A decoded tag/length header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub tag: u8,
    /// Number of bytes taken by tag + length octets.
    pub header_len: usize,
    pub content_len: usize,
}

impl Header {
    pub fn total_len(&self) -> usize {
        self.header_len + self.content_len
    }
}

/// Decode a tag/length header at the start of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed.
pub fn read_header(buf: &[u8]) -> Result<Option<Header>, PduError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let tag = buf[0];
    // Multi-byte tag numbers never occur in LDAP.
    if tag & 0x1f == 0x1f {
        return Err(PduError::Malformed("multi-byte tag"));
    }

    let first = buf[1];
    if first < 0x80 {
        return Ok(Some(Header {
            tag,
            header_len: 2,
            content_len: first as usize,
        }));
    }

    let n = (first & 0x7f) as usize;
    if n == 0 {
        return Err(PduError::Malformed("indefinite length"));
    }
    if n > 4 {
        return Err(PduError::Malformed("length too long"));
    }
    if buf.len() < 2 + n {
        return Ok(None);
    }
    let content_len = buf[2..2 + n]
        .iter()
        .fold(0usize, |acc, b| (acc << 8) | *b as usize);

    Ok(Some(Header {
        tag,
        header_len: 2 + n,
        content_len,
    }))
}

/// Decode a complete element, requiring all of its content to be present.
pub fn read_element(buf: &[u8]) -> Result<(Header, &[u8]), PduError> {
    let header = read_header(buf)?.ok_or(PduError::Malformed("truncated header"))?;
    if buf.len() < header.total_len() {
        return Err(PduError::Malformed("truncated element"));
    }
    Ok((header, &buf[header.header_len..header.total_len()]))
}

/// Decode a two's complement integer body (INTEGER or ENUMERATED content).
pub fn read_int(content: &[u8]) -> Result<i64, PduError> {
    if content.is_empty() || content.len() > 8 {
        return Err(PduError::Malformed("integer length"));
    }
    let negative = content[0] & 0x80 != 0;
    let init: i64 = if negative { -1 } else { 0 };
    Ok(content
        .iter()
        .fold(init, |acc, b| (acc << 8) | *b as i64))
}

pub fn put_len(out: &mut BytesMut, len: usize) {
    if len < 0x80 {
        out.put_u8(len as u8);
        return;
    }
    let bytes = (len as u32).to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    out.put_u8(0x80 | (4 - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

/// Encode a non-negative integer with the minimal number of octets.
pub fn put_int(out: &mut BytesMut, tag: u8, value: i64) {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    out.put_u8(tag);
    put_len(out, 8 - start);
    out.extend_from_slice(&bytes[start..]);
}

pub fn put_bytes(out: &mut BytesMut, tag: u8, value: &[u8]) {
    out.put_u8(tag);
    put_len(out, value.len());
    out.extend_from_slice(value);
}
