//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode client commands and parse server replies incrementally,
//! so the reader task can feed partial network chunks straight into the
//! parser without extra framing state.
//!
//! ## Design Principles
//! 1. **Incremental Parsing**: A partial frame returns `Ok(None)` and leaves
//!    the buffer untouched; callers simply read more bytes and retry.
//! 2. **Buffer Reuse**: Encoding appends into a caller-provided buffer.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.

use bytes::BytesMut;
use thiserror::Error;

/// RESP2 framing or parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("RESP protocol error")]
pub struct ProtocolError;

/// RESP reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style replies.
    Simple(Vec<u8>),
    /// -ERR ... replies.
    Error(Vec<u8>),
    /// :123 replies.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays.
    Array(Vec<RespValue>),
}

/// Encodes a RESP2 array command into the provided buffer.
pub fn encode_command(args: &[&[u8]], out: &mut Vec<u8>) {
    out.push(b'*');
    push_usize(out, args.len());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        out.push(b'$');
        push_usize(out, arg.len());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Attempts to parse one complete RESP value from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer holds only a partial frame; consumed
/// bytes are split off only once a full value is available.
pub fn parse_value(buf: &mut BytesMut) -> Result<Option<RespValue>, ProtocolError> {
    match parse_at(&buf[..], 0)? {
        Some((value, consumed)) => {
            let _ = buf.split_to(consumed);
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn parse_at(buf: &[u8], pos: usize) -> Result<Option<(RespValue, usize)>, ProtocolError> {
    let Some((line, next)) = read_line(buf, pos)? else {
        return Ok(None);
    };
    if line.is_empty() {
        return Err(ProtocolError);
    }

    match line[0] {
        b'+' => Ok(Some((RespValue::Simple(line[1..].to_vec()), next))),
        b'-' => Ok(Some((RespValue::Error(line[1..].to_vec()), next))),
        b':' => Ok(Some((RespValue::Integer(parse_i64(&line[1..])?), next))),
        b'$' => {
            let len = parse_i64(&line[1..])?;
            if len < 0 {
                return Ok(Some((RespValue::Bulk(None), next)));
            }
            let len = len as usize;
            let end = next + len + 2;
            if buf.len() < end {
                return Ok(None);
            }
            if buf[end - 2] != b'\r' || buf[end - 1] != b'\n' {
                return Err(ProtocolError);
            }
            Ok(Some((RespValue::Bulk(Some(buf[next..next + len].to_vec())), end)))
        }
        b'*' => {
            let count = parse_i64(&line[1..])?;
            if count <= 0 {
                return Ok(Some((RespValue::Array(Vec::new()), next)));
            }
            let mut items = Vec::with_capacity(count as usize);
            let mut pos = next;
            for _ in 0..count {
                match parse_at(buf, pos)? {
                    Some((item, after)) => {
                        items.push(item);
                        pos = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(items), pos)))
        }
        _ => Err(ProtocolError),
    }
}

fn read_line(buf: &[u8], pos: usize) -> Result<Option<(&[u8], usize)>, ProtocolError> {
    let Some(rel) = buf[pos..].iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };
    let end = pos + rel;
    if end == pos || buf[end - 1] != b'\r' {
        return Err(ProtocolError);
    }
    Ok(Some((&buf[pos..end - 1], end + 1)))
}

fn parse_i64(data: &[u8]) -> Result<i64, ProtocolError> {
    if data.is_empty() {
        return Err(ProtocolError);
    }
    let mut negative = false;
    let mut idx = 0;
    if data[0] == b'-' {
        negative = true;
        idx = 1;
    }

    let mut value: i64 = 0;
    while idx < data.len() {
        let b = data[idx];
        if !b.is_ascii_digit() {
            return Err(ProtocolError);
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
        idx += 1;
    }

    if negative {
        Ok(-value)
    } else {
        Ok(value)
    }
}

fn push_usize(out: &mut Vec<u8>, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}
