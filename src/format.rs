//! # Pre-Formatted Commands
//!
//! Purpose: Hold a command that was encoded to wire bytes once and can be
//! submitted many times, or shared across threads, without re-encoding.
//!
//! The underlying buffer is an atomically reference-counted `Bytes`; cloning
//! a `FormattedCommand` shares the buffer, and the bytes are released exactly
//! once when the last clone is dropped.

use bytes::Bytes;

use crate::resp;

/// A pre-encoded, shareable wire-ready command.
///
/// Carries a human-readable description alongside the encoded payload so the
/// dispatcher can log the command without decoding it.
#[derive(Debug, Clone)]
pub struct FormattedCommand {
    bytes: Bytes,
    description: String,
}

impl FormattedCommand {
    /// Encodes an argument list into RESP once, up front.
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let refs: Vec<&[u8]> = args.iter().map(|arg| arg.as_bytes()).collect();
        let mut out = Vec::with_capacity(32);
        resp::encode_command(&refs, &mut out);
        FormattedCommand {
            bytes: Bytes::from(out),
            description: args.join(" "),
        }
    }

    /// Wraps caller-encoded wire bytes.
    ///
    /// The bytes must already be a valid RESP command; the dispatcher writes
    /// them to the socket verbatim.
    pub fn from_bytes(bytes: Bytes, description: impl Into<String>) -> Self {
        FormattedCommand {
            bytes,
            description: description.into(),
        }
    }

    /// Encoded wire bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Description used for logging.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Length of the encoded payload in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True when the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Joins command arguments into one printable line.
pub fn join_args(args: &[String], delimiter: char) -> String {
    let mut line = String::new();
    for (idx, arg) in args.iter().enumerate() {
        if idx > 0 {
            line.push(delimiter);
        }
        line.push_str(arg);
    }
    line
}

/// Splits a command line into arguments, dropping empty fields.
pub fn split_args(line: &str, delimiter: char) -> Vec<String> {
    line.split(delimiter)
        .filter(|field| !field.is_empty())
        .map(str::to_string)
        .collect()
}
