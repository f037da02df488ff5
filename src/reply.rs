//! # Typed Reply Decoding
//!
//! Purpose: Map raw RESP replies onto the reply type a command was created
//! with. A failed conversion marks the command `WrongType` instead of
//! surfacing a parse error, so callers see one uniform status channel.

use crate::resp::RespValue;

/// A type a command reply can be decoded into.
///
/// Implementations return `None` when the server reply does not match the
/// requested shape; the dispatcher records that as a `WrongType` status.
pub trait Reply: Clone + Send + 'static {
    /// Decodes a raw reply value.
    fn from_resp(value: RespValue) -> Option<Self>;
}

/// Raw access to whatever the server sent.
impl Reply for RespValue {
    fn from_resp(value: RespValue) -> Option<Self> {
        Some(value)
    }
}

/// Reply is acknowledged and discarded.
impl Reply for () {
    fn from_resp(_value: RespValue) -> Option<Self> {
        Some(())
    }
}

/// Bulk or simple string replies. A null bulk is a type mismatch; use
/// `Option<String>` for commands that may return nil.
impl Reply for String {
    fn from_resp(value: RespValue) -> Option<Self> {
        match value {
            RespValue::Simple(data) | RespValue::Bulk(Some(data)) => {
                String::from_utf8(data).ok()
            }
            _ => None,
        }
    }
}

/// Nil-able bulk string replies, e.g. GET on a missing key.
impl Reply for Option<String> {
    fn from_resp(value: RespValue) -> Option<Self> {
        match value {
            RespValue::Bulk(None) => Some(None),
            RespValue::Simple(data) | RespValue::Bulk(Some(data)) => {
                String::from_utf8(data).ok().map(Some)
            }
            _ => None,
        }
    }
}

/// Integer replies, e.g. DEL and EXPIRE counts.
impl Reply for i64 {
    fn from_resp(value: RespValue) -> Option<Self> {
        match value {
            RespValue::Integer(value) => Some(value),
            _ => None,
        }
    }
}

/// Array-of-string replies, e.g. KEYS and LRANGE.
impl Reply for Vec<String> {
    fn from_resp(value: RespValue) -> Option<Self> {
        match value {
            RespValue::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    RespValue::Simple(data) | RespValue::Bulk(Some(data)) => {
                        String::from_utf8(data).ok()
                    }
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_strings_from_simple_and_bulk() {
        assert_eq!(String::from_resp(RespValue::Simple(b"OK".to_vec())), Some("OK".into()));
        assert_eq!(
            String::from_resp(RespValue::Bulk(Some(b"hi".to_vec()))),
            Some("hi".into())
        );
        assert_eq!(String::from_resp(RespValue::Bulk(None)), None);
        assert_eq!(String::from_resp(RespValue::Integer(1)), None);
    }

    #[test]
    fn decodes_optional_strings() {
        assert_eq!(Option::<String>::from_resp(RespValue::Bulk(None)), Some(None));
        assert_eq!(
            Option::<String>::from_resp(RespValue::Bulk(Some(b"v".to_vec()))),
            Some(Some("v".into()))
        );
    }

    #[test]
    fn decodes_integers() {
        assert_eq!(i64::from_resp(RespValue::Integer(-3)), Some(-3));
        assert_eq!(i64::from_resp(RespValue::Simple(b"OK".to_vec())), None);
    }

    #[test]
    fn decodes_string_arrays() {
        let value = RespValue::Array(vec![
            RespValue::Bulk(Some(b"a".to_vec())),
            RespValue::Bulk(Some(b"b".to_vec())),
        ]);
        assert_eq!(Vec::<String>::from_resp(value), Some(vec!["a".into(), "b".into()]));
        assert_eq!(
            Vec::<String>::from_resp(RespValue::Array(vec![RespValue::Integer(1)])),
            None
        );
    }

    #[test]
    fn raw_and_unit_accept_anything() {
        assert!(RespValue::from_resp(RespValue::Integer(9)).is_some());
        assert_eq!(<()>::from_resp(RespValue::Bulk(None)), Some(()));
    }
}
