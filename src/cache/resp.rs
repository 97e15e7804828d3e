/// RESP2 encoding and incremental parsing for the Redis client

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::str;

#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    SimpleString(String),
    Error(String),
    Integer(i64),
    /// `None` is the null bulk string.
    BulkString(Option<Bytes>),
    /// `None` is the null array.
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Text of a simple or bulk string.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::SimpleString(s) => Some(s.clone()),
            Self::BulkString(Some(data)) => str::from_utf8(data).ok().map(str::to_string),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            Self::BulkString(Some(_)) | Self::SimpleString(_) => self.as_text()?.parse().ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::BulkString(None) | Self::Array(None))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RespParseError {
    #[error("Invalid RESP format: {0}")]
    InvalidFormat(String),
    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(#[from] str::Utf8Error),
    #[error("Invalid integer: {0}")]
    InvalidInteger(#[from] std::num::ParseIntError),
}

/// Redis' own `proto-max-bulk-len`.
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;
/// Redis' own `proto-max-multibulk-len` default.
pub const MAX_ARRAY_LEN: i64 = 1024 * 1024;

pub struct RespParser;

impl RespParser {
    /// Take one complete value off the front of `buf`. Leaves `buf` untouched
    /// and returns `None` when more bytes are needed.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<RespValue>, RespParseError> {
        match Self::parse_at(buf, 0)? {
            Some((value, consumed)) => {
                buf.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn parse_at(buf: &[u8], pos: usize) -> Result<Option<(RespValue, usize)>, RespParseError> {
        let (line, next) = match Self::line_at(buf, pos) {
            Some(found) => found,
            None => return Ok(None),
        };
        if line.is_empty() {
            return Err(RespParseError::InvalidFormat("empty line".to_string()));
        }
        let body = &line[1..];

        match line[0] {
            b'+' => Ok(Some((RespValue::SimpleString(str::from_utf8(body)?.to_string()), next))),
            b'-' => Ok(Some((RespValue::Error(str::from_utf8(body)?.to_string()), next))),
            b':' => Ok(Some((RespValue::Integer(str::from_utf8(body)?.parse()?), next))),
            b'$' => {
                let size: i64 = str::from_utf8(body)?.parse()?;
                if size == -1 {
                    return Ok(Some((RespValue::BulkString(None), next)));
                }
                if !(0..=MAX_BULK_LEN).contains(&size) {
                    return Err(RespParseError::InvalidFormat(format!("Invalid bulk string size {}", size)));
                }
                let end = next + size as usize;
                if buf.len() < end + 2 {
                    return Ok(None);
                }
                if &buf[end..end + 2] != b"\r\n" {
                    return Err(RespParseError::InvalidFormat(
                        "Missing \\r\\n after bulk string".to_string(),
                    ));
                }
                let data = Bytes::copy_from_slice(&buf[next..end]);
                Ok(Some((RespValue::BulkString(Some(data)), end + 2)))
            }
            b'*' => {
                let size: i64 = str::from_utf8(body)?.parse()?;
                if size == -1 {
                    return Ok(Some((RespValue::Array(None), next)));
                }
                if !(0..=MAX_ARRAY_LEN).contains(&size) {
                    return Err(RespParseError::InvalidFormat(format!("Invalid array size {}", size)));
                }
                // Every element takes at least three bytes on the wire.
                let mut elements = Vec::with_capacity((size as usize).min(buf.len().saturating_sub(next) / 3));
                let mut cursor = next;
                for _ in 0..size {
                    match Self::parse_at(buf, cursor)? {
                        Some((element, after)) => {
                            elements.push(element);
                            cursor = after;
                        }
                        None => return Ok(None),
                    }
                }
                Ok(Some((RespValue::Array(Some(elements)), cursor)))
            }
            other => Err(RespParseError::InvalidFormat(format!(
                "Unknown RESP type: {}",
                other as char
            ))),
        }
    }

    /// Line starting at `pos` without its `\r\n`, plus the offset after it.
    fn line_at(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
        let rest = buf.get(pos..)?;
        rest.windows(2)
            .position(|w| w == b"\r\n")
            .map(|i| (&rest[..i], pos + i + 2))
    }
}

pub struct RespEncoder;

impl RespEncoder {
    pub fn encode(value: &RespValue) -> Bytes {
        let mut buf = BytesMut::new();
        Self::encode_into(&mut buf, value);
        buf.freeze()
    }

    pub fn encode_into(buf: &mut BytesMut, value: &RespValue) {
        match value {
            RespValue::SimpleString(s) => {
                buf.put_u8(b'+');
                buf.extend_from_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::Error(s) => {
                buf.put_u8(b'-');
                buf.extend_from_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::Integer(n) => {
                buf.put_u8(b':');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::BulkString(Some(data)) => {
                buf.put_u8(b'$');
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                buf.extend_from_slice(data);
                buf.put_slice(b"\r\n");
            }
            RespValue::BulkString(None) => buf.extend_from_slice(b"$-1\r\n"),
            RespValue::Array(Some(elements)) => {
                buf.put_u8(b'*');
                buf.extend_from_slice(elements.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                for element in elements {
                    Self::encode_into(buf, element);
                }
            }
            RespValue::Array(None) => buf.extend_from_slice(b"*-1\r\n"),
        }
    }

    /// A command is an array of bulk strings.
    pub fn create_command<S: AsRef<str>>(command: &str, args: &[S]) -> RespValue {
        let mut elements = Vec::with_capacity(args.len() + 1);
        elements.push(RespValue::BulkString(Some(Bytes::copy_from_slice(command.as_bytes()))));
        for arg in args {
            elements.push(RespValue::BulkString(Some(Bytes::copy_from_slice(arg.as_ref().as_bytes()))));
        }
        RespValue::Array(Some(elements))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scalars() {
        let mut buf = BytesMut::from("+OK\r\n:42\r\n-ERR nope\r\n$-1\r\n");
        assert_eq!(RespParser::parse(&mut buf).unwrap(), Some(RespValue::SimpleString("OK".to_string())));
        assert_eq!(RespParser::parse(&mut buf).unwrap(), Some(RespValue::Integer(42)));
        assert_eq!(RespParser::parse(&mut buf).unwrap(), Some(RespValue::Error("ERR nope".to_string())));
        assert_eq!(RespParser::parse(&mut buf).unwrap(), Some(RespValue::BulkString(None)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_array_is_left_in_place() {
        let full = b"*3\r\n$7\r\nmessage\r\n$14\r\ntrip:1:updates\r\n$2\r\n{}\r\n";
        let mut buf = BytesMut::from(&full[..full.len() - 3]);
        assert_eq!(RespParser::parse(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), full.len() - 3);

        buf.extend_from_slice(&full[full.len() - 3..]);
        let value = RespParser::parse(&mut buf).unwrap().unwrap();
        match value {
            RespValue::Array(Some(items)) => {
                assert_eq!(items[1].as_text().as_deref(), Some("trip:1:updates"));
                assert_eq!(items[2].as_text().as_deref(), Some("{}"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_lengths_are_rejected() {
        for frame in ["$536870913\r\n", "$9223372036854775807\r\n", "*1048577\r\n", "$-2\r\n"] {
            let mut buf = BytesMut::from(frame);
            assert!(
                matches!(RespParser::parse(&mut buf), Err(RespParseError::InvalidFormat(_))),
                "{} was accepted",
                frame.trim_end()
            );
        }

        // A large but legal declared size just waits for more bytes.
        let mut buf = BytesMut::from("*1048576\r\n:1\r\n");
        assert_eq!(RespParser::parse(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_encode_command() {
        let command = RespEncoder::create_command("SET", &["key", "value"]);
        assert_eq!(
            RespEncoder::encode(&command),
            Bytes::from("*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n")
        );
    }
}
