use bytes::Bytes;

/// A RESP2 frame.
///
/// Requests are always arrays of bulk strings; replies may be any variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Simple string (+OK).
    SimpleString(Vec<u8>),
    /// Error (-ERR).
    Error(Vec<u8>),
    /// Integer (:1000).
    Integer(i64),
    /// Bulk string ($6\r\nfoobar). `None` is the null bulk string.
    BulkString(Option<Bytes>),
    /// Array (*2\r\n...).
    Array(Vec<Frame>),
    /// Null array (*-1).
    Null,
}

impl Frame {
    /// Builds a bulk string frame.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Frame::BulkString(Some(data.into()))
    }

    /// Builds a simple string frame.
    pub fn simple(text: &str) -> Self {
        Frame::SimpleString(text.as_bytes().to_vec())
    }

    /// Builds an error frame.
    pub fn error(text: &str) -> Self {
        Frame::Error(text.as_bytes().to_vec())
    }

    /// Returns the payload of a simple or bulk string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Frame::SimpleString(s) => Some(s),
            Frame::BulkString(Some(b)) => Some(b),
            _ => None,
        }
    }

    /// Returns the payload of a simple or bulk string as UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Returns true for both null encodings.
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null | Frame::BulkString(None))
    }
}
