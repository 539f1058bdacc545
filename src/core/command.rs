use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;

use crate::proto::frame::Frame;
use crate::{Error, Result};

/// A command ready to be sent to Redis.
///
/// # Example
///
/// ```
/// use slotmux::core::command::{Cmd, get};
///
/// let cmd = Cmd::new("SET").arg("key").arg("value");
/// assert_eq!(cmd.name(), b"SET");
/// let get_cmd = get("key");
/// ```
#[derive(Debug, Clone)]
pub struct Cmd {
    args: Vec<Bytes>,
}

impl Cmd {
    /// Creates a new command with the given name.
    #[inline]
    pub fn new(name: impl Into<Bytes>) -> Self {
        Self {
            args: vec![name.into()],
        }
    }

    /// Appends an argument to the command.
    #[inline]
    pub fn arg<T: Into<Bytes>>(mut self, arg: T) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends every item of `args`.
    #[inline]
    pub fn args<I, T>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Returns the command name.
    #[inline]
    pub fn name(&self) -> &[u8] {
        &self.args[0]
    }

    /// Converts the command to a RESP Array frame.
    #[inline]
    pub fn into_frame(self) -> Frame {
        Frame::Array(
            self.args
                .into_iter()
                .map(|b| Frame::BulkString(Some(b)))
                .collect(),
        )
    }
}

/// Creates a PING command.
#[inline]
pub fn ping() -> Cmd {
    Cmd::new("PING")
}

/// Creates an ECHO command.
#[inline]
pub fn echo(msg: impl Into<Bytes>) -> Cmd {
    Cmd::new("ECHO").arg(msg)
}

/// Creates a RANDOMKEY command.
#[inline]
pub fn randomkey() -> Cmd {
    Cmd::new("RANDOMKEY")
}

/// Creates a DBSIZE command.
#[inline]
pub fn dbsize() -> Cmd {
    Cmd::new("DBSIZE")
}

/// Creates a FLUSHDB command.
#[inline]
pub fn flushdb() -> Cmd {
    Cmd::new("FLUSHDB")
}

/// Creates an INFO command.
#[inline]
pub fn info() -> Cmd {
    Cmd::new("INFO")
}

/// Creates a GET command.
#[inline]
pub fn get(key: impl Into<Bytes>) -> Cmd {
    Cmd::new("GET").arg(key)
}

/// Creates a SET command.
#[inline]
pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Cmd {
    Cmd::new("SET").arg(key).arg(value)
}

/// Creates a SET command with a relative expiry in seconds.
#[inline]
pub fn set_with_expiry(key: impl Into<Bytes>, value: impl Into<Bytes>, expiry: Duration) -> Cmd {
    Cmd::new("SET")
        .arg(key)
        .arg(value)
        .arg("EX")
        .arg(expiry.as_secs().max(1).to_string())
}

/// Creates a DEL command.
#[inline]
pub fn del<I: IntoIterator<Item = Bytes>>(keys: I) -> Cmd {
    Cmd::new("DEL").args(keys)
}

/// Creates an EXISTS command.
#[inline]
pub fn exists<I: IntoIterator<Item = Bytes>>(keys: I) -> Cmd {
    Cmd::new("EXISTS").args(keys)
}

/// Creates an INCRBY command.
#[inline]
pub fn incr_by(key: impl Into<Bytes>, amount: i64) -> Cmd {
    Cmd::new("INCRBY").arg(key).arg(amount.to_string())
}

/// Creates a DECRBY command.
#[inline]
pub fn decr_by(key: impl Into<Bytes>, amount: i64) -> Cmd {
    Cmd::new("DECRBY").arg(key).arg(amount.to_string())
}

/// Creates a MGET command.
#[inline]
pub fn mget<I: IntoIterator<Item = Bytes>>(keys: I) -> Cmd {
    Cmd::new("MGET").args(keys)
}

/// Creates a MSET command.
#[inline]
pub fn mset<I: IntoIterator<Item = (Bytes, Bytes)>>(pairs: I) -> Cmd {
    pairs
        .into_iter()
        .fold(Cmd::new("MSET"), |cmd, (key, value)| cmd.arg(key).arg(value))
}

/// Creates an EXPIRE command.
#[inline]
pub fn expire(key: impl Into<Bytes>, ttl: Duration) -> Cmd {
    Cmd::new("EXPIRE").arg(key).arg(ttl.as_secs().to_string())
}

/// Creates a TTL command.
#[inline]
pub fn ttl(key: impl Into<Bytes>) -> Cmd {
    Cmd::new("TTL").arg(key)
}

/// Creates a SADD command.
#[inline]
pub fn sadd<I: IntoIterator<Item = Bytes>>(key: impl Into<Bytes>, members: I) -> Cmd {
    Cmd::new("SADD").arg(key).args(members)
}

/// Creates a SMEMBERS command.
#[inline]
pub fn smembers(key: impl Into<Bytes>) -> Cmd {
    Cmd::new("SMEMBERS").arg(key)
}

/// Creates a SORT command with default (numeric, ascending) ordering.
#[inline]
pub fn sort(key: impl Into<Bytes>) -> Cmd {
    Cmd::new("SORT").arg(key)
}

/// Creates an AUTH command with password only.
#[inline]
pub fn auth(password: impl Into<Bytes>) -> Cmd {
    Cmd::new("AUTH").arg(password)
}

/// Creates an AUTH command with username and password (ACL style).
#[inline]
pub fn auth_with_username(username: impl Into<Bytes>, password: impl Into<Bytes>) -> Cmd {
    Cmd::new("AUTH").arg(username).arg(password)
}

fn server_error(e: &[u8]) -> Error {
    Error::Server {
        message: String::from_utf8_lossy(e).into_owned(),
    }
}

fn unexpected(frame: &Frame, expected: &str) -> Error {
    Error::Protocol {
        message: format!("expected {}, got {:?}", expected, frame),
    }
}

/// Converts a `+OK` style status reply.
#[inline]
pub fn frame_to_ok(frame: Frame) -> Result<bool> {
    match frame {
        Frame::SimpleString(s) => Ok(s.eq_ignore_ascii_case(b"OK")),
        Frame::Error(e) => Err(server_error(&e)),
        other => Err(unexpected(&other, "status reply")),
    }
}

/// Converts a bulk string reply; null maps to `None`.
#[inline]
pub fn frame_to_bytes(frame: Frame) -> Result<Option<Bytes>> {
    match frame {
        Frame::BulkString(b) => Ok(b),
        Frame::SimpleString(s) => Ok(Some(Bytes::from(s))),
        Frame::Null => Ok(None),
        Frame::Error(e) => Err(server_error(&e)),
        other => Err(unexpected(&other, "bulk string")),
    }
}

/// Converts an integer reply.
#[inline]
pub fn frame_to_int(frame: Frame) -> Result<i64> {
    match frame {
        Frame::Integer(i) => Ok(i),
        Frame::Error(e) => Err(server_error(&e)),
        other => Err(unexpected(&other, "integer")),
    }
}

/// Converts an integer reply to a boolean (non-zero is true).
#[inline]
pub fn frame_to_bool(frame: Frame) -> Result<bool> {
    frame_to_int(frame).map(|n| n != 0)
}

/// Converts an array reply of bulk strings, keeping nulls.
#[inline]
pub fn frame_to_vec_bytes(frame: Frame) -> Result<Vec<Option<Bytes>>> {
    match frame {
        Frame::Array(items) => items.into_iter().map(frame_to_bytes).collect(),
        Frame::Null => Ok(Vec::new()),
        Frame::Error(e) => Err(server_error(&e)),
        other => Err(unexpected(&other, "array")),
    }
}

/// Converts an array reply of bulk strings, dropping nulls.
#[inline]
pub fn frame_to_members(frame: Frame) -> Result<Vec<Bytes>> {
    Ok(frame_to_vec_bytes(frame)?.into_iter().flatten().collect())
}

/// Parses an INFO reply into `field -> value`.
///
/// Section headers (`# Server`) and blank lines are skipped.
pub fn frame_to_info(frame: Frame) -> Result<HashMap<String, String>> {
    let body = frame_to_bytes(frame)?.unwrap_or_default();
    let text = String::from_utf8_lossy(&body);
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect())
}
