use bytes::{Bytes, BytesMut};

use crate::proto::error::DecodeError;
use crate::proto::frame::Frame;

const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// Deepest array nesting accepted from the wire.
const MAX_DEPTH: usize = 128;

/// A streaming RESP decoder.
///
/// Call [`append`](Decoder::append) with bytes read from the socket, then
/// [`decode`](Decoder::decode) until it returns `Ok(None)`. Nothing is
/// consumed from the buffer until a whole frame is available, so a frame
/// split across reads is never lost.
///
/// Frame boundaries are checked before anything is copied, and once a scan
/// knows how many bytes the frame needs at least, later calls return early
/// until that many are buffered.
///
/// # Example
///
/// ```
/// use slotmux::proto::codec::Decoder;
/// use slotmux::proto::frame::Frame;
///
/// let mut decoder = Decoder::new();
/// decoder.append(b"+OK\r\n");
/// let frame = decoder.decode().unwrap().unwrap();
/// assert_eq!(frame, Frame::SimpleString(b"OK".to_vec()));
/// ```
#[derive(Debug)]
pub struct Decoder {
    buf: BytesMut,
    max_frame_size: usize,
    /// Buffer length below which the pending frame cannot be complete.
    needed: usize,
}

impl Decoder {
    /// Creates a new decoder with an empty buffer.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Creates a decoder that rejects frames larger than `max_frame_size` bytes.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_size,
            needed: 0,
        }
    }

    /// Appends raw bytes to the internal buffer.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Attempts to decode one frame.
    ///
    /// Returns `Ok(None)` when the buffer holds only part of a frame.
    pub fn decode(&mut self) -> Result<Option<Frame>, DecodeError> {
        if self.buf.is_empty() || self.buf.len() < self.needed {
            return Ok(None);
        }
        match frame_end(&self.buf, 0, self.max_frame_size, 0)? {
            Scan::Complete(end) => {
                self.needed = 0;
                let data = self.buf.split_to(end).freeze();
                let (frame, _) = build(&data, 0)?;
                Ok(Some(frame))
            }
            Scan::Incomplete(_) if self.buf.len() > self.max_frame_size => Err(
                DecodeError::new("buffered data exceeds maximum frame size"),
            ),
            Scan::Incomplete(needed) => {
                self.needed = needed;
                Ok(None)
            }
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

enum Scan {
    /// The frame ends just before this index.
    Complete(usize),
    /// The frame needs at least this many buffered bytes.
    Incomplete(usize),
}

/// Finds where the frame starting at `pos` ends without copying anything.
fn frame_end(buf: &[u8], pos: usize, max: usize, depth: usize) -> Result<Scan, DecodeError> {
    if depth > MAX_DEPTH {
        return Err(DecodeError::new("array nesting too deep"));
    }
    let Some((line, next)) = read_line(buf, pos + 1) else {
        return Ok(Scan::Incomplete(buf.len() + 1));
    };
    match buf[pos] {
        b'+' | b'-' => Ok(Scan::Complete(next)),
        b':' => parse_int(line).map(|_| Scan::Complete(next)),
        b'$' => {
            let len = parse_int(line)?;
            if len == -1 {
                return Ok(Scan::Complete(next));
            }
            let end = next + checked_len(len, max, "bulk string")? + 2;
            if buf.len() < end {
                return Ok(Scan::Incomplete(end));
            }
            if &buf[end - 2..end] != b"\r\n" {
                return Err(DecodeError::new("bulk string missing terminator"));
            }
            Ok(Scan::Complete(end))
        }
        b'*' => {
            let len = parse_int(line)?;
            if len == -1 {
                return Ok(Scan::Complete(next));
            }
            // every element needs at least 3 bytes on the wire
            let len = checked_len(len, max / 3, "array")?;
            let mut cursor = next;
            for _ in 0..len {
                match frame_end(buf, cursor, max, depth + 1)? {
                    Scan::Complete(after) => cursor = after,
                    incomplete => return Ok(incomplete),
                }
            }
            Ok(Scan::Complete(cursor))
        }
        other => Err(DecodeError::new(format!(
            "unknown frame type: {:?}",
            other as char
        ))),
    }
}

/// Builds the frame at `pos` of a buffer [`frame_end`] has accepted.
///
/// Bulk strings share `data` instead of being copied.
fn build(data: &Bytes, pos: usize) -> Result<(Frame, usize), DecodeError> {
    let (line, next) = read_line(data, pos + 1)
        .ok_or_else(|| DecodeError::new("frame truncated after validation"))?;
    let frame = match data[pos] {
        b'+' => Frame::SimpleString(line.to_vec()),
        b'-' => Frame::Error(line.to_vec()),
        b':' => Frame::Integer(parse_int(line)?),
        b'$' => match usize::try_from(parse_int(line)?) {
            Ok(len) => {
                let bulk = data.slice(next..next + len);
                return Ok((Frame::BulkString(Some(bulk)), next + len + 2));
            }
            Err(_) => Frame::BulkString(None),
        },
        b'*' => match usize::try_from(parse_int(line)?) {
            Ok(len) => {
                let mut items = Vec::with_capacity(len.min(1024));
                let mut cursor = next;
                for _ in 0..len {
                    let (item, after) = build(data, cursor)?;
                    items.push(item);
                    cursor = after;
                }
                return Ok((Frame::Array(items), cursor));
            }
            Err(_) => Frame::Null,
        },
        other => {
            return Err(DecodeError::new(format!(
                "unknown frame type: {:?}",
                other as char
            )))
        }
    };
    Ok((frame, next))
}

/// Finds the line starting at `from`, returning it without CRLF and the index after CRLF.
fn read_line(buf: &[u8], from: usize) -> Option<(&[u8], usize)> {
    if from > buf.len() {
        return None;
    }
    buf[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| (&buf[from..from + i], from + i + 2))
}

fn parse_int(line: &[u8]) -> Result<i64, DecodeError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| DecodeError::new("invalid integer"))
}

fn checked_len(len: i64, max: usize, what: &str) -> Result<usize, DecodeError> {
    match usize::try_from(len) {
        Ok(len) if len <= max => Ok(len),
        Ok(_) => Err(DecodeError::new(format!(
            "{} length exceeds maximum frame size",
            what
        ))),
        Err(_) => Err(DecodeError::new(format!("negative {} length", what))),
    }
}
