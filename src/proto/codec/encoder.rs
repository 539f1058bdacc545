use bytes::{BufMut, BytesMut};

use crate::proto::frame::Frame;

/// A RESP encoder that converts [`Frame`] types to bytes.
///
/// Frames accumulate in an internal buffer so a batch can be written with a
/// single syscall.
///
/// # Example
///
/// ```
/// use slotmux::proto::codec::Encoder;
/// use slotmux::proto::frame::Frame;
///
/// let mut encoder = Encoder::new();
/// encoder.encode(&Frame::SimpleString(b"OK".to_vec()));
/// assert_eq!(&encoder.take()[..], b"+OK\r\n");
/// ```
#[derive(Debug, Default)]
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    /// Creates a new encoder with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the RESP encoding of `frame` to the buffer.
    pub fn encode(&mut self, frame: &Frame) {
        write_frame(&mut self.buf, frame);
    }

    /// Takes the encoded data, leaving the encoder empty and reusable.
    pub fn take(&mut self) -> BytesMut {
        self.buf.split()
    }
}

fn write_frame(buf: &mut BytesMut, frame: &Frame) {
    match frame {
        Frame::SimpleString(s) => write_line(buf, b'+', s),
        Frame::Error(e) => write_line(buf, b'-', e),
        Frame::Integer(n) => write_line(buf, b':', n.to_string().as_bytes()),
        Frame::BulkString(Some(data)) => {
            write_line(buf, b'$', data.len().to_string().as_bytes());
            buf.extend_from_slice(data);
            buf.extend_from_slice(b"\r\n");
        }
        Frame::BulkString(None) => buf.extend_from_slice(b"$-1\r\n"),
        Frame::Array(items) => {
            write_line(buf, b'*', items.len().to_string().as_bytes());
            for item in items {
                write_frame(buf, item);
            }
        }
        Frame::Null => buf.extend_from_slice(b"*-1\r\n"),
    }
}

fn write_line(buf: &mut BytesMut, prefix: u8, body: &[u8]) {
    buf.reserve(body.len() + 3);
    buf.put_u8(prefix);
    buf.extend_from_slice(body);
    buf.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn encoded(frame: Frame) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.encode(&frame);
        encoder.take().to_vec()
    }

    #[test]
    fn test_encode_scalars() {
        assert_eq!(encoded(Frame::SimpleString(b"OK".to_vec())), b"+OK\r\n");
        assert_eq!(encoded(Frame::Error(b"ERR".to_vec())), b"-ERR\r\n");
        assert_eq!(encoded(Frame::Integer(-42)), b":-42\r\n");
    }

    #[test]
    fn test_encode_bulk_strings() {
        assert_eq!(
            encoded(Frame::BulkString(Some(Bytes::from("hello")))),
            b"$5\r\nhello\r\n"
        );
        assert_eq!(encoded(Frame::BulkString(Some(Bytes::new()))), b"$0\r\n\r\n");
        assert_eq!(encoded(Frame::BulkString(None)), b"$-1\r\n");
    }

    #[test]
    fn test_encode_command_array() {
        let frame = Frame::Array(vec![Frame::bulk("CLUSTER"), Frame::bulk("SLOTS")]);
        assert_eq!(encoded(frame), b"*2\r\n$7\r\nCLUSTER\r\n$5\r\nSLOTS\r\n");
        assert_eq!(encoded(Frame::Null), b"*-1\r\n");
    }

    #[test]
    fn test_take_resets_buffer() {
        let mut encoder = Encoder::new();
        encoder.encode(&Frame::Integer(1));
        encoder.encode(&Frame::Integer(2));
        assert_eq!(&encoder.take()[..], b":1\r\n:2\r\n");
        assert!(encoder.take().is_empty());
    }
}
