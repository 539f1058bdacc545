use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::proto::codec::{Decoder, Encoder};
use crate::proto::frame::Frame;
use crate::{Error, Result};

const READ_CHUNK: usize = 4096;

/// A RESP-framed connection to a Redis node over any async stream (TCP, TLS).
///
/// Used directly for the handshake (AUTH) and then [split](Connection::split)
/// into halves driven by the multiplexer tasks.
pub struct Connection<S> {
    stream: S,
    decoder: Decoder,
    encoder: Encoder,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a connected stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            decoder: Decoder::new(),
            encoder: Encoder::new(),
        }
    }

    /// Encodes and writes a frame.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.encoder.encode(frame);
        let data = self.encoder.take();
        self.stream.write_all(&data).await?;
        Ok(())
    }

    /// Reads the next complete frame.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        read_frame(&mut self.stream, &mut self.decoder).await
    }

    /// Splits the connection into independently owned read and write halves.
    ///
    /// Bytes already buffered by the decoder stay with the reader.
    pub fn split(self) -> (ConnectionReader<S>, ConnectionWriter<S>) {
        let (read, write) = tokio::io::split(self.stream);
        (
            ConnectionReader {
                stream: read,
                decoder: self.decoder,
            },
            ConnectionWriter {
                stream: write,
                encoder: self.encoder,
            },
        )
    }
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("buffered", &self.decoder.buffered())
            .finish()
    }
}

/// Read half of a split [`Connection`].
pub struct ConnectionReader<S> {
    stream: ReadHalf<S>,
    decoder: Decoder,
}

impl<S> ConnectionReader<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Reads the next complete frame.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        read_frame(&mut self.stream, &mut self.decoder).await
    }
}

/// Write half of a split [`Connection`].
pub struct ConnectionWriter<S> {
    stream: WriteHalf<S>,
    encoder: Encoder,
}

impl<S> ConnectionWriter<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Encodes `frames` back to back and writes them with one call.
    pub async fn write_frames(&mut self, frames: &[Frame]) -> std::io::Result<()> {
        for frame in frames {
            self.encoder.encode(frame);
        }
        let data = self.encoder.take();
        self.stream.write_all(&data).await?;
        self.stream.flush().await
    }
}

async fn read_frame<R>(stream: &mut R, decoder: &mut Decoder) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some(frame) = decoder.decode()? {
            return Ok(frame);
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::Io {
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                ),
            });
        }
        decoder.append(&chunk[..n]);
    }
}
