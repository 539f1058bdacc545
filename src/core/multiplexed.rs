use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, instrument};

use crate::core::connection::{Connection, ConnectionReader, ConnectionWriter};
use crate::proto::frame::Frame;
use crate::{Error, Result};

type ReplyTx = oneshot::Sender<Result<Vec<Frame>>>;

/// A batch of frames written back to back, answered by as many replies.
struct Request {
    frames: Vec<Frame>,
    response_tx: ReplyTx,
}

/// Reply slot handed from the writer task to the reader task.
struct Waiter {
    expected: usize,
    response_tx: ReplyTx,
}

/// A handle to a multiplexed connection.
///
/// Cheap to clone and shared by every task routing to the same node. One
/// writer task serializes requests onto the socket and one reader task
/// hands replies back in FIFO order. A batch sent with
/// [`send_pipeline`](Self::send_pipeline) is written contiguously, so no
/// other caller's command can land between its frames.
#[derive(Clone)]
pub struct MultiplexedConnection {
    sender: mpsc::Sender<Request>,
    read_timeout: Option<Duration>,
}

impl MultiplexedConnection {
    /// Starts the reader and writer tasks for `connection`.
    ///
    /// # Arguments
    ///
    /// * `connection` - The connection to multiplex (handshake already done).
    /// * `queue_size` - The maximum number of queued requests.
    /// * `read_timeout` - How long a caller waits for its reply.
    pub fn new<S>(
        connection: Connection<S>,
        queue_size: usize,
        read_timeout: Option<Duration>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = connection.split();
        let (request_tx, request_rx) = mpsc::channel(queue_size);
        let (waiter_tx, waiter_rx) = mpsc::channel(queue_size);

        tokio::spawn(run_writer(writer, request_rx, waiter_tx));
        tokio::spawn(run_reader(reader, waiter_rx));

        Self {
            sender: request_tx,
            read_timeout,
        }
    }

    /// Sends one command and awaits its reply.
    pub async fn send_command(&self, frame: Frame) -> Result<Frame> {
        let mut replies = self.send_pipeline(vec![frame]).await?;
        replies
            .pop()
            .ok_or_else(|| Error::protocol("missing reply"))
    }

    /// Sends several commands as one uninterrupted batch and awaits all replies.
    #[instrument(skip(self, frames), fields(count = frames.len()), level = "debug")]
    pub async fn send_pipeline(&self, frames: Vec<Frame>) -> Result<Vec<Frame>> {
        let (response_tx, response_rx) = oneshot::channel();
        let request = Request {
            frames,
            response_tx,
        };

        self.sender
            .send(request)
            .await
            .map_err(|_| Error::connection_closed())?;

        let reply = match self.read_timeout {
            Some(limit) => tokio::time::timeout(limit, response_rx)
                .await
                .map_err(|_| Error::Io {
                    source: std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out"),
                })?,
            None => response_rx.await,
        };
        reply.map_err(|_| Error::connection_closed())?
    }

    /// Returns true once the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl fmt::Debug for MultiplexedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiplexedConnection")
            .field("closed", &self.is_closed())
            .field("read_timeout", &self.read_timeout)
            .finish()
    }
}

async fn run_writer<S>(
    mut writer: ConnectionWriter<S>,
    mut request_rx: mpsc::Receiver<Request>,
    waiter_tx: mpsc::Sender<Waiter>,
) where
    S: AsyncRead + AsyncWrite,
{
    while let Some(req) = request_rx.recv().await {
        // the caller gave up before we got to it
        if req.response_tx.is_closed() {
            continue;
        }
        debug!(count = req.frames.len(), "writing frames");
        if let Err(e) = writer.write_frames(&req.frames).await {
            error!(error = ?e, "failed to write frames");
            let _ = req.response_tx.send(Err(Error::Io { source: e }));
            return;
        }
        let waiter = Waiter {
            expected: req.frames.len(),
            response_tx: req.response_tx,
        };
        if waiter_tx.send(waiter).await.is_err() {
            return;
        }
    }
}

async fn run_reader<S>(mut reader: ConnectionReader<S>, mut waiter_rx: mpsc::Receiver<Waiter>)
where
    S: AsyncRead + AsyncWrite,
{
    while let Some(waiter) = waiter_rx.recv().await {
        let mut replies = Vec::with_capacity(waiter.expected);
        for _ in 0..waiter.expected {
            match reader.read_frame().await {
                Ok(frame) => replies.push(frame),
                Err(e) => {
                    error!(error = ?e, "failed to read frame");
                    let _ = waiter.response_tx.send(Err(e));
                    return;
                }
            }
        }
        // a send error means the caller was cancelled; its replies are dropped
        let _ = waiter.response_tx.send(Ok(replies));
    }
}
