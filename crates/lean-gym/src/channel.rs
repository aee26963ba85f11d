//! Line transport to and from the lean-gym process.
//!
//! Outbound lines go through [`LineChannel`] on the caller's own task.
//! Inbound lines are read by a single [`MessagePump`] task that feeds an
//! unbounded queue, so a caller never blocks on the pipe itself, only on
//! the queue.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::types::LeanGymError;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write half of the transport.
///
/// Any write failure is terminal: the channel marks itself closed and every
/// later write fails without touching the pipe.
pub struct LineChannel {
    writer: BufWriter<BoxedWriter>,
    closed: bool,
}

impl LineChannel {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: BufWriter::new(Box::new(writer) as BoxedWriter),
            closed: false,
        }
    }

    /// Write `line` plus a newline and flush immediately.
    pub async fn write_line(&mut self, line: &str) -> Result<(), LeanGymError> {
        if self.closed {
            return Err(LeanGymError::Transport("lean-gym input is closed".into()));
        }

        let written = async {
            self.writer.write_all(line.as_bytes()).await?;
            self.writer.write_all(b"\n").await?;
            self.writer.flush().await
        }
        .await;

        written.map_err(|e| {
            self.closed = true;
            LeanGymError::Transport(format!("lean-gym process unexpectedly quit: {e}"))
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close the input stream. lean-gym exits when it sees EOF on stdin.
    pub async fn shutdown(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.writer.shutdown().await;
        }
    }
}

/// Background task draining lean-gym's output into a queue.
///
/// Constructing a pump consumes the reader, so a pump can only be started
/// once per stream.
pub struct MessagePump {
    handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl MessagePump {
    /// Spawn the pump. Returns the pump and the consumer end of its queue.
    ///
    /// The queue closes when the pump stops, for whichever reason.
    pub fn start<R>(reader: R, cancel: CancellationToken) -> (Self, UnboundedReceiver<String>)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(pump_lines(reader, tx, cancel.clone()));
        (
            Self {
                handle: Some(handle),
                cancel,
            },
            rx,
        )
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Signal the pump to stop and wait for it to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Message pump task failed");
            }
        }
    }
}

impl Drop for MessagePump {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn pump_lines<R>(reader: R, tx: UnboundedSender<String>, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);

    loop {
        let mut line = String::new();
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("Message pump cancelled");
                break;
            }
            read = reader.read_line(&mut line) => read,
        };

        match read {
            Ok(0) => {
                tracing::debug!("lean-gym output closed");
                break;
            }
            Ok(_) => {
                // lean-gym never emits blank lines; one means the stream is done.
                if line.trim().is_empty() {
                    tracing::debug!("Empty line from lean-gym, stopping pump");
                    break;
                }
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                tracing::warn!(error = %e, "Skipping non UTF-8 line from lean-gym");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Reading lean-gym output failed");
                break;
            }
        }
    }
}
