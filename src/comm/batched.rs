//! Interval-coalesced message sending.

use std::time::Duration;

use rmpv::Value;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::comm::connection::MessageWriter;
use crate::error::{Result, WorkerError};
use crate::proto::codec;

/// Default flush interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(2);

/// Coalesces outbound messages onto one connection.
///
/// Messages queue up and are written as one multi-frame wire message at most
/// once per interval, preserving FIFO order within and across batches. Closing
/// flushes whatever is still queued before the socket is released.
#[derive(Debug)]
pub struct BatchedSender {
    tx: mpsc::UnboundedSender<Value>,
    task: JoinHandle<()>,
}

impl BatchedSender {
    /// Start a batched sender over the given write half.
    pub fn new(writer: MessageWriter<OwnedWriteHalf>, interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_sender(writer, rx, interval));
        Self { tx, task }
    }

    /// Queue one message.
    ///
    /// Fails with [`WorkerError::SenderClosed`] once the sender has been
    /// closed or its connection has broken.
    pub fn send(&self, msg: Value) -> Result<()> {
        self.tx.send(msg).map_err(|_| WorkerError::SenderClosed)
    }

    /// Flush pending messages and release the socket.
    pub async fn close(self) {
        drop(self.tx);
        if let Err(err) = self.task.await {
            warn!(error = %err, "batched sender task panicked");
        }
    }

    /// Abandon the sender without flushing.
    pub fn abort(self) {
        self.task.abort();
    }
}

/// Sender loop.
///
/// Each batch opens when its first message arrives, accumulates for one
/// interval (or until the channel closes), and is then written as a single
/// wire message.
async fn run_sender(
    mut writer: MessageWriter<OwnedWriteHalf>,
    mut rx: mpsc::UnboundedReceiver<Value>,
    interval: Duration,
) {
    let mut batch: Vec<Value> = Vec::new();
    let mut closed = false;
    while !closed {
        match rx.recv().await {
            Some(msg) => batch.push(msg),
            None => break,
        }

        let deadline = tokio::time::sleep(interval);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                more = rx.recv() => match more {
                    Some(msg) => batch.push(msg),
                    None => {
                        closed = true;
                        break;
                    }
                },
            }
        }

        for chunk in batch.chunks(codec::MAX_FRAMES_PER_MESSAGE as usize) {
            if let Err(err) = writer.send(chunk).await {
                warn!(error = %err, "batched sender write failed, dropping stream");
                rx.close();
                return;
            }
        }
        debug!(messages = batch.len(), "flushed batch");
        batch.clear();
    }
}
