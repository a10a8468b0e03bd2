//! A framed connection over a TCP stream.

use rmpv::Value;
use snafu::ResultExt;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::address::Address;
use crate::error::{ConnectSnafu, Result};
use crate::proto::codec;

/// Read half of a framed connection.
#[derive(Debug)]
pub struct MessageReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    /// Wrap a raw reader.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next message; `None` on clean close.
    pub async fn recv(&mut self) -> Result<Option<Vec<Value>>> {
        codec::read_message(&mut self.inner).await
    }
}

/// Write half of a framed connection.
#[derive(Debug)]
pub struct MessageWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    /// Wrap a raw writer.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one message with the given frames.
    pub async fn send(&mut self, frames: &[Value]) -> Result<()> {
        codec::write_message(&mut self.inner, frames).await
    }
}

/// A framed, addressable TCP connection.
///
/// Tracks whether an I/O error has occurred so a pool never hands a broken
/// connection back out.
#[derive(Debug)]
pub struct Connection {
    reader: MessageReader<BufReader<OwnedReadHalf>>,
    writer: MessageWriter<OwnedWriteHalf>,
    peer: Address,
    broken: bool,
}

impl Connection {
    /// Dial a peer.
    pub async fn connect(peer: &Address) -> Result<Self> {
        let stream = TcpStream::connect(peer.host_port())
            .await
            .context(ConnectSnafu { address: peer.to_string() })?;
        Ok(Self::from_stream(stream, peer.clone()))
    }

    /// Wrap an already established stream.
    pub fn from_stream(stream: TcpStream, peer: Address) -> Self {
        let (read, write) = stream.into_split();
        Self {
            reader: MessageReader::new(BufReader::new(read)),
            writer: MessageWriter::new(write),
            peer,
            broken: false,
        }
    }

    /// The remote address this connection is keyed under.
    pub fn peer(&self) -> &Address {
        &self.peer
    }

    /// Whether an I/O error has rendered the connection unusable.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Send one message.
    pub async fn send(&mut self, frames: &[Value]) -> Result<()> {
        let result = self.writer.send(frames).await;
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    /// Receive one message; `None` on clean close.
    pub async fn recv(&mut self) -> Result<Option<Vec<Value>>> {
        let result = self.reader.recv().await;
        match &result {
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => self.broken = true,
        }
        result
    }

    /// Split into independently owned read and write halves.
    pub fn into_split(
        self,
    ) -> (MessageReader<BufReader<OwnedReadHalf>>, MessageWriter<OwnedWriteHalf>) {
        (self.reader, self.writer)
    }
}
