//! Byte-stream abstraction the session speaks over: `read`/`write`/`close`,
//! plus initiator-side `connect` with bounded retry/back-off.

use std::time::Duration;

use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
};

const DEFAULT_CONNECT_RETRIES: u32 = 5;
const DEFAULT_CONNECT_BACKOFF: Duration = Duration::from_secs(5);
const READ_CHUNK_SIZE: usize = 8192;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("connect cancelled")]
    Cancelled,

    #[error("failed to connect after {attempts} attempt(s): {source}")]
    ConnectFailed {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Returns the next chunk of bytes, or `Err(TransportError::Closed)` on
    /// disconnect. Never returns an empty chunk.
    async fn read(&mut self) -> Result<Vec<u8>, TransportError>;

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// TCP transport. `connect` is used by initiators; `from_stream` wraps an
/// already-accepted socket on the acceptor side.
pub struct TcpTransport {
    stream: TcpStream,
    cancel: mpsc::Receiver<()>,
    _cancel_tx: mpsc::Sender<()>,
}

impl TcpTransport {
    pub fn from_stream(stream: TcpStream) -> TcpTransport {
        let (cancel_tx, cancel) = mpsc::channel(1);
        TcpTransport {
            stream,
            cancel,
            _cancel_tx: cancel_tx,
        }
    }

    /// Connects with up to `DEFAULT_CONNECT_RETRIES` attempts, sleeping
    /// `DEFAULT_CONNECT_BACKOFF` between them. A canceller handle is
    /// returned so the owning session can abort an in-flight retry loop
    /// when it is itself being closed.
    pub async fn connect(host: &str, port: u16) -> Result<TcpTransport, TransportError> {
        let (tx, mut cancel) = mpsc::channel(1);
        let addr = format!("{host}:{port}");
        let mut last_err = None;
        for attempt in 1..=DEFAULT_CONNECT_RETRIES {
            tokio::select! {
                result = TcpStream::connect(&addr) => {
                    match result {
                        Ok(stream) => {
                            return Ok(TcpTransport { stream, cancel, _cancel_tx: tx });
                        }
                        Err(e) => {
                            tracing::warn!(attempt, %addr, error = %e, "connect attempt failed");
                            last_err = Some(e);
                        }
                    }
                }
                _ = cancel.recv() => return Err(TransportError::Cancelled),
            }
            if attempt < DEFAULT_CONNECT_RETRIES {
                tokio::select! {
                    _ = tokio::time::sleep(DEFAULT_CONNECT_BACKOFF) => {}
                    _ = cancel.recv() => return Err(TransportError::Cancelled),
                }
            }
        }
        Err(TransportError::ConnectFailed {
            attempts: DEFAULT_CONNECT_RETRIES,
            source: last_err.expect("loop ran at least once"),
        })
    }

    /// A cloneable handle that cancels an in-flight `connect` retry loop.
    pub fn canceller(&self) -> mpsc::Sender<()> {
        self._cancel_tx.clone()
    }

    /// Unwraps the established socket, discarding the retry/cancel
    /// plumbing, so the caller can split it for its own read/write loops.
    pub(crate) fn into_stream(self) -> TcpStream {
        self.stream
    }
}

impl Transport for TcpTransport {
    async fn read(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        tokio::select! {
            result = self.stream.read(&mut buf) => {
                match result? {
                    0 => Err(TransportError::Closed),
                    n => {
                        buf.truncate(n);
                        Ok(buf)
                    }
                }
            }
            _ = self.cancel.recv() => Err(TransportError::Cancelled),
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Paired, in-process duplex transport used by integration tests: writing
/// to one end makes the bytes available to `read` on the other.
pub struct InMemoryTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    closed: bool,
}

impl InMemoryTransport {
    pub fn pair() -> (InMemoryTransport, InMemoryTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            InMemoryTransport { tx: a_tx, rx: b_rx, closed: false },
            InMemoryTransport { tx: b_tx, rx: a_rx, closed: false },
        )
    }
}

impl Transport for InMemoryTransport {
    async fn read(&mut self) -> Result<Vec<u8>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.rx.recv().await.ok_or(TransportError::Closed)
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.tx.send(bytes.to_vec()).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_pair_round_trips() {
        let (mut a, mut b) = InMemoryTransport::pair();
        a.write(b"8=FIX.4.2\x01").await.unwrap();
        let got = b.read().await.unwrap();
        assert_eq!(got, b"8=FIX.4.2\x01");
    }

    #[tokio::test]
    async fn closed_transport_errs_on_read() {
        let (mut a, mut b) = InMemoryTransport::pair();
        a.close().await.unwrap();
        drop(a);
        assert!(matches!(b.read().await, Err(TransportError::Closed)));
    }
}
