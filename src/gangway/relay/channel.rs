use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::watch;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: AsyncRead + AsyncWrite {}
impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Whether a transport can close its write direction while keeping reads open.
///
/// Raw sockets can (TCP FIN); an SSH session channel cannot express this, so
/// `close_write` there tears down the whole channel. Callers that care should
/// branch on this instead of discovering the degradation at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfClose {
    Supported,
    Unsupported,
}

/// One live transport connection, owned by exactly one relay session once
/// claimed.
pub struct Channel {
    stream: BoxedStream,
    half_close: HalfClose,
    peer: String,
}

impl Channel {
    pub fn new(stream: BoxedStream, half_close: HalfClose, peer: impl Into<String>) -> Self {
        Self {
            stream,
            half_close,
            peer: peer.into(),
        }
    }

    pub fn half_close(&self) -> HalfClose {
        self.half_close
    }

    /// Peer label for logging.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Terminate both directions. Consumes the channel; the underlying
    /// connection is released when the stream is dropped.
    pub async fn close(mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }

    pub fn split(self) -> (ChannelReader, ChannelWriter) {
        let (rd, wr) = tokio::io::split(self.stream);
        (
            ChannelReader { rd },
            ChannelWriter {
                wr,
                half_close: self.half_close,
            },
        )
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.peer)
            .field("half_close", &self.half_close)
            .finish_non_exhaustive()
    }
}

pub struct ChannelReader {
    rd: ReadHalf<BoxedStream>,
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.rd).poll_read(cx, buf)
    }
}

pub struct ChannelWriter {
    wr: WriteHalf<BoxedStream>,
    half_close: HalfClose,
}

impl ChannelWriter {
    pub fn half_close(&self) -> HalfClose {
        self.half_close
    }

    /// Signal "no more data" on this direction. With `HalfClose::Unsupported`
    /// this closes the whole channel instead (documented asymmetry).
    pub async fn close_write(&mut self) -> io::Result<()> {
        self.wr.shutdown().await
    }
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.wr).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.wr).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.wr).poll_shutdown(cx)
    }
}

/// Exactly-once closure trigger shared by a session's copy tasks and its
/// shutdown watcher: a write-once broadcast rather than a mutex-guarded
/// counter.
#[derive(Debug, Clone)]
pub struct CloseOnce {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseOnce {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Trigger closure. Returns true only for the call that actually fired.
    pub fn fire(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the guard has fired; immediately if it already has.
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives inside self, so wait_for cannot fail here.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Default for CloseOnce {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn close_once_fires_exactly_once() {
        let guard = CloseOnce::new();
        let other = guard.clone();
        assert!(!guard.fired());
        assert!(guard.fire());
        assert!(!other.fire());
        assert!(!guard.fire());
        assert!(other.fired());
    }

    #[tokio::test]
    async fn close_once_wakes_waiters() {
        let guard = CloseOnce::new();
        let waiter = {
            let guard = guard.clone();
            tokio::spawn(async move { guard.closed().await })
        };
        tokio::task::yield_now().await;
        assert!(guard.fire());
        waiter.await.unwrap();

        // Already-fired guards resolve immediately.
        guard.closed().await;
    }

    #[tokio::test]
    async fn close_write_propagates_eof_through_split() {
        let (near, far) = tokio::io::duplex(64);
        let ch = Channel::new(Box::new(near), HalfClose::Supported, "test");
        assert_eq!(ch.half_close(), HalfClose::Supported);

        let (_rd, mut wr) = ch.split();
        use tokio::io::AsyncWriteExt as _;
        wr.write_all(b"GET /\r\n").await.unwrap();
        wr.close_write().await.unwrap();

        let mut far = far;
        let mut buf = Vec::new();
        far.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"GET /\r\n");
    }
}
