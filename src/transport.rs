//! The byte channel a connection runs over.

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_dup::Arc;
use async_io::Async;
use futures_lite::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream a connection can be served on.
///
/// Clones must share the underlying stream: the engine reads and writes
/// through separate handles.
pub trait Transport: AsyncRead + AsyncWrite + Clone + Send + Sync + Unpin + 'static {
    /// The remote address, if any.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// The request body buffer is full; stop reading from the peer.
    ///
    /// The engine stops polling for reads regardless, this hook lets the
    /// transport propagate the signal further down.
    fn pause_reading(&self) {}

    /// The request body buffer drained; reading may continue.
    fn resume_reading(&self) {}
}

/// A [`Transport`] over a TCP stream.
#[derive(Clone)]
pub struct TcpTransport {
    stream: Arc<Async<TcpStream>>,
    peer_addr: Option<SocketAddr>,
}

impl TcpTransport {
    /// Wrap an accepted stream.
    pub fn new(stream: Async<TcpStream>) -> Self {
        let peer_addr = stream.get_ref().peer_addr().ok();
        Self {
            stream: Arc::new(stream),
            peer_addr,
        }
    }
}

impl From<Async<TcpStream>> for TcpTransport {
    fn from(stream: Async<TcpStream>) -> Self {
        Self::new(stream)
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

impl Transport for TcpTransport {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn pause_reading(&self) {
        log::trace!("pausing reads from {:?}", self.peer_addr);
    }

    fn resume_reading(&self) {
        log::trace!("resuming reads from {:?}", self.peer_addr);
    }
}

impl AsyncRead for TcpTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_close(cx)
    }
}
