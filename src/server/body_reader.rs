//! The bounded buffer between the connection and a streaming handler.
//!
//! The connection pushes decoded body chunks through a [`BodySender`]; the
//! handler pulls them out of a [`BodyStream`]. When the buffer is full the
//! sender pauses the transport until the handler catches up.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_channel::{Receiver, Sender, TrySendError};
use futures_lite::{ready, AsyncBufRead, AsyncRead, StreamExt};

use crate::Transport;

/// Create a body buffer holding at most `capacity` chunks.
///
/// `first_read` is signalled once, the first time the handler reads.
pub(crate) fn channel<T: Transport>(
    capacity: usize,
    io: T,
    first_read: Option<Sender<()>>,
) -> (BodySender<T>, BodyStream) {
    let (sender, receiver) = async_channel::bounded(capacity.max(1));
    let sender = BodySender {
        sender,
        io,
        paused: false,
    };
    let stream = BodyStream {
        receiver,
        chunk: Vec::new(),
        pos: 0,
        done: false,
        first_read,
    };
    (sender, stream)
}

/// The handler's end of a streaming request body.
///
/// Yields the body bytes in order, then end-of-file. Once the end was seen
/// every further read returns it again without waiting.
pub struct BodyStream {
    receiver: Receiver<io::Result<Vec<u8>>>,
    chunk: Vec<u8>,
    pos: usize,
    done: bool,
    first_read: Option<Sender<()>>,
}

impl fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyStream")
            .field("buffered_chunks", &self.receiver.len())
            .field("done", &self.done)
            .finish()
    }
}

impl BodyStream {
    /// Whether the end of the body was reached.
    pub fn is_done(&self) -> bool {
        self.done
    }

    fn notify_first_read(&mut self) {
        if let Some(sender) = self.first_read.take() {
            let _ = sender.try_send(());
        }
    }
}

impl AsyncBufRead for BodyStream {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let this = self.get_mut();
        this.notify_first_read();
        while this.pos >= this.chunk.len() && !this.done {
            match ready!(this.receiver.poll_next(cx)) {
                Some(Ok(chunk)) => {
                    this.chunk = chunk;
                    this.pos = 0;
                }
                Some(Err(err)) => return Poll::Ready(Err(err)),
                None => {
                    this.done = true;
                    this.chunk = Vec::new();
                    this.pos = 0;
                }
            }
        }
        Poll::Ready(Ok(&this.chunk[this.pos..]))
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        let this = self.get_mut();
        this.pos = (this.pos + amt).min(this.chunk.len());
    }
}

impl AsyncRead for BodyStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let available = ready!(self.as_mut().poll_fill_buf(cx))?;
        let amt = available.len().min(buf.len());
        buf[..amt].copy_from_slice(&available[..amt]);
        self.consume(amt);
        Poll::Ready(Ok(amt))
    }
}

/// The connection's end of a streaming request body.
///
/// Dropping it marks the end of the body.
pub(crate) struct BodySender<T: Transport> {
    sender: Sender<io::Result<Vec<u8>>>,
    io: T,
    paused: bool,
}

impl<T: Transport> fmt::Debug for BodySender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodySender")
            .field("buffered_chunks", &self.sender.len())
            .field("paused", &self.paused)
            .finish()
    }
}

impl<T: Transport> BodySender<T> {
    /// Queue a chunk, pausing the transport while the buffer is full.
    ///
    /// Returns `false` once the handler dropped its end.
    pub(crate) async fn send(&mut self, chunk: Vec<u8>) -> bool {
        let item = match self.sender.try_send(Ok(chunk)) {
            Ok(()) => return true,
            Err(TrySendError::Closed(_)) => return false,
            Err(TrySendError::Full(item)) => item,
        };
        self.pause();
        let sent = self.sender.send(item).await.is_ok();
        self.resume();
        sent
    }

    /// Whether the handler still holds the stream.
    pub(crate) fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Tell the handler the body broke off, if there's room to say so.
    pub(crate) fn abort(self, err: io::Error) {
        let _ = self.sender.try_send(Err(err));
    }

    fn pause(&mut self) {
        if !self.paused {
            log::trace!("body buffer full, pausing transport");
            self.paused = true;
            self.io.pause_reading();
        }
    }

    fn resume(&mut self) {
        if self.paused {
            log::trace!("body buffer drained, resuming transport");
            self.paused = false;
            self.io.resume_reading();
        }
    }
}

impl<T: Transport> Drop for BodySender<T> {
    fn drop(&mut self) {
        self.resume();
    }
}
