//! The response sinks handed to request handlers.

use async_channel::Sender;
use http_types::{Response, StatusCode};

use crate::{Error, Result};

/// What a handler asked the connection to write.
#[derive(Debug)]
pub(crate) enum Frame {
    Whole(Response),
    Head(Response),
    Chunk(Vec<u8>),
    End,
}

impl Frame {
    /// Read the body the frame carries into memory.
    ///
    /// The body may be fed by the request body, so this must not block the
    /// connection from reading.
    pub(crate) async fn ready(self) -> Result<Ready> {
        Ok(match self {
            Frame::Whole(mut res) => {
                let body = res.take_body().into_bytes().await.map_err(Error::Handler)?;
                Ready::Whole(res, body)
            }
            Frame::Head(mut res) => {
                let initial = res.take_body().into_bytes().await.map_err(Error::Handler)?;
                Ready::Head(res, initial)
            }
            Frame::Chunk(data) => Ready::Chunk(data),
            Frame::End => Ready::End,
        })
    }
}

/// A frame with its body in memory, ready to be written.
#[derive(Debug)]
pub(crate) enum Ready {
    Whole(Response, Vec<u8>),
    Head(Response, Vec<u8>),
    Chunk(Vec<u8>),
    End,
}

fn closed() -> http_types::Error {
    http_types::Error::from_str(StatusCode::InternalServerError, "connection closed")
}

/// Sends the response for one request.
///
/// A handler gets exactly one `Responder` and spends it on either
/// [`Responder::respond`] or [`Responder::stream`].
#[derive(Debug)]
pub struct Responder {
    frames: Sender<Frame>,
}

impl Responder {
    pub(crate) fn new(frames: Sender<Frame>) -> Self {
        Self { frames }
    }

    /// Send a complete response.
    ///
    /// The `content-length` header is computed from the body.
    pub async fn respond(self, res: impl Into<Response>) -> http_types::Result<()> {
        self.frames
            .send(Frame::Whole(res.into()))
            .await
            .map_err(|_| closed())
    }

    /// Send the head of a response whose body follows in pieces.
    ///
    /// Set a `content-length` header on `res` to send the body unframed; the
    /// pieces must then add up to exactly that length. Otherwise the body is
    /// sent with chunked transfer-coding.
    pub async fn stream(self, res: impl Into<Response>) -> http_types::Result<ResponseStream> {
        self.frames
            .send(Frame::Head(res.into()))
            .await
            .map_err(|_| closed())?;
        Ok(ResponseStream {
            frames: self.frames,
        })
    }
}

/// The body of a streamed response.
///
/// Dropping it without calling [`ResponseStream::end`] ends the body once the
/// handler returns.
#[derive(Debug)]
pub struct ResponseStream {
    frames: Sender<Frame>,
}

impl ResponseStream {
    /// Send one piece of the body.
    ///
    /// Fails once the connection gave up on the response.
    pub async fn write(&mut self, data: impl Into<Vec<u8>>) -> http_types::Result<()> {
        self.frames
            .send(Frame::Chunk(data.into()))
            .await
            .map_err(|_| closed())
    }

    /// Finish the body.
    pub async fn end(self) -> http_types::Result<()> {
        self.frames.send(Frame::End).await.map_err(|_| closed())
    }
}
