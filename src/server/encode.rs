//! Encode HTTP responses on the server.

use std::io::Write as _;
use std::time::{Duration, Instant};

use futures_lite::{AsyncWrite, AsyncWriteExt};
use http_types::{Method, Response, StatusCode};
use log::{debug, info, trace, warn};

use crate::chunked::{encode_chunk, LAST_CHUNK};
use crate::server::RequestHead;
use crate::{Clock, Error, Result};

/// The interim line written before reading a body the client is holding back.
pub(crate) const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Written when even the error handler could not produce a response.
pub(crate) const FALLBACK_BODY: &str = "An error occurred while handling an error";

/// Access log target.
const ACCESS_TARGET: &str = "async_h1_conn::access";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Chunked,
    Length { remaining: u64 },
    /// Delimited by closing the connection, for HTTP/1.0 peers.
    Close,
    /// HEAD requests and bodiless statuses: the body is dropped.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Streaming(Framing),
    Done,
    Failed,
}

/// Writes exactly one response for one request.
///
/// The keep-alive decision is taken when the writer is created and is written
/// into the `connection` header of whatever response follows.
#[derive(Debug)]
pub(crate) struct ResponseWriter<T> {
    io: T,
    state: State,
    keep_alive: bool,
    http_1_0: bool,
    method: Option<Method>,
    path: String,
    access_log: bool,
    status: Option<StatusCode>,
    body_bytes: u64,
    clock: Clock,
    started_at: Instant,
}

impl<T: AsyncWrite + Unpin> ResponseWriter<T> {
    /// A writer for the response to `head`. Without a head the request could
    /// not be parsed and the connection won't be reused.
    ///
    /// The access record is timed from now on `clock`.
    pub(crate) fn new(
        io: T,
        head: Option<&RequestHead>,
        keep_alive: bool,
        access_log: bool,
        clock: Clock,
    ) -> Self {
        Self {
            io,
            state: State::Pending,
            keep_alive: keep_alive && head.map_or(false, RequestHead::keep_alive),
            http_1_0: head.map_or(false, |h| h.version() == http_types::Version::Http1_0),
            method: head.map(RequestHead::method),
            path: head.map(|h| h.target().to_owned()).unwrap_or_default(),
            access_log,
            status: None,
            body_bytes: 0,
            started_at: clock.now(),
            clock,
        }
    }

    /// Whether any part of the response was written.
    pub(crate) fn is_started(&self) -> bool {
        self.state != State::Pending
    }

    /// Whether a streamed response is open.
    pub(crate) fn is_streaming(&self) -> bool {
        matches!(self.state, State::Streaming(_))
    }

    /// Whether nothing more can be written.
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self.state, State::Done | State::Failed)
    }

    /// Whether the connection may serve another request after this response.
    pub(crate) fn keep_alive(&self) -> bool {
        self.keep_alive && self.state == State::Done
    }

    /// Give up on the connection, a response must not be reused after this.
    pub(crate) fn force_close(&mut self) {
        self.keep_alive = false;
    }

    /// Stop writing for good, whatever part of the response went out.
    pub(crate) fn abandon(&mut self) {
        if self.state != State::Done {
            self.state = State::Failed;
        }
        self.keep_alive = false;
    }

    /// Write `100 Continue`, unless the response already started.
    pub(crate) async fn write_continue(&mut self) -> Result<()> {
        if self.state != State::Pending {
            return Ok(());
        }
        trace!("writing 100 continue");
        self.write(CONTINUE).await
    }

    /// Write a whole response in one go.
    pub(crate) async fn respond(&mut self, mut res: Response) -> Result<()> {
        self.ensure_pending()?;
        let body = res.take_body().into_bytes().await.map_err(Error::Handler)?;
        self.write_response(res, body).await
    }

    /// Write `res` with `body` in place of its own body.
    pub(crate) async fn write_response(&mut self, res: Response, mut body: Vec<u8>) -> Result<()> {
        self.ensure_pending()?;

        let status = res.status();
        let chunked = wants_chunked(&res);
        let bodiless = is_bodiless(status);
        if bodiless && !body.is_empty() {
            warn!("dropping the {} byte body of a {} response", body.len(), status);
            body.clear();
        }

        let framing = if bodiless {
            None
        } else if chunked && !self.http_1_0 {
            Some(Framing::Chunked)
        } else if self.is_head() {
            // HEAD answers may announce the length of the body they omit.
            let announced = content_length(&res)?.filter(|_| body.is_empty());
            Some(Framing::Length {
                remaining: announced.unwrap_or(body.len() as u64),
            })
        } else {
            Some(Framing::Length {
                remaining: body.len() as u64,
            })
        };

        let mut buf = self.encode_head(&res, framing)?;
        if !self.is_head() && !body.is_empty() {
            if framing == Some(Framing::Chunked) {
                buf.extend(encode_chunk(&body));
            } else {
                buf.extend_from_slice(&body);
            }
            self.body_bytes = body.len() as u64;
        }
        if framing == Some(Framing::Chunked) && !self.is_head() {
            buf.extend_from_slice(LAST_CHUNK);
        }

        self.status = Some(status);
        self.write(&buf).await?;
        self.finish();
        Ok(())
    }

    /// Write the head of a streamed response.
    ///
    /// A `content-length` header on `res` switches from chunked to raw
    /// framing; the stream must then deliver exactly that many bytes. A
    /// non-empty `initial` is written as the first piece.
    pub(crate) async fn start_stream(&mut self, res: Response, initial: Vec<u8>) -> Result<()> {
        self.ensure_pending()?;
        let status = res.status();
        let length = content_length(&res)?;

        let framing = if is_bodiless(status) {
            None
        } else if let Some(len) = length {
            Some(Framing::Length { remaining: len })
        } else if self.http_1_0 {
            Some(Framing::Close)
        } else {
            Some(Framing::Chunked)
        };
        if framing == Some(Framing::Close) {
            self.keep_alive = false;
        }

        let head = self.encode_head(&res, framing)?;
        self.status = Some(status);
        self.state = match framing {
            _ if self.is_head() => State::Streaming(Framing::Ignored),
            None => State::Streaming(Framing::Ignored),
            Some(framing) => State::Streaming(framing),
        };
        self.write(&head).await?;

        if !initial.is_empty() {
            self.write_chunk(&initial).await?;
        }
        Ok(())
    }

    /// Write one piece of a streamed response.
    pub(crate) async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        let framing = match self.state {
            State::Streaming(framing) => framing,
            State::Pending => return Err(Error::Response("stream was not started".into())),
            State::Done | State::Failed => {
                return Err(Error::Response("response already finished".into()))
            }
        };
        if data.is_empty() {
            return Ok(());
        }

        match framing {
            Framing::Chunked => self.write(&encode_chunk(data)).await?,
            Framing::Close => self.write(data).await?,
            Framing::Length { remaining } => {
                let len = data.len() as u64;
                if len > remaining {
                    self.state = State::Failed;
                    return Err(Error::Response(
                        "response was bigger than content-length".into(),
                    ));
                }
                self.state = State::Streaming(Framing::Length {
                    remaining: remaining - len,
                });
                self.write(data).await?;
            }
            Framing::Ignored => {
                trace!("discarding {} bytes of a bodiless response", data.len());
                return Ok(());
            }
        }
        self.body_bytes += data.len() as u64;
        Ok(())
    }

    /// Finish a streamed response.
    pub(crate) async fn end(&mut self) -> Result<()> {
        match self.state {
            State::Streaming(Framing::Chunked) => {
                self.write(LAST_CHUNK).await?;
                self.finish();
                Ok(())
            }
            State::Streaming(Framing::Length { remaining }) if remaining > 0 => {
                self.state = State::Failed;
                Err(Error::Response(format!(
                    "response ended {} bytes short of content-length",
                    remaining
                )))
            }
            State::Streaming(Framing::Close) => {
                // The peer learns about the end when the connection closes.
                self.keep_alive = false;
                self.finish();
                Ok(())
            }
            State::Streaming(_) => {
                self.finish();
                Ok(())
            }
            State::Pending => Err(Error::Response("stream was not started".into())),
            State::Done | State::Failed => Ok(()),
        }
    }

    /// Write the fixed last-resort response.
    pub(crate) async fn write_fallback(&mut self) -> Result<()> {
        self.ensure_pending()?;
        self.keep_alive = false;
        let status = StatusCode::InternalServerError;
        let mut buf = Vec::new();
        write!(
            buf,
            "HTTP/1.1 {} {}\r\ncontent-length: {}\r\ncontent-type: text/plain;charset=utf-8\r\nconnection: close\r\n\r\n",
            status as u16,
            status.canonical_reason(),
            FALLBACK_BODY.len()
        )?;
        if !self.is_head() {
            buf.extend_from_slice(FALLBACK_BODY.as_bytes());
            self.body_bytes = FALLBACK_BODY.len() as u64;
        }
        self.status = Some(status);
        self.write(&buf).await?;
        self.finish();
        Ok(())
    }

    fn elapsed(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.started_at)
    }

    fn is_head(&self) -> bool {
        self.method == Some(Method::Head)
    }

    fn ensure_pending(&self) -> Result<()> {
        match self.state {
            State::Pending => Ok(()),
            _ => Err(Error::Response("response already started".into())),
        }
    }

    fn encode_head(&self, res: &Response, framing: Option<Framing>) -> Result<Vec<u8>> {
        let mut head = Vec::new();
        let status = res.status();
        write!(
            head,
            "HTTP/1.1 {} {}\r\n",
            status as u16,
            status.canonical_reason()
        )?;

        match framing {
            Some(Framing::Chunked) => write!(head, "transfer-encoding: chunked\r\n")?,
            Some(Framing::Length { remaining }) => {
                write!(head, "content-length: {}\r\n", remaining)?
            }
            Some(Framing::Close) | Some(Framing::Ignored) | None => {}
        }

        for (name, values) in res.iter() {
            match name.as_str() {
                "content-length" | "transfer-encoding" | "connection" => continue,
                "content-type" if framing.is_none() => continue,
                _ => {}
            }
            for value in values.iter() {
                write!(head, "{}: {}\r\n", name, value)?;
            }
        }

        let connection = if self.keep_alive { "keep-alive" } else { "close" };
        write!(head, "connection: {}\r\n\r\n", connection)?;
        Ok(head)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        let res = async {
            self.io.write_all(buf).await?;
            self.io.flush().await
        }
        .await;
        if let Err(err) = res {
            debug!("response write failed: {}", err);
            self.state = State::Failed;
            return Err(err.into());
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.state = State::Done;
        if self.access_log {
            let status = self.status.map_or(0, |s| s as u16);
            let method = self.method.map_or_else(|| "-".to_owned(), |m| m.to_string());
            info!(
                target: ACCESS_TARGET,
                "{} {} {} {} {:?}",
                method,
                if self.path.is_empty() { "-" } else { self.path.as_str() },
                status,
                self.body_bytes,
                self.elapsed()
            );
        }
    }
}

fn is_bodiless(status: StatusCode) -> bool {
    let code = status as u16;
    (100..200).contains(&code) || code == 204 || code == 304
}

fn wants_chunked(res: &Response) -> bool {
    res.header("transfer-encoding")
        .map_or(false, |v| v.last().as_str().eq_ignore_ascii_case("chunked"))
}

fn content_length(res: &Response) -> Result<Option<u64>> {
    match res.header("content-length") {
        None => Ok(None),
        Some(values) => values
            .last()
            .as_str()
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Response("invalid content-length header".into())),
    }
}
