//! Process HTTP connections on the server.

use std::fmt;
use std::io;
use std::mem;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use async_global_executor::Task;
use async_io::Timer;
use futures_lite::future::{self, Future, FutureExt};
use futures_lite::{AsyncReadExt, AsyncWriteExt};
use http_types::{Body, Request};
use log::{debug, error, trace, warn};

mod body_reader;
mod decode;
mod encode;
mod handler;
mod options;
mod responder;
mod timeout;

pub use body_reader::BodyStream;
pub use decode::{BodyFraming, Event, Events, HeaderList, RequestHead, RequestParser};
pub use handler::{BoxFuture, DefaultErrorHandler, ErrorHandler, Handler, Streaming};
pub use options::ServerOptions;
pub use responder::{Responder, ResponseStream};
pub use timeout::TimeoutKind;

use body_reader::BodySender;
use decode::build_request;
use encode::ResponseWriter;
use responder::{Frame, Ready};
use timeout::{Interrupt, Supervised, Timeouts};

use crate::registry::{ConnInfo, ConnectionGuard};
use crate::{Clock, Error, Registry, Result, Transport};

/// Accept a new incoming HTTP/1.1 connection.
///
/// Supports `KeepAlive` requests by default.
pub async fn accept<T, H>(io: T, handler: H)
where
    T: Transport,
    H: Handler,
{
    Server::new(io, handler).accept().await
}

/// Accept a new incoming HTTP/1.1 connection.
///
/// Supports `KeepAlive` requests by default.
pub async fn accept_with_opts<T, H>(io: T, handler: H, opts: ServerOptions)
where
    T: Transport,
    H: Handler,
{
    Server::new(io, handler).with_options(opts).accept().await
}

/// Where a connection is in its request/response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Between requests.
    Idle,
    /// Part of a request head arrived.
    ReceivingHeaders,
    /// The head is parsed and body bytes are expected.
    ReceivingBody,
    /// The handler runs.
    Handling,
    /// The response is being written.
    Responding,
    /// Done for good.
    Closed,
}

/// Whether the connection should be kept open after handling a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// The connection should be closed.
    Close,
    /// The connection should be kept alive.
    KeepAlive,
}

type Outcome = std::thread::Result<http_types::Result<()>>;
type Pump = Pin<Box<dyn Future<Output = (RequestParser, Result<()>)> + Send>>;
type Preparing = Pin<Box<dyn Future<Output = Result<Ready>> + Send>>;

/// A server for one connection.
pub struct Server<T, H> {
    io: T,
    handler: H,
    error_handler: Arc<dyn ErrorHandler>,
    opts: ServerOptions,
    clock: Clock,
    registry: Registry,
    guard: Option<ConnectionGuard>,
    parser: RequestParser,
    timeouts: Timeouts,
    ticker: Timer,
    stage: Stage,
    request_count: u64,
    read_buf: Vec<u8>,
}

impl<T: Transport, H> fmt::Debug for Server<T, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("peer_addr", &self.io.peer_addr())
            .field("stage", &self.stage)
            .field("request_count", &self.request_count)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl<T, H> Server<T, H>
where
    T: Transport,
    H: Handler,
{
    /// Build a new server for `io`.
    pub fn new(io: T, handler: H) -> Self {
        let opts = ServerOptions::default();
        Self {
            io,
            handler,
            error_handler: Arc::new(DefaultErrorHandler),
            parser: RequestParser::new(opts.max_head_length),
            ticker: Timer::interval(opts.check_interval()),
            read_buf: vec![0; opts.read_buffer_size],
            opts,
            clock: Clock::global().clone(),
            registry: Registry::global().clone(),
            guard: None,
            timeouts: Timeouts::default(),
            stage: Stage::Idle,
            request_count: 0,
        }
    }

    /// Use `opts` instead of the defaults.
    pub fn with_options(mut self, opts: ServerOptions) -> Self {
        self.parser = RequestParser::new(opts.max_head_length);
        self.ticker = Timer::interval(opts.check_interval());
        self.read_buf = vec![0; opts.read_buffer_size];
        self.opts = opts;
        self
    }

    /// Answer failures with `error_handler` instead of [`DefaultErrorHandler`].
    pub fn with_error_handler(mut self, error_handler: impl ErrorHandler) -> Self {
        self.error_handler = Arc::new(error_handler);
        self
    }

    /// Check deadlines against `clock` instead of [`Clock::global`].
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Register with `registry` instead of [`Registry::global`].
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// The current stage.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Details about this connection.
    pub fn info(&self) -> ConnInfo {
        let id = self.guard.as_ref().map_or(0, ConnectionGuard::id);
        ConnInfo::new(id, self.io.peer_addr(), self.request_count)
    }

    /// Serve requests until the connection closes.
    pub async fn accept(mut self) {
        while let ConnectionStatus::KeepAlive = self.accept_one().await {}
    }

    /// Serve a single request.
    ///
    /// Every failure is answered or logged here; the return value only says
    /// whether another request may follow.
    pub async fn accept_one(&mut self) -> ConnectionStatus {
        if self.stage == Stage::Closed {
            return ConnectionStatus::Close;
        }
        if self.guard.is_none() {
            self.guard = Some(self.registry.register(self.io.peer_addr()));
        }

        let head = match self.read_head().await {
            Ok(Some(head)) => head,
            Ok(None) => {
                self.close().await;
                return ConnectionStatus::Close;
            }
            Err(err) => {
                let writer = self.writer(None);
                self.bail_out(err, None, writer).await;
                return ConnectionStatus::Close;
            }
        };

        self.request_count += 1;
        trace!("{} {} ({:?})", head.method(), head.target(), self.info());
        let writer = self.writer(Some(&head));

        let expects_continue = match self.check_head(&head) {
            Ok(expects_continue) => expects_continue,
            Err(err) => {
                self.bail_out(err, Some(head), writer).await;
                return ConnectionStatus::Close;
            }
        };

        if self.handler.streams_body(&head) {
            self.serve_streaming(head, writer, expects_continue).await
        } else {
            self.serve_buffered(head, writer, expects_continue).await
        }
    }

    fn writer(&self, head: Option<&RequestHead>) -> ResponseWriter<T> {
        let keep_alive = self.opts.keep_alive && !self.registry.is_shutting_down();
        ResponseWriter::new(
            self.io.clone(),
            head,
            keep_alive,
            self.opts.access_log,
            self.clock.clone(),
        )
    }

    fn check_head(&self, head: &RequestHead) -> Result<bool> {
        let expects_continue = head.expects_continue()?;
        if head.content_length().map_or(false, |len| len > self.opts.request_max_size) {
            return Err(Error::PayloadTooLarge);
        }
        Ok(expects_continue)
    }

    /// Read until a request head is parsed.
    ///
    /// `None` means the connection should close quietly: the peer went away,
    /// sat idle for too long, or the server is shutting down.
    async fn read_head(&mut self) -> Result<Option<RequestHead>> {
        self.stage = Stage::Idle;
        let mut event = self.parser.next_event()?;
        loop {
            match event {
                Some(Event::Head(head)) => {
                    self.start_receiving();
                    if head.has_body() {
                        self.stage = Stage::ReceivingBody;
                    }
                    return Ok(Some(head));
                }
                Some(other) => {
                    return Err(Error::malformed(format!("unexpected {:?}", other)));
                }
                None => {}
            }

            if self.stage == Stage::Idle {
                if self.parser.buffered() > 0 {
                    self.start_receiving();
                } else if !self.timeouts.is_armed(TimeoutKind::KeepAlive) {
                    let after = self.opts.keep_alive_timeout();
                    self.timeouts.arm(TimeoutKind::KeepAlive, self.clock.now(), after);
                }
            }
            let idle = self.stage == Stage::Idle;

            let n = match self.read_some(idle).await {
                Ok(Ok(0)) if idle => return Ok(None),
                Ok(Ok(0)) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(Ok(n)) => n,
                Ok(Err(err)) => return Err(err.into()),
                Err(Interrupt::Timeout(TimeoutKind::KeepAlive)) => {
                    debug!("keep-alive timeout, closing idle connection");
                    return Ok(None);
                }
                Err(Interrupt::Shutdown) => {
                    debug!("shutting down, closing idle connection");
                    return Ok(None);
                }
                Err(Interrupt::Timeout(_)) => return Err(Error::RequestTimeout),
            };

            self.start_receiving();
            event = self.parser.feed(&self.read_buf[..n]).next().transpose()?;
        }
    }

    /// Leave `Idle`: the keep-alive deadline gives way to the request deadline.
    fn start_receiving(&mut self) {
        if self.stage == Stage::Idle {
            self.stage = Stage::ReceivingHeaders;
        }
        self.timeouts.disarm(TimeoutKind::KeepAlive);
        if !self.timeouts.is_armed(TimeoutKind::Request) {
            let after = self.opts.request_timeout();
            self.timeouts.arm(TimeoutKind::Request, self.clock.now(), after);
        }
    }

    async fn read_some(&mut self, idle: bool) -> std::result::Result<io::Result<usize>, Interrupt> {
        let read = self.io.read(&mut self.read_buf);
        let supervised = Supervised::new(read, &self.timeouts, &self.clock, &mut self.ticker);
        if idle {
            supervised.or_shutdown(&self.registry).await
        } else {
            supervised.await
        }
    }

    /// Read the whole body, then run the handler.
    async fn serve_buffered(
        &mut self,
        head: RequestHead,
        mut writer: ResponseWriter<T>,
        expects_continue: bool,
    ) -> ConnectionStatus {
        if expects_continue {
            if let Err(err) = self.supervise(writer.write_continue()).await {
                writer.abandon();
                self.bail_out(err, Some(head), writer).await;
                return ConnectionStatus::Close;
            }
        }

        let body = match self.read_body().await {
            Ok(body) => body,
            Err(err) => {
                self.bail_out(err, Some(head), writer).await;
                return ConnectionStatus::Close;
            }
        };
        self.timeouts.disarm(TimeoutKind::Request);

        let req = match build_request(&head, Body::from_bytes(body), self.info()) {
            Ok(req) => req,
            Err(err) => {
                self.bail_out(err, Some(head), writer).await;
                return ConnectionStatus::Close;
            }
        };
        self.run_handler(req, head, writer, None, None).await
    }

    async fn read_body(&mut self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        let mut event = self.parser.next_event()?;
        loop {
            match event {
                Some(Event::Data(data)) => {
                    if (body.len() + data.len()) as u64 > self.opts.request_max_size {
                        return Err(Error::PayloadTooLarge);
                    }
                    body.extend(data);
                    event = self.parser.next_event()?;
                    continue;
                }
                Some(Event::Complete) => return Ok(body),
                Some(Event::Head(_)) => return Err(Error::malformed("unexpected request head")),
                None => {}
            }

            let n = match self.read_some(false).await {
                Ok(Ok(0)) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(Ok(n)) => n,
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => return Err(Error::RequestTimeout),
            };
            event = self.parser.feed(&self.read_buf[..n]).next().transpose()?;
        }
    }

    /// Run the handler while the body is still arriving.
    async fn serve_streaming(
        &mut self,
        head: RequestHead,
        writer: ResponseWriter<T>,
        expects_continue: bool,
    ) -> ConnectionStatus {
        let (continue_tx, continue_rx) = if expects_continue {
            let (tx, rx) = async_channel::bounded(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let (sender, stream) =
            body_reader::channel(self.opts.stream_capacity, self.io.clone(), continue_tx);
        let len = head.content_length().map(|len| len as usize);
        let req = match build_request(&head, Body::from_reader(stream, len), self.info()) {
            Ok(req) => req,
            Err(err) => {
                self.bail_out(err, Some(head), writer).await;
                return ConnectionStatus::Close;
            }
        };

        let parser = mem::replace(&mut self.parser, RequestParser::new(self.opts.max_head_length));
        let pump: Pump = Box::pin(pump(
            parser,
            self.io.clone(),
            sender,
            self.opts.request_max_size,
            self.opts.read_buffer_size,
        ));
        self.run_handler(req, head, writer, Some(pump), continue_rx).await
    }

    /// Run the handler and write whatever it sends.
    async fn run_handler(
        &mut self,
        req: Request,
        head: RequestHead,
        mut writer: ResponseWriter<T>,
        mut pump: Option<Pump>,
        mut continue_rx: Option<async_channel::Receiver<()>>,
    ) -> ConnectionStatus {
        let (frames_tx, frames_rx) = async_channel::bounded(1);
        let call = self.handler.call(req, Responder::new(frames_tx));
        let mut task: Option<Task<Outcome>> =
            Some(async_global_executor::spawn(AssertUnwindSafe(call).catch_unwind()));

        self.stage = Stage::Handling;
        self.arm_response_timeout();

        // The client holds the body back until it sees `100 Continue`.
        let mut continue_owed = continue_rx.is_some();
        let mut frames_open = true;
        let mut preparing: Option<Preparing> = None;
        let mut outcome: Option<Outcome> = None;
        let mut failure: Option<Error> = None;

        while frames_open || preparing.is_some() || task.is_some() {
            let accepting = frames_open && preparing.is_none();
            let handler_done = task.is_none();
            let step = {
                let prepared = async {
                    match preparing.as_mut() {
                        Some(preparing) => Step::Ready(preparing.await),
                        None => future::pending().await,
                    }
                };
                let frames = async {
                    if !accepting {
                        future::pending().await
                    } else if handler_done {
                        // Only what the handler queued before returning.
                        Step::Frame(frames_rx.try_recv().ok())
                    } else {
                        Step::Frame(frames_rx.recv().await.ok())
                    }
                };
                let continued = async {
                    match continue_rx.as_ref() {
                        Some(rx) => Step::Continue(rx.recv().await.is_ok()),
                        None => future::pending().await,
                    }
                };
                let finished = async {
                    match task.as_mut() {
                        Some(task) => Step::Finished(task.await),
                        None => future::pending().await,
                    }
                };
                let pumped = async {
                    match pump.as_mut() {
                        Some(pump) => Step::Pumped(pump.await),
                        None => future::pending().await,
                    }
                };
                // A response that is ready wins over everything else.
                let race = prepared.or(frames).or(continued).or(finished).or(pumped);
                Supervised::new(race, &self.timeouts, &self.clock, &mut self.ticker).await
            };

            match step {
                Ok(Step::Frame(Some(frame))) => preparing = Some(Box::pin(frame.ready())),
                Ok(Step::Frame(None)) => {
                    frames_rx.close();
                    frames_open = false;
                }
                Ok(Step::Ready(ready)) => {
                    preparing = None;
                    self.stage = Stage::Responding;
                    let written = match ready {
                        Ok(ready) => self.supervise(write_ready(&mut writer, ready)).await,
                        Err(err) => Err(err),
                    };
                    match written {
                        // Measured from the last write once the response started.
                        Ok(()) => self.arm_response_timeout(),
                        Err(err) if err.is_closed() || err.is_timeout() => {
                            writer.abandon();
                            drop(task.take());
                            drop(pump.take());
                            self.bail_out(err, Some(head), writer).await;
                            return ConnectionStatus::Close;
                        }
                        Err(err) => {
                            error!("invalid response from handler: {}", err);
                            frames_rx.close();
                            frames_open = false;
                            if writer.is_started() {
                                writer.force_close();
                            } else {
                                failure = Some(err);
                            }
                        }
                    }
                }
                Ok(Step::Continue(read)) => {
                    continue_rx = None;
                    if read && !writer.is_started() {
                        if let Err(err) = self.supervise(writer.write_continue()).await {
                            writer.abandon();
                            drop(task.take());
                            drop(pump.take());
                            self.bail_out(err, Some(head), writer).await;
                            return ConnectionStatus::Close;
                        }
                        continue_owed = false;
                    }
                }
                Ok(Step::Finished(result)) => {
                    task = None;
                    outcome = Some(result);
                }
                Ok(Step::Pumped((parser, result))) => {
                    self.parser = parser;
                    pump = None;
                    self.timeouts.disarm(TimeoutKind::Request);
                    if let Err(err) = result {
                        drop(task.take());
                        if writer.is_started() {
                            debug!("request body failed after the response started: {}", err);
                            writer.force_close();
                            self.close().await;
                            return ConnectionStatus::Close;
                        }
                        self.bail_out(err, Some(head), writer).await;
                        return ConnectionStatus::Close;
                    }
                }
                Err(interrupt) => {
                    drop(task.take());
                    drop(pump.take());
                    let err = timed_out(interrupt);
                    debug!("{} while handling {} {}", err, head.method(), head.target());
                    self.bail_out(err, Some(head), writer).await;
                    return ConnectionStatus::Close;
                }
            }
        }

        let result = match (failure, outcome) {
            (Some(err), _) => Err(err),
            (None, Some(Ok(Ok(())))) | (None, None) => Ok(()),
            (None, Some(Ok(Err(err)))) => Err(Error::Handler(err)),
            (None, Some(Err(_))) => Err(Error::Panicked),
        };

        match result {
            Err(err) if writer.is_started() => {
                error!("handler failed after the response started: {}", err);
                writer.force_close();
                if writer.is_streaming() {
                    self.close().await;
                    return ConnectionStatus::Close;
                }
            }
            Err(err) => {
                error!("handler failed: {}", err);
                self.error_response(Some(head.clone()), err, &mut writer).await;
            }
            Ok(()) if !writer.is_started() => {
                warn!("handler produced no response for {} {}", head.method(), head.target());
                self.error_response(Some(head.clone()), Error::NoResponse, &mut writer)
                    .await;
            }
            Ok(()) => {}
        }

        if writer.is_streaming() {
            trace!("ending the stream the handler left open");
            self.arm_response_timeout();
            if let Err(err) = self.supervise(writer.end()).await {
                debug!("could not end the response stream: {}", err);
                writer.abandon();
            }
        }
        self.timeouts.disarm(TimeoutKind::Response);

        if let Some(pump) = pump.take() {
            if continue_owed || !writer.keep_alive() {
                // The client still holds the body back, or nobody needs it.
                writer.force_close();
            } else {
                self.stage = Stage::ReceivingBody;
                self.drain(pump).await;
                if self.stage == Stage::Closed {
                    return ConnectionStatus::Close;
                }
            }
        }

        if writer.keep_alive() && !self.registry.is_shutting_down() {
            self.timeouts.disarm_all();
            self.stage = Stage::Idle;
            ConnectionStatus::KeepAlive
        } else {
            self.close().await;
            ConnectionStatus::Close
        }
    }

    fn arm_response_timeout(&mut self) {
        let after = self.opts.response_timeout();
        self.timeouts.arm(TimeoutKind::Response, self.clock.now(), after);
    }

    /// Run a write under the connection deadlines.
    async fn supervise(&mut self, write: impl Future<Output = Result<()>>) -> Result<()> {
        match Supervised::new(write, &self.timeouts, &self.clock, &mut self.ticker).await {
            Ok(written) => written,
            Err(interrupt) => Err(timed_out(interrupt)),
        }
    }

    /// Finish reading a body the handler left unread.
    async fn drain(&mut self, pump: Pump) {
        debug!("discarding the unread request body");
        let drained = Supervised::new(pump, &self.timeouts, &self.clock, &mut self.ticker).await;
        match drained {
            Ok((parser, Ok(()))) => {
                self.parser = parser;
                self.timeouts.disarm(TimeoutKind::Request);
            }
            Ok((_, Err(err))) => {
                debug!("request body failed while discarding it: {}", err);
                self.close().await;
            }
            Err(_) => {
                debug!("request timeout while discarding the request body");
                self.close().await;
            }
        }
    }

    /// Let the error handler answer `err`, or fall back to a fixed `500`.
    async fn error_response(
        &mut self,
        head: Option<RequestHead>,
        err: Error,
        writer: &mut ResponseWriter<T>,
    ) {
        self.arm_response_timeout();
        let handled = AssertUnwindSafe(self.error_handler.handle(head, err)).catch_unwind();
        let handled = Supervised::new(handled, &self.timeouts, &self.clock, &mut self.ticker).await;
        self.timeouts.disarm(TimeoutKind::Response);

        let res = match handled {
            Ok(Ok(Ok(res))) => res,
            Ok(Ok(Err(err))) => {
                error!("error handler failed: {}", err);
                return self.fallback(writer).await;
            }
            Ok(Err(_)) => {
                error!("error handler panicked");
                return self.fallback(writer).await;
            }
            Err(_) => {
                error!("error handler timed out");
                return self.fallback(writer).await;
            }
        };

        self.stage = Stage::Responding;
        self.arm_response_timeout();
        match self.supervise(writer.respond(res)).await {
            Ok(()) => {}
            Err(err) if err.is_closed() || err.is_timeout() || writer.is_started() => {
                debug!("could not write the error response: {}", err);
                writer.abandon();
            }
            Err(err) => {
                error!("error handler produced an invalid response: {}", err);
                self.fallback(writer).await;
            }
        }
        self.timeouts.disarm(TimeoutKind::Response);
    }

    async fn fallback(&mut self, writer: &mut ResponseWriter<T>) {
        self.stage = Stage::Responding;
        self.arm_response_timeout();
        if let Err(err) = self.supervise(writer.write_fallback()).await {
            debug!("could not write the fallback response: {}", err);
            writer.abandon();
        }
        self.timeouts.disarm(TimeoutKind::Response);
    }

    /// Give up on the connection after `err`.
    ///
    /// If the transport is still usable and no response went out yet, the
    /// error handler gets a chance to answer first. Either way the
    /// connection ends up closed exactly once.
    async fn bail_out(&mut self, err: Error, head: Option<RequestHead>, mut writer: ResponseWriter<T>) {
        if err.is_closed() {
            debug!("transport already closed: {}", err);
        } else if writer.is_terminal() {
            debug!("response already over, dropping the connection: {}", err);
        } else if writer.is_started() {
            debug!("response already started, dropping the connection: {}", err);
        } else {
            match &err {
                Error::Malformed(_) | Error::UnsupportedVersion(_) | Error::HeadersTooLarge => {
                    debug!("bad request: {}", err)
                }
                _ => debug!("bailing out: {}", err),
            }
            writer.force_close();
            self.error_response(head, err, &mut writer).await;
        }
        self.close().await;
    }

    async fn close(&mut self) {
        if self.stage == Stage::Closed {
            return;
        }
        self.stage = Stage::Closed;
        self.timeouts.disarm_all();
        if let Err(err) = self.io.close().await {
            trace!("error closing the transport: {}", err);
        }
        self.guard = None;
    }
}

enum Step {
    Frame(Option<Frame>),
    Ready(Result<Ready>),
    Continue(bool),
    Finished(Outcome),
    Pumped((RequestParser, Result<()>)),
}

fn timed_out(interrupt: Interrupt) -> Error {
    match interrupt {
        Interrupt::Timeout(TimeoutKind::Request) => Error::RequestTimeout,
        _ => Error::ResponseTimeout,
    }
}

async fn write_ready<T: Transport>(writer: &mut ResponseWriter<T>, ready: Ready) -> Result<()> {
    match ready {
        Ready::Whole(res, body) => writer.write_response(res, body).await,
        Ready::Head(res, initial) => writer.start_stream(res, initial).await,
        Ready::Chunk(data) => writer.write_chunk(&data).await,
        Ready::End => writer.end().await,
    }
}

/// Feed the rest of a streaming request body into the handler's buffer.
///
/// Hands the parser back so pipelined bytes read along the way survive.
async fn pump<T: Transport>(
    mut parser: RequestParser,
    mut io: T,
    mut sender: BodySender<T>,
    max_size: u64,
    buf_size: usize,
) -> (RequestParser, Result<()>) {
    let mut buf = vec![0; buf_size];
    let mut received = 0u64;
    let mut event = parser.next_event();
    let result = loop {
        match event {
            Ok(Some(Event::Data(data))) => {
                received += data.len() as u64;
                if received > max_size {
                    break Err(Error::PayloadTooLarge);
                }
                if sender.is_connected() && !sender.send(data).await {
                    trace!("handler dropped the request body");
                }
                event = parser.next_event();
            }
            Ok(Some(Event::Complete)) => break Ok(()),
            Ok(Some(Event::Head(_))) => break Err(Error::malformed("unexpected request head")),
            Ok(None) => match io.read(&mut buf).await {
                Ok(0) => break Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(n) => event = parser.feed(&buf[..n]).next().transpose(),
                Err(err) => break Err(err.into()),
            },
            Err(err) => break Err(err),
        }
    };
    match &result {
        Ok(()) => drop(sender),
        Err(err) => sender.abort(io::Error::new(io::ErrorKind::Other, err.to_string())),
    }
    (parser, result)
}
