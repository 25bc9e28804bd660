//! Asynchronous HTTP/1.1 connection engine.
//!
//! Owns one byte stream per connection and drives it through the
//! request/response cycle: incremental request parsing, three independent
//! deadlines, bounded streaming of request bodies with read backpressure, and
//! response writing with keep-alive negotiation.
//!
//! ```txt
//!            bytes                 Request + Responder
//! transport -------> RequestParser ------------------> Handler
//!     ^                                                   |
//!     |            ResponseWriter <----- frames ----------+
//!     +-------------------+
//! ```
//!
//! Handlers see an [`http_types::Request`] and spend a [`server::Responder`]
//! on either a whole response or a streamed one. Everything that goes wrong
//! (malformed input, size limits, timeouts, handler failures) is answered on
//! the connection itself, through an [`server::ErrorHandler`].
//!
//! # Example
//!
//! ```no_run
//! use async_h1_conn::{server, TcpTransport};
//! use async_io::Async;
//! use http_types::{Request, Response, StatusCode};
//! use std::net::TcpListener;
//!
//! async fn hello(_req: Request, res: server::Responder) -> http_types::Result<()> {
//!     let mut response = Response::new(StatusCode::Ok);
//!     response.set_body("hello");
//!     res.respond(response).await
//! }
//!
//! # fn main() -> std::io::Result<()> {
//! async_global_executor::block_on(async {
//!     let listener = Async::<TcpListener>::bind(([127, 0, 0, 1], 8080))?;
//!     loop {
//!         let (stream, _) = listener.accept().await?;
//!         async_global_executor::spawn(server::accept(TcpTransport::new(stream), hello)).detach();
//!     }
//! })
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(future_incompatible, rust_2018_idioms)]
#![deny(missing_debug_implementations, nonstandard_style)]
#![warn(missing_docs, unreachable_pub)]

/// The maximum amount of headers parsed on the server.
const MAX_HEADERS: usize = 128;

/// The maximum length of the head section we'll try to parse.
/// See: https://nodejs.org/en/blog/vulnerability/november-2018-security-releases/#denial-of-service-with-large-http-headers-cve-2018-12121
const MAX_HEAD_LENGTH: usize = 8 * 1024;

mod chunked;
mod clock;
mod error;
mod registry;
mod transport;

pub mod server;

pub use clock::Clock;
pub use error::{Error, Result};
pub use registry::{ConnInfo, ConnectionGuard, Registry};
pub use transport::{TcpTransport, Transport};

#[doc(inline)]
pub use server::{accept, accept_with_opts, ServerOptions};
