use std::future::Future;
use std::pin::Pin;

use http_types::{Request, Response, StatusCode};

use crate::server::{RequestHead, Responder};
use crate::Error;

/// An owned dynamically typed [`Future`] for use in cases where you can't
/// statically type your result or need to add some indirection.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Handles requests.
///
/// Implemented for every `Fn(Request, Responder) -> impl Future`:
///
/// ```
/// use async_h1_conn::server::Responder;
/// use http_types::{Request, Response, StatusCode};
///
/// async fn hello(_req: Request, res: Responder) -> http_types::Result<()> {
///     let mut response = Response::new(StatusCode::Ok);
///     response.set_body("hello");
///     res.respond(response).await
/// }
/// # fn check<H: async_h1_conn::server::Handler>(_: H) {}
/// # check(hello);
/// ```
pub trait Handler: Send + Sync + 'static {
    /// Handle one request. Must spend `responder`, or fail.
    fn call(&self, req: Request, responder: Responder) -> BoxFuture<'static, http_types::Result<()>>;

    /// Whether this request's body is handed over while it is still arriving.
    ///
    /// Otherwise the body is read completely before the handler runs.
    fn streams_body(&self, _head: &RequestHead) -> bool {
        false
    }
}

impl<F, Fut> Handler for F
where
    F: Fn(Request, Responder) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = http_types::Result<()>> + Send + 'static,
{
    fn call(&self, req: Request, responder: Responder) -> BoxFuture<'static, http_types::Result<()>> {
        Box::pin(self(req, responder))
    }
}

/// Hands request bodies to the inner handler as they arrive.
#[derive(Debug, Clone)]
pub struct Streaming<H>(pub H);

impl<H: Handler> Handler for Streaming<H> {
    fn call(&self, req: Request, responder: Responder) -> BoxFuture<'static, http_types::Result<()>> {
        self.0.call(req, responder)
    }

    fn streams_body(&self, _head: &RequestHead) -> bool {
        true
    }
}

/// Turns a failure into the response the peer gets.
///
/// The head is missing when the request could not be parsed. Errors
/// returned from here are not retried: a fixed `500` is sent instead.
pub trait ErrorHandler: Send + Sync + 'static {
    /// Produce a response for `err`.
    fn handle(
        &self,
        head: Option<RequestHead>,
        err: Error,
    ) -> BoxFuture<'static, http_types::Result<Response>>;
}

impl<F, Fut> ErrorHandler for F
where
    F: Fn(Option<RequestHead>, Error) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = http_types::Result<Response>> + Send + 'static,
{
    fn handle(
        &self,
        head: Option<RequestHead>,
        err: Error,
    ) -> BoxFuture<'static, http_types::Result<Response>> {
        Box::pin(self(head, err))
    }
}

/// Answers with the error's status and its canonical reason as text.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorHandler;

impl ErrorHandler for DefaultErrorHandler {
    fn handle(
        &self,
        _head: Option<RequestHead>,
        err: Error,
    ) -> BoxFuture<'static, http_types::Result<Response>> {
        let status = match err.status() {
            status if status.is_client_error() || status.is_server_error() => status,
            _ => StatusCode::InternalServerError,
        };
        Box::pin(async move {
            let mut res = Response::new(status);
            res.set_body(status.canonical_reason());
            Ok(res)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::future::block_on;

    #[test]
    fn default_error_handler_uses_the_error_status() {
        let res = block_on(DefaultErrorHandler.handle(None, Error::RequestTimeout)).unwrap();
        assert_eq!(res.status(), StatusCode::RequestTimeout);

        let err = http_types::Error::from_str(StatusCode::Ok, "not really an error");
        let res = block_on(DefaultErrorHandler.handle(None, Error::Handler(err))).unwrap();
        assert_eq!(res.status(), StatusCode::InternalServerError);
    }

    #[test]
    fn default_error_handler_writes_the_reason() {
        let mut res = block_on(DefaultErrorHandler.handle(None, Error::PayloadTooLarge)).unwrap();
        let body = block_on(res.body_string()).unwrap();
        assert_eq!(body, "Payload Too Large");
    }
}
