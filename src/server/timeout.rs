//! Connection deadlines.
//!
//! A connection carries three independent deadlines. Each is an armed
//! instant or nothing; arming overwrites the slot and disarming clears it, so
//! a stale deadline can never fire into a later phase.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_io::Timer;
use futures_lite::Stream;
use pin_project::pin_project;

use crate::{Clock, Registry};

/// Which deadline fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// The request was not fully received in time.
    Request,
    /// The handler did not start a response in time, or the response stalled.
    Response,
    /// The connection sat idle between requests for too long.
    KeepAlive,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Request => f.write_str("request timeout"),
            TimeoutKind::Response => f.write_str("response timeout"),
            TimeoutKind::KeepAlive => f.write_str("keep-alive timeout"),
        }
    }
}

/// The deadlines of one connection.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Timeouts {
    request: Option<Instant>,
    response: Option<Instant>,
    keep_alive: Option<Instant>,
}

impl Timeouts {
    fn slot(&mut self, kind: TimeoutKind) -> &mut Option<Instant> {
        match kind {
            TimeoutKind::Request => &mut self.request,
            TimeoutKind::Response => &mut self.response,
            TimeoutKind::KeepAlive => &mut self.keep_alive,
        }
    }

    /// Arm `kind` to fire `after` from `now`. A `None` duration disarms it.
    pub(crate) fn arm(&mut self, kind: TimeoutKind, now: Instant, after: Option<Duration>) {
        *self.slot(kind) = after.map(|after| now + after);
    }

    pub(crate) fn disarm(&mut self, kind: TimeoutKind) {
        *self.slot(kind) = None;
    }

    pub(crate) fn disarm_all(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn is_armed(&self, kind: TimeoutKind) -> bool {
        match kind {
            TimeoutKind::Request => self.request.is_some(),
            TimeoutKind::Response => self.response.is_some(),
            TimeoutKind::KeepAlive => self.keep_alive.is_some(),
        }
    }

    /// The first deadline at or before `now`, request first.
    pub(crate) fn expired(&self, now: Instant) -> Option<TimeoutKind> {
        let fired = |deadline: Option<Instant>| deadline.map_or(false, |d| d <= now);
        if fired(self.request) {
            Some(TimeoutKind::Request)
        } else if fired(self.response) {
            Some(TimeoutKind::Response)
        } else if fired(self.keep_alive) {
            Some(TimeoutKind::KeepAlive)
        } else {
            None
        }
    }
}

/// Why a supervised future was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupt {
    Timeout(TimeoutKind),
    Shutdown,
}

/// Runs a future until it completes or an armed deadline passes.
///
/// Deadlines are checked against `clock` whenever `ticker` fires.
#[pin_project]
pub(crate) struct Supervised<'a, F> {
    #[pin]
    future: F,
    timeouts: &'a Timeouts,
    clock: &'a Clock,
    ticker: &'a mut Timer,
    registry: Option<&'a Registry>,
}

impl<'a, F> Supervised<'a, F> {
    pub(crate) fn new(
        future: F,
        timeouts: &'a Timeouts,
        clock: &'a Clock,
        ticker: &'a mut Timer,
    ) -> Self {
        Self {
            future,
            timeouts,
            clock,
            ticker,
            registry: None,
        }
    }

    /// Also give up once `registry` is shutting down.
    pub(crate) fn or_shutdown(mut self, registry: &'a Registry) -> Self {
        self.registry = Some(registry);
        self
    }
}

impl<F: Future> Future for Supervised<'_, F> {
    type Output = Result<F::Output, Interrupt>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if let Poll::Ready(output) = this.future.poll(cx) {
            return Poll::Ready(Ok(output));
        }

        while let Poll::Ready(Some(_)) = Pin::new(&mut **this.ticker).poll_next(cx) {
            if let Some(kind) = this.timeouts.expired(this.clock.now()) {
                return Poll::Ready(Err(Interrupt::Timeout(kind)));
            }
            if this.registry.map_or(false, |r| r.is_shutting_down()) {
                return Poll::Ready(Err(Interrupt::Shutdown));
            }
        }
        Poll::Pending
    }
}
