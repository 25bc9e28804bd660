//! A coarse, shared notion of "now".
//!
//! Timeout checks run often and on every connection, so they read a cached
//! instant that a background task refreshes at a fixed resolution instead of
//! asking the OS each time. Tests use [`Clock::manual`] and move time with
//! [`Clock::advance`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::{Duration, Instant};

use async_global_executor::Task;
use async_io::Timer;
use futures_lite::StreamExt;

/// Resolution of [`Clock::global`].
const DEFAULT_RESOLUTION: Duration = Duration::from_millis(10);

/// A cheaply clonable clock handle.
#[derive(Clone)]
pub struct Clock {
    inner: Arc<Inner>,
}

struct Inner {
    origin: Instant,
    /// Nanoseconds since `origin`, as of the last refresh.
    elapsed: AtomicU64,
    running: AtomicBool,
    mode: Mode,
    refresher: Mutex<Option<Task<()>>>,
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Coarse(Duration),
    Manual,
}

impl Inner {
    fn refresh(&self) {
        let nanos = self.origin.elapsed().as_nanos() as u64;
        self.elapsed.fetch_max(nanos, Ordering::Release);
    }

    fn cached(&self) -> Instant {
        self.origin + Duration::from_nanos(self.elapsed.load(Ordering::Acquire))
    }

    fn refresher(&self) -> MutexGuard<'_, Option<Task<()>>> {
        self.refresher.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clock {
    /// A clock refreshed every `resolution` once started.
    ///
    /// Until [`Clock::start`] is called, reads fall through to the OS.
    pub fn coarse(resolution: Duration) -> Self {
        Self::with_mode(Mode::Coarse(resolution))
    }

    /// A clock that only moves when [`Clock::advance`] is called.
    pub fn manual() -> Self {
        let clock = Self::with_mode(Mode::Manual);
        clock.inner.running.store(true, Ordering::Release);
        clock
    }

    fn with_mode(mode: Mode) -> Self {
        Self {
            inner: Arc::new(Inner {
                origin: Instant::now(),
                elapsed: AtomicU64::new(0),
                running: AtomicBool::new(false),
                mode,
                refresher: Mutex::new(None),
            }),
        }
    }

    /// The process-wide clock, started on first use.
    pub fn global() -> &'static Clock {
        static GLOBAL: OnceLock<Clock> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let clock = Clock::coarse(DEFAULT_RESOLUTION);
            clock.start();
            clock
        })
    }

    /// Start refreshing the cached instant. Does nothing for manual clocks.
    pub fn start(&self) {
        let resolution = match self.inner.mode {
            Mode::Coarse(resolution) => resolution,
            Mode::Manual => return,
        };
        let mut refresher = self.inner.refresher();
        if refresher.is_some() {
            return;
        }
        self.inner.refresh();

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        *refresher = Some(async_global_executor::spawn(async move {
            let mut ticks = Timer::interval(resolution);
            while ticks.next().await.is_some() {
                match weak.upgrade() {
                    Some(inner) => inner.refresh(),
                    None => break,
                }
            }
        }));
        self.inner.running.store(true, Ordering::Release);
        log::trace!("clock started, resolution {:?}", resolution);
    }

    /// Stop refreshing. Reads fall through to the OS afterwards.
    pub fn stop(&self) {
        if let Mode::Manual = self.inner.mode {
            return;
        }
        // Dropping the task cancels it.
        let task = self.inner.refresher().take();
        self.inner.running.store(false, Ordering::Release);
        drop(task);
    }

    /// Whether reads are served from the cache.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// The current instant, as far as this clock knows.
    pub fn now(&self) -> Instant {
        if self.is_running() {
            self.inner.cached()
        } else {
            Instant::now()
        }
    }

    /// Move a manual clock forward. Ignored by coarse clocks.
    pub fn advance(&self, by: Duration) {
        if let Mode::Manual = self.inner.mode {
            let nanos = by.as_nanos() as u64;
            self.inner.elapsed.fetch_add(nanos, Ordering::AcqRel);
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::global().clone()
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock")
            .field("mode", &self.inner.mode)
            .field("running", &self.is_running())
            .finish()
    }
}
