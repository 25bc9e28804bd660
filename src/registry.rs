//! The set of live connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

/// Tracks live connections and carries the shutdown signal.
///
/// A connection adds itself when it starts and is removed when its
/// [`ConnectionGuard`] drops. Nothing else touches its entry.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, Option<SocketAddr>>>,
    shutdown: AtomicBool,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Registry::new)
    }

    /// Add a connection. It stays registered until the guard drops.
    pub fn register(&self, peer_addr: Option<SocketAddr>) -> ConnectionGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.live().insert(id, peer_addr);
        log::trace!("connection {} registered, peer {:?}", id, peer_addr);
        ConnectionGuard {
            id,
            peer_addr,
            registry: self.clone(),
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.live().len()
    }

    /// Whether there are no live connections.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Peer addresses of the live connections, by connection id.
    pub fn peers(&self) -> Vec<(u64, Option<SocketAddr>)> {
        let mut peers: Vec<_> = self.live().iter().map(|(id, addr)| (*id, *addr)).collect();
        peers.sort_by_key(|(id, _)| *id);
        peers
    }

    /// Ask every connection to finish its current exchange and close.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
    }

    /// Whether [`Registry::shutdown`] was called.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    fn live(&self) -> MutexGuard<'_, HashMap<u64, Option<SocketAddr>>> {
        self.inner.live.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Membership of one connection in a [`Registry`].
#[derive(Debug)]
pub struct ConnectionGuard {
    id: u64,
    peer_addr: Option<SocketAddr>,
    registry: Registry,
}

impl ConnectionGuard {
    /// The connection id, unique within the registry.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The peer address recorded at registration.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// The registry this connection belongs to.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.live().remove(&self.id);
        log::trace!("connection {} unregistered", self.id);
    }
}

/// Connection details attached to every request as an extension.
///
/// ```
/// # fn check(req: &http_types::Request) {
/// use async_h1_conn::ConnInfo;
///
/// if let Some(info) = req.ext().get::<ConnInfo>() {
///     println!("request #{} on connection {}", info.request_count(), info.id());
/// }
/// # }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnInfo {
    id: u64,
    peer_addr: Option<SocketAddr>,
    request_count: u64,
}

impl ConnInfo {
    pub(crate) fn new(id: u64, peer_addr: Option<SocketAddr>, request_count: u64) -> Self {
        Self {
            id,
            peer_addr,
            request_count,
        }
    }

    /// The connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The remote address, when the transport knows it.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// 1 for the first request on the connection, 2 for the next, and so on.
    pub fn request_count(&self) -> u64 {
        self.request_count
    }
}
