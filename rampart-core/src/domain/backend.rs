//! Backend server models.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Represents a single upstream backend server.
///
/// Liveness is read, never computed, by the selection logic: an external
/// collaborator flips it with [`Backend::set_alive`]. The connection counter
/// is only touched through [`Backend::track_connection`], so it can never go
/// negative.
#[derive(Debug)]
pub struct Backend {
    /// The socket address of the backend.
    addr: SocketAddr,
    /// Whether the backend is currently considered alive.
    alive: AtomicBool,
    /// The number of in-flight requests routed to this backend.
    active_connections: AtomicU64,
}

impl Backend {
    /// Create a new backend for the given address.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            alive: AtomicBool::new(true), // assume alive initially
            active_connections: AtomicU64::new(0),
        }
    }

    /// The address requests are forwarded to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Check if the backend is marked alive.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Update the liveness of the backend.
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    /// The current number of in-flight requests.
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Increment the connection counter and return a guard that decrements
    /// it when the request finishes and the guard drops.
    pub fn track_connection(self: &Arc<Self>) -> ConnectionGuard {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            backend: Arc::clone(self),
        }
    }
}

/// A thread-safe reference to a Backend.
pub type SharedBackend = Arc<Backend>;

/// A RAII guard that automatically decrements a backend's connection counter
/// when the in-flight request it tracks completes.
#[derive(Debug)]
pub struct ConnectionGuard {
    backend: SharedBackend,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.backend
            .active_connections
            .fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(port: u16) -> SharedBackend {
        Arc::new(Backend::new(([127, 0, 0, 1], port).into()))
    }

    #[test]
    fn connection_guard_balances_the_counter() {
        let b = backend(9001);
        assert_eq!(b.active_connections(), 0);

        let g1 = b.track_connection();
        let g2 = b.track_connection();
        assert_eq!(b.active_connections(), 2);

        drop(g1);
        assert_eq!(b.active_connections(), 1);
        drop(g2);
        assert_eq!(b.active_connections(), 0);
    }

    #[test]
    fn liveness_round_trips() {
        let b = backend(9002);
        assert!(b.is_alive());
        b.set_alive(false);
        assert!(!b.is_alive());
        b.set_alive(true);
        assert!(b.is_alive());
    }
}
