//! The forwarding collaborator: ships an admitted request to a backend.
//!
//! Keeps a lock-free two-stage pool of idle HTTP/1.1 senders per backend so
//! repeat traffic to the same upstream reuses TCP connections.

use std::net::SocketAddr;
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

/// A forwarding failure, surfaced per request and never fatal to the
/// gateway itself.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The TCP connection to the backend could not be established.
    #[error("failed to connect to backend: {0}")]
    Connect(#[from] std::io::Error),
    /// The upstream HTTP exchange failed.
    #[error("upstream http error: {0}")]
    Upstream(#[from] hyper::Error),
}

/// Forwards requests over pooled HTTP/1.1 connections.
#[derive(Debug, Clone, Default)]
pub struct HttpForwarder {
    /// Maps a backend address to a lock-free queue of idle senders.
    idle: Arc<DashMap<SocketAddr, Arc<SegQueue<SendRequest<Incoming>>>>>,
}

impl HttpForwarder {
    /// Create a forwarder with an empty connection pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward `req` to the backend at `addr` and return its response.
    ///
    /// The request's `Host` header is rewritten to the backend address, as
    /// the gateway terminates the client-facing hop.
    pub async fn forward(
        &self,
        addr: SocketAddr,
        mut req: Request<Incoming>,
    ) -> Result<Response<Incoming>, ForwardError> {
        if let Ok(host) = HeaderValue::from_str(&addr.to_string()) {
            req.headers_mut().insert(HOST, host);
        }

        let mut sender = match self.try_checkout(addr) {
            Some(sender) => sender,
            None => self.connect(addr).await?,
        };

        // A pooled sender may have died while idle; fall back to a fresh
        // connection rather than failing the request.
        if sender.ready().await.is_err() {
            sender = self.connect(addr).await?;
        }

        let response = sender.send_request(req).await?;
        self.check_in(addr, sender);
        Ok(response)
    }

    /// Pop an idle sender for the backend, skipping closed ones.
    fn try_checkout(&self, addr: SocketAddr) -> Option<SendRequest<Incoming>> {
        let queue = self.idle.get(&addr)?.value().clone();
        while let Some(sender) = queue.pop() {
            if !sender.is_closed() {
                return Some(sender);
            }
        }
        None
    }

    /// Return a live sender to the pool for reuse.
    fn check_in(&self, addr: SocketAddr, sender: SendRequest<Incoming>) {
        if sender.is_closed() {
            return;
        }
        let queue = self
            .idle
            .entry(addr)
            .or_insert_with(|| Arc::new(SegQueue::new()))
            .value()
            .clone();
        queue.push(sender);
    }

    /// Open a new connection and spawn its driver task.
    async fn connect(&self, addr: SocketAddr) -> Result<SendRequest<Incoming>, ForwardError> {
        let stream = TcpStream::connect(addr).await?;
        let io = TokioIo::new(stream);
        let (sender, conn) = http1::handshake::<_, Incoming>(io).await?;
        tokio::task::spawn(async move {
            if let Err(err) = conn.await {
                debug!(error = ?err, "backend connection closed");
            }
        });
        Ok(sender)
    }
}
