//! A single delay queue for brown-list expirations.
//!
//! One task owns a min-heap of `(deadline, ip)` entries and sleeps until the
//! earliest one matures, instead of spawning one timer task per blocked IP.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use super::Inner;

/// A scheduled brown-list expiration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExpiryEntry {
    pub(crate) ip: IpAddr,
    pub(crate) until: Instant,
}

/// Drain scheduled expirations until shutdown.
pub(crate) async fn run(
    inner: Arc<Inner>,
    mut rx: mpsc::UnboundedReceiver<ExpiryEntry>,
    shutdown: CancellationToken,
) {
    let mut queue: BinaryHeap<Reverse<(Instant, IpAddr)>> = BinaryHeap::new();
    loop {
        let next = queue.peek().map(|Reverse((deadline, _))| *deadline);
        tokio::select! {
            () = shutdown.cancelled() => break,
            entry = rx.recv() => match entry {
                Some(entry) => queue.push(Reverse((entry.until, entry.ip))),
                None => break,
            },
            () = sleep_until_or_forever(next) => {
                if let Some(Reverse((until, ip))) = queue.pop() {
                    inner.expire_brownlist(ip, until);
                }
            }
        }
    }
}

/// Sleep until the deadline, or forever when the queue is empty.
async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
