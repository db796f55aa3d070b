//! Block/unblock signal channels to the packet-filter collaborator.
//!
//! Emission never blocks: signals are pushed with `try_send` so no admission
//! state lock can ever wait on a slow or absent consumer. When a channel is
//! full the newest signal is dropped, counted, and logged.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// The emitting half held by the admission engine.
#[derive(Debug)]
pub struct SignalSender {
    block_tx: mpsc::Sender<IpAddr>,
    unblock_tx: mpsc::Sender<IpAddr>,
    dropped: AtomicU64,
}

/// The consuming half handed to the packet-filter collaborator.
///
/// The two channels are independent and fire-and-forget: there is no
/// ordering guarantee between them.
#[derive(Debug)]
pub struct SignalReceiver {
    /// IPs whose traffic should be dropped at the lower layer.
    pub block: mpsc::Receiver<IpAddr>,
    /// IPs whose lower-layer drop should be lifted.
    pub unblock: mpsc::Receiver<IpAddr>,
}

/// Create a bounded block/unblock channel pair.
///
/// `capacity` is clamped to at least one slot per channel.
pub fn channel(capacity: usize) -> (SignalSender, SignalReceiver) {
    let capacity = capacity.max(1);
    let (block_tx, block_rx) = mpsc::channel(capacity);
    let (unblock_tx, unblock_rx) = mpsc::channel(capacity);
    (
        SignalSender {
            block_tx,
            unblock_tx,
            dropped: AtomicU64::new(0),
        },
        SignalReceiver {
            block: block_rx,
            unblock: unblock_rx,
        },
    )
}

impl SignalSender {
    /// Signal that traffic from `ip` should be dropped beneath the gateway.
    pub fn emit_block(&self, ip: IpAddr) {
        self.emit(&self.block_tx, ip, "block");
    }

    /// Signal that the lower-layer drop for `ip` should be lifted.
    pub fn emit_unblock(&self, ip: IpAddr) {
        self.emit(&self.unblock_tx, ip, "unblock");
    }

    /// The number of signals dropped because a channel was full.
    pub fn dropped_signals(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn emit(&self, tx: &mpsc::Sender<IpAddr>, ip: IpAddr, kind: &'static str) {
        match tx.try_send(ip) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(%ip, kind, "signal channel full, dropping signal");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(%ip, kind, "signal consumer is gone");
            }
        }
    }
}
