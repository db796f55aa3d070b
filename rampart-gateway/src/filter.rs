//! Consumer side of the packet-filter signal channels.
//!
//! The admission engine tells a lower layer which client IPs to drop and
//! when to lift those drops. The transport under that contract is
//! swappable: anything implementing [`PacketFilter`] can sit at the end of
//! the channels.

use std::net::IpAddr;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use rampart_core::admission::signal::SignalReceiver;

/// The packet-level blocking collaborator beneath the HTTP gateway.
pub trait PacketFilter: Send + Sync + 'static {
    /// Start dropping traffic from `ip`.
    fn apply(&self, ip: IpAddr);
    /// Stop dropping traffic from `ip`.
    fn release(&self, ip: IpAddr);
}

/// A [`PacketFilter`] that only records the transitions in the log.
///
/// Stands in where no kernel-level filter integration is wired up.
#[derive(Debug, Default)]
pub struct LogPacketFilter;

impl PacketFilter for LogPacketFilter {
    fn apply(&self, ip: IpAddr) {
        info!(%ip, "packet filter: drop applied");
    }

    fn release(&self, ip: IpAddr) {
        info!(%ip, "packet filter: drop released");
    }
}

/// Spawn the task that drains both signal channels into the filter.
///
/// Runs until shutdown or until the admission engine hangs up. The two
/// channels are independent; no ordering is assumed between them.
pub fn spawn_consumer<F: PacketFilter>(
    filter: F,
    mut signals: SignalReceiver,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut block_open = true;
        let mut unblock_open = true;
        while block_open || unblock_open {
            tokio::select! {
                () = shutdown.cancelled() => break,
                ip = signals.block.recv(), if block_open => match ip {
                    Some(ip) => filter.apply(ip),
                    None => block_open = false,
                },
                ip = signals.unblock.recv(), if unblock_open => match ip {
                    Some(ip) => filter.release(ip),
                    None => unblock_open = false,
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingFilter {
        applied: Arc<Mutex<Vec<IpAddr>>>,
        released: Arc<Mutex<Vec<IpAddr>>>,
    }

    impl PacketFilter for RecordingFilter {
        fn apply(&self, ip: IpAddr) {
            self.applied.lock().unwrap().push(ip);
        }

        fn release(&self, ip: IpAddr) {
            self.released.lock().unwrap().push(ip);
        }
    }

    #[tokio::test]
    async fn consumer_routes_signals_to_the_filter() {
        let ip = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7));
        let (tx, rx) = rampart_core::admission::signal::channel(4);

        let filter = RecordingFilter::default();
        let applied = Arc::clone(&filter.applied);
        let released = Arc::clone(&filter.released);

        let shutdown = CancellationToken::new();
        let handle = spawn_consumer(filter, rx, shutdown.clone());

        tx.emit_block(ip);
        tx.emit_unblock(ip);
        drop(tx);
        handle.await.unwrap();

        assert_eq!(applied.lock().unwrap().as_slice(), &[ip]);
        assert_eq!(released.lock().unwrap().as_slice(), &[ip]);
        drop(shutdown);
    }

    #[tokio::test]
    async fn consumer_stops_on_shutdown() {
        let (_tx, rx) = rampart_core::admission::signal::channel(4);
        let shutdown = CancellationToken::new();
        let handle = spawn_consumer(LogPacketFilter, rx, shutdown.clone());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
