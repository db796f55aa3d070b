//! Per-client-IP admission control.
//!
//! Two admission paths share one sliding-window history mechanism but carry
//! different block semantics. Requests with a session token that exceed the
//! rate limit are brown-listed (temporary, self-expiring); requests without
//! one are blacklisted (permanent, external-only release). Both transitions
//! emit a block signal to the packet-filter collaborator; brown-list expiry
//! emits exactly one unblock signal per event.

mod expiry;
mod record;
pub mod signal;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RejectReason, Rejection};
use expiry::ExpiryEntry;
use record::{BlockState, ClientRecord};
use signal::{SignalReceiver, SignalSender};

/// Tunable parameters for the admission engine.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionConfig {
    /// Requests allowed per client within the tracking window.
    pub rate_limit: usize,
    /// Length of the sliding window.
    pub tracking_window: Duration,
    /// How long a brown-listed client stays blocked.
    pub brownlist_duration: Duration,
    /// Capacity of each signal channel.
    pub signal_capacity: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            rate_limit: 20,
            tracking_window: Duration::from_secs(20),
            brownlist_duration: Duration::from_secs(25),
            signal_capacity: 64,
        }
    }
}

/// The admission-control engine.
///
/// Cheap to clone; all clones share the same state. Requests for one IP are
/// totally ordered by that IP's map shard lock, so no two requests from the
/// same client can race on its sliding window.
#[derive(Debug, Clone)]
pub struct AdmissionControl {
    inner: Arc<Inner>,
}

#[derive(Debug)]
pub(crate) struct Inner {
    cfg: AdmissionConfig,
    records: DashMap<IpAddr, ClientRecord>,
    signals: SignalSender,
    expiry_tx: mpsc::UnboundedSender<ExpiryEntry>,
}

impl AdmissionControl {
    /// Create the engine and spawn its background tasks (the brown-list
    /// expiry queue and the periodic history compaction sweep).
    ///
    /// Both tasks stop cooperatively when `shutdown` is cancelled. The
    /// returned [`SignalReceiver`] is the packet-filter collaborator's end
    /// of the block/unblock channels.
    pub fn new(cfg: AdmissionConfig, shutdown: CancellationToken) -> (Self, SignalReceiver) {
        let (signals, receiver) = signal::channel(cfg.signal_capacity);
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            cfg,
            records: DashMap::new(),
            signals,
            expiry_tx,
        });

        tokio::spawn(expiry::run(Arc::clone(&inner), expiry_rx, shutdown.clone()));
        tokio::spawn(run_compaction(Arc::clone(&inner), shutdown));

        (Self { inner }, receiver)
    }

    /// Decide whether to admit a request from `ip`.
    ///
    /// `has_session` selects the path: session traffic can only ever be
    /// brown-listed, sessionless traffic only ever blacklisted. No failure
    /// crosses from one path into the other.
    pub fn admit(&self, ip: IpAddr, has_session: bool) -> Result<(), Rejection> {
        if has_session {
            self.inner.session_check(ip)
        } else {
            self.inner.limit_check(ip)
        }
    }

    /// Externally triggered release: forget everything about `ip`,
    /// including a blacklist entry. This is the only way out of
    /// [`RejectReason::Blacklisted`].
    pub fn reset(&self, ip: IpAddr) {
        if self.inner.records.remove(&ip).is_some() {
            info!(%ip, "admission state reset");
        }
    }

    /// The number of client IPs currently tracked.
    pub fn tracked_ips(&self) -> usize {
        self.inner.records.len()
    }

    /// The number of signals dropped due to channel saturation.
    pub fn dropped_signals(&self) -> u64 {
        self.inner.signals.dropped_signals()
    }
}

impl Inner {
    /// Session path: brown-list semantics.
    fn session_check(&self, ip: IpAddr) -> Result<(), Rejection> {
        let now = Instant::now();
        let mut brownlisted_until = None;
        {
            let mut rec = self.records.entry(ip).or_default();
            if let BlockState::BrownListed { until } = rec.block {
                if now < until {
                    return Err(Rejection {
                        reason: RejectReason::BrownListed,
                    });
                }
                // Lapsed before the expiry task got to it; clear lazily.
                rec.block = BlockState::None;
            }
            if rec.observe(now, self.cfg.tracking_window) > self.cfg.rate_limit {
                let until = now + self.cfg.brownlist_duration;
                rec.block = BlockState::BrownListed { until };
                brownlisted_until = Some(until);
            }
        }
        // The shard lock is released; signal emission never runs under it.
        if let Some(until) = brownlisted_until {
            warn!(%ip, "rate limit exceeded, client brown-listed");
            self.signals.emit_block(ip);
            if self.expiry_tx.send(ExpiryEntry { ip, until }).is_err() {
                debug!(%ip, "expiry queue is shut down");
            }
            return Err(Rejection {
                reason: RejectReason::RateExceeded,
            });
        }
        Ok(())
    }

    /// Non-session path: blacklist semantics. No expiry is ever scheduled.
    fn limit_check(&self, ip: IpAddr) -> Result<(), Rejection> {
        let now = Instant::now();
        let mut blacklisted = false;
        {
            let mut rec = self.records.entry(ip).or_default();
            if rec.block == BlockState::Blacklisted {
                return Err(Rejection {
                    reason: RejectReason::Blacklisted,
                });
            }
            if rec.observe(now, self.cfg.tracking_window) > self.cfg.rate_limit {
                rec.block = BlockState::Blacklisted;
                blacklisted = true;
            }
        }
        if blacklisted {
            warn!(%ip, "rate limit exceeded, client blacklisted");
            self.signals.emit_block(ip);
            return Err(Rejection {
                reason: RejectReason::RateExceeded,
            });
        }
        Ok(())
    }

    /// Called by the expiry queue when a brown-list event matures.
    ///
    /// The unblock signal is emitted unconditionally, once per brown-list
    /// event: the packet filter applied a drop for this event and must
    /// release it even if the record was already cleared lazily. The state
    /// is only cleared when this event is still the current one.
    pub(crate) fn expire_brownlist(&self, ip: IpAddr, until: Instant) {
        if let Some(mut rec) = self.records.get_mut(&ip) {
            if matches!(rec.block, BlockState::BrownListed { until: u } if u == until) {
                rec.block = BlockState::None;
            }
        }
        self.signals.emit_unblock(ip);
        info!(%ip, "brown-list expired, unblock signal emitted");
    }

    /// Prune every record against the current window and drop the ones with
    /// nothing left to say. Blacklisted records are kept indefinitely.
    fn compact(&self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.cfg.tracking_window) else {
            return;
        };
        // Counted per record rather than by length snapshots: `retain` walks
        // the shards one at a time, so concurrent inserts into already-swept
        // shards can grow the map mid-sweep.
        let mut removed = 0usize;
        self.records.retain(|_, rec| {
            rec.prune(cutoff);
            if rec.is_idle() {
                removed += 1;
                return false;
            }
            true
        });
        if removed > 0 {
            debug!(removed, remaining = self.records.len(), "compacted idle client records");
        }
    }
}

/// Periodic history compaction, bounding memory for IPs that go quiet
/// without ever being blocked.
async fn run_compaction(inner: Arc<Inner>, shutdown: CancellationToken) {
    let mut ticker = interval(inner.cfg.tracking_window);

    // Prevent immediately ticking when spawned
    ticker.tick().await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => inner.compact(Instant::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::time::advance;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, last))
    }

    fn engine(cfg: AdmissionConfig) -> (AdmissionControl, SignalReceiver, CancellationToken) {
        let shutdown = CancellationToken::new();
        let (ac, rx) = AdmissionControl::new(cfg, shutdown.clone());
        (ac, rx, shutdown)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn requests_within_the_limit_are_admitted() {
        let (ac, _rx, _guard) = engine(AdmissionConfig::default());
        for _ in 0..20 {
            assert!(ac.admit(ip(1), false).is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sessionless_burst_is_blacklisted_permanently() {
        let (ac, mut rx, _guard) = engine(AdmissionConfig::default());

        // 21 requests within 5 seconds: 1-20 admitted, 21 rejected.
        for i in 0..21 {
            let decision = ac.admit(ip(2), false);
            if i < 20 {
                assert!(decision.is_ok(), "request {} should be admitted", i + 1);
            } else {
                assert_eq!(
                    decision.unwrap_err().reason,
                    RejectReason::RateExceeded
                );
            }
            advance(Duration::from_millis(200)).await;
        }

        // Exactly one block signal, and never an unblock.
        assert_eq!(rx.block.try_recv().ok(), Some(ip(2)));
        assert!(rx.block.try_recv().is_err());

        // The blacklist never lapses on its own.
        advance(Duration::from_secs(300)).await;
        settle().await;
        assert_eq!(
            ac.admit(ip(2), false).unwrap_err().reason,
            RejectReason::Blacklisted
        );
        assert!(rx.unblock.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn session_burst_is_brownlisted_for_the_full_duration() {
        let (ac, mut rx, _guard) = engine(AdmissionConfig::default());

        for _ in 0..20 {
            assert!(ac.admit(ip(3), true).is_ok());
        }
        assert_eq!(
            ac.admit(ip(3), true).unwrap_err().reason,
            RejectReason::RateExceeded
        );
        assert_eq!(rx.block.try_recv().ok(), Some(ip(3)));

        // Still blocked just before expiry.
        advance(Duration::from_secs(24)).await;
        assert_eq!(
            ac.admit(ip(3), true).unwrap_err().reason,
            RejectReason::BrownListed
        );

        // Eligible again once the duration has fully passed, and exactly
        // one unblock signal arrives for the event.
        advance(Duration::from_secs(2)).await;
        settle().await;
        assert!(ac.admit(ip(3), true).is_ok());
        assert_eq!(rx.unblock.recv().await, Some(ip(3)));
        assert!(rx.unblock.try_recv().is_err());
        assert!(rx.block.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_requests_do_not_extend_the_block() {
        let cfg = AdmissionConfig {
            rate_limit: 3,
            ..AdmissionConfig::default()
        };
        let (ac, mut rx, _guard) = engine(cfg);

        for _ in 0..3 {
            assert!(ac.admit(ip(4), true).is_ok());
        }
        assert!(ac.admit(ip(4), true).is_err());

        // Hammering a brown-listed client appends nothing to its history.
        for _ in 0..10 {
            assert_eq!(
                ac.admit(ip(4), true).unwrap_err().reason,
                RejectReason::BrownListed
            );
        }

        assert_eq!(rx.unblock.recv().await, Some(ip(4)));
        for _ in 0..3 {
            assert!(ac.admit(ip(4), true).is_ok());
        }
        assert!(ac.admit(ip(4), true).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn the_window_actually_slides() {
        let cfg = AdmissionConfig {
            rate_limit: 5,
            ..AdmissionConfig::default()
        };
        let (ac, _rx, _guard) = engine(cfg);

        for _ in 0..5 {
            assert!(ac.admit(ip(5), false).is_ok());
        }

        // After the window passes, the budget is fresh.
        advance(Duration::from_secs(21)).await;
        settle().await;
        for _ in 0..5 {
            assert!(ac.admit(ip(5), false).is_ok());
        }
        assert!(ac.admit(ip(5), false).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn paths_are_isolated_per_ip_state() {
        let (ac, _rx, _guard) = engine(AdmissionConfig::default());

        // Blacklisting one IP leaves another untouched.
        for _ in 0..21 {
            let _ = ac.admit(ip(6), false);
        }
        assert!(ac.admit(ip(7), false).is_ok());
        assert!(ac.admit(ip(7), true).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_is_the_only_way_out_of_the_blacklist() {
        let cfg = AdmissionConfig {
            rate_limit: 1,
            ..AdmissionConfig::default()
        };
        let (ac, _rx, _guard) = engine(cfg);

        assert!(ac.admit(ip(8), false).is_ok());
        assert!(ac.admit(ip(8), false).is_err());
        assert_eq!(
            ac.admit(ip(8), false).unwrap_err().reason,
            RejectReason::Blacklisted
        );

        ac.reset(ip(8));
        assert!(ac.admit(ip(8), false).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_signal_channel_drops_and_counts() {
        let cfg = AdmissionConfig {
            rate_limit: 0,
            signal_capacity: 1,
            ..AdmissionConfig::default()
        };
        let (ac, mut rx, _guard) = engine(cfg);

        assert!(ac.admit(ip(9), false).is_err());
        assert!(ac.admit(ip(10), false).is_err());

        assert_eq!(ac.dropped_signals(), 1);
        assert_eq!(rx.block.try_recv().ok(), Some(ip(9)));
        assert!(rx.block.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn compaction_drops_idle_records_but_keeps_blacklisted_ones() {
        let cfg = AdmissionConfig {
            rate_limit: 1,
            tracking_window: Duration::from_secs(5),
            ..AdmissionConfig::default()
        };
        let (ac, _rx, _guard) = engine(cfg);
        // Let the spawned sweep task start its interval before the paused
        // clock moves, so its first tick lands inside the advance below.
        settle().await;

        assert!(ac.admit(ip(11), false).is_ok());
        assert!(ac.admit(ip(12), false).is_ok());
        assert!(ac.admit(ip(12), false).is_err());
        assert_eq!(ac.tracked_ips(), 2);

        advance(Duration::from_secs(6)).await;
        settle().await;

        // The quiet IP is gone; the blacklisted one is retained.
        assert_eq!(ac.tracked_ips(), 1);
        assert_eq!(
            ac.admit(ip(12), false).unwrap_err().reason,
            RejectReason::Blacklisted
        );
    }

    #[tokio::test(start_paused = true)]
    async fn direct_compaction_drops_exactly_the_idle_records() {
        let cfg = AdmissionConfig {
            rate_limit: 1,
            ..AdmissionConfig::default()
        };
        let (ac, _rx, shutdown) = engine(cfg);

        // Stop the periodic sweep so the direct calls below do all the work.
        shutdown.cancel();
        settle().await;

        assert!(ac.admit(ip(14), false).is_ok());
        assert!(ac.admit(ip(15), false).is_ok());
        assert!(ac.admit(ip(15), false).is_err());
        assert_eq!(ac.tracked_ips(), 2);

        // Sweep with every history entry out of the window: the quiet IP is
        // reclaimed, the blacklisted one survives, and a second sweep over
        // the already-clean map is a no-op.
        advance(Duration::from_secs(21)).await;
        ac.inner.compact(Instant::now());
        assert_eq!(ac.tracked_ips(), 1);
        ac.inner.compact(Instant::now());
        assert_eq!(ac.tracked_ips(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn background_tasks_stop_on_shutdown() {
        let (ac, _rx, shutdown) = engine(AdmissionConfig::default());
        shutdown.cancel();
        settle().await;

        // Admission still works after shutdown; only the timers are gone.
        assert!(ac.admit(ip(13), true).is_ok());
    }
}
