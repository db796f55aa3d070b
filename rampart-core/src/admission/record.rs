//! Per-client request history and block state.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// The block condition attached to a client record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockState {
    /// Not blocked.
    None,
    /// Temporarily blocked; lapses once `until` passes.
    BrownListed {
        /// When the block expires.
        until: Instant,
    },
    /// Permanently blocked; only an external reset clears this.
    Blacklisted,
}

/// Sliding-window request history plus block state for one client IP.
#[derive(Debug)]
pub(crate) struct ClientRecord {
    /// Request timestamps in ascending order, all within the tracking
    /// window after any pruning pass.
    history: VecDeque<Instant>,
    pub(crate) block: BlockState,
}

impl Default for ClientRecord {
    fn default() -> Self {
        Self {
            history: VecDeque::new(),
            block: BlockState::None,
        }
    }
}

impl ClientRecord {
    /// Append a request timestamp, prune everything that has slid out of the
    /// window, and return the resulting in-window count.
    pub(crate) fn observe(&mut self, now: Instant, window: Duration) -> usize {
        self.history.push_back(now);
        if let Some(cutoff) = now.checked_sub(window) {
            self.prune(cutoff);
        }
        self.history.len()
    }

    /// Drop history entries at or before `cutoff`.
    pub(crate) fn prune(&mut self, cutoff: Instant) {
        while self.history.front().is_some_and(|&t| t <= cutoff) {
            self.history.pop_front();
        }
    }

    /// Whether this record carries no state worth keeping.
    pub(crate) fn is_idle(&self) -> bool {
        self.history.is_empty() && self.block == BlockState::None
    }
}
