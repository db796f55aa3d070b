//! Error types shared across the core engines.

use thiserror::Error;

/// Backend selection failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SelectError {
    /// Every backend in the pool is dead (or the pool is empty).
    #[error("no available backend")]
    NoAvailableBackend,
}

/// Why an admission check turned a request away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectReason {
    /// The request pushed the client over the sliding-window limit.
    #[error("rate limit exceeded")]
    RateExceeded,
    /// The client is temporarily brown-listed and the block has not lapsed.
    #[error("temporarily blocked")]
    BrownListed,
    /// The client is permanently blacklisted.
    #[error("permanently blocked")]
    Blacklisted,
}

/// A rejected admission decision.
///
/// Rejections are per-request and non-fatal: the client may retry once the
/// block state clears, except under [`RejectReason::Blacklisted`], which
/// never clears on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("admission rejected: {reason}")]
pub struct Rejection {
    /// The specific block condition that applied.
    pub reason: RejectReason,
}

/// A policy name that matches neither supported selection policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown policy `{0}` (expected `round-robin` or `least-connections`)")]
pub struct InvalidPolicy(pub String);
