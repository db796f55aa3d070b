//! Rampart core functionality.
//!
//! This crate contains the domain models and the two decision engines that
//! power the Rampart edge gateway: backend selection/routing (round-robin,
//! least-connections, sticky sessions) and per-IP admission control
//! (sliding-window tracking, brown-list and blacklist blocking).

pub mod admission;
pub mod balancer;
pub mod domain;
pub mod error;
