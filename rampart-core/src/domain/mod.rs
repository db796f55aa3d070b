//! Domain models for upstream targets.

pub mod backend;
