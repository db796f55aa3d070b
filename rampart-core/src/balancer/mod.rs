//! Backend selection and sticky-session routing.

pub mod pool;

pub use pool::{Policy, ServerPool};
