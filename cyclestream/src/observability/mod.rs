//! Observability: `tracing` subscriber setup.
//!
//! Library code only emits `tracing` events and [`crate::events`]; the
//! binary decides where they go.

mod logging;

pub use logging::{init_tracing, LogConfig, LogFormat, LogLevel};
