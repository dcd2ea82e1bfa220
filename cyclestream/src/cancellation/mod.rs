//! Cooperative cancellation.
//!
//! The runner checks the token between micro-batches and immediately before
//! every commit, never during one. Streaming mode also awaits the token
//! while sleeping between polls.

mod token;

pub use token::{CancelCallback, CancellationToken};
