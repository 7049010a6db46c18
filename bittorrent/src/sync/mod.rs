//! Async synchronisation primitives the engine needs beyond what
//! `tokio::sync` offers directly: a single-slot mutual-exclusion guard with
//! FIFO-by-arrival fairness, and a thin counting semaphore wrapper used to
//! cap concurrent disk operations per torrent.

mod exclusive;
mod semaphore;

pub use exclusive::{AsyncExclusive, ExclusiveGuard};
pub use semaphore::AsyncSemaphore;
