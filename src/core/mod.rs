//! Derived index and the store that ties log, index and projection together.

/// Sequence, timestamp and key-history index.
pub mod indices;
/// Thread-safe engine store.
pub mod store;
