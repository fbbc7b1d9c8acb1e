//! Read-side engine: as-of projection and time-bound resolution.

/// Live projection and as-of row/table materialization.
pub mod projector;
/// Time bounds, key filters and the query resolver.
pub mod resolver;
/// Event source seam used by the projector.
pub mod traits;
