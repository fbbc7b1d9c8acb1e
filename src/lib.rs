//! Embedded append-only event log with point-in-time ("as of") table reads.
//!
//! Every insert, update, soft delete and table drop is stored as an immutable,
//! sequence-numbered, CRC-checked frame. The state of a row or a whole table
//! at any earlier sequence or timestamp is rebuilt from those events; the
//! latest state is served from an incrementally maintained projection.
//!
//! Sequence order is authoritative. Timestamp bounds are best effort because
//! wall clocks can step backwards; see [`engine::resolver::TimeBound`].
//!
//! # Examples
//!
//! Synchronous usage with [`core::store::Store`]:
//! ```
//! use chronolog::{
//!     config::EngineConfig,
//!     core::store::Store,
//!     engine::resolver::{Query, TimeBound},
//! };
//!
//! let dir = tempfile::tempdir().expect("tempdir");
//! let store = Store::open(dir.path().join("events.log"), EngineConfig::default()).expect("open");
//!
//! let first = store.insert("users", "u1", r#"{"qty":100}"#).expect("insert");
//! store.update("users", "u1", r#"{"qty":90}"#).expect("update");
//! store.soft_delete("users", "u1").expect("delete");
//!
//! let then = store.state_as_of("users", "u1", first, false).expect("as of");
//! assert_eq!(then.expect("row").payload, br#"{"qty":100}"#);
//!
//! let now = store.query(&Query::table("users").as_of(TimeBound::Latest)).expect("query");
//! assert!(now.rows.is_empty());
//! ```
//!
//! Runtime usage with SQLite snapshots:
//! ```no_run
//! use std::sync::Arc;
//!
//! use chronolog::{
//!     config::{EngineConfig, RuntimeConfig},
//!     core::store::Store,
//!     engine::resolver::Query,
//!     persist::sqlite::SqliteSnapshotStore,
//!     runtime::handle::spawn_engine,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let snapshots = SqliteSnapshotStore::open("snapshots.db").expect("open sqlite");
//! let store = Store::open("events.log", EngineConfig::default())
//!     .expect("open log")
//!     .with_snapshots(Box::new(snapshots));
//! let handle = spawn_engine(Arc::new(store), RuntimeConfig::default());
//! let seq = handle.insert("users", "u1", r#"{"name":"Alice"}"#).await.expect("insert");
//! let rows = handle.query(Query::table("users")).await.expect("query");
//! assert_eq!(rows.sequence, seq);
//! handle.shutdown().await.expect("shutdown");
//! # }
//! ```
#![warn(missing_docs)]

/// Append timestamp sources.
pub mod clock;
/// Single-frame binary codec.
pub mod codec;
/// Engine and runtime options.
pub mod config;
/// Derived index and the thread-safe store.
pub mod core;
/// As-of projection and query resolution.
pub mod engine;
/// Crate error type.
pub mod error;
/// Events, drafts and rows.
pub mod event;
/// Durable append-only log file.
pub mod log;
/// Snapshot persistence abstraction and SQLite implementation.
pub mod persist;
/// Single-writer runtime handle and events.
pub mod runtime;
/// Shared primitive types and enums.
pub mod types;

pub use error::{Error, Result};
