//! # pydra-store
//!
//! Task Store for Pydra's Master: SQLite-backed persistence for
//! `TaskInstance` and `WorkUnit` records (WAL mode, mmap) and known Nodes,
//! plus a `moka`-backed cache layer used by the Status Aggregator's
//! TTL-deduplicated progress fetches.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  CacheLayer (moka)  — status fan-out TTL │
//! ├─────────────────────────────────────────┤
//! │  TaskStore  (task_instances, work_units) │
//! │  NodeStore  (known Nodes)                │
//! ├─────────────────────────────────────────┤
//! │  Database (rusqlite WAL + mmap)          │
//! │  Migrations (versioned, transactional)   │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use pydra_store::{Database, TaskStore, CacheLayer};
//!
//! let db = Database::open_and_migrate("data/pydra.db").await?;
//! let tasks = TaskStore::new(db.clone());
//! let cache: CacheLayer<String> = CacheLayer::builder("task_status")
//!     .max_capacity(1000)
//!     .ttl_seconds(3)
//!     .build();
//! ```

pub mod cache;
pub mod db;
pub mod error;
pub mod migration;
pub mod task_store;

// ── re-exports ───────────────────────────────────────────────────────

pub use cache::{CacheLayer, CacheLayerBuilder, CacheStats};
pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use task_store::{Node, NodeStore, TaskInstance, TaskStatus, TaskStore, WorkUnit};
