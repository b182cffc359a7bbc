//! # Dieah Recall
//!
//! Access-controlled memory store for Dieah with a rebuildable semantic index.
//!
//! ## Architecture
//!
//! - **Relational store** - SQLite, the source of truth for users, apps,
//!   memories, status history and access logs
//! - **Vector index** - LanceDB, a derived cache that may be missing or stale
//! - **Access control** - a pure per-memory evaluator consulted before any
//!   content is returned or any access is logged
//! - **Resync** - rebuilds the index from relational state, one batched
//!   embedding call per user
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dieah_recall::{Config, LazyCapabilities, MemoryStore, SearchEngine, SqliteStorage};
//!
//! let config = Config::from_env();
//! let storage = SqliteStorage::open(config.sqlite_path())?;
//! let capabilities = Arc::new(LazyCapabilities::new(config.clone(), None));
//! let store = MemoryStore::new(storage, capabilities, config.clone());
//!
//! store.add("u1", "cli", "likes espresso", None).await?;
//! let hits = SearchEngine::new(config).search(&store, "u1", "cli", "coffee", None).await?;
//! ```

pub mod access;
pub mod capability;
pub mod config;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod memory;
pub mod resync;
pub mod search;
pub mod secrets;
pub mod storage;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use capability::{CapabilityProvider, LazyCapabilities, StaticCapabilities};
pub use config::Config;
pub use error::{Error, Result};
pub use memory::{App, Memory, MemoryState, User};
pub use resync::{ResyncPipeline, ResyncStats};
pub use search::{SearchEngine, SearchMethod, SearchResponse};
pub use storage::SqliteStorage;
pub use store::MemoryStore;
