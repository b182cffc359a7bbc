//! The semantic-search capability: vector index interface, its record types,
//! and the lazily-initialised bundle of embedder + index + ingestor.
//!
//! The index is a derived cache of relational state. Anything here may be
//! missing, stale or unreachable; callers treat failures as recoverable.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::{build_embedder, Embedder};
use crate::error::{Error, Result};
use crate::ingest::{MemoryIngestor, VectorIngestor};
use crate::memory::Memory;
use crate::storage::LanceDbIndex;

/// Denormalized memory snapshot stored next to each vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorPayload {
    /// External user id of the owner
    pub user_id: String,

    /// Memory content
    pub data: String,

    /// SHA-256 of `data`
    pub hash: String,

    #[serde(default)]
    pub metadata: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl VectorPayload {
    pub fn from_memory(memory: &Memory, owner: &str) -> Self {
        Self {
            user_id: owner.to_string(),
            data: memory.content.clone(),
            hash: memory.content_hash(),
            metadata: memory.metadata.clone(),
            created_at: Some(memory.created_at.to_rfc3339()),
            updated_at: Some(memory.updated_at.to_rfc3339()),
        }
    }
}

/// One point in the index; `id` equals the memory id
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: VectorPayload,
}

/// A nearest-neighbour result. `id` is `None` when the stored id is not a
/// valid memory id; such hits are never surfaced.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: Option<Uuid>,
    pub score: f32,
    pub payload: VectorPayload,
}

/// A stored point without its vector
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub id: Option<Uuid>,
    pub payload: VectorPayload,
}

/// Metadata filter applied to search and list
#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub user_id: Option<String>,
}

impl VectorFilter {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
        }
    }
}

/// Nearest-neighbour index with metadata filters
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the collection (cosine distance, fixed dimensions) if absent
    async fn ensure_collection(&self) -> Result<()>;

    /// Insert or overwrite records by id. With `wait` the call returns only
    /// once the write is durable.
    async fn upsert(&self, records: Vec<VectorRecord>, wait: bool) -> Result<()>;

    /// Most similar records first; score is cosine similarity
    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorHit>>;

    async fn delete(&self, id: Uuid) -> Result<()>;

    /// Stored records matching `filter`, at most `limit`
    async fn list(&self, filter: &VectorFilter, limit: usize) -> Result<Vec<IndexEntry>>;
}

/// Everything needed to talk to the semantic side
pub struct Capabilities {
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<dyn VectorIndex>,
    pub ingestor: Arc<dyn MemoryIngestor>,
}

/// Source of [`Capabilities`]. `get` fails with
/// [`Error::CapabilityUnavailable`] when they cannot be reached.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    async fn get(&self) -> Result<Arc<Capabilities>>;
}

/// Fixed capabilities, or none at all
pub struct StaticCapabilities(Option<Arc<Capabilities>>);

impl StaticCapabilities {
    pub fn new(capabilities: Capabilities) -> Self {
        Self(Some(Arc::new(capabilities)))
    }

    /// Relational-only mode
    pub fn unavailable() -> Self {
        Self(None)
    }
}

#[async_trait]
impl CapabilityProvider for StaticCapabilities {
    async fn get(&self) -> Result<Arc<Capabilities>> {
        self.0
            .clone()
            .ok_or_else(|| Error::unavailable("Memory capability is disabled"))
    }
}

/// Builds the embedder and LanceDB index on first use.
///
/// A failed build is retried on a later call, at most once per
/// `retry_after`, so an outage at startup does not disable semantic search
/// for the life of the process.
pub struct LazyCapabilities {
    config: Config,
    api_key: Option<String>,
    retry_after: Duration,
    state: Mutex<LazyState>,
}

#[derive(Default)]
struct LazyState {
    ready: Option<Arc<Capabilities>>,
    last_failure: Option<(Instant, String)>,
}

impl LazyCapabilities {
    pub fn new(config: Config, api_key: Option<String>) -> Self {
        Self {
            config,
            api_key,
            retry_after: Duration::from_secs(30),
            state: Mutex::new(LazyState::default()),
        }
    }

    async fn build(&self) -> Result<Capabilities> {
        let embedder = build_embedder(&self.config, self.api_key.clone())?;
        let index: Arc<dyn VectorIndex> = Arc::new(
            LanceDbIndex::open(
                &self.config.vector_db_path(),
                &self.config.collection,
                embedder.dimensions(),
            )
            .await?,
        );
        let ingestor = Arc::new(VectorIngestor::new(
            embedder.clone(),
            index.clone(),
            self.config.duplicate_threshold,
        ));
        Ok(Capabilities {
            embedder,
            index,
            ingestor,
        })
    }
}

#[async_trait]
impl CapabilityProvider for LazyCapabilities {
    async fn get(&self) -> Result<Arc<Capabilities>> {
        let mut state = self.state.lock().await;
        if let Some(ready) = &state.ready {
            return Ok(ready.clone());
        }
        if let Some((at, reason)) = &state.last_failure {
            if at.elapsed() < self.retry_after {
                return Err(Error::unavailable(reason.clone()));
            }
        }

        match self.build().await {
            Ok(capabilities) => {
                tracing::info!(
                    collection = %self.config.collection,
                    "Memory capability initialised"
                );
                let capabilities = Arc::new(capabilities);
                state.ready = Some(capabilities.clone());
                state.last_failure = None;
                Ok(capabilities)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to initialise memory capability");
                let reason = e.to_string();
                state.last_failure = Some((Instant::now(), reason.clone()));
                Err(Error::unavailable(reason))
            }
        }
    }
}
