//! Turning submitted text into memory change events

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capability::{VectorFilter, VectorIndex, VectorPayload, VectorRecord};
use crate::embedding::{EmbedMode, Embedder};
use crate::error::Result;
use crate::memory::content_hash;

/// What the capability did with a piece of text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Add,
    Update,
    Delete,
}

/// One change reported by an ingestor. `memory` is the new content (or the
/// removed content for `Delete`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEvent {
    pub id: Uuid,
    pub event: EventKind,
    pub memory: String,
}

impl MemoryEvent {
    pub fn new(id: Uuid, event: EventKind, memory: impl Into<String>) -> Self {
        Self {
            id,
            event,
            memory: memory.into(),
        }
    }
}

/// Semantic ingestion of free text for one user.
///
/// `writable` holds the active memories the submitting app may access.
/// Events must only name ids from that set or fresh ids.
#[async_trait]
pub trait MemoryIngestor: Send + Sync {
    async fn ingest(
        &self,
        user_id: &str,
        text: &str,
        metadata: &serde_json::Value,
        writable: &HashSet<Uuid>,
    ) -> Result<Vec<MemoryEvent>>;
}

/// Neighbours considered when looking for a restatement
const DEDUP_CANDIDATES: usize = 5;

/// Deduplicating ingestor backed by an embedder and a vector index.
///
/// Text whose nearest writable neighbour for the same user scores at or
/// above `threshold` is treated as a restatement: identical content produces
/// no event, different content updates that record in place. Index records
/// outside the writable set (stale, deleted or hidden from the app) never
/// match.
pub struct VectorIngestor {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    threshold: f32,
}

impl VectorIngestor {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>, threshold: f32) -> Self {
        Self {
            embedder,
            index,
            threshold,
        }
    }
}

#[async_trait]
impl MemoryIngestor for VectorIngestor {
    async fn ingest(
        &self,
        user_id: &str,
        text: &str,
        metadata: &serde_json::Value,
        writable: &HashSet<Uuid>,
    ) -> Result<Vec<MemoryEvent>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let vector = self.embedder.embed_one(text, EmbedMode::Add).await?;
        let hash = content_hash(text);

        let nearest = self
            .index
            .search(&vector, DEDUP_CANDIDATES, &VectorFilter::user(user_id))
            .await?
            .into_iter()
            .filter(|hit| hit.score >= self.threshold)
            .find_map(|hit| match hit.id {
                Some(id) if writable.contains(&id) => Some((id, hit)),
                _ => None,
            });

        let now = Utc::now().to_rfc3339();
        let (id, event, created_at) = match nearest {
            Some((_, hit)) if hit.payload.hash == hash => {
                tracing::debug!(user_id, score = hit.score, "Duplicate memory ignored");
                return Ok(Vec::new());
            }
            Some((id, hit)) => (id, EventKind::Update, hit.payload.created_at),
            None => (Uuid::new_v4(), EventKind::Add, Some(now.clone())),
        };

        self.index
            .upsert(
                vec![VectorRecord {
                    id,
                    vector,
                    payload: VectorPayload {
                        user_id: user_id.to_string(),
                        data: text.to_string(),
                        hash,
                        metadata: metadata.clone(),
                        created_at,
                        updated_at: Some(now),
                    },
                }],
                true,
            )
            .await?;

        tracing::debug!(user_id, memory_id = %id, event = ?event, "Ingested memory");
        Ok(vec![MemoryEvent::new(id, event, text)])
    }
}
