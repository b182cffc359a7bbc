//! In-memory stand-ins for the embedding and vector capabilities

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use crate::capability::{
    Capabilities, IndexEntry, StaticCapabilities, VectorFilter, VectorHit, VectorIndex,
    VectorPayload, VectorRecord,
};
use crate::embedding::{EmbedMode, Embedder};
use crate::error::{Error, Result};
use crate::ingest::{MemoryEvent, MemoryIngestor, VectorIngestor};

/// Bag-of-words embedder: each lowercase word hashes into one dimension
pub struct FakeEmbedder {
    dimensions: usize,
    failing: AtomicBool,
    calls: AtomicUsize,
    texts: AtomicUsize,
}

impl FakeEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            texts: AtomicUsize::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of `embed` calls
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of texts embedded across all calls
    pub fn texts_embedded(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for word in text.split_whitespace() {
            let word = word.to_lowercase();
            // FNV-1a
            let mut hash: u64 = 0xcbf29ce484222325;
            for byte in word.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(0x100000001b3);
            }
            vector[(hash % self.dimensions as u64) as usize] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, texts: &[String], _mode: EmbedMode) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::embedding("embedder offline"));
        }
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

struct Stored {
    id: Option<Uuid>,
    vector: Vec<f32>,
    payload: VectorPayload,
}

/// Vector index held in a `Vec`, with call counters
#[derive(Default)]
pub struct InMemoryIndex {
    entries: Mutex<Vec<Stored>>,
    failing: AtomicBool,
    upserts: AtomicUsize,
    searches: AtomicUsize,
    deletes: AtomicUsize,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn upsert_calls(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn search_calls(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Stored records with a valid id, in insertion order
    pub fn records(&self) -> Vec<VectorRecord> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| {
                e.id.map(|id| VectorRecord {
                    id,
                    vector: e.vector.clone(),
                    payload: e.payload.clone(),
                })
            })
            .collect()
    }

    /// Store a record whose id is not a memory id
    pub fn insert_orphan(&self, vector: Vec<f32>, payload: VectorPayload) {
        self.entries.lock().unwrap().push(Stored {
            id: None,
            vector,
            payload,
        });
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::vector_db("index offline"));
        }
        Ok(())
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

fn matches(filter: &VectorFilter, payload: &VectorPayload) -> bool {
    filter
        .user_id
        .as_ref()
        .map_or(true, |user| *user == payload.user_id)
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn ensure_collection(&self) -> Result<()> {
        self.check()
    }

    async fn upsert(&self, records: Vec<VectorRecord>, _wait: bool) -> Result<()> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let mut entries = self.entries.lock().unwrap();
        for record in records {
            match entries.iter_mut().find(|e| e.id == Some(record.id)) {
                Some(existing) => {
                    existing.vector = record.vector;
                    existing.payload = record.payload;
                }
                None => entries.push(Stored {
                    id: Some(record.id),
                    vector: record.vector,
                    payload: record.payload,
                }),
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorHit>> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let entries = self.entries.lock().unwrap();
        let mut hits: Vec<VectorHit> = entries
            .iter()
            .filter(|e| matches(filter, &e.payload))
            .map(|e| VectorHit {
                id: e.id,
                score: cosine(vector, &e.vector),
                payload: e.payload.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.entries.lock().unwrap().retain(|e| e.id != Some(id));
        Ok(())
    }

    async fn list(&self, filter: &VectorFilter, limit: usize) -> Result<Vec<IndexEntry>> {
        self.check()?;
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches(filter, &e.payload))
            .take(limit)
            .map(|e| IndexEntry {
                id: e.id,
                payload: e.payload.clone(),
            })
            .collect())
    }
}

/// Ingestor that replays a fixed sequence of event batches
#[derive(Default)]
pub struct ScriptedIngestor {
    script: Mutex<VecDeque<Vec<MemoryEvent>>>,
    failing: AtomicBool,
}

impl ScriptedIngestor {
    pub fn new(script: Vec<Vec<MemoryEvent>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl MemoryIngestor for ScriptedIngestor {
    async fn ingest(
        &self,
        _user_id: &str,
        _text: &str,
        _metadata: &serde_json::Value,
        _writable: &HashSet<Uuid>,
    ) -> Result<Vec<MemoryEvent>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::embedding("ingestor offline"));
        }
        Ok(self.script.lock().unwrap().pop_front().unwrap_or_default())
    }
}

/// Fake capability bundle wired like the real one
pub struct FakeCapabilities {
    pub embedder: Arc<FakeEmbedder>,
    pub index: Arc<InMemoryIndex>,
}

impl FakeCapabilities {
    pub fn new() -> Self {
        Self {
            embedder: Arc::new(FakeEmbedder::new(16)),
            index: Arc::new(InMemoryIndex::new()),
        }
    }

    /// Provider using the deduplicating ingestor over these fakes
    pub fn provider(&self) -> StaticCapabilities {
        self.provider_with(Arc::new(VectorIngestor::new(
            self.embedder.clone(),
            self.index.clone(),
            0.95,
        )))
    }

    pub fn provider_with(&self, ingestor: Arc<dyn MemoryIngestor>) -> StaticCapabilities {
        StaticCapabilities::new(Capabilities {
            embedder: self.embedder.clone(),
            index: self.index.clone(),
            ingestor,
        })
    }
}
