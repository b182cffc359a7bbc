//! Bulk resynchronization of the vector index from relational state.
//!
//! Each user costs one embedding call and one batched upsert. Users are
//! independent: a failure or timeout is counted against that user and the
//! run carries on.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::capability::{
    Capabilities, CapabilityProvider, IndexEntry, VectorFilter, VectorPayload, VectorRecord,
};
use crate::config::{ResyncConfig, ResyncScope};
use crate::embedding::EmbedMode;
use crate::error::{Error, Result};
use crate::memory::Memory;
use crate::storage::SqliteStorage;
use crate::store::MemoryStore;

/// Upper bound on records scanned per user when purging
const PURGE_SCAN_LIMIT: usize = 1_000_000;

/// Statistics of one run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResyncStats {
    /// Active memories in the relational snapshot
    pub total: usize,

    /// Memories left after scope and cutoff filtering
    pub candidates: usize,

    /// Memories upserted (or that would be, in a dry run)
    pub synced: usize,

    /// Memories belonging to users whose sync failed
    pub errors: usize,

    /// Failed memory count per user
    pub user_errors: BTreeMap<String, usize>,

    /// Users with at least one stale index record removed
    pub users_cleared: usize,

    /// Users whose records were synced but whose stale purge failed
    pub purge_errors: usize,

    /// Users excluded by scope
    pub skipped_users: usize,

    /// Memories older than their user's cutoff
    pub filtered_by_cutoff: usize,

    pub dry_run: bool,
}

impl ResyncStats {
    /// No sync or purge failed
    pub fn is_clean(&self) -> bool {
        self.errors == 0 && self.purge_errors == 0
    }
}

/// Outcome of one user's sync. `purged` is `None` when no purge ran.
struct UserOutcome {
    owner: String,
    count: usize,
    synced: Result<usize>,
    purged: Option<Result<usize>>,
}

/// Rebuilds index records from active memories
pub struct ResyncPipeline {
    storage: SqliteStorage,
    capabilities: Arc<dyn CapabilityProvider>,
    config: ResyncConfig,
    running: Mutex<()>,
}

impl ResyncPipeline {
    pub fn new(
        storage: SqliteStorage,
        capabilities: Arc<dyn CapabilityProvider>,
        config: ResyncConfig,
    ) -> Self {
        Self {
            storage,
            capabilities,
            config,
            running: Mutex::new(()),
        }
    }

    pub fn from_store(store: &MemoryStore) -> Self {
        Self::new(
            store.storage().clone(),
            store.capabilities().clone(),
            store.config().resync.clone(),
        )
    }

    /// Restrict the run to `scope`
    pub fn with_scope(mut self, scope: ResyncScope) -> Self {
        self.config.scope = scope;
        self
    }

    /// Run once. Concurrent calls are serialized.
    pub async fn run(&self, dry_run: bool) -> Result<ResyncStats> {
        let _guard = self.running.lock().await;
        let started = std::time::Instant::now();
        let started_at = Utc::now();

        let snapshot = self
            .storage
            .with_transaction(|uow| uow.active_memories_with_owner())?;

        let mut stats = ResyncStats {
            total: snapshot.len(),
            dry_run,
            ..Default::default()
        };

        let (groups, active_ids) = self.partition(snapshot, &mut stats);
        stats.candidates = groups.values().map(Vec::len).sum();

        tracing::info!(
            total = stats.total,
            candidates = stats.candidates,
            users = groups.len(),
            skipped_users = stats.skipped_users,
            filtered_by_cutoff = stats.filtered_by_cutoff,
            dry_run,
            "Starting resync"
        );

        if dry_run {
            for (owner, memories) in &groups {
                tracing::info!(user_id = %owner, count = memories.len(), "[dry run] would sync");
            }
            stats.synced = stats.candidates;
            return Ok(stats);
        }

        let capabilities = match self.capabilities.get().await {
            Ok(capabilities) => capabilities,
            Err(e) => {
                tracing::error!(error = %e, "Vector capability unavailable; nothing synced");
                for (owner, memories) in &groups {
                    stats.errors += memories.len();
                    stats.user_errors.insert(owner.clone(), memories.len());
                }
                return Ok(stats);
            }
        };

        let timeout = self.config.user_timeout;
        let purge = self.config.purge_stale;
        let active_ids = Arc::new(active_ids);

        let outcomes: Vec<UserOutcome> = stream::iter(groups)
            .map(|(owner, memories)| {
                let capabilities = capabilities.clone();
                let storage = self.storage.clone();
                let active_ids = active_ids.clone();
                async move {
                    let count = memories.len();
                    let synced = within(timeout, sync_user(&capabilities, &owner, memories)).await;
                    let purged = match (&synced, purge) {
                        (Ok(_), true) => {
                            let keep = active_ids.get(&owner).cloned().unwrap_or_default();
                            let purge =
                                purge_stale(&capabilities, &storage, &owner, &keep, started_at);
                            Some(within(timeout, purge).await)
                        }
                        _ => None,
                    };
                    UserOutcome {
                        owner,
                        count,
                        synced,
                        purged,
                    }
                }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            let owner = outcome.owner;
            let synced = match outcome.synced {
                Ok(synced) => synced,
                Err(e) => {
                    tracing::error!(
                        user_id = %owner,
                        count = outcome.count,
                        error = %e,
                        "User sync failed"
                    );
                    stats.errors += outcome.count;
                    stats.user_errors.insert(owner, outcome.count);
                    continue;
                }
            };
            stats.synced += synced;

            let purged = match outcome.purged {
                Some(Ok(purged)) => purged,
                Some(Err(e)) => {
                    tracing::error!(user_id = %owner, error = %e, "Stale record purge failed");
                    stats.purge_errors += 1;
                    0
                }
                None => 0,
            };
            if purged > 0 {
                stats.users_cleared += 1;
            }
            tracing::info!(user_id = %owner, synced, purged, "User synced");
        }

        tracing::info!(
            total = stats.total,
            synced = stats.synced,
            errors = stats.errors,
            purge_errors = stats.purge_errors,
            users_cleared = stats.users_cleared,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Resync complete"
        );
        Ok(stats)
    }

    /// Group the snapshot by owner, applying scope and cutoffs. Also returns
    /// every active id per in-scope owner, cutoffs ignored, for purging.
    fn partition(
        &self,
        snapshot: Vec<(String, Memory)>,
        stats: &mut ResyncStats,
    ) -> (BTreeMap<String, Vec<Memory>>, BTreeMap<String, HashSet<Uuid>>) {
        let now = Utc::now();
        let mut groups: BTreeMap<String, Vec<Memory>> = BTreeMap::new();
        let mut active_ids: BTreeMap<String, HashSet<Uuid>> = BTreeMap::new();
        let mut skipped: BTreeSet<String> = BTreeSet::new();

        // In-scope users with nothing left to upsert still get purged.
        if let ResyncScope::Only(users) = &self.config.scope {
            for user in users {
                groups.entry(user.clone()).or_default();
            }
        }

        for (owner, memory) in snapshot {
            if !self.config.scope.includes(&owner) {
                skipped.insert(owner);
                continue;
            }
            active_ids.entry(owner.clone()).or_default().insert(memory.id);
            let group = groups.entry(owner.clone()).or_default();

            let cutoff = self
                .config
                .cutoff_for(&owner)
                .and_then(|age| chrono::Duration::from_std(age).ok())
                .and_then(|age| now.checked_sub_signed(age));
            if let Some(cutoff) = cutoff {
                if memory.created_at < cutoff {
                    stats.filtered_by_cutoff += 1;
                    continue;
                }
            }
            group.push(memory);
        }

        stats.skipped_users = skipped.len();
        (groups, active_ids)
    }

    /// Run every `interval` until the task is aborted. The first run happens
    /// one interval after start. A zero or unrepresentable interval disables
    /// scheduling.
    pub fn spawn_scheduled(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let now = tokio::time::Instant::now();
            let start = now
                .checked_add(interval)
                .filter(|start| !interval.is_zero() && start.checked_add(interval).is_some());
            let Some(start) = start else {
                tracing::error!(?interval, "Unusable resync interval; scheduled resync disabled");
                return;
            };

            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.run(false).await {
                    Ok(stats) if !stats.is_clean() => tracing::warn!(
                        errors = stats.errors,
                        purge_errors = stats.purge_errors,
                        "Scheduled resync finished with errors"
                    ),
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "Scheduled resync failed"),
                }
            }
        })
    }
}

async fn within<T>(limit: Duration, work: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(limit, work)
        .await
        .unwrap_or_else(|_| Err(Error::Timeout(limit)))
}

/// Embed and upsert one user's memories, returning how many were written
async fn sync_user(
    capabilities: &Capabilities,
    owner: &str,
    memories: Vec<Memory>,
) -> Result<usize> {
    if memories.is_empty() {
        return Ok(0);
    }

    let texts: Vec<String> = memories.iter().map(|m| m.content.clone()).collect();
    // One call for the whole batch
    let vectors = capabilities.embedder.embed(&texts, EmbedMode::Add).await?;
    if vectors.len() != memories.len() {
        return Err(Error::embedding(format!(
            "Expected {} embeddings, got {}",
            memories.len(),
            vectors.len()
        )));
    }

    let records: Vec<VectorRecord> = memories
        .iter()
        .zip(vectors)
        .map(|(memory, vector)| VectorRecord {
            id: memory.id,
            vector,
            payload: VectorPayload::from_memory(memory, owner),
        })
        .collect();
    let synced = records.len();
    capabilities.index.upsert(records, true).await?;
    Ok(synced)
}

/// Remove the user's index records that no longer back an active memory.
///
/// Records outside the run's snapshot are re-checked against the relational
/// store at purge time, and records written after the run started are left
/// alone, so live additions made during the run survive.
async fn purge_stale(
    capabilities: &Capabilities,
    storage: &SqliteStorage,
    owner: &str,
    keep: &HashSet<Uuid>,
    started_at: DateTime<Utc>,
) -> Result<usize> {
    let candidates: Vec<Uuid> = capabilities
        .index
        .list(&VectorFilter::user(owner), PURGE_SCAN_LIMIT)
        .await?
        .into_iter()
        .filter(|entry| !written_since(entry, started_at))
        .filter_map(|entry| entry.id)
        .filter(|id| !keep.contains(id))
        .collect();
    if candidates.is_empty() {
        return Ok(0);
    }

    let stale: Vec<Uuid> = storage.with_transaction(|uow| {
        let mut stale = Vec::new();
        for id in candidates {
            match uow.get_memory(id)? {
                Some(memory) if memory.is_active() => {}
                _ => stale.push(id),
            }
        }
        Ok(stale)
    })?;

    for id in &stale {
        capabilities.index.delete(*id).await?;
    }
    Ok(stale.len())
}

fn written_since(entry: &IndexEntry, since: DateTime<Utc>) -> bool {
    entry
        .payload
        .updated_at
        .as_deref()
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map_or(false, |ts| ts >= since)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    use crate::capability::{StaticCapabilities, VectorHit, VectorIndex};
    use crate::config::Config;
    use crate::embedding::Embedder;
    use crate::ingest::{MemoryEvent, MemoryIngestor, VectorIngestor};
    use crate::testing::{FakeCapabilities, FakeEmbedder, InMemoryIndex, ScriptedIngestor};

    fn storage() -> SqliteStorage {
        SqliteStorage::open_in_memory().unwrap()
    }

    fn seed(storage: &SqliteStorage, user: &str, content: &str, age: chrono::Duration) -> Uuid {
        storage
            .with_transaction(|uow| {
                let (user, app) = uow.resolve_identity(user, "a1")?;
                let (memory, change) = Memory::create(
                    Uuid::new_v4(),
                    &user,
                    &app,
                    content,
                    json!({}),
                    Utc::now() - age,
                );
                uow.insert_memory(&memory, &change)?;
                Ok(memory.id)
            })
            .unwrap()
    }

    fn pipeline(
        storage: &SqliteStorage,
        fakes: &FakeCapabilities,
        config: ResyncConfig,
    ) -> ResyncPipeline {
        ResyncPipeline::new(storage.clone(), Arc::new(fakes.provider()), config)
    }

    fn payloads(index: &InMemoryIndex) -> Vec<(Uuid, VectorPayload)> {
        let mut payloads: Vec<_> = index.records().into_iter().map(|r| (r.id, r.payload)).collect();
        payloads.sort_by_key(|(id, _)| *id);
        payloads
    }

    fn ghost_record(user: &str) -> VectorRecord {
        VectorRecord {
            id: Uuid::new_v4(),
            vector: vec![0.0; 16],
            payload: VectorPayload {
                user_id: user.into(),
                data: "ghost".into(),
                hash: String::new(),
                metadata: json!({}),
                created_at: None,
                updated_at: None,
            },
        }
    }

    fn fresh() -> chrono::Duration {
        chrono::Duration::zero()
    }

    #[tokio::test]
    async fn resync_is_idempotent_with_one_embed_call_per_user() {
        let storage = storage();
        seed(&storage, "u1", "likes espresso", fresh());
        seed(&storage, "u1", "owns a bicycle", fresh());
        seed(&storage, "u2", "plays chess", fresh());
        let fakes = FakeCapabilities::new();
        let pipeline = pipeline(&storage, &fakes, ResyncConfig::default());

        let first = pipeline.run(false).await.unwrap();
        assert_eq!(first.total, 3);
        assert_eq!(first.synced, 3);
        assert_eq!(first.errors, 0);
        assert_eq!(fakes.embedder.calls(), 2);
        assert_eq!(fakes.embedder.texts_embedded(), 3);
        assert_eq!(fakes.index.upsert_calls(), 2);

        let before = payloads(&fakes.index);
        let second = pipeline.run(false).await.unwrap();
        assert_eq!(second.synced, 3);
        assert_eq!(before, payloads(&fakes.index));
    }

    #[tokio::test]
    async fn dry_run_touches_nothing() {
        let storage = storage();
        seed(&storage, "u1", "likes espresso", fresh());
        seed(&storage, "u2", "plays chess", fresh());
        let fakes = FakeCapabilities::new();
        let pipeline = pipeline(&storage, &fakes, ResyncConfig::default());

        let dry = pipeline.run(true).await.unwrap();
        assert!(dry.dry_run);
        assert_eq!(fakes.embedder.calls(), 0);
        assert_eq!(fakes.index.upsert_calls(), 0);
        assert!(fakes.index.records().is_empty());

        let real = pipeline.run(false).await.unwrap();
        assert_eq!(dry.total, real.total);
        assert_eq!(dry.synced, real.synced);
    }

    #[tokio::test]
    async fn dry_run_works_without_capability() {
        let storage = storage();
        seed(&storage, "u1", "likes espresso", fresh());
        let pipeline = ResyncPipeline::new(
            storage.clone(),
            Arc::new(StaticCapabilities::unavailable()),
            ResyncConfig::default(),
        );
        assert_eq!(pipeline.run(true).await.unwrap().synced, 1);

        let real = pipeline.run(false).await.unwrap();
        assert_eq!(real.synced, 0);
        assert_eq!(real.errors, 1);
    }

    #[tokio::test]
    async fn scope_and_cutoffs_filter_candidates() {
        let storage = storage();
        seed(&storage, "u1", "recent", chrono::Duration::hours(1));
        seed(&storage, "u1", "ancient", chrono::Duration::days(30));
        seed(&storage, "u2", "out of scope", fresh());
        let fakes = FakeCapabilities::new();

        let config = ResyncConfig {
            scope: ResyncScope::from_list("u1"),
            cutoffs: BTreeMap::from([("u1".to_string(), Duration::from_secs(7 * 24 * 3600))]),
            ..Default::default()
        };
        let stats = pipeline(&storage, &fakes, config).run(false).await.unwrap();

        assert_eq!(stats.total, 3);
        assert_eq!(stats.candidates, 1);
        assert_eq!(stats.synced, 1);
        assert_eq!(stats.skipped_users, 1);
        assert_eq!(stats.filtered_by_cutoff, 1);
        let records = fakes.index.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload.data, "recent");
    }

    #[tokio::test]
    async fn stale_records_are_purged_but_cut_off_ones_kept() {
        let storage = storage();
        let old = seed(&storage, "u1", "ancient", chrono::Duration::days(30));
        let fakes = FakeCapabilities::new();
        let pipeline_all = pipeline(&storage, &fakes, ResyncConfig::default());
        pipeline_all.run(false).await.unwrap();

        // Orphaned record for a memory the store never had
        fakes.index.upsert(vec![ghost_record("u1")], true).await.unwrap();

        let config = ResyncConfig {
            cutoffs: BTreeMap::from([("u1".to_string(), Duration::from_secs(24 * 3600))]),
            ..Default::default()
        };
        let stats = pipeline(&storage, &fakes, config).run(false).await.unwrap();
        assert_eq!(stats.users_cleared, 1);
        let ids: Vec<Uuid> = fakes.index.records().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![old]);
    }

    /// Fails for any batch containing "poison"
    struct PoisonEmbedder(FakeEmbedder);

    #[async_trait]
    impl Embedder for PoisonEmbedder {
        async fn embed(&self, texts: &[String], mode: EmbedMode) -> Result<Vec<Vec<f32>>> {
            if texts.iter().any(|t| t.contains("poison")) {
                return Err(Error::embedding("rejected"));
            }
            self.0.embed(texts, mode).await
        }

        fn dimensions(&self) -> usize {
            self.0.dimensions()
        }
    }

    /// Never finishes within a test timeout
    struct StallingEmbedder;

    #[async_trait]
    impl Embedder for StallingEmbedder {
        async fn embed(&self, _texts: &[String], _mode: EmbedMode) -> Result<Vec<Vec<f32>>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        }

        fn dimensions(&self) -> usize {
            16
        }
    }

    fn provider_with(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
    ) -> Arc<StaticCapabilities> {
        let ingestor: Arc<dyn MemoryIngestor> =
            Arc::new(ScriptedIngestor::new(Vec::<Vec<MemoryEvent>>::new()));
        Arc::new(StaticCapabilities::new(Capabilities {
            embedder,
            index,
            ingestor,
        }))
    }

    #[tokio::test]
    async fn one_failing_user_does_not_abort_the_run() {
        let storage = storage();
        seed(&storage, "u1", "likes espresso", fresh());
        seed(&storage, "u2", "poison pill", fresh());
        seed(&storage, "u2", "harmless", fresh());
        let index = Arc::new(InMemoryIndex::new());
        let pipeline = ResyncPipeline::new(
            storage.clone(),
            provider_with(Arc::new(PoisonEmbedder(FakeEmbedder::new(16))), index.clone()),
            ResyncConfig {
                concurrency: 2,
                ..Default::default()
            },
        );

        let stats = pipeline.run(false).await.unwrap();
        assert_eq!(stats.synced, 1);
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.user_errors.get("u2"), Some(&2));
        assert_eq!(index.records().len(), 1);
    }

    #[tokio::test]
    async fn slow_user_times_out_as_error() {
        let storage = storage();
        seed(&storage, "u1", "likes espresso", fresh());
        let pipeline = ResyncPipeline::new(
            storage.clone(),
            provider_with(Arc::new(StallingEmbedder), Arc::new(InMemoryIndex::new())),
            ResyncConfig {
                user_timeout: Duration::from_millis(20),
                ..Default::default()
            },
        );

        let stats = pipeline.run(false).await.unwrap();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.synced, 0);
    }

    #[tokio::test]
    async fn deleted_memories_are_not_resynced() {
        let fakes = FakeCapabilities::new();
        let store = MemoryStore::new(
            storage(),
            Arc::new(fakes.provider()),
            Config::with_data_dir("/tmp/dieah-recall-unused"),
        );
        store.add("u1", "a1", "likes espresso", None).await.unwrap();
        store.delete_all("u1", "a1").await.unwrap();
        store.add("u1", "a1", "owns a bicycle", None).await.unwrap();

        let stats = ResyncPipeline::from_store(&store).run(false).await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.synced, 1);
        assert_eq!(fakes.index.records().len(), 1);
    }

    /// Holds batch embeddings back so live traffic can land mid-run
    struct SlowBatchEmbedder(FakeEmbedder);

    #[async_trait]
    impl Embedder for SlowBatchEmbedder {
        async fn embed(&self, texts: &[String], mode: EmbedMode) -> Result<Vec<Vec<f32>>> {
            if texts.len() > 1 {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            self.0.embed(texts, mode).await
        }

        fn dimensions(&self) -> usize {
            self.0.dimensions()
        }
    }

    #[tokio::test]
    async fn memory_added_during_run_survives_purge() {
        let storage = storage();
        seed(&storage, "u1", "likes espresso", fresh());
        seed(&storage, "u1", "owns a bicycle", fresh());

        let index = Arc::new(InMemoryIndex::new());
        let embedder: Arc<dyn Embedder> = Arc::new(SlowBatchEmbedder(FakeEmbedder::new(16)));
        let ingestor = Arc::new(VectorIngestor::new(embedder.clone(), index.clone(), 0.95));
        let provider = Arc::new(StaticCapabilities::new(Capabilities {
            embedder,
            index: index.clone(),
            ingestor,
        }));
        let store = MemoryStore::new(
            storage.clone(),
            provider,
            Config::with_data_dir("/tmp/dieah-recall-unused"),
        );
        let pipeline = ResyncPipeline::from_store(&store);

        let (stats, added) = tokio::join!(pipeline.run(false), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            store.add("u1", "a1", "plays chess", None).await
        });
        let stats = stats.unwrap();
        let added = added.unwrap().results[0].id;

        assert_eq!(stats.synced, 2);
        assert_eq!(stats.users_cleared, 0);
        assert!(index.records().iter().any(|r| r.id == added));
    }

    #[tokio::test]
    async fn index_record_of_revived_memory_is_kept() {
        let storage = storage();
        let fakes = FakeCapabilities::new();
        let live = seed(&storage, "u1", "likes espresso", fresh());
        let mut record = ghost_record("u1");
        record.id = live;
        fakes.index.upsert(vec![record], true).await.unwrap();

        // Not in this run's snapshot, but active by the time the purge runs.
        let stale = purge_stale(
            &Capabilities {
                embedder: fakes.embedder.clone(),
                index: fakes.index.clone(),
                ingestor: Arc::new(ScriptedIngestor::default()),
            },
            &storage,
            "u1",
            &HashSet::new(),
            Utc::now(),
        )
        .await
        .unwrap();
        assert_eq!(stale, 0);
        assert_eq!(fakes.index.records().len(), 1);
    }

    /// Index that accepts writes but rejects deletes
    struct UndeletableIndex(InMemoryIndex);

    #[async_trait]
    impl VectorIndex for UndeletableIndex {
        async fn ensure_collection(&self) -> Result<()> {
            self.0.ensure_collection().await
        }

        async fn upsert(&self, records: Vec<VectorRecord>, wait: bool) -> Result<()> {
            self.0.upsert(records, wait).await
        }

        async fn search(
            &self,
            vector: &[f32],
            limit: usize,
            filter: &VectorFilter,
        ) -> Result<Vec<VectorHit>> {
            self.0.search(vector, limit, filter).await
        }

        async fn delete(&self, _id: Uuid) -> Result<()> {
            Err(Error::vector_db("delete rejected"))
        }

        async fn list(&self, filter: &VectorFilter, limit: usize) -> Result<Vec<IndexEntry>> {
            self.0.list(filter, limit).await
        }
    }

    #[tokio::test]
    async fn purge_failure_still_counts_synced_records() {
        let storage = storage();
        seed(&storage, "u1", "likes espresso", fresh());
        let index = Arc::new(UndeletableIndex(InMemoryIndex::new()));
        index.upsert(vec![ghost_record("u1")], true).await.unwrap();

        let pipeline = ResyncPipeline::new(
            storage.clone(),
            provider_with(Arc::new(FakeEmbedder::new(16)), index.clone()),
            ResyncConfig::default(),
        );
        let stats = pipeline.run(false).await.unwrap();

        assert_eq!(stats.synced, 1);
        assert_eq!(stats.errors, 0);
        assert_eq!(stats.purge_errors, 1);
        assert_eq!(stats.users_cleared, 0);
        assert!(!stats.is_clean());
        assert_eq!(index.0.records().len(), 2);
    }

    #[tokio::test]
    async fn unusable_schedule_interval_does_not_panic() {
        let fakes = FakeCapabilities::new();
        for interval in [Duration::ZERO, Duration::MAX] {
            let scheduled = Arc::new(pipeline(&storage(), &fakes, ResyncConfig::default()));
            let handle = scheduled.spawn_scheduled(interval);
            assert!(handle.await.is_ok());
        }
    }
}
