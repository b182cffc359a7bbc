//! Write path: identity, add, bulk delete and list.
//!
//! The relational store is committed first and is authoritative. Vector-side
//! effects are best effort; drift is repaired by [`crate::resync`].

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::access::{accessible_ids, can_access, rules_permit};
use crate::capability::{CapabilityProvider, IndexEntry, LazyCapabilities, VectorFilter};
use crate::config::{Config, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::ingest::{EventKind, MemoryEvent};
use crate::memory::{
    AccessLogEntry, AccessRule, AccessType, App, Memory, RuleEffect, RuleObject, User,
};
use crate::secrets::{resolve_api_key, resolve_database_path, ChainResolver};
use crate::storage::{SqliteStorage, UnitOfWork};

/// Result of [`MemoryStore::add`]: only the events of that call
#[derive(Debug, Clone, Serialize)]
pub struct AddOutcome {
    pub results: Vec<MemoryEvent>,
}

/// Result of [`MemoryStore::delete_all`]
#[derive(Debug, Clone, Serialize)]
pub struct DeleteOutcome {
    /// Memories moved to `deleted` by this call
    pub deleted: Vec<Uuid>,

    /// Index deletions that failed or were skipped
    pub vector_failures: usize,
}

/// Where a listing came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListSource {
    Vector,
    Database,
    Privileged,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListedMemory {
    pub id: Uuid,
    pub memory: String,
    pub hash: String,
    pub metadata: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl ListedMemory {
    fn from_entry(id: Uuid, entry: IndexEntry) -> Self {
        Self {
            id,
            memory: entry.payload.data,
            hash: entry.payload.hash,
            metadata: entry.payload.metadata,
            created_at: entry.payload.created_at,
            updated_at: entry.payload.updated_at,
        }
    }

    fn from_memory(memory: Memory) -> Self {
        Self {
            id: memory.id,
            hash: memory.content_hash(),
            memory: memory.content,
            metadata: memory.metadata,
            created_at: Some(memory.created_at.to_rfc3339()),
            updated_at: Some(memory.updated_at.to_rfc3339()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResponse {
    pub results: Vec<ListedMemory>,
    pub source: ListSource,
}

/// Main entry point for memory mutations and listings
#[derive(Clone)]
pub struct MemoryStore {
    storage: SqliteStorage,
    capabilities: Arc<dyn CapabilityProvider>,
    config: Config,
}

impl MemoryStore {
    pub fn new(
        storage: SqliteStorage,
        capabilities: Arc<dyn CapabilityProvider>,
        config: Config,
    ) -> Self {
        Self {
            storage,
            capabilities,
            config,
        }
    }

    /// Open the store described by `config`: resolve credentials, open the
    /// relational database and defer the vector side until first use.
    ///
    /// Missing embedding credentials are not an error; the store then runs
    /// relational-only until they appear.
    pub fn open(config: Config) -> Result<Self> {
        config.ensure_dirs()?;

        let resolver = ChainResolver::standard(&config);
        let db_path = resolve_database_path(&config, &resolver);
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let storage = SqliteStorage::open(&db_path)?;

        let api_key = resolve_api_key(&config, &resolver);
        if api_key.is_none() && config.embedding_provider == EmbeddingProvider::OpenAi {
            tracing::warn!("No embedding API key configured; semantic search disabled");
        }
        let capabilities = Arc::new(LazyCapabilities::new(config.clone(), api_key));

        Ok(Self::new(storage, capabilities, config))
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    pub fn capabilities(&self) -> &Arc<dyn CapabilityProvider> {
        &self.capabilities
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get or create the user and the app named `app_name`
    pub fn resolve_identity(&self, user_id: &str, app_name: &str) -> Result<(User, App)> {
        self.storage
            .with_transaction(|uow| uow.resolve_identity(user_id, app_name))
    }

    /// Create the configured default user and app
    pub fn ensure_default_identity(&self) -> Result<(User, App)> {
        self.resolve_identity(&self.config.default_user_id, &self.config.default_app)
    }

    /// Pause or resume an app
    pub fn set_app_active(&self, user_id: &str, app_name: &str, active: bool) -> Result<App> {
        self.storage.with_transaction(|uow| {
            let (_, app) = uow.resolve_identity(user_id, app_name)?;
            uow.set_app_active(app.id, active)?;
            tracing::info!(user_id, app = app_name, active, "App state changed");
            uow.get_app(app.id)?
                .ok_or_else(|| Error::not_found(format!("App {}", app_name)))
        })
    }

    /// Allow `app_name` to read `object`
    pub fn grant_access(
        &self,
        user_id: &str,
        app_name: &str,
        object: RuleObject,
    ) -> Result<AccessRule> {
        self.add_rule(user_id, app_name, object, RuleEffect::Allow)
    }

    /// Forbid `app_name` from reading `object`, overriding ownership
    pub fn deny_access(
        &self,
        user_id: &str,
        app_name: &str,
        object: RuleObject,
    ) -> Result<AccessRule> {
        self.add_rule(user_id, app_name, object, RuleEffect::Deny)
    }

    fn add_rule(
        &self,
        user_id: &str,
        app_name: &str,
        object: RuleObject,
        effect: RuleEffect,
    ) -> Result<AccessRule> {
        self.storage.with_transaction(|uow| {
            let (user, app) = uow.resolve_identity(user_id, app_name)?;

            // Rules may only reference the user's own memories and apps.
            let owner = match object {
                RuleObject::Memory(id) => uow.get_memory(id)?.map(|m| m.user_id),
                RuleObject::App(id) => uow.get_app(id)?.map(|a| a.owner_id),
            }
            .ok_or_else(|| Error::not_found(format!("{} {}", object.kind(), object.id())))?;
            if owner != user.id {
                return Err(Error::permission_denied(format!(
                    "{} {} does not belong to {}",
                    object.kind(),
                    object.id(),
                    user_id
                )));
            }

            let rule = AccessRule::new(app.id, object, effect);
            uow.insert_rule(&rule)?;
            Ok(rule)
        })
    }

    /// Submit text for `user_id` through `app_name`.
    ///
    /// The ingestor decides what changed; every reported event is applied
    /// with its history entry in one transaction.
    pub async fn add(
        &self,
        user_id: &str,
        app_name: &str,
        text: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<AddOutcome> {
        let (user, app) = self.resolve_identity(user_id, app_name)?;
        if !app.is_active {
            return Err(Error::AppPaused { app: app.name });
        }
        if text.trim().is_empty() {
            return Err(Error::invalid_input("text is empty"));
        }

        let writable = self.storage.with_transaction(|uow| {
            let memories = uow.memories_for_user(user.id)?;
            let rules = uow.rules_for_app(app.id)?;
            Ok(accessible_ids(&memories, &app, &rules))
        })?;

        let metadata = source_metadata(metadata, &app.name);
        let capabilities = self.capabilities.get().await?;
        let events = capabilities
            .ingestor
            .ingest(&user.user_id, text, &metadata, &writable)
            .await?;

        let now = Utc::now();
        let results = self.storage.with_transaction(|uow| {
            let rules = uow.rules_for_app(app.id)?;
            let mut applied = Vec::with_capacity(events.len());
            for event in &events {
                if let Some(event) = apply_event(uow, &user, &app, &rules, event, &metadata, now)? {
                    applied.push(event);
                }
            }
            Ok(applied)
        })?;

        tracing::info!(user_id, app = app_name, events = results.len(), "Added memory");
        Ok(AddOutcome { results })
    }

    /// Soft-delete every memory of `user_id` that `app_name` may access
    pub async fn delete_all(&self, user_id: &str, app_name: &str) -> Result<DeleteOutcome> {
        let (user, app) = self.resolve_identity(user_id, app_name)?;
        let targets: Vec<Uuid> = self.storage.with_transaction(|uow| {
            let memories = uow.memories_for_user(user.id)?;
            let rules = uow.rules_for_app(app.id)?;
            let ids = accessible_ids(&memories, &app, &rules);
            Ok(memories
                .iter()
                .map(|m| m.id)
                .filter(|id| ids.contains(id))
                .collect())
        })?;

        let mut vector_failures = 0;
        match self.capabilities.get().await {
            Ok(capabilities) => {
                for id in &targets {
                    if let Err(e) = capabilities.index.delete(*id).await {
                        tracing::warn!(
                            memory_id = %id,
                            error = %e,
                            "Failed to delete memory from vector index"
                        );
                        vector_failures += 1;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    count = targets.len(),
                    "Vector index unavailable; deleting relationally only"
                );
                vector_failures = targets.len();
            }
        }

        let now = Utc::now();
        let deleted = self.storage.with_transaction(|uow| {
            let rules = uow.rules_for_app(app.id)?;
            let mut deleted = Vec::new();
            let mut logs = Vec::new();
            for id in &targets {
                let Some(mut memory) = uow.get_memory(*id)? else {
                    continue;
                };
                // State may have moved since the accessible set was computed.
                if memory.user_id != user.id || !can_access(&memory, &app, &rules) {
                    continue;
                }
                if let Some(change) = memory.mark_deleted(user.id, now) {
                    uow.update_memory(&memory, Some(&change))?;
                    logs.push(AccessLogEntry::new(
                        memory.id,
                        app.id,
                        AccessType::DeleteAll,
                        json!({"operation": "bulk_delete"}),
                    ));
                    deleted.push(memory.id);
                }
            }
            uow.insert_access_logs(&logs)?;
            Ok(deleted)
        })?;

        tracing::info!(user_id, app = app_name, deleted = deleted.len(), "Deleted memories");
        Ok(DeleteOutcome {
            deleted,
            vector_failures,
        })
    }

    /// Memories of `user_id` visible to `app_name`
    pub async fn list(&self, user_id: &str, app_name: &str) -> Result<ListResponse> {
        let (user, app) = self.resolve_identity(user_id, app_name)?;

        let entries = match self.capabilities.get().await {
            Ok(capabilities) => {
                match capabilities
                    .index
                    .list(&VectorFilter::user(user_id), self.config.list_limit)
                    .await
                {
                    Ok(entries) => Some(entries),
                    Err(e) if e.is_capability_failure() => {
                        tracing::warn!(
                            user_id,
                            error = %e,
                            "Vector listing failed; using database"
                        );
                        None
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Vector index unavailable; using database");
                None
            }
        };

        match entries {
            Some(entries) if self.config.is_privileged(user_id) => {
                self.list_privileged(user_id, &app, entries)
            }
            Some(entries) => self.storage.with_transaction(|uow| {
                let memories = uow.memories_for_user(user.id)?;
                let rules = uow.rules_for_app(app.id)?;
                let accessible: HashSet<Uuid> = accessible_ids(&memories, &app, &rules);

                let mut results = Vec::new();
                let mut logs = Vec::new();
                for entry in entries {
                    let Some(id) = entry.id.filter(|id| accessible.contains(id)) else {
                        continue;
                    };
                    logs.push(AccessLogEntry::new(
                        id,
                        app.id,
                        AccessType::List,
                        json!({"hash": entry.payload.hash}),
                    ));
                    results.push(ListedMemory::from_entry(id, entry));
                }
                uow.insert_access_logs(&logs)?;
                Ok(ListResponse {
                    results,
                    source: ListSource::Vector,
                })
            }),
            None => self.storage.with_transaction(|uow| {
                let memories = uow.memories_for_user(user.id)?;
                let rules = uow.rules_for_app(app.id)?;

                let mut results = Vec::new();
                let mut logs = Vec::new();
                for memory in memories {
                    if !can_access(&memory, &app, &rules) {
                        continue;
                    }
                    logs.push(AccessLogEntry::new(
                        memory.id,
                        app.id,
                        AccessType::List,
                        json!({"hash": memory.content_hash(), "source": "database"}),
                    ));
                    results.push(ListedMemory::from_memory(memory));
                }
                uow.insert_access_logs(&logs)?;
                Ok(ListResponse {
                    results,
                    source: ListSource::Database,
                })
            }),
        }
    }

    /// Unfiltered listing for bulk-ingestion actors. Audited, never silent.
    fn list_privileged(
        &self,
        user_id: &str,
        app: &App,
        entries: Vec<IndexEntry>,
    ) -> Result<ListResponse> {
        tracing::warn!(
            user_id,
            app = %app.name,
            count = entries.len(),
            "Privileged listing bypasses access control"
        );

        self.storage.with_transaction(|uow| {
            let mut results = Vec::new();
            let mut logs = Vec::new();
            for entry in entries {
                let Some(id) = entry.id else {
                    continue;
                };
                if uow.get_memory(id)?.is_some() {
                    logs.push(AccessLogEntry::new(
                        id,
                        app.id,
                        AccessType::PrivilegedList,
                        json!({"hash": entry.payload.hash, "actor": user_id}),
                    ));
                }
                results.push(ListedMemory::from_entry(id, entry));
            }
            uow.insert_access_logs(&logs)?;
            Ok(ListResponse {
                results,
                source: ListSource::Privileged,
            })
        })
    }
}

/// Caller metadata tagged with the submitting app
fn source_metadata(metadata: Option<serde_json::Value>, app_name: &str) -> serde_json::Value {
    let mut map = match metadata {
        Some(serde_json::Value::Object(map)) => map,
        Some(serde_json::Value::Null) | None => serde_json::Map::new(),
        Some(other) => {
            let mut map = serde_json::Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    map.insert("source_app".to_string(), json!("dieah"));
    map.insert("client".to_string(), json!(app_name));
    serde_json::Value::Object(map)
}

/// Apply one ingest event, returning what was actually recorded.
///
/// Events naming a memory the app may not modify never touch it: additions
/// become a new memory under a fresh id and deletions are dropped.
fn apply_event(
    uow: &UnitOfWork<'_>,
    user: &User,
    app: &App,
    rules: &[AccessRule],
    event: &MemoryEvent,
    metadata: &serde_json::Value,
    now: chrono::DateTime<Utc>,
) -> Result<Option<MemoryEvent>> {
    let existing = match uow.get_memory(event.id)? {
        Some(memory) if memory.user_id != user.id => {
            tracing::warn!(
                memory_id = %event.id,
                "Ignoring event for memory owned by another user"
            );
            return Ok(None);
        }
        Some(memory) if !rules_permit(&memory, app, rules) => {
            if event.event == EventKind::Delete {
                tracing::warn!(
                    memory_id = %event.id,
                    app = %app.name,
                    "Ignoring delete of inaccessible memory"
                );
                return Ok(None);
            }
            tracing::warn!(
                memory_id = %event.id,
                app = %app.name,
                "Event targets inaccessible memory; storing as new"
            );
            let id = Uuid::new_v4();
            let (memory, created) =
                Memory::create(id, user, app, event.memory.clone(), metadata.clone(), now);
            uow.insert_memory(&memory, &created)?;
            return Ok(Some(MemoryEvent::new(id, EventKind::Add, event.memory.clone())));
        }
        other => other,
    };

    match (event.event, existing) {
        (EventKind::Add | EventKind::Update, None) => {
            let (memory, created) =
                Memory::create(event.id, user, app, event.memory.clone(), metadata.clone(), now);
            uow.insert_memory(&memory, &created)?;
        }
        (EventKind::Add | EventKind::Update, Some(mut memory)) => {
            let change = memory.reactivate(user.id, event.memory.clone(), now);
            memory.metadata = metadata.clone();
            uow.update_memory(&memory, change.as_ref())?;
        }
        (EventKind::Delete, Some(mut memory)) => {
            if let Some(change) = memory.mark_deleted(user.id, now) {
                uow.update_memory(&memory, Some(&change))?;
            }
        }
        (EventKind::Delete, None) => {
            tracing::debug!(memory_id = %event.id, "Delete event for unknown memory");
            return Ok(None);
        }
    }
    Ok(Some(event.clone()))
}
