//! Access-controlled search: vector first, relational text match as fallback

use std::collections::HashSet;

use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::access::{accessible_ids, can_access};
use crate::capability::{VectorFilter, VectorHit};
use crate::config::Config;
use crate::embedding::EmbedMode;
use crate::error::{Error, Result};
use crate::memory::{AccessLogEntry, AccessType, App, User};
use crate::store::MemoryStore;

/// How a response was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMethod {
    Vector,
    DatabaseText,
}

impl SearchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMethod::Vector => "vector",
            SearchMethod::DatabaseText => "database_text",
        }
    }
}

/// A memory surfaced by a search
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: Uuid,
    pub memory: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub search_method: SearchMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Search orchestrator
pub struct SearchEngine {
    config: Config,
}

impl SearchEngine {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Search `user_id`'s memories visible to `app_name`.
    ///
    /// Falls back to a case-insensitive substring match when the vector side
    /// is unavailable or fails. Access logs for the returned results are
    /// committed together, or not at all.
    pub async fn search(
        &self,
        store: &MemoryStore,
        user_id: &str,
        app_name: &str,
        query: &str,
        limit: Option<usize>,
    ) -> Result<SearchResponse> {
        let limit = limit.unwrap_or(self.config.search_limit).max(1);
        self.run(store, user_id, app_name, query, limit)
            .await
            .map_err(|e| match e {
                Error::InvalidInput(_) => e,
                other => {
                    tracing::error!(user_id, app = app_name, error = %other, "Search failed");
                    Error::search(other)
                }
            })
    }

    async fn run(
        &self,
        store: &MemoryStore,
        user_id: &str,
        app_name: &str,
        query: &str,
        limit: usize,
    ) -> Result<SearchResponse> {
        let (user, app) = store.resolve_identity(user_id, app_name)?;

        match self.vector_hits(store, &user, query, limit).await {
            Ok(hits) => self.vector_results(store, &user, &app, query, hits),
            Err(e) if e.is_capability_failure() => {
                tracing::info!(
                    user_id,
                    app = app_name,
                    reason = %e,
                    "Using database fallback search"
                );
                self.text_results(store, &user, &app, query, limit)
            }
            Err(e) => Err(e),
        }
    }

    async fn vector_hits(
        &self,
        store: &MemoryStore,
        user: &User,
        query: &str,
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        let capabilities = store.capabilities().get().await?;
        let vector = capabilities.embedder.embed_one(query, EmbedMode::Search).await?;
        capabilities
            .index
            .search(&vector, limit, &VectorFilter::user(&user.user_id))
            .await
    }

    fn vector_results(
        &self,
        store: &MemoryStore,
        user: &User,
        app: &App,
        query: &str,
        hits: Vec<VectorHit>,
    ) -> Result<SearchResponse> {
        store.storage().with_transaction(|uow| {
            let memories = uow.memories_for_user(user.id)?;
            let rules = uow.rules_for_app(app.id)?;
            let accessible: HashSet<Uuid> = accessible_ids(&memories, app, &rules);

            let mut results = Vec::new();
            let mut logs = Vec::new();
            for hit in hits {
                // Only explicitly accessible ids are surfaced.
                let Some(id) = hit.id.filter(|id| accessible.contains(id)) else {
                    continue;
                };
                logs.push(AccessLogEntry::new(
                    id,
                    app.id,
                    AccessType::Search,
                    json!({"query": query, "score": hit.score, "hash": hit.payload.hash}),
                ));
                results.push(SearchHit {
                    id,
                    memory: hit.payload.data,
                    hash: Some(hit.payload.hash),
                    metadata: hit.payload.metadata,
                    created_at: hit.payload.created_at,
                    updated_at: hit.payload.updated_at,
                    score: hit.score,
                });
            }

            uow.insert_access_logs(&logs)?;
            tracing::debug!(
                user_id = %user.user_id,
                app = %app.name,
                results = results.len(),
                "Vector search"
            );
            Ok(SearchResponse {
                results,
                search_method: SearchMethod::Vector,
                note: None,
            })
        })
    }

    fn text_results(
        &self,
        store: &MemoryStore,
        user: &User,
        app: &App,
        query: &str,
        limit: usize,
    ) -> Result<SearchResponse> {
        store.storage().with_transaction(|uow| {
            let candidates = uow.search_text(user.id, app.id, query, limit)?;
            let rules = uow.rules_for_app(app.id)?;

            let mut results = Vec::new();
            let mut logs = Vec::new();
            for memory in candidates {
                if !can_access(&memory, app, &rules) {
                    continue;
                }
                logs.push(AccessLogEntry::new(
                    memory.id,
                    app.id,
                    AccessType::Search,
                    json!({"query": query, "search_method": SearchMethod::DatabaseText.as_str()}),
                ));
                results.push(SearchHit {
                    id: memory.id,
                    hash: Some(memory.content_hash()),
                    created_at: Some(memory.created_at.to_rfc3339()),
                    updated_at: Some(memory.updated_at.to_rfc3339()),
                    memory: memory.content,
                    metadata: memory.metadata,
                    score: 1.0,
                });
            }

            uow.insert_access_logs(&logs)?;
            tracing::debug!(
                user_id = %user.user_id,
                app = %app.name,
                results = results.len(),
                "Text search"
            );
            Ok(SearchResponse {
                results,
                search_method: SearchMethod::DatabaseText,
                note: Some("Using text search (vector store unavailable)".to_string()),
            })
        })
    }
}
