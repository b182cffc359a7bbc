//! SQLite storage: the durable source of truth for users, apps, memories and
//! their audit trails

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::memory::{
    AccessLogEntry, AccessRule, AccessType, App, Memory, MemoryState, RuleEffect, RuleObject,
    StatusChange, User,
};

const MEMORY_COLUMNS: &str =
    "id, user_id, app_id, content, metadata, state, created_at, updated_at, deleted_at";

/// SQLite storage backend
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (or create) the database file at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Self::init(conn)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;

        // Initialize schema
        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` inside one transaction. Returning `Err` rolls every change back.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&UnitOfWork<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;
        let tx = conn.transaction()?;
        let out = f(&UnitOfWork { conn: &tx })?;
        tx.commit()?;
        Ok(out)
    }
}

/// Typed access to the relational tables within one transaction
pub struct UnitOfWork<'a> {
    conn: &'a Connection,
}

impl UnitOfWork<'_> {
    // --- users and apps ---

    pub fn find_user(&self, user_id: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT id, user_id, name, created_at FROM users WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?
            .map(|(id, user_id, name, created_at)| {
                Ok(User {
                    id: parse_uuid(&id)?,
                    user_id,
                    name,
                    created_at: parse_ts(&created_at)?,
                })
            })
            .transpose()
    }

    pub fn insert_user(&self, user: &User) -> Result<()> {
        self.conn.execute(
            "INSERT INTO users (id, user_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                user.id.to_string(),
                user.user_id,
                user.name,
                user.created_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn find_app(&self, owner_id: Uuid, name: &str) -> Result<Option<App>> {
        self.conn
            .query_row(
                "SELECT id, owner_id, name, is_active, created_at, updated_at
                 FROM apps WHERE owner_id = ?1 AND name = ?2",
                params![owner_id.to_string(), name],
                AppRow::from_row,
            )
            .optional()?
            .map(AppRow::into_app)
            .transpose()
    }

    pub fn get_app(&self, id: Uuid) -> Result<Option<App>> {
        self.conn
            .query_row(
                "SELECT id, owner_id, name, is_active, created_at, updated_at
                 FROM apps WHERE id = ?1",
                params![id.to_string()],
                AppRow::from_row,
            )
            .optional()?
            .map(AppRow::into_app)
            .transpose()
    }

    pub fn insert_app(&self, app: &App) -> Result<()> {
        self.conn.execute(
            "INSERT INTO apps (id, owner_id, name, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                app.id.to_string(),
                app.owner_id.to_string(),
                app.name,
                app.is_active,
                app.created_at.to_rfc3339(),
                app.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn set_app_active(&self, app_id: Uuid, active: bool) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE apps SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
            params![active, Utc::now().to_rfc3339(), app_id.to_string()],
        )?;
        if changed == 0 {
            return Err(Error::not_found(format!("App {}", app_id)));
        }
        Ok(())
    }

    /// Get or create the user and the user's app called `app_name`.
    pub fn resolve_identity(&self, user_id: &str, app_name: &str) -> Result<(User, App)> {
        if user_id.trim().is_empty() {
            return Err(Error::invalid_input("user_id not provided"));
        }
        if app_name.trim().is_empty() {
            return Err(Error::invalid_input("app name not provided"));
        }

        let user = match self.find_user(user_id)? {
            Some(user) => user,
            None => {
                let user = User::new(user_id);
                self.insert_user(&user)?;
                tracing::info!(user_id, "Created user");
                user
            }
        };

        let app = match self.find_app(user.id, app_name)? {
            Some(app) => app,
            None => {
                let app = App::new(user.id, app_name);
                self.insert_app(&app)?;
                tracing::info!(user_id, app = app_name, "Created app");
                app
            }
        };

        Ok((user, app))
    }

    // --- memories ---

    pub fn get_memory(&self, id: Uuid) -> Result<Option<Memory>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM memories WHERE id = ?1", MEMORY_COLUMNS),
                params![id.to_string()],
                MemoryRow::from_row,
            )
            .optional()?
            .map(MemoryRow::into_memory)
            .transpose()
    }

    /// All memories owned by a user, any state
    pub fn memories_for_user(&self, user: Uuid) -> Result<Vec<Memory>> {
        self.query_memories(
            &format!(
                "SELECT {} FROM memories WHERE user_id = ?1 ORDER BY created_at DESC",
                MEMORY_COLUMNS
            ),
            params![user.to_string()],
        )
    }

    /// Active memories of a user created through one app
    pub fn active_memories_for_app(&self, user: Uuid, app: Uuid) -> Result<Vec<Memory>> {
        self.query_memories(
            &format!(
                "SELECT {} FROM memories WHERE user_id = ?1 AND app_id = ?2 AND state = 'active'
                 ORDER BY created_at DESC",
                MEMORY_COLUMNS
            ),
            params![user.to_string(), app.to_string()],
        )
    }

    /// Case-insensitive substring match over active memories of (user, app).
    pub fn search_text(
        &self,
        user: Uuid,
        app: Uuid,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        let needle = query.to_lowercase();
        Ok(self
            .active_memories_for_app(user, app)?
            .into_iter()
            .filter(|memory| memory.content.to_lowercase().contains(&needle))
            .take(limit)
            .collect())
    }

    /// Every active memory paired with its owner's external user id
    pub fn active_memories_with_owner(&self) -> Result<Vec<(String, Memory)>> {
        let mut stmt = self.conn.prepare(
            "SELECT u.user_id, m.id, m.user_id, m.app_id, m.content, m.metadata, m.state,
                    m.created_at, m.updated_at, m.deleted_at
             FROM memories m JOIN users u ON u.id = m.user_id
             WHERE m.state = 'active'
             ORDER BY m.created_at",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, MemoryRow::from_row_at(row, 1)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (owner, memory) = row?;
            out.push((owner, memory.into_memory()?));
        }
        Ok(out)
    }

    /// Insert a freshly created memory with its creation history entry.
    pub fn insert_memory(&self, memory: &Memory, created: &StatusChange) -> Result<()> {
        if created.memory_id != memory.id || created.new_state != memory.state() {
            return Err(Error::storage("History entry does not match memory"));
        }
        self.conn.execute(
            &format!(
                "INSERT INTO memories ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                MEMORY_COLUMNS
            ),
            params![
                memory.id.to_string(),
                memory.user_id.to_string(),
                memory.app_id.to_string(),
                memory.content,
                serde_json::to_string(&memory.metadata)?,
                memory.state().as_str(),
                memory.created_at.to_rfc3339(),
                memory.updated_at.to_rfc3339(),
                memory.deleted_at().map(|dt| dt.to_rfc3339()),
            ],
        )?;
        self.insert_history(created)
    }

    /// Persist content changes and, when `change` is given, the state
    /// transition together with its history entry. Without a change the
    /// stored state is left untouched.
    pub fn update_memory(&self, memory: &Memory, change: Option<&StatusChange>) -> Result<()> {
        let id = memory.id.to_string();
        let metadata = serde_json::to_string(&memory.metadata)?;
        let updated = match change {
            Some(change) => {
                if change.memory_id != memory.id || change.new_state != memory.state() {
                    return Err(Error::storage("History entry does not match memory"));
                }
                self.conn.execute(
                    "UPDATE memories SET content = ?1, metadata = ?2, state = ?3,
                            updated_at = ?4, deleted_at = ?5
                     WHERE id = ?6",
                    params![
                        memory.content,
                        metadata,
                        memory.state().as_str(),
                        memory.updated_at.to_rfc3339(),
                        memory.deleted_at().map(|dt| dt.to_rfc3339()),
                        id,
                    ],
                )?
            }
            None => self.conn.execute(
                "UPDATE memories SET content = ?1, metadata = ?2, updated_at = ?3 WHERE id = ?4",
                params![memory.content, metadata, memory.updated_at.to_rfc3339(), id],
            )?,
        };
        if updated == 0 {
            return Err(Error::not_found(format!("Memory {}", memory.id)));
        }
        match change {
            Some(change) => self.insert_history(change),
            None => Ok(()),
        }
    }

    fn insert_history(&self, change: &StatusChange) -> Result<()> {
        self.conn.execute(
            "INSERT INTO memory_status_history (id, memory_id, changed_by, old_state, new_state, changed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                change.id.to_string(),
                change.memory_id.to_string(),
                change.changed_by.to_string(),
                change.old_state.map(|s| s.as_str()),
                change.new_state.as_str(),
                change.changed_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn history_for(&self, memory_id: Uuid) -> Result<Vec<StatusChange>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, memory_id, changed_by, old_state, new_state, changed_at
             FROM memory_status_history WHERE memory_id = ?1 ORDER BY changed_at, rowid",
        )?;
        let rows = stmt.query_map(params![memory_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, memory_id, changed_by, old_state, new_state, changed_at) = row?;
            out.push(StatusChange {
                id: parse_uuid(&id)?,
                memory_id: parse_uuid(&memory_id)?,
                changed_by: parse_uuid(&changed_by)?,
                old_state: old_state.as_deref().map(MemoryState::parse).transpose()?,
                new_state: MemoryState::parse(&new_state)?,
                changed_at: parse_ts(&changed_at)?,
            });
        }
        Ok(out)
    }

    /// Raw SQL for test fixtures
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    // --- access logs and rules ---

    pub fn insert_access_logs(&self, entries: &[AccessLogEntry]) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "INSERT INTO memory_access_logs (id, memory_id, app_id, access_type, metadata, accessed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for entry in entries {
            stmt.execute(params![
                entry.id.to_string(),
                entry.memory_id.to_string(),
                entry.app_id.to_string(),
                entry.access_type.as_str(),
                serde_json::to_string(&entry.metadata)?,
                entry.accessed_at.to_rfc3339(),
            ])?;
        }
        Ok(())
    }

    pub fn access_logs_for(&self, memory_id: Uuid) -> Result<Vec<AccessLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, memory_id, app_id, access_type, metadata, accessed_at
             FROM memory_access_logs WHERE memory_id = ?1 ORDER BY accessed_at, rowid",
        )?;
        let rows = stmt.query_map(params![memory_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, memory_id, app_id, access_type, metadata, accessed_at) = row?;
            out.push(AccessLogEntry {
                id: parse_uuid(&id)?,
                memory_id: parse_uuid(&memory_id)?,
                app_id: parse_uuid(&app_id)?,
                access_type: AccessType::parse(&access_type)?,
                metadata: serde_json::from_str(&metadata)?,
                accessed_at: parse_ts(&accessed_at)?,
            });
        }
        Ok(out)
    }

    pub fn count_access_logs(&self) -> Result<u64> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM memory_access_logs", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn insert_rule(&self, rule: &AccessRule) -> Result<()> {
        self.conn.execute(
            "INSERT INTO access_controls (id, subject_app_id, object_type, object_id, effect, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                rule.id.to_string(),
                rule.subject_app_id.to_string(),
                rule.object.kind(),
                rule.object.id().to_string(),
                rule.effect.as_str(),
                rule.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Rules whose subject is `app_id`
    pub fn rules_for_app(&self, app_id: Uuid) -> Result<Vec<AccessRule>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, subject_app_id, object_type, object_id, effect, created_at
             FROM access_controls WHERE subject_app_id = ?1",
        )?;
        let rows = stmt.query_map(params![app_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, subject, object_type, object_id, effect, created_at) = row?;
            let effect = match effect.as_str() {
                "allow" => RuleEffect::Allow,
                "deny" => RuleEffect::Deny,
                other => return Err(Error::storage(format!("Unknown rule effect: {}", other))),
            };
            out.push(AccessRule {
                id: parse_uuid(&id)?,
                subject_app_id: parse_uuid(&subject)?,
                object: RuleObject::from_parts(&object_type, parse_uuid(&object_id)?)?,
                effect,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(out)
    }

    fn query_memories(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Memory>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, MemoryRow::from_row)?;

        let mut memories = Vec::new();
        for row in rows {
            memories.push(row?.into_memory()?);
        }
        Ok(memories)
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::storage(e.to_string()))
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::storage(e.to_string()))
}

/// Intermediate struct for reading apps from SQLite
struct AppRow {
    id: String,
    owner_id: String,
    name: String,
    is_active: bool,
    created_at: String,
    updated_at: String,
}

impl AppRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            name: row.get(2)?,
            is_active: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    fn into_app(self) -> Result<App> {
        Ok(App {
            id: parse_uuid(&self.id)?,
            owner_id: parse_uuid(&self.owner_id)?,
            name: self.name,
            is_active: self.is_active,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

/// Intermediate struct for reading memories from SQLite
struct MemoryRow {
    id: String,
    user_id: String,
    app_id: String,
    content: String,
    metadata: String,
    state: String,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
}

impl MemoryRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Self::from_row_at(row, 0)
    }

    fn from_row_at(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(offset)?,
            user_id: row.get(offset + 1)?,
            app_id: row.get(offset + 2)?,
            content: row.get(offset + 3)?,
            metadata: row.get(offset + 4)?,
            state: row.get(offset + 5)?,
            created_at: row.get(offset + 6)?,
            updated_at: row.get(offset + 7)?,
            deleted_at: row.get(offset + 8)?,
        })
    }

    fn into_memory(self) -> Result<Memory> {
        Ok(Memory {
            id: parse_uuid(&self.id)?,
            user_id: parse_uuid(&self.user_id)?,
            app_id: parse_uuid(&self.app_id)?,
            content: self.content,
            metadata: serde_json::from_str(&self.metadata)?,
            state: MemoryState::parse(&self.state)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            deleted_at: self.deleted_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity(storage: &SqliteStorage, user: &str, app: &str) -> (User, App) {
        storage
            .with_transaction(|uow| uow.resolve_identity(user, app))
            .unwrap()
    }

    fn add_memory(storage: &SqliteStorage, user: &User, app: &App, content: &str) -> Memory {
        let (memory, change) =
            Memory::create(Uuid::new_v4(), user, app, content, json!({}), Utc::now());
        storage
            .with_transaction(|uow| uow.insert_memory(&memory, &change))
            .unwrap();
        memory
    }

    #[test]
    fn resolve_identity_is_idempotent() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let (user, app) = identity(&storage, "u1", "a1");
        let (user2, app2) = identity(&storage, "u1", "a1");
        assert_eq!(user.id, user2.id);
        assert_eq!(app.id, app2.id);
        assert!(app.is_active);

        let (_, other) = identity(&storage, "u1", "a2");
        assert_ne!(other.id, app.id);
    }

    #[test]
    fn resolve_identity_rejects_blank_ids() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let err = storage
            .with_transaction(|uow| uow.resolve_identity("", "a1"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn insert_memory_writes_history() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let (user, app) = identity(&storage, "u1", "a1");
        let memory = add_memory(&storage, &user, &app, "likes espresso");

        let (stored, history) = storage
            .with_transaction(|uow| Ok((uow.get_memory(memory.id)?, uow.history_for(memory.id)?)))
            .unwrap();
        let stored = stored.unwrap();
        assert_eq!(stored.content, "likes espresso");
        assert!(stored.is_active());
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].old_state, None);
        assert_eq!(history[0].new_state, MemoryState::Active);
    }

    #[test]
    fn update_without_change_keeps_state() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let (user, app) = identity(&storage, "u1", "a1");
        let mut memory = add_memory(&storage, &user, &app, "old");

        memory.content = "new".into();
        storage
            .with_transaction(|uow| uow.update_memory(&memory, None))
            .unwrap();

        let history = storage.with_transaction(|uow| uow.history_for(memory.id)).unwrap();
        assert_eq!(history.len(), 1);
        let stored = storage
            .with_transaction(|uow| uow.get_memory(memory.id))
            .unwrap()
            .unwrap();
        assert_eq!(stored.content, "new");
    }

    #[test]
    fn soft_delete_round_trips() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let (user, app) = identity(&storage, "u1", "a1");
        let mut memory = add_memory(&storage, &user, &app, "x");

        let change = memory.mark_deleted(user.id, Utc::now()).unwrap();
        storage
            .with_transaction(|uow| uow.update_memory(&memory, Some(&change)))
            .unwrap();

        let stored = storage
            .with_transaction(|uow| uow.get_memory(memory.id))
            .unwrap()
            .unwrap();
        assert_eq!(stored.state(), MemoryState::Deleted);
        assert!(stored.deleted_at().is_some());
        let history = storage.with_transaction(|uow| uow.history_for(memory.id)).unwrap();
        assert_eq!(history.last().unwrap().new_state, MemoryState::Deleted);
    }

    #[test]
    fn failed_unit_of_work_rolls_back() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let (user, app) = identity(&storage, "u1", "a1");
        let (memory, change) =
            Memory::create(Uuid::new_v4(), &user, &app, "doomed", json!({}), Utc::now());

        let result: Result<()> = storage.with_transaction(|uow| {
            uow.insert_memory(&memory, &change)?;
            Err(Error::storage("boom"))
        });
        assert!(result.is_err());
        assert!(storage
            .with_transaction(|uow| uow.get_memory(memory.id))
            .unwrap()
            .is_none());
    }

    #[test]
    fn audit_tables_are_append_only() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let (user, app) = identity(&storage, "u1", "a1");
        let memory = add_memory(&storage, &user, &app, "x");

        let result = storage.with_transaction(|uow| {
            uow.conn
                .execute("DELETE FROM memory_status_history", [])
                .map_err(Error::from)
        });
        assert!(result.is_err());

        let result = storage.with_transaction(|uow| {
            uow.conn
                .execute("DELETE FROM memories WHERE id = ?1", params![memory.id.to_string()])
                .map_err(Error::from)
        });
        assert!(result.is_err());
    }

    #[test]
    fn text_search_is_case_insensitive_and_scoped() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let (user, app) = identity(&storage, "u1", "a1");
        let (_, other_app) = identity(&storage, "u1", "a2");
        add_memory(&storage, &user, &app, "Likes ESPRESSO in the morning");
        add_memory(&storage, &user, &app, "Owns a bicycle");
        add_memory(&storage, &user, &other_app, "likes espresso too");

        let hits = storage
            .with_transaction(|uow| uow.search_text(user.id, app.id, "espresso", 10))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.starts_with("Likes ESPRESSO"));

        let capped = storage
            .with_transaction(|uow| uow.search_text(user.id, app.id, "", 1))
            .unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[test]
    fn rules_round_trip() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let (_, app) = identity(&storage, "u1", "a1");
        let (_, other) = identity(&storage, "u1", "a2");
        let rule = AccessRule::new(app.id, RuleObject::App(other.id), RuleEffect::Allow);
        storage.with_transaction(|uow| uow.insert_rule(&rule)).unwrap();

        let rules = storage.with_transaction(|uow| uow.rules_for_app(app.id)).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].object, RuleObject::App(other.id));
        assert_eq!(rules[0].effect, RuleEffect::Allow);
    }

    #[test]
    fn active_memories_carry_owner_key() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let (user, app) = identity(&storage, "u1", "a1");
        let mut gone = add_memory(&storage, &user, &app, "gone");
        add_memory(&storage, &user, &app, "kept");
        let change = gone.mark_deleted(user.id, Utc::now()).unwrap();
        storage
            .with_transaction(|uow| uow.update_memory(&gone, Some(&change)))
            .unwrap();

        let active = storage
            .with_transaction(|uow| uow.active_memories_with_owner())
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].0, "u1");
        assert_eq!(active[0].1.content, "kept");
    }

    #[test]
    fn file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recall.db");
        {
            let storage = SqliteStorage::open(&path).unwrap();
            identity(&storage, "u1", "a1");
        }
        let storage = SqliteStorage::open(&path).unwrap();
        let user = storage.with_transaction(|uow| uow.find_user("u1")).unwrap();
        assert!(user.is_some());
    }
}
