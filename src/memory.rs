//! Data model: users, apps, memories and their append-only audit records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Lifecycle state of a memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryState {
    Active,
    Deleted,
}

impl MemoryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryState::Active => "active",
            MemoryState::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(MemoryState::Active),
            "deleted" => Ok(MemoryState::Deleted),
            _ => Err(Error::storage(format!("Unknown memory state: {}", s))),
        }
    }
}

impl std::fmt::Display for MemoryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A person whose memories are stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Internal identifier
    pub id: Uuid,

    /// External identity key supplied by callers
    pub user_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            name: None,
            created_at: Utc::now(),
        }
    }
}

/// A client application acting on behalf of a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub id: Uuid,

    /// Owning user (internal id)
    pub owner_id: Uuid,

    /// Name, unique per owner
    pub name: String,

    /// Paused apps cannot create memories and are denied reads
    pub is_active: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl App {
    pub fn new(owner_id: Uuid, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id,
            name: name.into(),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A stored unit of user-relevant text.
///
/// `state` only changes through [`Memory::create`], [`Memory::mark_deleted`]
/// and [`Memory::reactivate`], each of which yields the matching
/// [`StatusChange`] for the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: Uuid,

    /// Owning user (internal id)
    pub user_id: Uuid,

    /// Originating app
    pub app_id: Uuid,

    pub content: String,

    /// Free-form key/value metadata
    #[serde(default)]
    pub metadata: serde_json::Value,

    pub(crate) state: MemoryState,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) deleted_at: Option<DateTime<Utc>>,
}

impl Memory {
    /// Create an active memory together with its first history entry.
    pub fn create(
        id: Uuid,
        owner: &User,
        app: &App,
        content: impl Into<String>,
        metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) -> (Self, StatusChange) {
        let memory = Self {
            id,
            user_id: owner.id,
            app_id: app.id,
            content: content.into(),
            metadata,
            state: MemoryState::Active,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        let change = StatusChange::new(id, owner.id, None, MemoryState::Active, now);
        (memory, change)
    }

    pub fn state(&self) -> MemoryState {
        self.state
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    pub fn is_active(&self) -> bool {
        self.state == MemoryState::Active
    }

    /// Soft-delete. Returns `None` when the memory was already deleted.
    pub fn mark_deleted(&mut self, actor: Uuid, now: DateTime<Utc>) -> Option<StatusChange> {
        if self.state == MemoryState::Deleted {
            return None;
        }
        self.state = MemoryState::Deleted;
        self.deleted_at = Some(now);
        self.updated_at = now;
        Some(StatusChange::new(
            self.id,
            actor,
            Some(MemoryState::Active),
            MemoryState::Deleted,
            now,
        ))
    }

    /// Bring a deleted memory back with fresh content. Returns `None` (and
    /// only replaces content) when it was already active.
    pub fn reactivate(
        &mut self,
        actor: Uuid,
        content: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Option<StatusChange> {
        self.content = content.into();
        self.updated_at = now;
        if self.state == MemoryState::Active {
            return None;
        }
        self.state = MemoryState::Active;
        self.deleted_at = None;
        Some(StatusChange::new(
            self.id,
            actor,
            Some(MemoryState::Deleted),
            MemoryState::Active,
            now,
        ))
    }

    /// Hash identifying this memory's content in the vector payload
    pub fn content_hash(&self) -> String {
        content_hash(&self.content)
    }
}

/// Lowercase hex SHA-256 of `content`
pub fn content_hash(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

/// Immutable history entry for a memory state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub id: Uuid,
    pub memory_id: Uuid,

    /// Internal id of the user who caused the change
    pub changed_by: Uuid,

    /// `None` for the creation entry
    pub old_state: Option<MemoryState>,

    pub new_state: MemoryState,
    pub changed_at: DateTime<Utc>,
}

impl StatusChange {
    fn new(
        memory_id: Uuid,
        changed_by: Uuid,
        old_state: Option<MemoryState>,
        new_state: MemoryState,
        changed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            memory_id,
            changed_by,
            old_state,
            new_state,
            changed_at,
        }
    }
}

/// Kind of access recorded in the access log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    Search,
    List,
    PrivilegedList,
    DeleteAll,
}

impl AccessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessType::Search => "search",
            AccessType::List => "list",
            AccessType::PrivilegedList => "privileged_list",
            AccessType::DeleteAll => "delete_all",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "search" => Ok(AccessType::Search),
            "list" => Ok(AccessType::List),
            "privileged_list" => Ok(AccessType::PrivilegedList),
            "delete_all" => Ok(AccessType::DeleteAll),
            _ => Err(Error::storage(format!("Unknown access type: {}", s))),
        }
    }
}

/// Immutable record of a permitted access to a memory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub id: Uuid,
    pub memory_id: Uuid,
    pub app_id: Uuid,
    pub access_type: AccessType,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub accessed_at: DateTime<Utc>,
}

impl AccessLogEntry {
    pub fn new(
        memory_id: Uuid,
        app_id: Uuid,
        access_type: AccessType,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            memory_id,
            app_id,
            access_type,
            metadata,
            accessed_at: Utc::now(),
        }
    }
}

/// Whether a rule grants or withholds access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleEffect {
    Allow,
    Deny,
}

impl RuleEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleEffect::Allow => "allow",
            RuleEffect::Deny => "deny",
        }
    }
}

/// What a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum RuleObject {
    /// A single memory
    Memory(Uuid),
    /// Every memory originating from an app
    App(Uuid),
}

impl RuleObject {
    pub fn kind(&self) -> &'static str {
        match self {
            RuleObject::Memory(_) => "memory",
            RuleObject::App(_) => "app",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            RuleObject::Memory(id) | RuleObject::App(id) => *id,
        }
    }

    pub fn from_parts(kind: &str, id: Uuid) -> Result<Self> {
        match kind {
            "memory" => Ok(RuleObject::Memory(id)),
            "app" => Ok(RuleObject::App(id)),
            _ => Err(Error::storage(format!("Unknown rule object type: {}", kind))),
        }
    }

    /// Whether this object covers `memory`
    pub fn covers(&self, memory: &Memory) -> bool {
        match self {
            RuleObject::Memory(id) => *id == memory.id,
            RuleObject::App(id) => *id == memory.app_id,
        }
    }
}

/// Explicit access rule for a requesting app
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRule {
    pub id: Uuid,

    /// App the rule applies to
    pub subject_app_id: Uuid,

    pub object: RuleObject,
    pub effect: RuleEffect,
    pub created_at: DateTime<Utc>,
}

impl AccessRule {
    pub fn new(subject_app_id: Uuid, object: RuleObject, effect: RuleEffect) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject_app_id,
            object,
            effect,
            created_at: Utc::now(),
        }
    }
}
