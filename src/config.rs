//! Configuration for dieah-recall

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Which embedding backend produces vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingProvider {
    /// OpenAI-compatible `/v1/embeddings` endpoint
    OpenAi,
    /// Local fastembed model, no network or API key
    Local,
}

impl FromStr for EmbeddingProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "local" | "fastembed" => Ok(Self::Local),
            other => Err(Error::config(format!("Unknown embedding provider: {}", other))),
        }
    }
}

/// Configuration for the memory system
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for all storage
    pub data_dir: PathBuf,

    /// Explicit database location (`sqlite://...` URL or file path)
    pub database_url: Option<String>,

    /// Secret holding database credentials
    pub db_secret_name: Option<String>,

    /// Directory consulted by the file secret resolver
    pub secrets_dir: PathBuf,

    /// Embedding backend
    pub embedding_provider: EmbeddingProvider,

    /// Embedding model name
    pub embedding_model: String,

    /// Embedding dimensions (1536 for text-embedding-3-small)
    pub embedding_dimensions: usize,

    /// Base URL of the OpenAI-compatible API
    pub openai_base_url: String,

    /// API key for the remote embedding backend
    pub openai_api_key: Option<String>,

    /// Secret holding the embedding API token
    pub openai_secret_name: Option<String>,

    /// Timeout applied to every embedding HTTP call
    pub http_timeout: Duration,

    /// Vector collection (LanceDB table) name
    pub collection: String,

    /// Maximum number of results returned by a search
    pub search_limit: usize,

    /// Upper bound on records fetched by a list call
    pub list_limit: usize,

    /// Similarity at or above which an incoming memory is treated as a
    /// restatement of an existing one
    pub duplicate_threshold: f32,

    /// Users allowed to list every indexed record without relational filtering
    pub privileged_users: BTreeSet<String>,

    /// User created on startup
    pub default_user_id: String,

    /// App created for the default user on startup
    pub default_app: String,

    /// Tracing filter directive used when RUST_LOG is unset
    pub log_level: String,

    /// Emit JSON log lines
    pub log_json: bool,

    /// HTTP server port
    pub server_port: u16,

    /// Bulk resynchronization settings
    pub resync: ResyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dieah-recall");

        Self {
            secrets_dir: data_dir.join("secrets"),
            data_dir,
            database_url: None,
            db_secret_name: None,
            embedding_provider: EmbeddingProvider::OpenAi,
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimensions: 1536,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_api_key: None,
            openai_secret_name: None,
            http_timeout: Duration::from_secs(30),
            collection: "memories".to_string(),
            search_limit: 10,
            list_limit: 10_000,
            duplicate_threshold: 0.95,
            privileged_users: BTreeSet::from(["slack-bot".to_string()]),
            default_user_id: "default_user".to_string(),
            default_app: "dieah".to_string(),
            log_level: "info".to_string(),
            log_json: false,
            server_port: 8420,
            resync: ResyncConfig::default(),
        }
    }
}

impl Config {
    /// Create a new config with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            secrets_dir: data_dir.join("secrets"),
            data_dir,
            ..Default::default()
        }
    }

    /// Build a config from defaults overlaid with environment variables.
    ///
    /// Malformed values are logged and the default is kept.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] but reading from an arbitrary source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = match lookup("DIEAH_DATA_DIR") {
            Some(dir) => Self::with_data_dir(dir),
            None => Self::default(),
        };

        if let Some(dir) = lookup("DIEAH_SECRETS_DIR") {
            config.secrets_dir = PathBuf::from(dir);
        }
        config.database_url = lookup("DATABASE_URL").or(config.database_url);
        config.db_secret_name = lookup("DB_SECRET_NAME").or(config.db_secret_name);
        config.openai_api_key = lookup("OPENAI_API_KEY").or(config.openai_api_key);
        config.openai_secret_name = lookup("OPENAI_SECRET_NAME").or(config.openai_secret_name);

        if let Some(v) = lookup("DIEAH_EMBEDDING_PROVIDER") {
            apply(&mut config.embedding_provider, "DIEAH_EMBEDDING_PROVIDER", v.parse());
        }
        if let Some(model) = lookup("DIEAH_EMBEDDING_MODEL") {
            config.embedding_model = model;
        }
        if let Some(v) = lookup("DIEAH_EMBEDDING_DIMENSIONS") {
            apply(&mut config.embedding_dimensions, "DIEAH_EMBEDDING_DIMENSIONS", parse_num(&v));
        }
        if let Some(url) = lookup("OPENAI_BASE_URL") {
            config.openai_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(name) = lookup("DIEAH_COLLECTION") {
            config.collection = name;
        }
        if let Some(v) = lookup("DIEAH_PORT") {
            apply(&mut config.server_port, "DIEAH_PORT", parse_num(&v));
        }
        if let Some(level) = lookup("DIEAH_LOG_LEVEL") {
            config.log_level = level;
        }
        if let Some(v) = lookup("DIEAH_LOG_JSON") {
            config.log_json = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = lookup("DIEAH_PRIVILEGED_USERS") {
            config.privileged_users = parse_list(&v).collect();
        }
        if let Some(user) = lookup("USER_ID") {
            config.default_user_id = user;
        }
        if let Some(app) = lookup("DIEAH_DEFAULT_APP") {
            config.default_app = app;
        }

        let resync = &mut config.resync;
        if let Some(v) = lookup("DIEAH_RESYNC_USERS") {
            resync.scope = ResyncScope::from_list(&v);
        }
        if let Some(v) = lookup("DIEAH_RESYNC_CUTOFFS") {
            apply(&mut resync.cutoffs, "DIEAH_RESYNC_CUTOFFS", parse_cutoffs(&v));
        }
        if let Some(v) = lookup("DIEAH_RESYNC_INTERVAL_MINUTES") {
            apply(
                &mut resync.interval,
                "DIEAH_RESYNC_INTERVAL_MINUTES",
                parse_interval_minutes(&v),
            );
        }
        if let Some(v) = lookup("DIEAH_RESYNC_CONCURRENCY") {
            let n: Result<usize> = parse_num(&v);
            apply(&mut resync.concurrency, "DIEAH_RESYNC_CONCURRENCY", n.map(|n| n.max(1)));
        }
        if let Some(v) = lookup("DIEAH_RESYNC_USER_TIMEOUT_SECS") {
            let secs: Result<u64> = parse_num(&v);
            apply(
                &mut resync.user_timeout,
                "DIEAH_RESYNC_USER_TIMEOUT_SECS",
                secs.map(Duration::from_secs),
            );
        }

        config
    }

    /// Get the path to the local SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("recall.db")
    }

    /// Get the path to the vector database
    pub fn vector_db_path(&self) -> PathBuf {
        self.data_dir.join("vectors")
    }

    /// Whether `user_id` may list without relational filtering
    pub fn is_privileged(&self, user_id: &str) -> bool {
        self.privileged_users.contains(user_id)
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.vector_db_path())?;
        Ok(())
    }
}

/// Which users a resync run covers
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResyncScope {
    /// Every user with active memories
    #[default]
    All,
    /// Only the listed external user ids
    Only(BTreeSet<String>),
}

impl ResyncScope {
    /// Parse a comma-separated user list; an empty list means every user.
    pub fn from_list(list: &str) -> Self {
        let users: BTreeSet<String> = parse_list(list).collect();
        if users.is_empty() {
            Self::All
        } else {
            Self::Only(users)
        }
    }

    pub fn includes(&self, user_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(users) => users.contains(user_id),
        }
    }
}

/// Settings for the bulk resynchronization pipeline
#[derive(Debug, Clone)]
pub struct ResyncConfig {
    /// Users to rebuild
    pub scope: ResyncScope,

    /// Per-user recency cutoff; memories older than `now - cutoff` are skipped
    pub cutoffs: BTreeMap<String, Duration>,

    /// Period of the scheduled run in the server
    pub interval: Duration,

    /// Number of users synchronized at once
    pub concurrency: usize,

    /// Budget for one user's embed + upsert
    pub user_timeout: Duration,

    /// Remove index records that no longer match an active memory
    pub purge_stale: bool,
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            scope: ResyncScope::All,
            cutoffs: BTreeMap::new(),
            interval: Duration::from_secs(30 * 60),
            concurrency: 1,
            user_timeout: Duration::from_secs(120),
            purge_stale: true,
        }
    }
}

impl ResyncConfig {
    pub fn cutoff_for(&self, user_id: &str) -> Option<Duration> {
        self.cutoffs.get(user_id).copied()
    }
}

fn apply<T>(slot: &mut T, key: &str, parsed: Result<T>) {
    match parsed {
        Ok(value) => *slot = value,
        Err(e) => tracing::warn!(key, error = %e, "Ignoring malformed configuration value"),
    }
}

fn parse_num<T: FromStr>(value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("Not a number: {}", value)))
}

fn parse_list(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Longest accepted resync interval
const MAX_RESYNC_INTERVAL: Duration = Duration::from_secs(366 * 86_400);

/// Parse a resync interval in whole minutes. Zero and values beyond a year
/// are rejected.
pub fn parse_interval_minutes(value: &str) -> Result<Duration> {
    let minutes: u64 = parse_num(value)?;
    let interval = minutes
        .checked_mul(60)
        .map(Duration::from_secs)
        .filter(|d| !d.is_zero() && *d <= MAX_RESYNC_INTERVAL)
        .ok_or_else(|| Error::config(format!("Resync interval out of range: {} minutes", value)))?;
    Ok(interval)
}

/// Parse `7d`, `12h`, `30m` or `45s`.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| Error::config(format!("Missing unit in duration: {}", value)))?;
    let (amount, unit) = value.split_at(split);
    let amount: u64 = parse_num(amount)?;
    let scale = match unit {
        "d" => 86_400,
        "h" => 3_600,
        "m" => 60,
        "s" => 1,
        _ => return Err(Error::config(format!("Unknown duration unit: {}", unit))),
    };
    let secs = amount
        .checked_mul(scale)
        .ok_or_else(|| Error::config(format!("Duration too large: {}", value)))?;
    Ok(Duration::from_secs(secs))
}

/// Parse `user=7d,other=12h` into per-user cutoffs.
pub fn parse_cutoffs(value: &str) -> Result<BTreeMap<String, Duration>> {
    parse_list(value)
        .map(|pair| {
            let (user, age) = pair
                .split_once('=')
                .ok_or_else(|| Error::config(format!("Expected user=duration, got {}", pair)))?;
            Ok((user.trim().to_string(), parse_duration(age)?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_openai_small_model() {
        let config = Config::default();
        assert_eq!(config.embedding_dimensions, 1536);
        assert_eq!(config.search_limit, 10);
        assert!(config.is_privileged("slack-bot"));
        assert_eq!(config.resync.scope, ResyncScope::All);
        assert_eq!(config.resync.interval, Duration::from_secs(1800));
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = Config::from_lookup(lookup(&[
            ("DIEAH_DATA_DIR", "/tmp/recall"),
            ("DIEAH_EMBEDDING_PROVIDER", "local"),
            ("DIEAH_EMBEDDING_DIMENSIONS", "384"),
            ("DIEAH_RESYNC_USERS", "slack-bot, weather"),
            ("DIEAH_RESYNC_CUTOFFS", "slack-bot=7d"),
            ("DIEAH_PRIVILEGED_USERS", "ingest"),
        ]));
        assert_eq!(config.data_dir, PathBuf::from("/tmp/recall"));
        assert_eq!(config.secrets_dir, PathBuf::from("/tmp/recall/secrets"));
        assert_eq!(config.embedding_provider, EmbeddingProvider::Local);
        assert_eq!(config.embedding_dimensions, 384);
        assert!(config.resync.scope.includes("weather"));
        assert!(!config.resync.scope.includes("buy-box-rules"));
        assert_eq!(
            config.resync.cutoff_for("slack-bot"),
            Some(Duration::from_secs(7 * 86_400))
        );
        assert!(config.is_privileged("ingest"));
        assert!(!config.is_privileged("slack-bot"));
    }

    #[test]
    fn malformed_values_keep_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("DIEAH_PORT", "not-a-port"),
            ("DIEAH_EMBEDDING_PROVIDER", "mystery"),
            ("DIEAH_RESYNC_CUTOFFS", "slack-bot"),
        ]));
        assert_eq!(config.server_port, 8420);
        assert_eq!(config.embedding_provider, EmbeddingProvider::OpenAi);
        assert!(config.resync.cutoffs.is_empty());
    }

    #[test]
    fn durations_parse_with_units() {
        assert_eq!(parse_duration("12h").unwrap(), Duration::from_secs(43_200));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1_800));
        assert!(parse_duration("7").is_err());
        assert!(parse_duration("7w").is_err());
        assert!(parse_duration("18446744073709551615d").is_err());
    }

    #[test]
    fn unusable_resync_intervals_keep_default() {
        for bad in ["0", "18446744073709551615", "1000000", "-5"] {
            let config = Config::from_lookup(lookup(&[("DIEAH_RESYNC_INTERVAL_MINUTES", bad)]));
            assert_eq!(config.resync.interval, Duration::from_secs(1800), "value {}", bad);
        }

        let config = Config::from_lookup(lookup(&[("DIEAH_RESYNC_INTERVAL_MINUTES", "5")]));
        assert_eq!(config.resync.interval, Duration::from_secs(300));
    }

    #[test]
    fn empty_user_list_means_everyone() {
        assert_eq!(ResyncScope::from_list(" , "), ResyncScope::All);
        assert!(ResyncScope::All.includes("anyone"));
    }
}
