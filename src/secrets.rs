//! Credential resolution with a local fallback.
//!
//! A logical secret name maps to a JSON credential bundle. Resolution failures
//! never abort startup: callers degrade to the local configuration.

use std::path::PathBuf;

use serde::Deserialize;

use crate::config::Config;
use crate::error::{Error, Result};

/// Structured credentials returned for a secret name
#[derive(Clone, Deserialize)]
#[serde(untagged)]
pub enum CredentialBundle {
    Database(DatabaseCredentials),
    ApiToken { token: String },
}

impl std::fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Database(creds) => f.debug_tuple("Database").field(creds).finish(),
            Self::ApiToken { .. } => f.write_str("ApiToken { token: <redacted> }"),
        }
    }
}

/// Database connection credentials
#[derive(Clone, Deserialize)]
pub struct DatabaseCredentials {
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub dbname: String,
}

impl std::fmt::Debug for DatabaseCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseCredentials")
            .field("engine", &self.engine)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .finish()
    }
}

impl DatabaseCredentials {
    /// Connection URL with the password percent-encoded.
    pub fn database_url(&self) -> String {
        let engine = self.engine.as_deref().unwrap_or("postgresql");
        if engine == "sqlite" {
            return format!("sqlite://{}", self.dbname);
        }
        let password: String =
            url::form_urlencoded::byte_serialize(self.password.as_bytes()).collect();
        format!(
            "{}://{}:{}@{}:{}/{}",
            engine,
            self.username,
            password,
            self.host,
            self.port.unwrap_or(5432),
            self.dbname
        )
    }
}

/// Looks up a credential bundle by logical name
pub trait SecretResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Result<CredentialBundle>;
}

/// Reads `<dir>/<name>.json`
pub struct FileSecretResolver {
    dir: PathBuf,
}

impl FileSecretResolver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl SecretResolver for FileSecretResolver {
    fn resolve(&self, name: &str) -> Result<CredentialBundle> {
        if name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(Error::invalid_input(format!("Invalid secret name: {}", name)));
        }
        let path = self.dir.join(format!("{}.json", name));
        let data = std::fs::read_to_string(&path)
            .map_err(|e| Error::config(format!("Failed to read secret {}: {}", name, e)))?;
        serde_json::from_str(&data).map_err(|e| {
            Error::config(format!("Secret {} is not a credential bundle: {}", name, e))
        })
    }
}

/// Reads the bundle JSON from `DIEAH_SECRET_<NAME>`
pub struct EnvSecretResolver;

impl EnvSecretResolver {
    fn var_name(name: &str) -> String {
        let normalized: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("DIEAH_SECRET_{}", normalized)
    }
}

impl SecretResolver for EnvSecretResolver {
    fn resolve(&self, name: &str) -> Result<CredentialBundle> {
        let var = Self::var_name(name);
        let data = std::env::var(&var)
            .map_err(|_| Error::config(format!("Secret {} not set ({})", name, var)))?;
        Ok(serde_json::from_str(&data)?)
    }
}

/// Tries each resolver in order, returning the first success
pub struct ChainResolver(pub Vec<Box<dyn SecretResolver>>);

impl ChainResolver {
    /// Environment first, then the configured secrets directory.
    pub fn standard(config: &Config) -> Self {
        Self(vec![
            Box::new(EnvSecretResolver),
            Box::new(FileSecretResolver::new(config.secrets_dir.clone())),
        ])
    }
}

impl SecretResolver for ChainResolver {
    fn resolve(&self, name: &str) -> Result<CredentialBundle> {
        let mut last = Error::config(format!("No resolver configured for secret {}", name));
        for resolver in &self.0 {
            match resolver.resolve(name) {
                Ok(bundle) => return Ok(bundle),
                Err(e) => last = e,
            }
        }
        Err(last)
    }
}

/// Extract a filesystem path from a `sqlite://`/`sqlite:` URL or a bare path.
pub fn sqlite_path_from_url(url: &str) -> Result<PathBuf> {
    if let Some(rest) = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:")) {
        if rest.is_empty() {
            return Err(Error::config("Empty SQLite path"));
        }
        return Ok(PathBuf::from(rest));
    }
    if url.contains("://") {
        return Err(Error::config(format!(
            "Unsupported database URL scheme: {}",
            url.split("://").next().unwrap_or_default()
        )));
    }
    Ok(PathBuf::from(url))
}

/// Decide where the relational store lives.
///
/// Priority: `DATABASE_URL`, then the database secret, then the local file
/// under the data directory.
pub fn resolve_database_path(config: &Config, resolver: &dyn SecretResolver) -> PathBuf {
    if let Some(url) = &config.database_url {
        match sqlite_path_from_url(url) {
            Ok(path) => {
                tracing::info!("Using DATABASE_URL from environment");
                return path;
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring DATABASE_URL"),
        }
    }

    if let Some(name) = &config.db_secret_name {
        tracing::info!(secret = %name, "Fetching database credentials");
        let resolved = resolver.resolve(name).and_then(|bundle| match bundle {
            CredentialBundle::Database(creds) => sqlite_path_from_url(&creds.database_url()),
            CredentialBundle::ApiToken { .. } => Err(Error::config(format!(
                "Secret {} holds an API token, not database credentials",
                name
            ))),
        });
        match resolved {
            Ok(path) => return path,
            Err(e) => {
                tracing::error!(error = %e, "Failed to get database credentials");
                tracing::warn!("Falling back to local SQLite");
            }
        }
    }

    let path = config.sqlite_path();
    tracing::info!(path = %path.display(), "Using local SQLite");
    path
}

/// API key for the remote embedding backend, if any can be found.
pub fn resolve_api_key(config: &Config, resolver: &dyn SecretResolver) -> Option<String> {
    if let Some(key) = &config.openai_api_key {
        return Some(key.clone());
    }
    let name = config.openai_secret_name.as_ref()?;
    match resolver.resolve(name) {
        Ok(CredentialBundle::ApiToken { token }) => Some(token),
        Ok(CredentialBundle::Database(_)) => {
            tracing::warn!(secret = %name, "Secret holds database credentials, not an API token");
            None
        }
        Err(e) => {
            tracing::warn!(secret = %name, error = %e, "Failed to resolve embedding API token");
            None
        }
    }
}
