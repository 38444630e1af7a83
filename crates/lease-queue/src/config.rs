//! Backend kinds, per-queue configuration records and settings loading.
//!
//! Configuration sources are layered with the `config` crate, later sources
//! overriding earlier ones:
//!
//! 1. an optional settings file (YAML, TOML or JSON, by extension)
//! 2. environment variables prefixed `LEASE_QUEUE__`, using `__` as the
//!    nesting separator, e.g. `LEASE_QUEUE__QUEUES__JOBS__BACKEND=memory`
//!
//! Every field carries a serde default, so an empty environment yields a
//! usable configuration: any queue without a record lands on the filesystem
//! backend under the default path.

use crate::error::ConfigurationError;
use crate::message::{QueueName, MAX_LEASE_SECONDS};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Environment variable prefix for settings overrides
pub const ENV_PREFIX: &str = "LEASE_QUEUE";

/// Lease applied by `receive_with_default_lease` when settings do not override it
pub const DEFAULT_LEASE_SECONDS: i64 = 300;

// ============================================================================
// Backend kinds
// ============================================================================

/// Closed set of supported storage backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process memory, lost when the process exits
    Memory,
    /// One file per message in a directory
    #[default]
    Filesystem,
    /// One row per message in a SQL table
    Database,
    /// Kernel System V message queue
    SystemV,
    /// Amazon SQS, leases owned by the remote service
    Sqs,
}

impl BackendKind {
    /// Stable identifier used in configuration and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Filesystem => "filesystem",
            Self::Database => "database",
            Self::SystemV => "system_v",
            Self::Sqs => "sqs",
        }
    }

    /// Check if the backend implements the lease protocol itself
    pub fn supports_leases(&self) -> bool {
        !matches!(self, Self::SystemV)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Resolved backend configuration
// ============================================================================

/// Fully resolved configuration for one adapter instance
///
/// Two queues whose records resolve to an equal `BackendConfig` share one
/// adapter; the fingerprint is derived from this value only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum BackendConfig {
    Memory(MemoryConfig),
    Filesystem(FilesystemConfig),
    Database(DatabaseConfig),
    SystemV(SystemVConfig),
    Sqs(SqsConfig),
}

impl BackendConfig {
    /// Backend kind this configuration selects
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Memory(_) => BackendKind::Memory,
            Self::Filesystem(_) => BackendKind::Filesystem,
            Self::Database(_) => BackendKind::Database,
            Self::SystemV(_) => BackendKind::SystemV,
            Self::Sqs(_) => BackendKind::Sqs,
        }
    }

    /// Deterministic digest used as the adapter cache key
    pub fn fingerprint(&self) -> Fingerprint {
        // Serialization of these plain structs cannot fail; the Debug form is
        // a stable fallback all the same.
        let canonical = serde_json::to_vec(self).unwrap_or_else(|_| format!("{:?}", self).into_bytes());
        Fingerprint(hex::encode(Sha256::digest(&canonical)))
    }
}

/// Hex SHA-256 digest of a resolved backend configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// In-memory backend configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub max_queue_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
        }
    }
}

/// Filesystem backend configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilesystemConfig {
    pub path: PathBuf,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            path: default_queue_path(),
        }
    }
}

/// Database backend configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL, e.g. `sqlite://queue.db?mode=rwc`
    pub url: String,
    pub table: String,
    pub create_table: bool,
    pub max_connections: u32,
}

/// System V message queue configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SystemVConfig {
    pub max_message_size: usize,
    /// Explicit kernel key; derived from the queue name when absent
    pub key: Option<i32>,
    pub permissions: u32,
}

/// Amazon SQS configuration
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SqsConfig {
    pub region: String,
    pub queue_url: String,
    /// Service endpoint override, e.g. a LocalStack URL
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl fmt::Debug for SqsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqsConfig")
            .field("region", &self.region)
            .field("queue_url", &self.queue_url)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Directory used by queues that have no configuration record
pub fn default_queue_path() -> PathBuf {
    std::env::temp_dir().join("lease-queue")
}

// ============================================================================
// Per-queue records
// ============================================================================

/// Raw per-queue configuration record
///
/// A flat bag of backend parameters; only the ones relevant to `backend` are
/// read when the record is resolved.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueEntry {
    pub backend: Option<BackendKind>,
    pub path: Option<PathBuf>,
    pub url: Option<String>,
    pub table: Option<String>,
    pub create_table: Option<bool>,
    pub max_connections: Option<u32>,
    pub key: Option<i32>,
    pub permissions: Option<u32>,
    pub max_message_size: Option<usize>,
    pub max_queue_size: Option<usize>,
    pub region: Option<String>,
    pub queue_url: Option<String>,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("backend", &self.backend)
            .field("path", &self.path)
            .field("url", &self.url)
            .field("table", &self.table)
            .field("create_table", &self.create_table)
            .field("max_connections", &self.max_connections)
            .field("key", &self.key)
            .field("permissions", &self.permissions)
            .field("max_message_size", &self.max_message_size)
            .field("max_queue_size", &self.max_queue_size)
            .field("region", &self.region)
            .field("queue_url", &self.queue_url)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl QueueEntry {
    /// Record selecting a backend with no parameters set
    pub fn for_backend(backend: BackendKind) -> Self {
        Self {
            backend: Some(backend),
            ..Self::default()
        }
    }

    /// Resolve this record into a complete backend configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::Missing`] when a parameter the selected
    /// backend cannot do without is absent.
    pub fn resolve(
        &self,
        queue: &str,
        defaults: &Defaults,
    ) -> Result<BackendConfig, ConfigurationError> {
        let missing = |key: &str| ConfigurationError::Missing {
            queue: queue.to_string(),
            key: key.to_string(),
        };

        let config = match self.backend.unwrap_or_default() {
            BackendKind::Memory => BackendConfig::Memory(MemoryConfig {
                max_queue_size: self
                    .max_queue_size
                    .unwrap_or(MemoryConfig::default().max_queue_size),
            }),
            BackendKind::Filesystem => BackendConfig::Filesystem(FilesystemConfig {
                path: self
                    .path
                    .clone()
                    .unwrap_or_else(|| defaults.path.clone()),
            }),
            BackendKind::Database => BackendConfig::Database(DatabaseConfig {
                url: self.url.clone().ok_or_else(|| missing("url"))?,
                table: self
                    .table
                    .clone()
                    .unwrap_or_else(|| "queue_messages".to_string()),
                create_table: self.create_table.unwrap_or(true),
                max_connections: self.max_connections.unwrap_or(5),
            }),
            BackendKind::SystemV => BackendConfig::SystemV(SystemVConfig {
                max_message_size: self
                    .max_message_size
                    .ok_or_else(|| missing("max_message_size"))?,
                key: self.key,
                permissions: self.permissions.unwrap_or(0o666),
            }),
            BackendKind::Sqs => BackendConfig::Sqs(SqsConfig {
                region: self.region.clone().ok_or_else(|| missing("region"))?,
                queue_url: self
                    .queue_url
                    .clone()
                    .or_else(|| self.url.clone())
                    .ok_or_else(|| missing("queue_url"))?,
                endpoint: self.endpoint.clone(),
                access_key_id: self.access_key_id.clone(),
                secret_access_key: self.secret_access_key.clone(),
            }),
        };

        Ok(config)
    }
}

/// Values applied to queues that leave them unset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    /// Directory for filesystem queues without a `path`
    pub path: PathBuf,
    /// Lease used by `receive_with_default_lease`
    pub lease_seconds: i64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            path: default_queue_path(),
            lease_seconds: DEFAULT_LEASE_SECONDS,
        }
    }
}

impl Defaults {
    /// The default lease as a duration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::Invalid`] when `lease_seconds` is
    /// negative or longer than [`MAX_LEASE_SECONDS`].
    pub fn lease(&self) -> Result<Duration, ConfigurationError> {
        if !(0..=MAX_LEASE_SECONDS).contains(&self.lease_seconds) {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "defaults.lease_seconds must be between 0 and {}, got {}",
                    MAX_LEASE_SECONDS, self.lease_seconds
                ),
            });
        }

        Duration::try_seconds(self.lease_seconds).ok_or_else(|| ConfigurationError::Invalid {
            message: format!("defaults.lease_seconds {} is out of range", self.lease_seconds),
        })
    }
}

// ============================================================================
// QueueSettings
// ============================================================================

/// Complete settings consumed by the queue front door
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub defaults: Defaults,
    pub queues: HashMap<String, QueueEntry>,
}

impl QueueSettings {
    /// Create empty settings (every queue uses the filesystem default)
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the record for one queue
    pub fn with_queue(mut self, queue: impl Into<String>, entry: QueueEntry) -> Self {
        self.queues.insert(queue.into(), entry);
        self
    }

    /// Override the default filesystem path
    pub fn with_default_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.defaults.path = path.into();
        self
    }

    /// Load settings from an optional file plus `LEASE_QUEUE__*` environment
    ///
    /// # Errors
    ///
    /// A file that was named but cannot be read or parsed, or an environment
    /// value of the wrong type, is a [`ConfigurationError::Parsing`]. The
    /// result is validated before it is returned.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            tracing::info!(path = %path.display(), "Loading queue settings from file");
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let settings: QueueSettings = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Check queue names, default lease and that every record resolves
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.defaults.lease()?;

        for (name, entry) in &self.queues {
            QueueName::new(name.as_str()).map_err(|e| ConfigurationError::Invalid {
                message: format!("queue '{}': {}", name, e),
            })?;
            entry.resolve(name, &self.defaults)?;
        }

        Ok(())
    }

    /// Resolve the backend configuration for a queue
    ///
    /// Queues without a record resolve to the filesystem backend at the
    /// default path.
    pub fn resolve(&self, queue: &QueueName) -> Result<BackendConfig, ConfigurationError> {
        match self.queues.get(queue.as_str()) {
            Some(entry) => entry.resolve(queue.as_str(), &self.defaults),
            None => Ok(BackendConfig::Filesystem(FilesystemConfig {
                path: self.defaults.path.clone(),
            })),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
