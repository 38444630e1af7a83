//! Registry mapping backend kinds to adapter constructors.
//!
//! The front door resolves a queue to a [`BackendConfig`] and asks the
//! registry to build the adapter for it. [`AdapterRegistry::with_defaults`]
//! wires every built-in backend; tests and embedders can replace any entry.

use crate::adapter::QueueAdapter;
use crate::adapters::{DatabaseAdapter, FilesystemAdapter, MemoryAdapter, SqsAdapter};
use crate::config::{BackendConfig, BackendKind};
use crate::error::{ConfigurationError, QueueError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Future returned by an adapter constructor
pub type AdapterFuture =
    Pin<Box<dyn Future<Output = Result<Arc<dyn QueueAdapter>, QueueError>> + Send>>;

/// Builds an adapter from its resolved configuration
pub type AdapterConstructor = fn(BackendConfig) -> AdapterFuture;

// ============================================================================
// AdapterRegistry
// ============================================================================

/// Registry mapping backend kinds to their constructors.
///
/// Built once with the front door and used read-only afterwards.
#[derive(Clone)]
pub struct AdapterRegistry {
    constructors: HashMap<BackendKind, AdapterConstructor>,
}

impl AdapterRegistry {
    /// Create a new, empty registry.
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Create a registry with every built-in backend registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register(BackendKind::Memory, build_memory)
            .register(BackendKind::Filesystem, build_filesystem)
            .register(BackendKind::Database, build_database)
            .register(BackendKind::SystemV, build_system_v)
            .register(BackendKind::Sqs, build_sqs);
        registry
    }

    /// Register a constructor for a backend kind.
    ///
    /// An existing constructor for the same kind is replaced. Returns
    /// `&mut Self` to allow method chaining.
    pub fn register(&mut self, kind: BackendKind, constructor: AdapterConstructor) -> &mut Self {
        self.constructors.insert(kind, constructor);
        self
    }

    /// Look up the constructor for a backend kind.
    pub fn get(&self, kind: BackendKind) -> Option<AdapterConstructor> {
        self.constructors.get(&kind).copied()
    }

    /// Check whether a backend kind is registered.
    pub fn contains(&self, kind: BackendKind) -> bool {
        self.constructors.contains_key(&kind)
    }

    /// Build the adapter for a resolved configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::UnsupportedBackend`] when no constructor
    /// is registered for the configuration's kind, or whatever the
    /// constructor itself fails with.
    pub async fn create(&self, config: BackendConfig) -> Result<Arc<dyn QueueAdapter>, QueueError> {
        let kind = config.kind();
        let constructor = self.get(kind).ok_or_else(|| ConfigurationError::UnsupportedBackend {
            backend: kind,
            message: "no adapter constructor registered".to_string(),
        })?;

        constructor(config).await
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ============================================================================
// Built-in constructors
// ============================================================================

fn mismatch(expected: BackendKind, config: &BackendConfig) -> QueueError {
    ConfigurationError::Invalid {
        message: format!(
            "{} constructor received {} configuration",
            expected,
            config.kind()
        ),
    }
    .into()
}

fn build_memory(config: BackendConfig) -> AdapterFuture {
    Box::pin(async move {
        match config {
            BackendConfig::Memory(c) => Ok(Arc::new(MemoryAdapter::new(c)) as Arc<dyn QueueAdapter>),
            other => Err(mismatch(BackendKind::Memory, &other)),
        }
    })
}

fn build_filesystem(config: BackendConfig) -> AdapterFuture {
    Box::pin(async move {
        match config {
            BackendConfig::Filesystem(c) => {
                Ok(Arc::new(FilesystemAdapter::new(c).await?) as Arc<dyn QueueAdapter>)
            }
            other => Err(mismatch(BackendKind::Filesystem, &other)),
        }
    })
}

fn build_database(config: BackendConfig) -> AdapterFuture {
    Box::pin(async move {
        match config {
            BackendConfig::Database(c) => {
                Ok(Arc::new(DatabaseAdapter::connect(c).await?) as Arc<dyn QueueAdapter>)
            }
            other => Err(mismatch(BackendKind::Database, &other)),
        }
    })
}

#[cfg(target_os = "linux")]
fn build_system_v(config: BackendConfig) -> AdapterFuture {
    use crate::adapters::SystemVAdapter;

    Box::pin(async move {
        match config {
            BackendConfig::SystemV(c) => {
                Ok(Arc::new(SystemVAdapter::new(c)?) as Arc<dyn QueueAdapter>)
            }
            other => Err(mismatch(BackendKind::SystemV, &other)),
        }
    })
}

#[cfg(not(target_os = "linux"))]
fn build_system_v(_config: BackendConfig) -> AdapterFuture {
    Box::pin(async move {
        Err(ConfigurationError::UnsupportedBackend {
            backend: BackendKind::SystemV,
            message: "System V message queues are only available on Linux".to_string(),
        }
        .into())
    })
}

fn build_sqs(config: BackendConfig) -> AdapterFuture {
    Box::pin(async move {
        match config {
            BackendConfig::Sqs(c) => Ok(Arc::new(SqsAdapter::new(c)?) as Arc<dyn QueueAdapter>),
            other => Err(mismatch(BackendKind::Sqs, &other)),
        }
    })
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
