//! Common test utilities for lease-queue integration tests
//!
//! This module provides:
//! - Construction of every locally runnable backend behind the adapter trait
//! - Unique queue names so tests sharing a medium never collide
//! - Envelope builders

use bytes::Bytes;
use lease_queue::adapters::{DatabaseAdapter, FilesystemAdapter, MemoryAdapter};
use lease_queue::config::{DatabaseConfig, FilesystemConfig, MemoryConfig};
use lease_queue::{Envelope, QueueAdapter, QueueName};
use std::sync::Arc;
use tempfile::TempDir;

/// An adapter plus whatever keeps its storage alive
pub struct TestBackend {
    pub name: &'static str,
    pub adapter: Arc<dyn QueueAdapter>,
    _storage: Option<TempDir>,
}

impl TestBackend {
    #[allow(dead_code)]
    pub async fn memory() -> Self {
        Self {
            name: "memory",
            adapter: Arc::new(MemoryAdapter::new(MemoryConfig::default())),
            _storage: None,
        }
    }

    #[allow(dead_code)]
    pub async fn filesystem() -> Self {
        let dir = TempDir::new().unwrap();
        let adapter = FilesystemAdapter::new(FilesystemConfig {
            path: dir.path().join("queues"),
        })
        .await
        .unwrap();

        Self {
            name: "filesystem",
            adapter: Arc::new(adapter),
            _storage: Some(dir),
        }
    }

    /// SQLite file database; a file rather than `:memory:` so the pool can
    /// hand out more than one connection
    #[allow(dead_code)]
    pub async fn database() -> Self {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("queue.db").display());
        let adapter = DatabaseAdapter::connect(DatabaseConfig {
            url,
            table: "queue_messages".to_string(),
            create_table: true,
            max_connections: 4,
        })
        .await
        .unwrap();

        Self {
            name: "database",
            adapter: Arc::new(adapter),
            _storage: Some(dir),
        }
    }
}

/// Every backend with lease support that runs without external services
#[allow(dead_code)]
pub async fn leasing_backends() -> Vec<TestBackend> {
    vec![
        TestBackend::memory().await,
        TestBackend::filesystem().await,
        TestBackend::database().await,
    ]
}

/// A queue name no other test uses
#[allow(dead_code)]
pub fn unique_queue(prefix: &str) -> QueueName {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    QueueName::new(format!("{}-{}", prefix, &suffix[..12])).unwrap()
}

#[allow(dead_code)]
pub fn envelope(payload: &str, producer_id: &str) -> Envelope {
    Envelope::new(Bytes::from(payload.to_string())).with_producer_id(producer_id)
}

#[allow(dead_code)]
pub fn payload_text(envelope: &Envelope) -> String {
    String::from_utf8(envelope.payload.to_vec()).unwrap()
}
