//! Tests for the queue front door.

use super::*;
use crate::adapters::MemoryAdapter;
use crate::config::{BackendKind, FilesystemConfig, QueueEntry};
use crate::registry::AdapterFuture;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

fn name(queue: &str) -> QueueName {
    QueueName::new(queue).unwrap()
}

fn memory_settings() -> QueueSettings {
    QueueSettings::new()
        .with_queue("alpha", QueueEntry::for_backend(BackendKind::Memory))
        .with_queue("beta", QueueEntry::for_backend(BackendKind::Memory))
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Task {
    id: u32,
    steps: Vec<String>,
}

// ============================================================================
// Resolution and Caching
// ============================================================================

mod cache_tests {
    use super::*;

    #[test]
    fn test_invalid_settings_rejected_at_construction() {
        let settings = QueueSettings::new().with_queue("bad name", QueueEntry::default());
        assert!(matches!(
            MessageQueue::new(settings),
            Err(QueueError::Configuration(_))
        ));
    }

    #[test]
    fn test_unconfigured_queue_resolves_to_default_filesystem() {
        let dir = TempDir::new().unwrap();
        let queue = MessageQueue::new(QueueSettings::new().with_default_path(dir.path())).unwrap();

        assert_eq!(
            queue.resolve(&name("anything")).unwrap(),
            BackendConfig::Filesystem(FilesystemConfig {
                path: dir.path().to_path_buf()
            })
        );
    }

    /// Queues with identical configuration share a single adapter instance.
    #[tokio::test]
    async fn test_identical_configs_share_adapter() {
        let queue = MessageQueue::new(memory_settings()).unwrap();

        let a = queue.adapter_for(&name("alpha")).await.unwrap();
        let b = queue.adapter_for(&name("beta")).await.unwrap();
        let a_again = queue.adapter_for(&name("alpha")).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &a_again));
        assert_eq!(queue.cached_adapters().await, 1);
    }

    #[tokio::test]
    async fn test_distinct_configs_get_distinct_adapters() {
        let settings = memory_settings().with_queue(
            "gamma",
            QueueEntry {
                max_queue_size: Some(5),
                ..QueueEntry::for_backend(BackendKind::Memory)
            },
        );
        let queue = MessageQueue::new(settings).unwrap();

        let a = queue.adapter_for(&name("alpha")).await.unwrap();
        let c = queue.adapter_for(&name("gamma")).await.unwrap();

        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(queue.cached_adapters().await, 2);
    }

    /// In-memory messages survive between calls because the adapter is cached.
    #[tokio::test]
    async fn test_memory_messages_persist_across_calls() {
        let queue = MessageQueue::new(memory_settings()).unwrap();
        queue.send(&name("alpha"), "hello", "app-1").await.unwrap();

        let envelope = queue
            .receive(&name("alpha"), Duration::seconds(30))
            .await
            .unwrap()
            .expect("message should still be there");
        assert_eq!(queue.decode::<String>(&envelope).unwrap(), "hello");
        assert!(queue
            .receive(&name("beta"), Duration::seconds(30))
            .await
            .unwrap()
            .is_none());
    }

    static BUILDS: AtomicUsize = AtomicUsize::new(0);

    fn counting_memory(config: BackendConfig) -> AdapterFuture {
        Box::pin(async move {
            BUILDS.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            match config {
                BackendConfig::Memory(c) => {
                    Ok(Arc::new(MemoryAdapter::new(c)) as Arc<dyn QueueAdapter>)
                }
                other => panic!("unexpected config {:?}", other),
            }
        })
    }

    #[tokio::test]
    async fn test_concurrent_lookups_build_once() {
        let mut registry = AdapterRegistry::with_defaults();
        registry.register(BackendKind::Memory, counting_memory);
        let queue = MessageQueue::new(memory_settings())
            .unwrap()
            .with_registry(registry);

        let alpha = name("alpha");
        let beta = name("beta");
        let (a, b) = tokio::join!(queue.adapter_for(&alpha), queue.adapter_for(&beta));

        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(BUILDS.load(Ordering::SeqCst), 1);
    }

    fn stalled_database(_config: BackendConfig) -> AdapterFuture {
        Box::pin(async move {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Err(QueueError::ConnectionFailed {
                message: "database never answered".to_string(),
            })
        })
    }

    /// A slow adapter build for one configuration does not hold up queues
    /// served by another.
    #[tokio::test]
    async fn test_slow_build_does_not_block_other_queues() {
        let mut registry = AdapterRegistry::with_defaults();
        registry.register(BackendKind::Database, stalled_database);
        let settings = memory_settings().with_queue(
            "ledger",
            QueueEntry {
                url: Some("sqlite::memory:".to_string()),
                ..QueueEntry::for_backend(BackendKind::Database)
            },
        );
        let queue = MessageQueue::new(settings).unwrap().with_registry(registry);

        let ledger = name("ledger");
        tokio::select! {
            _ = queue.adapter_for(&ledger) => panic!("stalled build completed first"),
            sent = async {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                queue.send(&name("alpha"), "hello", "p").await
            } => {
                sent.unwrap();
            }
        }

        assert_eq!(queue.cached_adapters().await, 1);
    }

    #[tokio::test]
    async fn test_unregistered_backend_is_configuration_error() {
        let queue = MessageQueue::new(memory_settings())
            .unwrap()
            .with_registry(AdapterRegistry::new());

        let result = queue.send(&name("alpha"), "x", "p").await;
        assert!(matches!(
            result,
            Err(QueueError::Configuration(
                crate::error::ConfigurationError::UnsupportedBackend { .. }
            ))
        ));
    }
}

// ============================================================================
// Operations
// ============================================================================

mod operation_tests {
    use super::*;

    #[tokio::test]
    async fn test_structured_payload_round_trip() {
        let queue = MessageQueue::new(memory_settings()).unwrap();
        let task = Task {
            id: 7,
            steps: vec!["fetch".to_string(), "index".to_string()],
        };

        let id = queue.send(&name("alpha"), &task, "scheduler").await.unwrap();
        let envelope = queue
            .receive(&name("alpha"), Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(envelope.message_id.as_ref(), Some(&id));
        assert_eq!(envelope.producer_id, "scheduler");
        assert_eq!(queue.decode::<Task>(&envelope).unwrap(), task);
        assert!(queue.delete(&name("alpha"), &id).await.unwrap());
    }

    #[tokio::test]
    async fn test_send_bytes_passes_payload_through() {
        let queue = MessageQueue::new(memory_settings()).unwrap();
        queue
            .send_bytes(&name("alpha"), Bytes::from_static(b"\x00raw"), "p")
            .await
            .unwrap();

        let envelope = queue
            .receive_with_default_lease(&name("alpha"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.payload, Bytes::from_static(b"\x00raw"));
    }

    #[tokio::test]
    async fn test_default_lease_comes_from_settings() {
        let mut settings = memory_settings();
        settings.defaults.lease_seconds = 120;
        let queue = MessageQueue::new(settings).unwrap();
        queue.send(&name("alpha"), &1, "p").await.unwrap();

        let before = crate::message::Timestamp::now();
        let envelope = queue
            .receive_with_default_lease(&name("alpha"))
            .await
            .unwrap()
            .unwrap();

        let expiry = envelope.lease_expiry.unwrap();
        assert!(expiry >= before.plus(Duration::seconds(120)).unwrap());
        assert!(expiry <= before.plus(Duration::seconds(125)).unwrap());
    }

    #[tokio::test]
    async fn test_filesystem_default_backend_end_to_end() {
        let dir = TempDir::new().unwrap();
        let queue = MessageQueue::new(QueueSettings::new().with_default_path(dir.path())).unwrap();
        let jobs = name("jobs");

        let id = queue.send(&jobs, "hello", "app-1").await.unwrap();
        let envelope = queue
            .receive(&jobs, Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(envelope.message_id.as_ref(), Some(&id));
        assert_eq!(queue.decode::<String>(&envelope).unwrap(), "hello");
        assert!(queue.delete(&jobs, &id).await.unwrap());
    }

    #[test]
    fn test_debug_output() {
        let queue = MessageQueue::new(memory_settings()).unwrap();
        let debug = format!("{:?}", queue);
        assert!(debug.contains("json"));
        assert!(debug.contains("configured_queues: 2"));
    }
}
