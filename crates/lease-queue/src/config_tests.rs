//! Tests for configuration resolution and loading.

use super::*;
use serial_test::serial;
use std::io::Write;

fn queue(name: &str) -> QueueName {
    QueueName::new(name).unwrap()
}

// ============================================================================
// BackendKind Tests
// ============================================================================

#[test]
fn test_backend_kind_names() {
    assert_eq!(BackendKind::Memory.to_string(), "memory");
    assert_eq!(BackendKind::Filesystem.to_string(), "filesystem");
    assert_eq!(BackendKind::Database.to_string(), "database");
    assert_eq!(BackendKind::SystemV.to_string(), "system_v");
    assert_eq!(BackendKind::Sqs.to_string(), "sqs");

    let parsed: BackendKind = serde_json::from_str("\"system_v\"").unwrap();
    assert_eq!(parsed, BackendKind::SystemV);
}

#[test]
fn test_only_system_v_lacks_leases() {
    assert!(!BackendKind::SystemV.supports_leases());
    for kind in [
        BackendKind::Memory,
        BackendKind::Filesystem,
        BackendKind::Database,
        BackendKind::Sqs,
    ] {
        assert!(kind.supports_leases(), "{} should support leases", kind);
    }
}

// ============================================================================
// Resolution Tests
// ============================================================================

mod resolution_tests {
    use super::*;

    #[test]
    fn test_unconfigured_queue_defaults_to_filesystem() {
        let settings = QueueSettings::new().with_default_path("/var/spool/lq");

        let resolved = settings.resolve(&queue("anything")).unwrap();
        assert_eq!(
            resolved,
            BackendConfig::Filesystem(FilesystemConfig {
                path: PathBuf::from("/var/spool/lq")
            })
        );
    }

    #[test]
    fn test_record_without_backend_defaults_to_filesystem() {
        let entry = QueueEntry {
            path: Some(PathBuf::from("/tmp/jobs")),
            ..QueueEntry::default()
        };

        let resolved = entry.resolve("jobs", &Defaults::default()).unwrap();
        assert_eq!(resolved.kind(), BackendKind::Filesystem);
    }

    #[test]
    fn test_database_requires_url() {
        let entry = QueueEntry::for_backend(BackendKind::Database);

        match entry.resolve("jobs", &Defaults::default()) {
            Err(ConfigurationError::Missing { queue, key }) => {
                assert_eq!(queue, "jobs");
                assert_eq!(key, "url");
            }
            other => panic!("Expected Missing error, got: {:?}", other),
        }
    }

    #[test]
    fn test_database_defaults() {
        let entry = QueueEntry {
            url: Some("sqlite::memory:".to_string()),
            ..QueueEntry::for_backend(BackendKind::Database)
        };

        match entry.resolve("jobs", &Defaults::default()).unwrap() {
            BackendConfig::Database(db) => {
                assert_eq!(db.table, "queue_messages");
                assert!(db.create_table);
            }
            other => panic!("Expected database config, got: {:?}", other),
        }
    }

    #[test]
    fn test_system_v_requires_max_message_size() {
        let entry = QueueEntry::for_backend(BackendKind::SystemV);
        assert!(matches!(
            entry.resolve("ipc", &Defaults::default()),
            Err(ConfigurationError::Missing { .. })
        ));
    }

    #[test]
    fn test_sqs_accepts_url_as_queue_url() {
        let entry = QueueEntry {
            region: Some("eu-west-1".to_string()),
            url: Some("https://sqs.eu-west-1.amazonaws.com/1/jobs".to_string()),
            ..QueueEntry::for_backend(BackendKind::Sqs)
        };

        match entry.resolve("jobs", &Defaults::default()).unwrap() {
            BackendConfig::Sqs(sqs) => {
                assert_eq!(sqs.queue_url, "https://sqs.eu-west-1.amazonaws.com/1/jobs")
            }
            other => panic!("Expected sqs config, got: {:?}", other),
        }
    }

    #[test]
    fn test_sqs_debug_redacts_secret() {
        let config = SqsConfig {
            region: "us-east-1".to_string(),
            queue_url: "https://example/q".to_string(),
            endpoint: None,
            access_key_id: Some("AKID".to_string()),
            secret_access_key: Some("very-secret".to_string()),
        };

        let debug = format!("{:?}", config);
        assert!(!debug.contains("very-secret"));
        assert!(debug.contains("<redacted>"));
    }
}

// ============================================================================
// Fingerprint Tests
// ============================================================================

#[test]
fn test_equal_configs_share_fingerprint() {
    let a = BackendConfig::Filesystem(FilesystemConfig {
        path: PathBuf::from("/tmp/a"),
    });
    let b = BackendConfig::Filesystem(FilesystemConfig {
        path: PathBuf::from("/tmp/a"),
    });
    let c = BackendConfig::Filesystem(FilesystemConfig {
        path: PathBuf::from("/tmp/c"),
    });

    assert_eq!(a.fingerprint(), b.fingerprint());
    assert_ne!(a.fingerprint(), c.fingerprint());
    assert_eq!(a.fingerprint().as_str().len(), 64);
}

#[test]
fn test_fingerprint_distinguishes_backends() {
    let memory = BackendConfig::Memory(MemoryConfig::default());
    let file = BackendConfig::Filesystem(FilesystemConfig::default());
    assert_ne!(memory.fingerprint(), file.fingerprint());
}

// ============================================================================
// Validation and Loading Tests
// ============================================================================

#[test]
fn test_validate_rejects_bad_queue_name() {
    let settings = QueueSettings::new().with_queue("bad/name", QueueEntry::default());
    assert!(matches!(
        settings.validate(),
        Err(ConfigurationError::Invalid { .. })
    ));
}

#[test]
fn test_validate_rejects_negative_default_lease() {
    let mut settings = QueueSettings::new();
    settings.defaults.lease_seconds = -5;
    assert!(settings.validate().is_err());
}

#[test]
fn test_validate_rejects_oversized_default_lease() {
    let mut settings = QueueSettings::new();
    for seconds in [MAX_LEASE_SECONDS + 1, i64::MAX] {
        settings.defaults.lease_seconds = seconds;
        assert!(matches!(
            settings.validate(),
            Err(ConfigurationError::Invalid { .. })
        ));
        assert!(settings.defaults.lease().is_err());
    }

    settings.defaults.lease_seconds = MAX_LEASE_SECONDS;
    assert!(settings.validate().is_ok());
    assert_eq!(
        settings.defaults.lease().unwrap(),
        Duration::seconds(MAX_LEASE_SECONDS)
    );
}

#[test]
#[serial]
fn test_load_from_yaml_file() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(
        file,
        "defaults:\n  lease_seconds: 60\nqueues:\n  jobs:\n    backend: memory\n    max_queue_size: 3\n"
    )
    .unwrap();

    let settings = QueueSettings::load(Some(file.path())).unwrap();

    assert_eq!(settings.defaults.lease_seconds, 60);
    assert_eq!(
        settings.resolve(&queue("jobs")).unwrap(),
        BackendConfig::Memory(MemoryConfig { max_queue_size: 3 })
    );
}

#[test]
#[serial]
fn test_load_missing_file_fails() {
    let result = QueueSettings::load(Some(Path::new("/nonexistent/lease-queue.yaml")));
    assert!(matches!(result, Err(ConfigurationError::Parsing { .. })));
}

#[test]
#[serial]
fn test_environment_overrides_backend() {
    std::env::set_var("LEASE_QUEUE__QUEUES__ENVJOBS__BACKEND", "memory");

    let settings = QueueSettings::load(None);
    std::env::remove_var("LEASE_QUEUE__QUEUES__ENVJOBS__BACKEND");

    let settings = settings.unwrap();
    assert_eq!(
        settings.resolve(&queue("envjobs")).unwrap().kind(),
        BackendKind::Memory
    );
}
