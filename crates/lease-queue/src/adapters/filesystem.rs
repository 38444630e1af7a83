//! # Filesystem Queue Adapter
//!
//! One file per message in a single directory, shared by every queue that is
//! configured with the same path. The lease state lives in the file name:
//!
//! ```text
//! <queue>-YYYY-MM-DD-HH-mm-ss-<32 hex>.message                      active
//! <queue>-YYYY-MM-DD-HH-mm-ss-<32 hex>.inflight.YYYY-MM-DD-HH-mm-ss  leased until
//! ```
//!
//! Timestamps are UTC with one-second resolution. The basename (everything
//! before the first `.`) is the message id. Every state change is a single
//! `rename`, which the filesystem performs atomically, so several processes
//! can share a directory: whoever loses a rename sees `NotFound` and moves on.

use crate::adapter::QueueAdapter;
use crate::config::{BackendKind, FilesystemConfig};
use crate::error::{ConfigurationError, QueueError};
use crate::message::{validate_lease, Envelope, MessageId, QueueName, StoredEnvelope, Timestamp};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use regex::Regex;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const STAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";
const ACTIVE_SUFFIX: &str = ".message";
const INFLIGHT_MARKER: &str = ".inflight.";

/// Filesystem-based queue adapter
///
/// # Examples
///
/// ```no_run
/// use lease_queue::adapters::FilesystemAdapter;
/// use lease_queue::config::FilesystemConfig;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let adapter = FilesystemAdapter::new(FilesystemConfig {
///     path: "./data/queues".into(),
/// })
/// .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct FilesystemAdapter {
    base_path: PathBuf,
    /// Matches the part of an active file name after `<queue>-`
    active_pattern: Regex,
    /// Matches the part of an in-flight file name after `<queue>-`; captures the expiry
    inflight_pattern: Regex,
}

impl FilesystemAdapter {
    /// Create the adapter, creating the queue directory if needed
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::PathNotCreatable`] if the directory
    /// cannot be created.
    pub async fn new(config: FilesystemConfig) -> Result<Self, QueueError> {
        fs::create_dir_all(&config.path)
            .await
            .map_err(|e| ConfigurationError::PathNotCreatable {
                path: config.path.display().to_string(),
                message: e.to_string(),
            })?;

        let active_pattern = compile(r"^\d{4}-\d{2}-\d{2}-\d{2}-\d{2}-\d{2}-[0-9a-f]{32}\.message$")?;
        let inflight_pattern = compile(
            r"^\d{4}-\d{2}-\d{2}-\d{2}-\d{2}-\d{2}-[0-9a-f]{32}\.inflight\.(\d{4}-\d{2}-\d{2}-\d{2}-\d{2}-\d{2})$",
        )?;

        tracing::info!(path = %config.path.display(), "Created filesystem queue adapter");

        Ok(Self {
            base_path: config.path,
            active_pattern,
            inflight_pattern,
        })
    }

    /// Directory holding the message files
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Names of this queue's files matching `pattern` after the queue prefix
    async fn list(
        &self,
        queue: &QueueName,
        pattern: &Regex,
        operation: &'static str,
    ) -> Result<Vec<String>, QueueError> {
        let prefix = format!("{}-", queue);
        let mut names = Vec::new();

        let mut entries = fs::read_dir(&self.base_path)
            .await
            .map_err(|e| io_error(operation, &self.base_path, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(operation, &self.base_path, e))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let matches = name
                .strip_prefix(&prefix)
                .map(|rest| pattern.is_match(rest))
                .unwrap_or(false);
            if matches {
                names.push(name);
            }
        }

        Ok(names)
    }

    /// Rename every expired in-flight file of the queue back to active
    async fn reclaim(
        &self,
        queue: &QueueName,
        operation: &'static str,
    ) -> Result<usize, QueueError> {
        let now = Utc::now().timestamp();
        let mut reclaimed = 0;

        for name in self.list(queue, &self.inflight_pattern, operation).await? {
            let Some(expiry) = self.inflight_expiry(queue, &name) else {
                continue;
            };
            if now <= expiry.timestamp() {
                continue;
            }

            let Some((base, _)) = name.split_once(INFLIGHT_MARKER) else {
                continue;
            };
            let from = self.base_path.join(&name);
            let to = self.base_path.join(format!("{}{}", base, ACTIVE_SUFFIX));

            match fs::rename(&from, &to).await {
                Ok(()) => reclaimed += 1,
                // Another process reclaimed or deleted it first
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(operation, &from, e)),
            }
        }

        if reclaimed > 0 {
            tracing::warn!(queue = %queue, reclaimed, "Reclaimed expired leases");
        }
        Ok(reclaimed)
    }

    fn inflight_expiry(&self, queue: &QueueName, name: &str) -> Option<DateTime<Utc>> {
        let rest = name.strip_prefix(&format!("{}-", queue))?;
        let stamp = self.inflight_pattern.captures(rest)?.get(1)?.as_str();
        NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// Check that a message id is a basename belonging to this queue
    fn owns_id(&self, queue: &QueueName, message_id: &MessageId) -> bool {
        let id = message_id.as_str();
        id.starts_with(&format!("{}-", queue))
            && !id.contains(|c: char| matches!(c, '/' | '\\' | '.'))
    }
}

/// Write `body` to `temp_path` and rename it into place, removing the
/// temporary file again if either step fails
async fn write_message(
    temp_path: &Path,
    final_path: &Path,
    body: &[u8],
) -> Result<(), QueueError> {
    let result = write_then_rename(temp_path, final_path, body).await;
    if result.is_err() {
        if let Err(e) = fs::remove_file(temp_path).await {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(
                    file = %temp_path.display(),
                    error = %e,
                    "Failed to remove temporary message file"
                );
            }
        }
    }
    result
}

async fn write_then_rename(
    temp_path: &Path,
    final_path: &Path,
    body: &[u8],
) -> Result<(), QueueError> {
    let mut file = fs::File::create(temp_path)
        .await
        .map_err(|e| io_error("push", temp_path, e))?;
    file.write_all(body)
        .await
        .map_err(|e| io_error("push", temp_path, e))?;
    file.flush()
        .await
        .map_err(|e| io_error("push", temp_path, e))?;
    drop(file);

    fs::rename(temp_path, final_path)
        .await
        .map_err(|e| io_error("push", final_path, e))
}

#[async_trait]
impl QueueAdapter for FilesystemAdapter {
    async fn push(&self, queue: &QueueName, envelope: &Envelope) -> Result<MessageId, QueueError> {
        let base = format!(
            "{}-{}-{}",
            queue,
            Utc::now().format(STAMP_FORMAT),
            uuid::Uuid::new_v4().simple()
        );
        let message_id: MessageId = base.parse()?;
        let body = StoredEnvelope::from_envelope(envelope, Some(&message_id)).to_bytes()?;

        let temp_path = self.base_path.join(format!("{}.tmp", base));
        let final_path = self.base_path.join(format!("{}{}", base, ACTIVE_SUFFIX));

        // Write to temporary file first so pullers never see a partial message
        write_message(&temp_path, &final_path, &body).await?;

        tracing::debug!(queue = %queue, message_id = %message_id, "Pushed message");
        Ok(message_id)
    }

    async fn pull(
        &self,
        queue: &QueueName,
        lease: Duration,
    ) -> Result<Option<Envelope>, QueueError> {
        validate_lease(lease)?;
        self.reclaim(queue, "pull").await?;

        let mut candidates = self.list(queue, &self.active_pattern, "pull").await?;
        candidates.sort();

        // File names only carry whole seconds, so round the lease up
        let lease_seconds = lease.num_milliseconds().saturating_add(999) / 1000;
        let expiry = Timestamp::now().plus(Duration::seconds(lease_seconds))?;
        let expiry_stamp = expiry.as_datetime().format(STAMP_FORMAT).to_string();

        for name in candidates {
            let Some(base) = name.strip_suffix(ACTIVE_SUFFIX) else {
                continue;
            };
            let from = self.base_path.join(&name);
            let to = self
                .base_path
                .join(format!("{}{}{}", base, INFLIGHT_MARKER, expiry_stamp));

            match fs::rename(&from, &to).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    tracing::debug!(queue = %queue, file = %name, "Lost claim race, trying next");
                    continue;
                }
                Err(e) => return Err(io_error("pull", &from, e)),
            }

            let data = match fs::read(&to).await {
                Ok(data) => data,
                // Already reclaimed and claimed elsewhere; only possible with a zero lease
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error("pull", &to, e)),
            };

            let message_id: MessageId = base.parse()?;
            let envelope = StoredEnvelope::from_slice(&data, &to.display().to_string())?
                .into_envelope(None);
            let envelope = Envelope {
                message_id: Some(message_id),
                ..envelope
            }
            .with_lease_expiry(expiry);

            tracing::debug!(queue = %queue, file = %name, lease_expiry = %expiry_stamp, "Leased message");
            return Ok(Some(envelope));
        }

        Ok(None)
    }

    async fn delete(&self, queue: &QueueName, message_id: &MessageId) -> Result<bool, QueueError> {
        if !self.owns_id(queue, message_id) {
            tracing::debug!(queue = %queue, message_id = %message_id, "Ignoring foreign message id");
            return Ok(false);
        }

        self.reclaim(queue, "delete").await?;

        let prefix = format!("{}{}", message_id, INFLIGHT_MARKER);
        let leased = self
            .list(queue, &self.inflight_pattern, "delete")
            .await?
            .into_iter()
            .find(|name| name.starts_with(&prefix));

        let Some(name) = leased else {
            return Ok(false);
        };

        let path = self.base_path.join(&name);
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(queue = %queue, message_id = %message_id, "Deleted message");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error("delete", &path, e)),
        }
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::Filesystem
    }
}

fn compile(pattern: &str) -> Result<Regex, ConfigurationError> {
    Regex::new(pattern).map_err(|e| ConfigurationError::Invalid {
        message: format!("Invalid file name pattern: {}", e),
    })
}

fn io_error(operation: &'static str, path: &Path, error: std::io::Error) -> QueueError {
    QueueError::storage(
        BackendKind::Filesystem,
        operation,
        format!("{}: {}", path.display(), error),
    )
}

#[cfg(test)]
#[path = "filesystem_tests.rs"]
mod tests;
