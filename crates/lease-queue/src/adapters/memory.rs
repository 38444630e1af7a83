//! In-process queue adapter.
//!
//! All queues live in one map inside the adapter instance, behind a single
//! mutex held for the duration of each operation. Messages vanish with the
//! process; the front door caches adapters so every caller with the same
//! configuration sees the same map.

use crate::adapter::QueueAdapter;
use crate::config::{BackendKind, MemoryConfig};
use crate::error::QueueError;
use crate::message::{validate_lease, Envelope, MessageId, QueueName, StoredEnvelope, Timestamp};
use async_trait::async_trait;
use chrono::Duration;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

// ============================================================================
// Internal Storage Structures
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseState {
    Active,
    InFlight { expires_at: Timestamp },
}

/// A message stored in the queue with its lease state
struct StoredMessage {
    message_id: MessageId,
    state: LeaseState,
    body: Vec<u8>,
}

/// Messages for one queue in insertion order
#[derive(Default)]
struct InMemoryQueue {
    messages: VecDeque<StoredMessage>,
}

impl InMemoryQueue {
    /// Revert every lease that ran out before `now`; returns the count
    fn reclaim(&mut self, now: Timestamp) -> usize {
        let mut reclaimed = 0;
        for message in self.messages.iter_mut() {
            if let LeaseState::InFlight { expires_at } = message.state {
                if expires_at < now {
                    message.state = LeaseState::Active;
                    reclaimed += 1;
                }
            }
        }
        reclaimed
    }
}

// ============================================================================
// MemoryAdapter
// ============================================================================

/// In-process adapter
pub struct MemoryAdapter {
    queues: Mutex<HashMap<QueueName, InMemoryQueue>>,
    config: MemoryConfig,
}

impl MemoryAdapter {
    pub fn new(config: MemoryConfig) -> Self {
        tracing::info!(
            max_queue_size = config.max_queue_size,
            "Created in-memory queue adapter"
        );
        Self {
            queues: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Number of messages held for a queue, leased ones included
    pub fn len(&self, queue: &QueueName) -> Result<usize, QueueError> {
        let queues = self.lock("len")?;
        Ok(queues.get(queue).map(|q| q.messages.len()).unwrap_or(0))
    }

    pub fn is_empty(&self, queue: &QueueName) -> Result<bool, QueueError> {
        Ok(self.len(queue)? == 0)
    }

    fn lock(
        &self,
        operation: &'static str,
    ) -> Result<MutexGuard<'_, HashMap<QueueName, InMemoryQueue>>, QueueError> {
        self.queues
            .lock()
            .map_err(|e| QueueError::storage(BackendKind::Memory, operation, e))
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

#[async_trait]
impl QueueAdapter for MemoryAdapter {
    async fn push(&self, queue: &QueueName, envelope: &Envelope) -> Result<MessageId, QueueError> {
        let message_id = MessageId::new();
        let body = StoredEnvelope::from_envelope(envelope, Some(&message_id)).to_bytes()?;

        let mut queues = self.lock("push")?;
        let entry = queues.entry(queue.clone()).or_default();

        if entry.messages.len() >= self.config.max_queue_size {
            return Err(QueueError::QueueFull {
                queue_name: queue.to_string(),
                capacity: self.config.max_queue_size,
            });
        }

        entry.messages.push_back(StoredMessage {
            message_id: message_id.clone(),
            state: LeaseState::Active,
            body,
        });

        tracing::debug!(queue = %queue, message_id = %message_id, "Pushed message");
        Ok(message_id)
    }

    async fn pull(
        &self,
        queue: &QueueName,
        lease: Duration,
    ) -> Result<Option<Envelope>, QueueError> {
        validate_lease(lease)?;

        let mut queues = self.lock("pull")?;
        let Some(entry) = queues.get_mut(queue) else {
            return Ok(None);
        };

        let now = Timestamp::now();
        let reclaimed = entry.reclaim(now);
        if reclaimed > 0 {
            tracing::warn!(queue = %queue, reclaimed, "Reclaimed expired leases");
        }

        let Some(message) = entry
            .messages
            .iter_mut()
            .find(|m| m.state == LeaseState::Active)
        else {
            return Ok(None);
        };

        let expires_at = now.plus(lease)?;
        message.state = LeaseState::InFlight { expires_at };

        let envelope = StoredEnvelope::from_slice(&message.body, message.message_id.as_str())?
            .into_envelope(Some(message.message_id.clone()))
            .with_lease_expiry(expires_at);

        tracing::debug!(
            queue = %queue,
            message_id = %message.message_id,
            lease_expiry = %expires_at,
            "Leased message"
        );
        Ok(Some(envelope))
    }

    async fn delete(&self, queue: &QueueName, message_id: &MessageId) -> Result<bool, QueueError> {
        let mut queues = self.lock("delete")?;
        let Some(entry) = queues.get_mut(queue) else {
            return Ok(false);
        };

        let reclaimed = entry.reclaim(Timestamp::now());
        if reclaimed > 0 {
            tracing::warn!(queue = %queue, reclaimed, "Reclaimed expired leases");
        }

        let position = entry.messages.iter().position(|m| {
            &m.message_id == message_id && matches!(m.state, LeaseState::InFlight { .. })
        });

        match position {
            Some(index) => {
                entry.messages.remove(index);
                tracing::debug!(queue = %queue, message_id = %message_id, "Deleted message");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::Memory
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
