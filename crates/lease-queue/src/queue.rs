//! The queue front door.
//!
//! [`MessageQueue`] maps queue names to adapters. Each queue's record is
//! resolved to a [`BackendConfig`], whose fingerprint keys a cache of adapter
//! instances: queues with identical configuration share one adapter, and an
//! adapter is built at most once per configuration for the lifetime of the
//! `MessageQueue`. The in-memory backend depends on this, since its messages
//! live inside the adapter instance.
//!
//! # Example
//!
//! ```no_run
//! use lease_queue::{MessageQueue, QueueName, QueueSettings};
//! use chrono::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = MessageQueue::new(QueueSettings::load(None)?)?;
//! let jobs = QueueName::new("jobs")?;
//!
//! queue.send(&jobs, &serde_json::json!({"task": "reindex"}), "worker-1").await?;
//!
//! if let Some(envelope) = queue.receive(&jobs, Duration::seconds(60)).await? {
//!     let task: serde_json::Value = queue.decode(&envelope)?;
//!     println!("{}", task);
//!     if let Some(id) = &envelope.message_id {
//!         queue.delete(&jobs, id).await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use crate::adapter::QueueAdapter;
use crate::codec::{self, JsonCodec, PayloadCodec};
use crate::config::{BackendConfig, Fingerprint, QueueSettings};
use crate::error::QueueError;
use crate::message::{Envelope, MessageId, QueueName};
use crate::registry::AdapterRegistry;
use bytes::Bytes;
use chrono::Duration;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

/// Cache slot for one configuration, filled by the first caller to need it
type AdapterSlot = Arc<OnceCell<Arc<dyn QueueAdapter>>>;

/// Queue front door: configuration lookup, adapter cache and operations
pub struct MessageQueue {
    settings: QueueSettings,
    registry: AdapterRegistry,
    codec: Arc<dyn PayloadCodec>,
    adapters: Mutex<HashMap<Fingerprint, AdapterSlot>>,
}

impl MessageQueue {
    /// Create a front door over validated settings with the built-in backends
    pub fn new(settings: QueueSettings) -> Result<Self, QueueError> {
        settings.validate()?;
        Ok(Self {
            settings,
            registry: AdapterRegistry::with_defaults(),
            codec: Arc::new(JsonCodec),
            adapters: Mutex::new(HashMap::new()),
        })
    }

    /// Replace the adapter registry
    pub fn with_registry(mut self, registry: AdapterRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the payload codec
    pub fn with_codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Resolve the backend configuration for a queue
    pub fn resolve(&self, queue: &QueueName) -> Result<BackendConfig, QueueError> {
        Ok(self.settings.resolve(queue)?)
    }

    /// Adapter serving a queue, built on first use
    pub async fn adapter_for(&self, queue: &QueueName) -> Result<Arc<dyn QueueAdapter>, QueueError> {
        let config = self.resolve(queue)?;
        let fingerprint = config.fingerprint();

        // The map lock only covers the slot lookup; construction runs under
        // the slot's own cell so other configurations are never blocked
        let slot = {
            let mut adapters = self.adapters.lock().await;
            Arc::clone(adapters.entry(fingerprint.clone()).or_default())
        };

        let adapter = slot
            .get_or_try_init(|| async {
                let kind = config.kind();
                let adapter = self.registry.create(config).await?;
                tracing::info!(
                    queue = %queue,
                    backend = %kind,
                    fingerprint = %fingerprint,
                    "Created queue adapter"
                );
                Ok::<_, QueueError>(adapter)
            })
            .await?;

        Ok(Arc::clone(adapter))
    }

    /// Encode a payload with the codec and push it
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        queue: &QueueName,
        payload: &T,
        producer_id: &str,
    ) -> Result<MessageId, QueueError> {
        let bytes = codec::encode(self.codec.as_ref(), payload)?;
        self.send_bytes(queue, bytes, producer_id).await
    }

    /// Push an already encoded payload
    pub async fn send_bytes(
        &self,
        queue: &QueueName,
        payload: Bytes,
        producer_id: &str,
    ) -> Result<MessageId, QueueError> {
        let adapter = self.adapter_for(queue).await?;
        let envelope = Envelope::new(payload).with_producer_id(producer_id);
        adapter.push(queue, &envelope).await
    }

    /// Lease the next message of a queue
    pub async fn receive(
        &self,
        queue: &QueueName,
        lease: Duration,
    ) -> Result<Option<Envelope>, QueueError> {
        let adapter = self.adapter_for(queue).await?;
        adapter.pull(queue, lease).await
    }

    /// Lease the next message for the configured default lease
    pub async fn receive_with_default_lease(
        &self,
        queue: &QueueName,
    ) -> Result<Option<Envelope>, QueueError> {
        let lease = self.settings.defaults.lease()?;
        self.receive(queue, lease).await
    }

    /// Delete a leased message
    pub async fn delete(&self, queue: &QueueName, message_id: &MessageId) -> Result<bool, QueueError> {
        let adapter = self.adapter_for(queue).await?;
        adapter.delete(queue, message_id).await
    }

    /// Decode an envelope's payload with this instance's codec
    pub fn decode<T: DeserializeOwned>(&self, envelope: &Envelope) -> Result<T, QueueError> {
        Ok(codec::decode(self.codec.as_ref(), &envelope.payload)?)
    }

    /// Number of distinct adapters built so far
    pub async fn cached_adapters(&self) -> usize {
        self.adapters
            .lock()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("configured_queues", &self.settings.queues.len())
            .field("codec", &self.codec.name())
            .finish()
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
