//! The backend adapter contract.
//!
//! Every backend implements the same lease protocol: a pulled message is not
//! removed but leased to the puller until `now + lease`. If it is not deleted
//! before the lease runs out, the next reclamation pass on that queue makes it
//! available again. Reclamation is lazy and runs at the start of `pull` and
//! `delete`; nothing runs on a timer.
//!
//! Expected outcomes are values: an empty queue (or a lost claim race) is
//! `Ok(None)` from `pull`, and a missing or expired message is `Ok(false)`
//! from `delete`.

use crate::config::BackendKind;
use crate::error::QueueError;
use crate::message::{Envelope, MessageId, QueueName};
use async_trait::async_trait;
use chrono::Duration;

/// Push/pull/delete over one storage medium
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    /// Append a message in the active state and return its assigned id
    async fn push(&self, queue: &QueueName, envelope: &Envelope) -> Result<MessageId, QueueError>;

    /// Lease the earliest active message for `lease`
    ///
    /// The returned copy carries the adapter's `message_id` and, on backends
    /// with leases, the `lease_expiry`.
    async fn pull(&self, queue: &QueueName, lease: Duration)
        -> Result<Option<Envelope>, QueueError>;

    /// Remove a leased message whose lease has not yet expired
    async fn delete(&self, queue: &QueueName, message_id: &MessageId) -> Result<bool, QueueError>;

    /// Backend this adapter talks to
    fn backend_kind(&self) -> BackendKind;

    /// Check if pulled messages are leased rather than removed
    fn supports_leases(&self) -> bool {
        self.backend_kind().supports_leases()
    }
}
