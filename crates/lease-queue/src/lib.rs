//! # Lease Queue
//!
//! One push/pull/delete contract over interchangeable storage backends, with
//! lease-based visibility timeouts.
//!
//! A pulled message is not removed: it is leased to the puller until
//! `now + lease`. Deleting it within the lease removes it for good; otherwise
//! the next access to the queue returns it to circulation. Every backend
//! implements this with the atomic primitive it has:
//!
//! - in-process memory, behind one mutex
//! - files in a directory, via atomic `rename`
//! - an SQL table, via a conditional `UPDATE`
//! - System V kernel queues (Linux), which have no leases at all
//! - Amazon SQS, where the service owns the lease
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all queue operations
//! - [`message`] - Envelope and domain identifiers
//! - [`config`] - Backend kinds, per-queue records and settings loading
//! - [`codec`] - Payload encoding
//! - [`adapter`] - The adapter contract
//! - [`adapters`] - One adapter per backend
//! - [`registry`] - Backend kind to constructor mapping
//! - [`queue`] - The front door with its adapter cache

pub mod adapter;
pub mod adapters;
pub mod codec;
pub mod config;
pub mod error;
pub mod message;
pub mod queue;
pub mod registry;

// Re-export commonly used types at crate root for convenience
pub use adapter::QueueAdapter;
pub use codec::{JsonCodec, PayloadCodec};
pub use config::{BackendConfig, BackendKind, QueueEntry, QueueSettings};
pub use error::{ConfigurationError, QueueError, SerializationError, ValidationError};
pub use message::{Envelope, MessageId, QueueName, Timestamp};
pub use queue::MessageQueue;
pub use registry::AdapterRegistry;
