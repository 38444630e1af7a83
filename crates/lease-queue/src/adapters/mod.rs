//! Queue adapter implementations.
//!
//! This module contains concrete implementations of the `QueueAdapter` trait
//! for each storage backend.

pub mod database;
pub mod filesystem;
pub mod memory;
pub mod sqs;
#[cfg(target_os = "linux")]
pub mod systemv;

pub use database::DatabaseAdapter;
pub use filesystem::FilesystemAdapter;
pub use memory::MemoryAdapter;
pub use sqs::SqsAdapter;
#[cfg(target_os = "linux")]
pub use systemv::SystemVAdapter;
