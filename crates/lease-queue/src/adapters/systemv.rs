//! System V message queue adapter (Linux only).
//!
//! The kernel offers no visibility timeout: a receive removes the message in
//! one call. Pulled envelopes therefore carry no `lease_expiry`, and `delete`
//! succeeds unconditionally because there is nothing left to remove.
//!
//! Both send and receive use `IPC_NOWAIT`, so no call ever parks a runtime
//! thread.

use crate::adapter::QueueAdapter;
use crate::config::{BackendKind, SystemVConfig};
use crate::error::{ConfigurationError, QueueError};
use crate::message::{validate_lease, Envelope, MessageId, QueueName, StoredEnvelope};
use async_trait::async_trait;
use chrono::Duration;
use std::collections::HashMap;
use std::io;
use std::mem::size_of;
use std::sync::Mutex;

/// Message type used for every send; receives accept any type
const MESSAGE_TYPE: libc::c_long = 1;

/// Kernel-IPC queue adapter
pub struct SystemVAdapter {
    config: SystemVConfig,
    /// Kernel queue ids resolved so far, by queue name
    queue_ids: Mutex<HashMap<QueueName, libc::c_int>>,
}

impl SystemVAdapter {
    pub fn new(config: SystemVConfig) -> Result<Self, QueueError> {
        if config.max_message_size == 0 {
            return Err(ConfigurationError::Invalid {
                message: "max_message_size must be greater than zero".to_string(),
            }
            .into());
        }

        tracing::info!(
            max_message_size = config.max_message_size,
            key = ?config.key,
            "Created System V queue adapter"
        );
        Ok(Self {
            config,
            queue_ids: Mutex::new(HashMap::new()),
        })
    }

    /// Kernel key for a queue: the pinned key, the numeric name, or a hash
    pub fn key_for(&self, queue: &QueueName) -> libc::key_t {
        if let Some(key) = self.config.key {
            return key;
        }
        queue
            .as_str()
            .parse::<libc::key_t>()
            .unwrap_or_else(|_| fnv1a(queue.as_str()) as libc::key_t)
    }

    /// Remove the kernel queue and any messages left in it
    ///
    /// Returns `false` when no such queue exists.
    pub fn remove_queue(&self, queue: &QueueName) -> Result<bool, QueueError> {
        self.forget(queue);

        // SAFETY: msgget takes plain integers and touches no caller memory.
        let id = unsafe { libc::msgget(self.key_for(queue), 0) };
        if id < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::ENOENT) => Ok(false),
                _ => Err(errno_error("remove_queue", err)),
            };
        }

        // SAFETY: IPC_RMID ignores the buffer argument, so null is allowed.
        let rc = unsafe { libc::msgctl(id, libc::IPC_RMID, std::ptr::null_mut()) };
        if rc < 0 {
            return Err(errno_error("remove_queue", io::Error::last_os_error()));
        }

        tracing::info!(queue = %queue, "Removed System V queue");
        Ok(true)
    }

    fn queue_id(&self, queue: &QueueName, operation: &'static str) -> Result<libc::c_int, QueueError> {
        let mut ids = self
            .queue_ids
            .lock()
            .map_err(|e| QueueError::storage(BackendKind::SystemV, operation, e))?;

        if let Some(id) = ids.get(queue) {
            return Ok(*id);
        }

        let flags = libc::IPC_CREAT | (self.config.permissions & 0o777) as libc::c_int;
        // SAFETY: msgget takes plain integers and touches no caller memory.
        let id = unsafe { libc::msgget(self.key_for(queue), flags) };
        if id < 0 {
            return Err(errno_error(operation, io::Error::last_os_error()));
        }

        ids.insert(queue.clone(), id);
        Ok(id)
    }

    /// Drop a cached id so the next call looks the queue up again
    fn forget(&self, queue: &QueueName) {
        if let Ok(mut ids) = self.queue_ids.lock() {
            ids.remove(queue);
        }
    }

    /// Map a failed send or receive, dropping ids of queues removed underneath us
    fn call_failed(&self, queue: &QueueName, operation: &'static str, err: io::Error) -> QueueError {
        if matches!(err.raw_os_error(), Some(libc::EIDRM) | Some(libc::EINVAL)) {
            self.forget(queue);
        }
        errno_error(operation, err)
    }
}

#[async_trait]
impl QueueAdapter for SystemVAdapter {
    async fn push(&self, queue: &QueueName, envelope: &Envelope) -> Result<MessageId, QueueError> {
        let message_id = MessageId::new();
        let body = StoredEnvelope::from_envelope(envelope, Some(&message_id)).to_bytes()?;

        if body.len() > self.config.max_message_size {
            return Err(QueueError::MessageTooLarge {
                size: body.len(),
                max_size: self.config.max_message_size,
            });
        }

        let id = self.queue_id(queue, "push")?;
        let mut buffer = MessageBuffer::new(body.len());
        buffer.text_mut().copy_from_slice(&body);

        // SAFETY: the buffer starts with a c_long message type followed by at
        // least `body.len()` bytes of text, which is the layout msgsnd reads.
        let rc = unsafe { libc::msgsnd(id, buffer.as_ptr(), body.len(), libc::IPC_NOWAIT) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Err(QueueError::QueueFull {
                    queue_name: queue.to_string(),
                    capacity: queue_bytes(id),
                });
            }
            return Err(self.call_failed(queue, "push", err));
        }

        tracing::debug!(queue = %queue, message_id = %message_id, "Pushed message");
        Ok(message_id)
    }

    async fn pull(
        &self,
        queue: &QueueName,
        lease: Duration,
    ) -> Result<Option<Envelope>, QueueError> {
        validate_lease(lease)?;

        let id = self.queue_id(queue, "pull")?;
        let mut buffer = MessageBuffer::new(self.config.max_message_size);

        // SAFETY: the buffer holds a c_long followed by `max_message_size`
        // bytes, so the kernel never writes past its end.
        let received = unsafe {
            libc::msgrcv(
                id,
                buffer.as_mut_ptr(),
                self.config.max_message_size,
                0,
                libc::IPC_NOWAIT,
            )
        };
        if received < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOMSG) {
                return Ok(None);
            }
            return Err(self.call_failed(queue, "pull", err));
        }

        let text = &buffer.text()[..received as usize];
        let envelope = StoredEnvelope::from_slice(text, &format!("system_v:{}", queue))?
            .into_envelope(None);

        tracing::debug!(queue = %queue, message_id = ?envelope.message_id, "Received message");
        Ok(Some(envelope))
    }

    async fn delete(&self, _queue: &QueueName, _message_id: &MessageId) -> Result<bool, QueueError> {
        // The receive already removed it
        Ok(true)
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::SystemV
    }
}

/// `struct msgbuf { long mtype; char mtext[]; }` with c_long alignment
struct MessageBuffer {
    words: Vec<libc::c_long>,
    text_len: usize,
}

impl MessageBuffer {
    fn new(text_len: usize) -> Self {
        let word = size_of::<libc::c_long>();
        let mut words = vec![0; 1 + text_len.div_ceil(word)];
        words[0] = MESSAGE_TYPE;
        Self { words, text_len }
    }

    fn text(&self) -> &[u8] {
        // SAFETY: `words` has room for one c_long plus `text_len` bytes and
        // any byte pattern is a valid u8.
        unsafe {
            std::slice::from_raw_parts(
                self.words.as_ptr().add(1) as *const u8,
                self.text_len,
            )
        }
    }

    fn text_mut(&mut self) -> &mut [u8] {
        // SAFETY: as for `text`, with exclusive access through &mut self.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.words.as_mut_ptr().add(1) as *mut u8,
                self.text_len,
            )
        }
    }

    fn as_ptr(&self) -> *const libc::c_void {
        self.words.as_ptr() as *const libc::c_void
    }

    fn as_mut_ptr(&mut self) -> *mut libc::c_void {
        self.words.as_mut_ptr() as *mut libc::c_void
    }
}

/// Byte capacity the kernel reports for a queue, 0 if it cannot be read
fn queue_bytes(id: libc::c_int) -> usize {
    // SAFETY: msqid_ds is plain integers, so all-zero is a valid value.
    let mut stat: libc::msqid_ds = unsafe { std::mem::zeroed() };
    // SAFETY: `stat` is a valid, writable msqid_ds for IPC_STAT to fill.
    let rc = unsafe { libc::msgctl(id, libc::IPC_STAT, &mut stat) };
    if rc < 0 {
        return 0;
    }
    stat.msg_qbytes as usize
}

/// 32-bit FNV-1a hash of a queue name
fn fnv1a(name: &str) -> u32 {
    name.bytes().fold(0x811c_9dc5_u32, |hash, byte| {
        (hash ^ byte as u32).wrapping_mul(0x0100_0193)
    })
}

fn errno_error(operation: &'static str, err: io::Error) -> QueueError {
    QueueError::storage(BackendKind::SystemV, operation, err)
}

#[cfg(test)]
#[path = "systemv_tests.rs"]
mod tests;
