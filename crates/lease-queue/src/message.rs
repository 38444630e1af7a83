//! Message envelope and the core domain identifiers.

use crate::error::{SerializationError, ValidationError};
use bytes::Bytes;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated queue name with length and character restrictions
///
/// Queue names end up inside file names and SQL parameters, so only ASCII
/// alphanumerics, hyphens and underscores are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name with validation
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();

        if name.is_empty() || name.len() > 128 {
            return Err(ValidationError::OutOfRange {
                field: "queue_name".to_string(),
                message: "must be 1-128 characters".to_string(),
            });
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "only ASCII alphanumeric, hyphens, and underscores allowed".to_string(),
            });
        }

        if name.starts_with('-') || name.ends_with('-') || name.contains("--") {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "no leading/trailing hyphens or consecutive hyphens".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get queue name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for QueueName {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QueueName> for String {
    fn from(value: QueueName) -> Self {
        value.0
    }
}

/// Adapter-assigned message identifier
///
/// The format depends on the backend: a UUID, a file basename, a database row
/// id or an SQS receipt handle. It is the only token accepted by delete.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

impl From<i64> for MessageId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Create timestamp from milliseconds since the Unix epoch
    pub fn from_unix_millis(millis: i64) -> Option<Self> {
        Utc.timestamp_millis_opt(millis).single().map(Self)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Milliseconds since the Unix epoch
    pub fn unix_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Timestamp shifted forward by a duration
    ///
    /// Fails when the result falls outside the representable date range.
    pub fn plus(&self, duration: Duration) -> Result<Self, ValidationError> {
        self.0
            .checked_add_signed(duration)
            .map(Self)
            .ok_or_else(|| ValidationError::OutOfRange {
                field: "lease".to_string(),
                message: format!(
                    "{}s past {} is not a representable time",
                    duration.num_seconds(),
                    self
                ),
            })
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = s.parse::<DateTime<Utc>>()?;
        Ok(Self::from_datetime(dt))
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// The unit of transport through every backend
///
/// `message_id` is filled in by the adapter on push and returned with every
/// pull; `lease_expiry` is only set on a pulled copy from a backend that
/// leases messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub producer_id: String,
    pub payload: Bytes,
    pub message_id: Option<MessageId>,
    pub lease_expiry: Option<Timestamp>,
}

impl Envelope {
    /// Create new envelope around an encoded payload
    pub fn new(payload: Bytes) -> Self {
        Self {
            producer_id: String::new(),
            payload,
            message_id: None,
            lease_expiry: None,
        }
    }

    /// Set the caller-supplied producer identifier
    pub fn with_producer_id(mut self, producer_id: impl Into<String>) -> Self {
        self.producer_id = producer_id.into();
        self
    }

    /// Set the adapter-assigned message identifier
    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = Some(message_id);
        self
    }

    /// Set the lease expiry of a pulled copy
    pub fn with_lease_expiry(mut self, expiry: Timestamp) -> Self {
        self.lease_expiry = Some(expiry);
        self
    }

    /// Check whether the lease on this copy has run out
    ///
    /// Envelopes without a lease never expire.
    pub fn is_lease_expired(&self) -> bool {
        match self.lease_expiry {
            Some(expiry) => Timestamp::now() > expiry,
            None => false,
        }
    }
}

/// On-medium representation shared by every adapter that stores bytes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub producer_id: String,
    #[serde(with = "bytes_serde")]
    pub payload: Bytes,
}

impl StoredEnvelope {
    pub fn from_envelope(envelope: &Envelope, message_id: Option<&MessageId>) -> Self {
        Self {
            message_id: message_id.map(|id| id.as_str().to_string()),
            producer_id: envelope.producer_id.clone(),
            payload: envelope.payload.clone(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SerializationError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_slice(data: &[u8], location: &str) -> Result<Self, SerializationError> {
        serde_json::from_slice(data).map_err(|e| SerializationError::Corrupt {
            location: location.to_string(),
            message: e.to_string(),
        })
    }

    /// Rebuild the caller-facing envelope, preferring the stored message id
    pub fn into_envelope(self, fallback_id: Option<MessageId>) -> Envelope {
        let message_id = match self.message_id {
            Some(id) if !id.is_empty() => Some(MessageId(id)),
            _ => fallback_id,
        };

        Envelope {
            producer_id: self.producer_id,
            payload: self.payload,
            message_id,
            lease_expiry: None,
        }
    }
}

/// Custom serialization for Bytes
mod bytes_serde {
    use base64::{engine::general_purpose, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = general_purpose::STANDARD.encode(bytes);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

/// Longest lease any adapter accepts (one hundred years)
pub const MAX_LEASE_SECONDS: i64 = 100 * 365 * 24 * 60 * 60;

/// Validate a caller-supplied lease duration
pub(crate) fn validate_lease(lease: Duration) -> Result<(), ValidationError> {
    if lease < Duration::zero() {
        return Err(ValidationError::OutOfRange {
            field: "lease".to_string(),
            message: format!("must not be negative, got {}s", lease.num_seconds()),
        });
    }
    if lease.num_seconds() > MAX_LEASE_SECONDS {
        return Err(ValidationError::OutOfRange {
            field: "lease".to_string(),
            message: format!(
                "must not exceed {}s, got {}s",
                MAX_LEASE_SECONDS,
                lease.num_seconds()
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
