//! Amazon SQS adapter over the HTTP query API.
//!
//! SQS owns the lease: `pull` sets the receive's `VisibilityTimeout` to the
//! lease, and the receipt handle it returns becomes the message id. Deleting
//! with a handle whose visibility window has closed is rejected by the
//! service and reported as `false`.
//!
//! Requests are signed with AWS Signature V4 and sent with `reqwest`, so the
//! adapter can point at any compatible endpoint (LocalStack, a mock server).

use crate::adapter::QueueAdapter;
use crate::config::{BackendKind, SqsConfig};
use crate::error::{ConfigurationError, QueueError, SerializationError};
use crate::message::{validate_lease, Envelope, MessageId, QueueName, StoredEnvelope, Timestamp};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client as HttpClient;
use sha2::{Digest, Sha256};
use std::fmt;

const API_VERSION: &str = "2012-11-05";

/// Largest message body SQS accepts
const MAX_BODY_SIZE: usize = 256 * 1024;

/// Longest visibility timeout SQS accepts, in seconds
const MAX_VISIBILITY_TIMEOUT: i64 = 12 * 60 * 60;

// ============================================================================
// Error Types
// ============================================================================

/// Failures reported by SQS or the HTTP layer
#[derive(Debug, thiserror::Error)]
enum SqsError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("SQS service error: {0}")]
    Service(String),

    #[error("Invalid receipt handle: {0}")]
    InvalidReceipt(String),

    #[error("Malformed SQS response: {0}")]
    Response(String),
}

impl SqsError {
    fn into_queue_error(self, operation: &'static str) -> QueueError {
        match self {
            Self::Authentication(message) => QueueError::AuthenticationFailed { message },
            Self::Network(message) => QueueError::ConnectionFailed { message },
            Self::Response(message) => SerializationError::Corrupt {
                location: format!("sqs {} response", operation),
                message,
            }
            .into(),
            other => QueueError::storage(BackendKind::Sqs, operation, other),
        }
    }
}

// ============================================================================
// AWS Signature V4 Signing
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// AWS Signature Version 4 signer for request authentication
///
/// 1. Create canonical request (method, URI, query, headers, payload)
/// 2. Create string to sign (algorithm, timestamp, scope, request hash)
/// 3. Derive signing key (4-level HMAC chain)
/// 4. Calculate signature and build Authorization header
#[derive(Clone)]
struct AwsV4Signer {
    access_key: String,
    secret_key: String,
    region: String,
    service: &'static str,
}

impl AwsV4Signer {
    fn new(access_key: String, secret_key: String, region: String) -> Self {
        Self {
            access_key,
            secret_key,
            region,
            service: "sqs",
        }
    }

    /// Headers that authenticate one request
    fn sign_request(
        &self,
        method: &str,
        host: &str,
        path: &str,
        canonical_query: &str,
        body: &str,
        timestamp: &DateTime<Utc>,
    ) -> Result<Vec<(&'static str, String)>, SqsError> {
        let date_stamp = timestamp.format("%Y%m%d").to_string();
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();

        let canonical_headers = format!("host:{}\nx-amz-date:{}\n", host, amz_date);
        let signed_headers = "host;x-amz-date";
        let payload_hash = hex::encode(Sha256::digest(body.as_bytes()));

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, path, canonical_query, canonical_headers, signed_headers, payload_hash
        );

        let algorithm = "AWS4-HMAC-SHA256";
        let credential_scope = format!(
            "{}/{}/{}/aws4_request",
            date_stamp, self.region, self.service
        );
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            algorithm,
            amz_date,
            credential_scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let signature = self.calculate_signature(&string_to_sign, &date_stamp)?;
        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            algorithm, self.access_key, credential_scope, signed_headers, signature
        );

        Ok(vec![
            ("Authorization", authorization),
            ("x-amz-date", amz_date),
            ("host", host.to_string()),
        ])
    }

    /// kSigning = HMAC(HMAC(HMAC(HMAC("AWS4" + secret, date), region), service), "aws4_request")
    fn calculate_signature(&self, string_to_sign: &str, date_stamp: &str) -> Result<String, SqsError> {
        let k_secret = format!("AWS4{}", self.secret_key);
        let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes())?;
        let k_region = hmac_sha256(&k_date, self.region.as_bytes())?;
        let k_service = hmac_sha256(&k_region, self.service.as_bytes())?;
        let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
        let signature = hmac_sha256(&k_signing, string_to_sign.as_bytes())?;

        Ok(hex::encode(signature))
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SqsError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| SqsError::Authentication(format!("Cannot derive signing key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Sorted, percent-encoded query string as SigV4 expects it
fn canonical_query(params: &[(&str, String)]) -> String {
    let mut pairs = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>();
    pairs.sort();
    pairs.join("&")
}

// ============================================================================
// SqsAdapter
// ============================================================================

/// SQS-backed queue adapter
pub struct SqsAdapter {
    http_client: HttpClient,
    signer: Option<AwsV4Signer>,
    config: SqsConfig,
    endpoint: String,
}

impl SqsAdapter {
    /// Create the adapter
    ///
    /// Credentials come from the configuration, falling back to the
    /// `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` environment variables.
    /// Without either, every request fails with an authentication error.
    pub fn new(config: SqsConfig) -> Result<Self, QueueError> {
        if config.region.is_empty() {
            return Err(ConfigurationError::Invalid {
                message: "SQS region cannot be empty".to_string(),
            }
            .into());
        }
        if config.queue_url.is_empty() {
            return Err(ConfigurationError::Invalid {
                message: "SQS queue_url cannot be empty".to_string(),
            }
            .into());
        }

        let access_key = config
            .access_key_id
            .clone()
            .or_else(|| std::env::var("AWS_ACCESS_KEY_ID").ok());
        let secret_key = config
            .secret_access_key
            .clone()
            .or_else(|| std::env::var("AWS_SECRET_ACCESS_KEY").ok());
        let signer = match (access_key, secret_key) {
            (Some(access), Some(secret)) => {
                Some(AwsV4Signer::new(access, secret, config.region.clone()))
            }
            _ => None,
        };

        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://sqs.{}.amazonaws.com", config.region))
            .trim_end_matches('/')
            .to_string();

        let http_client = HttpClient::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        tracing::info!(
            endpoint = %endpoint,
            queue_url = %config.queue_url,
            signed = signer.is_some(),
            "Created SQS queue adapter"
        );

        Ok(Self {
            http_client,
            signer,
            config,
            endpoint,
        })
    }

    /// Send one signed query API call and return the response body
    async fn call(&self, action: &str, mut params: Vec<(&str, String)>) -> Result<String, SqsError> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| SqsError::Authentication("No credentials configured".to_string()))?;

        params.push(("Action", action.to_string()));
        params.push(("Version", API_VERSION.to_string()));
        params.push(("QueueUrl", self.config.queue_url.clone()));
        let query = canonical_query(&params);

        let host = self
            .endpoint
            .strip_prefix("https://")
            .or_else(|| self.endpoint.strip_prefix("http://"))
            .unwrap_or(&self.endpoint);

        let headers = signer.sign_request("POST", host, "/", &query, "", &Utc::now())?;

        let mut request = self
            .http_client
            .post(format!("{}/?{}", self.endpoint, query));
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SqsError::Network(format!("Request timeout: {}", e))
            } else if e.is_connect() {
                SqsError::Network(format!("Connection failed: {}", e))
            } else {
                SqsError::Network(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SqsError::Network(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(parse_error_response(&body, status.as_u16()));
        }

        Ok(body)
    }
}

impl fmt::Debug for SqsAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqsAdapter")
            .field("config", &self.config)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[async_trait]
impl QueueAdapter for SqsAdapter {
    async fn push(&self, queue: &QueueName, envelope: &Envelope) -> Result<MessageId, QueueError> {
        let body = StoredEnvelope::from_envelope(envelope, None).to_bytes()?;
        if body.len() > MAX_BODY_SIZE {
            return Err(QueueError::MessageTooLarge {
                size: body.len(),
                max_size: MAX_BODY_SIZE,
            });
        }
        // Stored envelopes are JSON with a base64 payload, so always UTF-8
        let body = String::from_utf8(body).map_err(|e| SerializationError::Corrupt {
            location: "sqs message body".to_string(),
            message: e.to_string(),
        })?;

        let response = self
            .call("SendMessage", vec![("MessageBody", body)])
            .await
            .map_err(|e| e.into_queue_error("push"))?;

        let message_id = element_text(&response, b"MessageId")
            .map_err(|e| e.into_queue_error("push"))?
            .ok_or_else(|| {
                SqsError::Response("MessageId not found in response".to_string())
                    .into_queue_error("push")
            })?;

        tracing::debug!(queue = %queue, sqs_message_id = %message_id, "Pushed message");
        Ok(message_id.parse()?)
    }

    async fn pull(
        &self,
        queue: &QueueName,
        lease: Duration,
    ) -> Result<Option<Envelope>, QueueError> {
        validate_lease(lease)?;

        let visibility =
            (lease.num_milliseconds().saturating_add(999) / 1000).clamp(0, MAX_VISIBILITY_TIMEOUT);
        let expires_at = Timestamp::now().plus(Duration::seconds(visibility))?;

        let response = self
            .call(
                "ReceiveMessage",
                vec![
                    ("MaxNumberOfMessages", "1".to_string()),
                    ("VisibilityTimeout", visibility.to_string()),
                    ("WaitTimeSeconds", "0".to_string()),
                ],
            )
            .await
            .map_err(|e| e.into_queue_error("pull"))?;

        let Some((receipt, body)) =
            parse_receive_response(&response).map_err(|e| e.into_queue_error("pull"))?
        else {
            return Ok(None);
        };

        let receipt: MessageId = receipt.parse()?;
        let envelope = StoredEnvelope::from_slice(body.as_bytes(), "sqs message body")?
            .into_envelope(None);
        let envelope = Envelope {
            message_id: Some(receipt),
            ..envelope
        }
        .with_lease_expiry(expires_at);

        tracing::debug!(queue = %queue, lease_expiry = %expires_at, "Leased message");
        Ok(Some(envelope))
    }

    async fn delete(&self, queue: &QueueName, message_id: &MessageId) -> Result<bool, QueueError> {
        match self
            .call(
                "DeleteMessage",
                vec![("ReceiptHandle", message_id.as_str().to_string())],
            )
            .await
        {
            Ok(_) => {
                tracing::debug!(queue = %queue, "Deleted message");
                Ok(true)
            }
            Err(SqsError::InvalidReceipt(reason)) => {
                tracing::debug!(queue = %queue, reason = %reason, "Receipt handle rejected");
                Ok(false)
            }
            Err(e) => Err(e.into_queue_error("delete")),
        }
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::Sqs
    }
}

// ============================================================================
// XML Parsing
// ============================================================================

/// Text of the first element named `tag`
fn element_text(xml: &str, tag: &[u8]) -> Result<Option<String>, SqsError> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut inside = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.name().as_ref() == tag => inside = true,
            Ok(Event::Text(e)) if inside => {
                return e
                    .unescape()
                    .map(|s| Some(s.into_owned()))
                    .map_err(|e| SqsError::Response(format!("Failed to parse XML: {}", e)));
            }
            Ok(Event::Eof) => return Ok(None),
            Err(e) => return Err(SqsError::Response(format!("XML parsing error: {}", e))),
            _ => {}
        }
        buf.clear();
    }
}

/// Receipt handle and body of the first message in a ReceiveMessage response
fn parse_receive_response(xml: &str) -> Result<Option<(String, String)>, SqsError> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut in_message = false;
    let mut in_receipt_handle = false;
    let mut in_body = false;
    let mut receipt_handle: Option<String> = None;
    let mut body: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"Message" => {
                    in_message = true;
                    receipt_handle = None;
                    body = None;
                }
                b"ReceiptHandle" if in_message => in_receipt_handle = true,
                b"Body" if in_message => in_body = true,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                let text = e
                    .unescape()
                    .map(|s| s.into_owned())
                    .map_err(|e| SqsError::Response(format!("Failed to parse XML: {}", e)))?;
                if in_receipt_handle {
                    receipt_handle = Some(text);
                    in_receipt_handle = false;
                } else if in_body {
                    body = Some(text);
                    in_body = false;
                }
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"Message" => {
                return match (receipt_handle.take(), body.take()) {
                    (Some(receipt), Some(body)) => Ok(Some((receipt, body))),
                    _ => Err(SqsError::Response(
                        "Message without ReceiptHandle or Body".to_string(),
                    )),
                };
            }
            Ok(Event::Eof) => return Ok(None),
            Err(e) => return Err(SqsError::Response(format!("XML parsing error: {}", e))),
            _ => {}
        }
        buf.clear();
    }
}

/// Map an SQS error document to an error kind
fn parse_error_response(xml: &str, status_code: u16) -> SqsError {
    let code = element_text(xml, b"Code")
        .ok()
        .flatten()
        .unwrap_or_else(|| "Unknown".to_string());
    let message = element_text(xml, b"Message")
        .ok()
        .flatten()
        .unwrap_or_else(|| "Unknown error".to_string());

    match code.as_str() {
        "InvalidClientTokenId" | "UnrecognizedClientException" | "SignatureDoesNotMatch" => {
            SqsError::Authentication(format!("{}: {}", code, message))
        }
        "InvalidReceiptHandle" | "ReceiptHandleIsInvalid" => SqsError::InvalidReceipt(message),
        _ if status_code == 401 || status_code == 403 => {
            SqsError::Authentication(format!("{}: {}", code, message))
        }
        _ => SqsError::Service(format!("{} ({}): {}", code, status_code, message)),
    }
}

#[cfg(test)]
#[path = "sqs_tests.rs"]
mod tests;
