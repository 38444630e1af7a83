//! # Lease Queue CLI
//!
//! Command-line interface over the lease-queue front door.
//!
//! This module provides CLI commands for:
//! - Sending a JSON payload to a queue
//! - Receiving (leasing) the next message of a queue
//! - Deleting a leased message
//! - Inspecting and validating the queue configuration
//!
//! Command output goes to stdout; logs go to stderr.

use clap::{Parser, Subcommand};
use lease_queue::config::BackendConfig;
use lease_queue::message::MAX_LEASE_SECONDS;
use lease_queue::{
    ConfigurationError, Envelope, MessageId, MessageQueue, QueueError, QueueName, QueueSettings,
};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const REDACTED: &str = "<redacted>";

// ============================================================================
// CLI Structure
// ============================================================================

/// lease-queue CLI - push, lease and delete queue messages
#[derive(Parser)]
#[command(name = "lease-queue")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Lease-based message queue over pluggable storage backends")]
#[command(
    long_about = "Sends, leases and deletes messages on queues backed by memory, files, SQL tables, System V queues or SQS"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "LEASE_QUEUE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Push a message onto a queue
    Send {
        /// Target queue
        queue: QueueName,

        /// Payload as a JSON document
        payload: String,

        /// Producer identifier stored with the message
        #[arg(short, long, default_value = "lease-queue-cli")]
        producer: String,

        /// Send the payload as a plain string instead of parsing it as JSON
        #[arg(long)]
        raw: bool,
    },

    /// Lease the next message of a queue
    Receive {
        /// Source queue
        queue: QueueName,

        /// Lease duration in seconds (defaults to the configured lease)
        #[arg(short = 't', long)]
        lease: Option<i64>,

        /// Output format
        #[arg(short, long, default_value = "json")]
        format: OutputFormat,
    },

    /// Delete a leased message
    Delete {
        /// Queue the message was received from
        queue: QueueName,

        /// Message id returned by receive
        message_id: MessageId,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

/// Configuration subcommands
#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the loaded configuration with secrets redacted
    Show {
        /// Output format for configuration
        #[arg(short = 'f', long, default_value = "yaml")]
        format: ConfigFormat,
    },

    /// Show the backend a queue resolves to and its fingerprint
    Resolve {
        /// Queue to resolve
        queue: QueueName,

        /// Output format for configuration
        #[arg(short = 'f', long, default_value = "yaml")]
        format: ConfigFormat,
    },

    /// Validate the configuration
    Validate,
}

/// Output format options
#[derive(Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON output
    Json,
}

/// Configuration format options
#[derive(Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    /// YAML format
    Yaml,
    /// JSON format
    Json,
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("Output failed: {message}")]
    Output { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Queue(QueueError::Configuration(_)) => 1,
            Self::Queue(_) => 2,
            Self::Output { .. } => 3,
            Self::InvalidArgument { .. } => 4,
            Self::Io(_) => 5,
        }
    }
}

// ============================================================================
// Output Types
// ============================================================================

/// A leased message as printed by `receive`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceivedMessage {
    pub message_id: Option<String>,
    pub producer_id: String,
    pub lease_expiry: Option<String>,
    /// Decoded JSON payload, or the lossy UTF-8 text when it is not JSON
    pub payload: serde_json::Value,
}

impl ReceivedMessage {
    fn from_envelope(queue: &MessageQueue, envelope: &Envelope) -> Self {
        let payload = queue
            .decode::<serde_json::Value>(envelope)
            .unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(&envelope.payload).into_owned())
            });

        Self {
            message_id: envelope.message_id.as_ref().map(|id| id.to_string()),
            producer_id: envelope.producer_id.clone(),
            lease_expiry: envelope
                .lease_expiry
                .map(|expiry| expiry.as_datetime().to_rfc3339()),
            payload,
        }
    }

    fn render(&self, format: &OutputFormat) -> Result<String, CliError> {
        match format {
            OutputFormat::Json => to_json(self),
            OutputFormat::Text => Ok(format!(
                "id:       {}\nproducer: {}\nexpires:  {}\npayload:  {}",
                self.message_id.as_deref().unwrap_or("-"),
                self.producer_id,
                self.lease_expiry.as_deref().unwrap_or("-"),
                self.payload
            )),
        }
    }
}

/// Backend resolution as printed by `config resolve`
#[derive(Debug, Serialize)]
struct Resolution {
    queue: String,
    fingerprint: String,
    backend: BackendConfig,
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    initialize_logging(&cli)?;

    if let Some(output) = execute(cli).await? {
        println!("{}", output);
    }
    Ok(())
}

/// Run one parsed command and return what it prints, if anything
pub async fn execute(cli: Cli) -> Result<Option<String>, CliError> {
    let settings = load_configuration(cli.config.as_ref())?;

    match cli.command {
        Commands::Send {
            queue,
            payload,
            producer,
            raw,
        } => execute_send_command(settings, queue, payload, producer, raw).await,
        Commands::Receive {
            queue,
            lease,
            format,
        } => execute_receive_command(settings, queue, lease, format).await,
        Commands::Delete { queue, message_id } => {
            execute_delete_command(settings, queue, message_id).await
        }
        Commands::Config { action } => execute_config_command(settings, action),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Initialize logging based on CLI arguments
///
/// `RUST_LOG` wins over `--log-level` when set.
fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(format!("lease_queue={}", cli.log_level)).map_err(|e| {
            CliError::InvalidArgument {
                arg: "log-level".to_string(),
                message: e.to_string(),
            }
        })?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = if cli.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    // A subscriber installed by an embedding process is left in place
    if let Err(e) = result {
        debug!(error = %e, "Logging already initialized");
    }
    Ok(())
}

/// Load configuration from file and environment
fn load_configuration(config_path: Option<&PathBuf>) -> Result<QueueSettings, ConfigurationError> {
    QueueSettings::load(config_path.map(|p| p.as_path()))
}

async fn execute_send_command(
    settings: QueueSettings,
    queue: QueueName,
    payload: String,
    producer: String,
    raw: bool,
) -> Result<Option<String>, CliError> {
    let value = if raw {
        serde_json::Value::String(payload)
    } else {
        serde_json::from_str::<serde_json::Value>(&payload).map_err(|e| {
            CliError::InvalidArgument {
                arg: "payload".to_string(),
                message: format!("not valid JSON ({}); use --raw to send plain text", e),
            }
        })?
    };

    let front_door = MessageQueue::new(settings)?;
    let message_id = front_door.send(&queue, &value, &producer).await?;

    info!(queue = %queue, message_id = %message_id, "Message sent");
    Ok(Some(message_id.to_string()))
}

/// Convert a `--lease` value, rejecting what no adapter would accept
fn lease_duration(seconds: i64) -> Result<chrono::Duration, CliError> {
    let out_of_range = || CliError::InvalidArgument {
        arg: "lease".to_string(),
        message: format!(
            "must be between 0 and {} seconds, got {}",
            MAX_LEASE_SECONDS, seconds
        ),
    };

    if !(0..=MAX_LEASE_SECONDS).contains(&seconds) {
        return Err(out_of_range());
    }
    chrono::Duration::try_seconds(seconds).ok_or_else(out_of_range)
}

async fn execute_receive_command(
    settings: QueueSettings,
    queue: QueueName,
    lease: Option<i64>,
    format: OutputFormat,
) -> Result<Option<String>, CliError> {
    let front_door = MessageQueue::new(settings)?;

    let envelope = match lease {
        Some(seconds) => front_door.receive(&queue, lease_duration(seconds)?).await?,
        None => front_door.receive_with_default_lease(&queue).await?,
    };

    match envelope {
        Some(envelope) => {
            let message = ReceivedMessage::from_envelope(&front_door, &envelope);
            info!(queue = %queue, message_id = ?message.message_id, "Message leased");
            Ok(Some(message.render(&format)?))
        }
        None => {
            info!(queue = %queue, "No message available");
            match format {
                OutputFormat::Json => Ok(Some("null".to_string())),
                OutputFormat::Text => Ok(None),
            }
        }
    }
}

async fn execute_delete_command(
    settings: QueueSettings,
    queue: QueueName,
    message_id: MessageId,
) -> Result<Option<String>, CliError> {
    let front_door = MessageQueue::new(settings)?;
    let deleted = front_door.delete(&queue, &message_id).await?;

    info!(
        queue = %queue,
        message_id = %message_id,
        deleted = deleted,
        "Processed delete"
    );
    Ok(Some(deleted.to_string()))
}

fn execute_config_command(
    settings: QueueSettings,
    action: ConfigCommands,
) -> Result<Option<String>, CliError> {
    match action {
        ConfigCommands::Show { format } => Ok(Some(render(&redact_settings(settings), &format)?)),
        ConfigCommands::Resolve { queue, format } => {
            let backend = settings.resolve(&queue)?;
            let resolution = Resolution {
                queue: queue.to_string(),
                fingerprint: backend.fingerprint().to_string(),
                backend: redact_backend(backend),
            };
            Ok(Some(render(&resolution, &format)?))
        }
        ConfigCommands::Validate => Ok(Some(format!(
            "configuration valid ({} queues configured)",
            settings.queues.len()
        ))),
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn redact_settings(mut settings: QueueSettings) -> QueueSettings {
    for entry in settings.queues.values_mut() {
        if entry.secret_access_key.is_some() {
            entry.secret_access_key = Some(REDACTED.to_string());
        }
    }
    settings
}

fn redact_backend(backend: BackendConfig) -> BackendConfig {
    match backend {
        BackendConfig::Sqs(mut sqs) => {
            if sqs.secret_access_key.is_some() {
                sqs.secret_access_key = Some(REDACTED.to_string());
            }
            BackendConfig::Sqs(sqs)
        }
        other => other,
    }
}

fn render<T: Serialize>(value: &T, format: &ConfigFormat) -> Result<String, CliError> {
    match format {
        ConfigFormat::Json => to_json(value),
        ConfigFormat::Yaml => serde_yaml::to_string(value).map_err(|e| CliError::Output {
            message: e.to_string(),
        }),
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, CliError> {
    serde_json::to_string_pretty(value).map_err(|e| CliError::Output {
        message: e.to_string(),
    })
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
