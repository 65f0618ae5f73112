//! # asb-client CLI
//!
//! Polling consumer for the Service Bus client. It is an ordinary user of
//! the library and adds nothing to the client contract.
//!
//! Commands:
//! - `send`: post messages to a queue or topic on an interval
//! - `receive`: peek-lock messages and delete (or unlock) each one
//! - `demo`: both loops at once, each in its own task
//! - `config`: validate and show the resolved configuration
//!
//! Configuration comes from an optional YAML file followed by `ASB_*`
//! environment variables, e.g. `ASB_NAMESPACE`, `ASB_KEY_NAME`, `ASB_KEY`
//! or `ASB_CONNECTION_STRING`.

use asb_client::{
    ClientIdentity, ConfigurationError, ConnectionString, EntityKind, InMemoryServiceBus,
    MemoryConfig, OutboundMessage, SecretKey, ServiceBusClient, ServiceBusError,
};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

const ENV_PREFIX: &str = "ASB";
const DEFAULT_LOG_FILTER: &str = "asb_client=info,asb_client_cli=info";

const EMULATOR_NAMESPACE: &str = "emulator";
const EMULATOR_KEY_NAME: &str = "RootManageSharedAccessKey";
const EMULATOR_KEY: &str = "emulator-shared-access-key";
const EMULATOR_SUBSCRIPTION: &str = "demo";

// ============================================================================
// CLI Structure
// ============================================================================

/// Send and receive Service Bus messages
#[derive(Parser, Debug)]
#[command(name = "asb-client")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Send and receive Service Bus messages with peek-lock")]
pub struct Cli {
    /// Configuration file path (YAML)
    #[arg(short, long, env = "ASB_CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Run against an in-process emulator instead of the service.
    ///
    /// The emulator lives only as long as the process, so only `demo` and
    /// `config` accept it.
    #[arg(long)]
    pub emulator: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send messages on an interval
    Send {
        /// Queue or topic path; defaults to the configured path
        path: Option<String>,

        /// Message body; each message gets its index appended
        #[arg(short, long, default_value = "message")]
        body: String,

        /// Number of messages to send
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,

        /// Delay between sends in milliseconds
        #[arg(long, default_value = "500")]
        interval_ms: u64,
    },

    /// Peek-lock messages and settle each one
    Receive {
        /// Queue or topic path; defaults to the configured path
        path: Option<String>,

        /// Topic subscription to receive from
        #[arg(short, long)]
        subscription: Option<String>,

        /// How long the service may hold the request open, in seconds
        #[arg(short, long, default_value = "30")]
        timeout: i64,

        /// Unlock instead of delete, handing each message back
        #[arg(long)]
        unlock: bool,

        /// Stop after this many messages; runs until interrupted otherwise
        #[arg(short = 'n', long)]
        count: Option<usize>,

        /// Delay between polls in milliseconds
        #[arg(long, default_value = "200")]
        interval_ms: u64,
    },

    /// Run a send loop and a receive loop side by side
    Demo {
        /// Queue or topic path; defaults to the configured path
        path: Option<String>,

        /// Stop once this many messages were sent and deleted
        #[arg(short = 'n', long)]
        messages: Option<usize>,

        #[arg(long, default_value = "500")]
        send_interval_ms: u64,

        #[arg(long, default_value = "200")]
        receive_interval_ms: u64,
    },

    /// Validate and show the resolved configuration
    Config,
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Service Bus error: {0}")]
    ServiceBus(#[from] ServiceBusError),

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("Failed to initialize logging: {message}")]
    Logging { message: String },

    #[error("Task failed: {message}")]
    Task { message: String },
}

/// Configuration-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("{0}")]
    Client(#[from] ConfigurationError),
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Settings as loaded from file and environment.
///
/// Either `connection_string` or the `namespace` / `key_name` / `key` triple
/// must be set. A connection string wins when both are present.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub connection_string: Option<SecretKey>,

    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default)]
    pub entity_kind: EntityKind,

    #[serde(default)]
    pub subscription: Option<String>,

    #[serde(default)]
    pub key_name: Option<String>,

    #[serde(default)]
    pub key: Option<SecretKey>,

    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub request_timeout_seconds: Option<u64>,

    /// Queue or topic used when a command does not name one
    #[serde(default)]
    pub path: Option<String>,
}

impl CliConfig {
    /// Build and validate the client identity.
    pub fn identity(&self) -> Result<ClientIdentity, ConfigurationError> {
        let mut identity = match &self.connection_string {
            Some(connection_string) => {
                ClientIdentity::from_connection_string(self.entity_kind, connection_string.expose())?
            }
            None => ClientIdentity::new(
                self.entity_kind,
                self.namespace.clone().ok_or_else(|| missing("namespace"))?,
                self.key_name.clone().ok_or_else(|| missing("key_name"))?,
                self.key
                    .as_ref()
                    .map(|k| k.expose().to_string())
                    .ok_or_else(|| missing("key"))?,
            ),
        };

        if let Some(subscription) = &self.subscription {
            identity = identity.with_subscription(subscription.clone());
        }
        if let Some(endpoint) = &self.endpoint {
            identity = identity.with_endpoint(endpoint.clone());
        }
        if let Some(seconds) = self.request_timeout_seconds {
            identity.request_timeout_seconds = seconds;
        }

        identity.validate()?;
        Ok(identity)
    }

    /// Configured path, falling back to the connection string's `EntityPath`.
    pub fn default_path(&self) -> Option<String> {
        self.path.clone().or_else(|| {
            self.connection_string
                .as_ref()
                .and_then(|cs| ConnectionString::parse(cs.expose()).ok())
                .and_then(|parsed| parsed.entity_path)
        })
    }

    fn emulator_identity(&self) -> ClientIdentity {
        let identity = ClientIdentity::new(
            self.entity_kind,
            EMULATOR_NAMESPACE,
            EMULATOR_KEY_NAME,
            EMULATOR_KEY,
        );
        match self.entity_kind {
            EntityKind::Queue => identity,
            EntityKind::Topic => identity.with_subscription(
                self.subscription
                    .clone()
                    .unwrap_or_else(|| EMULATOR_SUBSCRIPTION.to_string()),
            ),
        }
    }
}

fn missing(key: &str) -> ConfigurationError {
    ConfigurationError::Missing {
        key: key.to_string(),
    }
}

// ============================================================================
// Polling loops
// ============================================================================

/// Settings for [`send_loop`]
#[derive(Debug, Clone)]
pub struct SendLoop {
    pub body: String,
    /// `None` sends until the task is stopped
    pub count: Option<usize>,
    pub interval: Duration,
}

/// Settings for [`receive_loop`]
#[derive(Debug, Clone)]
pub struct ReceiveLoop {
    pub subscription: Option<String>,
    pub timeout: chrono::Duration,
    pub unlock: bool,
    /// `None` receives until the task is stopped
    pub count: Option<usize>,
    pub interval: Duration,
}

/// Failures that will not go away by trying again.
fn is_fatal(error: &ServiceBusError) -> bool {
    matches!(
        error,
        ServiceBusError::Configuration(_) | ServiceBusError::Validation(_)
    )
}

/// Send messages until `count` have been accepted. Returns the number sent.
///
/// Service and transport failures are logged and the loop carries on.
pub async fn send_loop(
    client: ServiceBusClient,
    path: String,
    settings: SendLoop,
) -> Result<usize, CliError> {
    let mut sent = 0;
    let mut index = 0usize;

    while settings.count.map_or(true, |count| sent < count) {
        let message = OutboundMessage::new(format!("{} {}", settings.body, index));

        match client.send(&path, &message).await {
            Ok(()) => {
                sent += 1;
                info!(path = %path, index = index, "Sent message");
            }
            Err(e) if is_fatal(&e) => return Err(e.into()),
            Err(e) => {
                warn!(path = %path, index = index, error = %e, transient = e.is_transient(), "Send failed")
            }
        }

        index += 1;
        tokio::time::sleep(settings.interval).await;
    }

    Ok(sent)
}

/// Peek-lock and settle messages until `count` have been handled.
///
/// Each message is deleted, or unlocked when `unlock` is set. Returns the
/// number of messages settled.
pub async fn receive_loop(
    client: ServiceBusClient,
    path: String,
    settings: ReceiveLoop,
) -> Result<usize, CliError> {
    let mut settled = 0;

    while settings.count.map_or(true, |count| settled < count) {
        let received = match &settings.subscription {
            Some(subscription) => {
                client
                    .peek_lock_subscription(&path, subscription, settings.timeout)
                    .await
            }
            None => client.peek_lock_message(&path, settings.timeout).await,
        };

        match received {
            Ok(Some(message)) => {
                info!(
                    path = %path,
                    message_id = message.message_id().unwrap_or_default(),
                    delivery_count = message.delivery_count(),
                    body = %String::from_utf8_lossy(&message.body),
                    "Peeked message"
                );

                let outcome = if settings.unlock {
                    client.unlock_message(&message).await
                } else {
                    client.delete_message(&message).await
                };

                match outcome {
                    Ok(()) => {
                        settled += 1;
                        if settings.unlock {
                            info!(path = %path, "Unlocked message");
                        } else {
                            info!(path = %path, "Deleted message");
                        }
                    }
                    Err(e) if is_fatal(&e) => return Err(e.into()),
                    Err(e) => warn!(path = %path, error = %e, "Settle failed"),
                }
            }
            Ok(None) => debug!(path = %path, "No message available"),
            Err(e) if is_fatal(&e) => return Err(e.into()),
            Err(e) => warn!(path = %path, error = %e, transient = e.is_transient(), "Peek failed"),
        }

        tokio::time::sleep(settings.interval).await;
    }

    Ok(settled)
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    initialize_logging(&cli)?;

    run(cli).await
}

/// Execute a parsed command line.
pub async fn run(cli: Cli) -> Result<(), CliError> {
    let config = load_configuration(cli.config.as_deref())?;

    match cli.command {
        Commands::Send {
            path,
            body,
            count,
            interval_ms,
        } => {
            reject_emulator("send", cli.emulator)?;
            let path = resolve_path(path, &config)?;
            let client = build_client(&config, &path, false)?;
            let settings = SendLoop {
                body,
                count: Some(count),
                interval: Duration::from_millis(interval_ms),
            };

            let sent = send_loop(client, path.clone(), settings).await?;
            info!(path = %path, sent = sent, "Send finished");
            Ok(())
        }
        Commands::Receive {
            path,
            subscription,
            timeout,
            unlock,
            count,
            interval_ms,
        } => {
            reject_emulator("receive", cli.emulator)?;
            let path = resolve_path(path, &config)?;
            let client = build_client(&config, &path, false)?;
            let settings = ReceiveLoop {
                subscription,
                timeout: chrono::Duration::seconds(timeout),
                unlock,
                count,
                interval: Duration::from_millis(interval_ms),
            };

            let settled = receive_loop(client, path.clone(), settings).await?;
            info!(path = %path, settled = settled, "Receive finished");
            Ok(())
        }
        Commands::Demo {
            path,
            messages,
            send_interval_ms,
            receive_interval_ms,
        } => {
            let path = resolve_path(path, &config)?;
            let client = build_client(&config, &path, cli.emulator)?;
            execute_demo_command(client, path, messages, send_interval_ms, receive_interval_ms)
                .await
        }
        Commands::Config => {
            let identity = if cli.emulator {
                config.emulator_identity()
            } else {
                config.identity().map_err(ConfigError::from)?
            };

            println!("{:#?}", identity);
            println!("base url: {}", identity.base_url());
            if let Some(path) = config.default_path() {
                println!("path: {}", path);
            }
            Ok(())
        }
    }
}

async fn execute_demo_command(
    client: ServiceBusClient,
    path: String,
    messages: Option<usize>,
    send_interval_ms: u64,
    receive_interval_ms: u64,
) -> Result<(), CliError> {
    info!(path = %path, messages = ?messages, "Starting send and receive loops");

    let sender = tokio::spawn(send_loop(
        client.clone(),
        path.clone(),
        SendLoop {
            body: "message".to_string(),
            count: messages,
            interval: Duration::from_millis(send_interval_ms),
        },
    ));

    let received = receive_loop(
        client,
        path.clone(),
        ReceiveLoop {
            subscription: None,
            timeout: chrono::Duration::seconds(30),
            unlock: false,
            count: messages,
            interval: Duration::from_millis(receive_interval_ms),
        },
    )
    .await;
    let settled = match received {
        Ok(settled) => settled,
        Err(e) => {
            sender.abort();
            return Err(e);
        }
    };

    let sent = sender.await.map_err(|e| CliError::Task {
        message: e.to_string(),
    })??;

    info!(path = %path, sent = sent, deleted = settled, "Demo finished");
    Ok(())
}

/// A separate `send` or `receive` process would get its own empty emulator.
fn reject_emulator(command: &str, emulator: bool) -> Result<(), CliError> {
    if emulator {
        return Err(CliError::InvalidArgument {
            arg: "--emulator".to_string(),
            message: format!(
                "'{}' cannot use the in-process emulator; use 'demo' instead",
                command
            ),
        });
    }
    Ok(())
}

fn resolve_path(path: Option<String>, config: &CliConfig) -> Result<String, CliError> {
    path.or_else(|| config.default_path())
        .ok_or_else(|| CliError::InvalidArgument {
            arg: "path".to_string(),
            message: "no queue or topic given and none configured".to_string(),
        })
}

/// Create the client, over the emulator when requested.
///
/// The emulator always uses its own credentials and verifies every
/// signature against them. Its entity is created up front.
fn build_client(
    config: &CliConfig,
    path: &str,
    emulator: bool,
) -> Result<ServiceBusClient, CliError> {
    if !emulator {
        let identity = config.identity().map_err(ConfigError::from)?;
        return Ok(ServiceBusClient::new(identity)?);
    }

    let identity = config.emulator_identity();
    let bus = InMemoryServiceBus::new(
        MemoryConfig::default().with_credentials(EMULATOR_KEY_NAME, EMULATOR_KEY),
    );
    match (&identity.entity_kind, &identity.subscription) {
        (EntityKind::Topic, Some(subscription)) => bus.create_subscription(path, subscription),
        _ => bus.create_queue(path),
    }

    info!(path = %path, kind = %identity.entity_kind, "Using in-process emulator");
    Ok(ServiceBusClient::with_transport(identity, Arc::new(bus))?)
}

/// Initialize logging based on CLI arguments
pub fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);

    let result = if cli.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    result.map_err(|e| CliError::Logging {
        message: e.to_string(),
    })
}

/// Load configuration from an optional YAML file, then the environment.
///
/// Environment variables use the `ASB_` prefix and `__` for nesting, so
/// `ASB_KEY_NAME` sets `key_name`.
pub fn load_configuration(config_path: Option<&Path>) -> Result<CliConfig, ConfigError> {
    let mut builder = config::Config::builder();

    if let Some(path) = config_path {
        builder = builder.add_source(
            config::File::from(path)
                .format(config::FileFormat::Yaml)
                .required(true),
        );
    }

    let settings = builder
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    Ok(settings.try_deserialize()?)
}
