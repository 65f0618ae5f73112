//! # asb-client
//!
//! Client for the Azure Service Bus REST interface: shared access signature
//! signing and the peek-lock message lifecycle.
//!
//! ## Overview
//!
//! A sender posts messages to a queue or topic. A receiver peek-locks the
//! next message, processes it, and then either deletes it (done) or unlocks
//! it (give it back). A lock that is neither deleted nor unlocked expires
//! on the service, and the message becomes available again. Every request
//! is authorized with an HMAC-SHA256 signature over its exact URI.
//!
//! ## Key Features
//!
//! - **SAS signing**: [`SasSigner`] reproduces the service's canonical URI
//!   and signature format byte for byte
//! - **Peek-lock lifecycle**: send, peek-lock, unlock, delete, renew
//! - **Topics**: per-subscription receive via [`SubscriptionClient`]
//! - **Pluggable transport**: [`ReqwestTransport`] for real traffic,
//!   [`InMemoryServiceBus`] for tests
//!
//! ## Example
//!
//! ```no_run
//! use asb_client::{ClientIdentity, EntityKind, OutboundMessage, ServiceBusClient};
//!
//! # async fn example() -> asb_client::Result<()> {
//! let identity = ClientIdentity::new(EntityKind::Queue, "tester", "RootManageSharedAccessKey", "secret");
//! let client = ServiceBusClient::new(identity)?;
//!
//! client
//!     .send("stuff", &OutboundMessage::new("hello").with_label("greeting"))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! No operation is retried. [`ServiceBusError::is_transient`] tells callers
//! which failures are worth another attempt.

pub mod client;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod message;
pub mod signer;
pub mod transport;

pub use client::{ServiceBusClient, SubscriptionClient, API_VERSION};
pub use config::{ClientIdentity, ConnectionString, EntityKind, SecretKey};
pub use error::{
    ConfigurationError, DecodeError, ProtocolError, Result, ServiceBusError, TransportError,
    ValidationError,
};
pub use lifecycle::{InvalidTransition, LifecycleEvent, MessageState};
pub use message::{BrokerProperties, OutboundMessage, ReceivedMessage, SendProperties};
pub use signer::{SasSigner, SignedRequest, SIGNATURE_VALIDITY_SECONDS};
pub use transport::{
    HttpRequest, HttpResponse, HttpTransport, InMemoryServiceBus, MemoryConfig, Method,
    ReqwestTransport,
};
