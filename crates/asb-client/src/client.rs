//! Message lifecycle client.
//!
//! [`ServiceBusClient`] turns the logical operations (send, peek-lock,
//! unlock, delete, plus renew and receive-and-delete) into signed HTTPS
//! exchanges. All of them go through one request-construction path:
//!
//! 1. Build the URI from the namespace address and entity path
//! 2. Merge `api-version` into the query and sort the parameters
//! 3. Sign the resulting URI and attach the `Authorization` header
//! 4. Attach message headers and body, if any
//!
//! The client keeps no per-message state. Whether a lock is still held is
//! known only to the service; every settle call is an attempt whose result
//! is decided by the response status.
//!
//! ## Example
//!
//! ```no_run
//! use asb_client::{ClientIdentity, EntityKind, OutboundMessage, ServiceBusClient};
//! use chrono::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let identity = ClientIdentity::new(EntityKind::Queue, "tester", "RootManageSharedAccessKey", "secret");
//! let client = ServiceBusClient::new(identity)?;
//!
//! client.send("stuff", &OutboundMessage::new("hello")).await?;
//!
//! if let Some(message) = client.peek_lock_message("stuff", Duration::seconds(30)).await? {
//!     // process message.body ...
//!     client.delete_message(&message).await?;
//! }
//! # Ok(())
//! # }
//! ```

use crate::config::{ClientIdentity, EntityKind};
use crate::error::{
    ConfigurationError, DecodeError, ProtocolError, Result, ServiceBusError, ValidationError,
};
use crate::message::{BrokerProperties, OutboundMessage, ReceivedMessage};
use crate::signer::SasSigner;
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport};
use chrono::{Duration, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// REST API version sent with every request
pub const API_VERSION: &str = "2017-04";

pub(crate) const BROKER_PROPERTIES_HEADER: &str = "BrokerProperties";
pub(crate) const LOCATION_HEADER: &str = "Location";
pub(crate) const CONTENT_TYPE_HEADER: &str = "Content-Type";

/// Protocol and HTTP headers that never carry custom message properties
const STANDARD_HEADERS: &[&str] = &[
    "accept",
    "age",
    "authorization",
    "brokerproperties",
    "cache-control",
    "connection",
    "date",
    "etag",
    "expires",
    "host",
    "keep-alive",
    "last-modified",
    "location",
    "pragma",
    "server",
    "strict-transport-security",
    "transfer-encoding",
    "user-agent",
    "vary",
];

const STATUS_OK: u16 = 200;
const STATUS_CREATED: u16 = 201;
const STATUS_NO_CONTENT: u16 = 204;

/// Client for one namespace.
///
/// Cheap to clone; clones share the transport. Safe to use from many tasks
/// at once since nothing in it changes after construction.
#[derive(Clone)]
pub struct ServiceBusClient {
    identity: Arc<ClientIdentity>,
    signer: SasSigner,
    base_url: String,
    transport: Arc<dyn HttpTransport>,
}

impl ServiceBusClient {
    /// Create a client using the default `reqwest` transport.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The identity is incomplete (see [`ClientIdentity::validate`])
    /// - The HTTP client cannot be created
    pub fn new(identity: ClientIdentity) -> Result<Self> {
        let transport = ReqwestTransport::new(identity.request_timeout())?;
        Self::with_transport(identity, Arc::new(transport))
    }

    /// Create a client over a caller-supplied transport.
    pub fn with_transport(
        identity: ClientIdentity,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self> {
        identity.validate()?;

        let signer = SasSigner::new(identity.key_name.clone(), identity.key.expose());
        let base_url = identity.base_url();

        Ok(Self {
            identity: Arc::new(identity),
            signer,
            base_url,
            transport,
        })
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn entity_kind(&self) -> EntityKind {
        self.identity.entity_kind
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Handle bound to one topic subscription.
    pub fn subscription(
        &self,
        topic: impl Into<String>,
        subscription: impl Into<String>,
    ) -> SubscriptionClient {
        SubscriptionClient {
            client: self.clone(),
            topic: topic.into(),
            subscription: subscription.into(),
        }
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Send `message` to the queue or topic at `path`.
    ///
    /// Success is 200 or 201; anything else is a [`ProtocolError`].
    pub async fn send(&self, path: &str, message: &OutboundMessage) -> Result<()> {
        validate_path(path)?;

        let uri = format!("{}{}/messages/", self.base_url, path);
        let request = self.build_request(Method::Post, &uri, Some(message))?;
        let response = self.execute(request).await?;

        expect_status(&response, &[STATUS_OK, STATUS_CREATED])?;
        debug!(path = %path, status = response.status, "Message sent");
        Ok(())
    }

    /// Atomically retrieve and lock the next message at `path`.
    ///
    /// For a topic, the identity's subscription is used; without one this
    /// fails with [`ConfigurationError::SubscriptionRequired`] and nothing is
    /// sent. Returns `Ok(None)` when no message is available.
    pub async fn peek_lock_message(
        &self,
        path: &str,
        timeout: Duration,
    ) -> Result<Option<ReceivedMessage>> {
        let entity = self.receive_entity(path)?;
        self.peek_lock_entity(&entity, timeout).await
    }

    /// Peek-lock from an explicitly named topic subscription.
    pub async fn peek_lock_subscription(
        &self,
        topic: &str,
        subscription: &str,
        timeout: Duration,
    ) -> Result<Option<ReceivedMessage>> {
        let entity = subscription_entity(topic, subscription)?;
        self.peek_lock_entity(&entity, timeout).await
    }

    /// Retrieve and delete the next message in one step.
    ///
    /// The returned message carries no lock and cannot be unlocked or
    /// deleted again. Returns `Ok(None)` when no message is available.
    pub async fn receive_and_delete(
        &self,
        path: &str,
        timeout: Duration,
    ) -> Result<Option<ReceivedMessage>> {
        let entity = self.receive_entity(path)?;
        self.receive_and_delete_entity(&entity, timeout).await
    }

    /// Permanently remove a locked message. Success is 200.
    ///
    /// A lock that has already expired server-side comes back as an
    /// ordinary [`ProtocolError`].
    pub async fn delete_message(&self, message: &ReceivedMessage) -> Result<()> {
        self.settle(Method::Delete, message, "Message deleted").await
    }

    /// Release a lock so the message is available to any receiver again.
    pub async fn unlock_message(&self, message: &ReceivedMessage) -> Result<()> {
        self.settle(Method::Put, message, "Message unlocked").await
    }

    /// Extend the lock on a message.
    pub async fn renew_lock(&self, message: &ReceivedMessage) -> Result<()> {
        self.settle(Method::Post, message, "Message lock renewed").await
    }

    // ------------------------------------------------------------------------
    // Shared plumbing
    // ------------------------------------------------------------------------

    fn receive_entity(&self, path: &str) -> Result<String> {
        validate_path(path)?;

        match self.identity.entity_kind {
            EntityKind::Queue => Ok(path.to_string()),
            EntityKind::Topic => {
                let subscription = self
                    .identity
                    .subscription
                    .as_deref()
                    .filter(|s| !s.is_empty())
                    .ok_or(ConfigurationError::SubscriptionRequired)?;
                subscription_entity(path, subscription)
            }
        }
    }

    async fn peek_lock_entity(
        &self,
        entity: &str,
        timeout: Duration,
    ) -> Result<Option<ReceivedMessage>> {
        let uri = head_uri(&self.base_url, entity, timeout);
        let request = self.build_request(Method::Post, &uri, None)?;
        let response = self.execute(request).await?;

        match response.status {
            STATUS_NO_CONTENT => {
                debug!(entity = %entity, "No message available");
                Ok(None)
            }
            STATUS_CREATED => decode_received(response, true).map(Some),
            _ => Err(protocol_error(&response)),
        }
    }

    async fn receive_and_delete_entity(
        &self,
        entity: &str,
        timeout: Duration,
    ) -> Result<Option<ReceivedMessage>> {
        let uri = head_uri(&self.base_url, entity, timeout);
        let request = self.build_request(Method::Delete, &uri, None)?;
        let response = self.execute(request).await?;

        match response.status {
            STATUS_NO_CONTENT => {
                debug!(entity = %entity, "No message available");
                Ok(None)
            }
            STATUS_OK => decode_received(response, false).map(Some),
            _ => Err(protocol_error(&response)),
        }
    }

    async fn settle(&self, method: Method, message: &ReceivedMessage, done: &str) -> Result<()> {
        let uri = settlement_uri(message)?;
        let request = self.build_request(method, &uri, None)?;
        let response = self.execute(request).await?;

        expect_status(&response, &[STATUS_OK])?;
        debug!(
            message_id = message.message_id().unwrap_or_default(),
            "{}", done
        );
        Ok(())
    }

    /// Build the signed request for `uri`.
    ///
    /// Every operation goes through here so that the signature always covers
    /// exactly the URI that is sent.
    pub(crate) fn build_request(
        &self,
        method: Method,
        uri: &str,
        message: Option<&OutboundMessage>,
    ) -> Result<HttpRequest> {
        let uri = normalize_uri(uri)?;
        let signed = self.signer.sign_request(method.as_str(), &uri, Utc::now());

        debug!(method = %method, uri = %uri, expiry = %signed.expiry, "Signed request");

        let mut request = HttpRequest::new(method, uri)
            .with_header("Accept", "application/json")
            .with_header("Authorization", signed.authorization);

        if let Some(message) = message {
            if !message.properties.is_empty() {
                let props = serde_json::to_string(&message.properties).map_err(|e| {
                    ValidationError::InvalidFormat {
                        field: "properties".to_string(),
                        message: e.to_string(),
                    }
                })?;
                request = request.with_header(BROKER_PROPERTIES_HEADER, props);
            }

            if let Some(content_type) = &message.content_type {
                request = request.with_header(CONTENT_TYPE_HEADER, content_type.as_str());
            }

            for (name, value) in &message.user_properties {
                request = request.with_header(name.as_str(), quote_header_value(value));
            }

            request = request.with_body(message.body.clone());
        }

        Ok(request)
    }

    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let method = request.method;
        self.transport.execute(request).await.map_err(|e| {
            warn!(method = %method, error = %e, "Transport failure");
            ServiceBusError::from(e)
        })
    }
}

impl fmt::Debug for ServiceBusClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBusClient")
            .field("identity", &self.identity)
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// A [`ServiceBusClient`] bound to one topic subscription
#[derive(Debug, Clone)]
pub struct SubscriptionClient {
    client: ServiceBusClient,
    topic: String,
    subscription: String,
}

impl SubscriptionClient {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub async fn peek_lock(&self, timeout: Duration) -> Result<Option<ReceivedMessage>> {
        self.client
            .peek_lock_subscription(&self.topic, &self.subscription, timeout)
            .await
    }

    pub async fn receive_and_delete(&self, timeout: Duration) -> Result<Option<ReceivedMessage>> {
        let entity = subscription_entity(&self.topic, &self.subscription)?;
        self.client.receive_and_delete_entity(&entity, timeout).await
    }

    pub async fn delete_message(&self, message: &ReceivedMessage) -> Result<()> {
        self.client.delete_message(message).await
    }

    pub async fn unlock_message(&self, message: &ReceivedMessage) -> Result<()> {
        self.client.unlock_message(message).await
    }

    pub async fn renew_lock(&self, message: &ReceivedMessage) -> Result<()> {
        self.client.renew_lock(message).await
    }
}

// ============================================================================
// URI construction
// ============================================================================

fn validate_path(path: &str) -> Result<()> {
    if path.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "path".to_string(),
        }
        .into());
    }

    if path.starts_with('/') || path.ends_with('/') || path.contains(['?', '#']) {
        return Err(ValidationError::InvalidFormat {
            field: "path".to_string(),
            message: format!("'{}' must be a bare entity path", path),
        }
        .into());
    }

    Ok(())
}

fn subscription_entity(topic: &str, subscription: &str) -> Result<String> {
    validate_path(topic)?;
    if subscription.trim().is_empty() {
        return Err(ConfigurationError::SubscriptionRequired.into());
    }
    if subscription.contains(['/', '?', '#']) {
        return Err(ValidationError::InvalidFormat {
            field: "subscription".to_string(),
            message: format!("'{}' must be a bare subscription name", subscription),
        }
        .into());
    }
    Ok(format!("{}/subscriptions/{}", topic, subscription))
}

fn head_uri(base_url: &str, entity: &str, timeout: Duration) -> String {
    format!(
        "{}{}/messages/head?timeout={}",
        base_url,
        entity,
        timeout.num_seconds().max(0)
    )
}

/// Address of a locked message instance.
///
/// The `Location` header normally already ends in the lock token; when it
/// does not, the token is appended.
fn settlement_uri(message: &ReceivedMessage) -> Result<String> {
    let location = message.location().ok_or_else(|| ValidationError::Required {
        field: "location".to_string(),
    })?;
    let lock_token = message.lock_token().ok_or_else(|| ValidationError::Required {
        field: "lock_token".to_string(),
    })?;

    let (path, query) = match location.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (location, None),
    };
    let path = path.trim_end_matches('/');

    let mut uri = if path.ends_with(&format!("/{}", lock_token)) {
        path.to_string()
    } else {
        format!("{}/{}", path, lock_token)
    };
    if let Some(query) = query {
        uri.push('?');
        uri.push_str(query);
    }

    Ok(uri)
}

/// Merge `api-version` into the query string and sort parameters by name.
///
/// The result is the exact string that is both signed and sent.
pub(crate) fn normalize_uri(uri: &str) -> Result<String> {
    let (base, query) = match uri.split_once('?') {
        Some((base, query)) => (base, query),
        None => (uri, ""),
    };

    let mut params: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .filter(|(k, _)| k != "api-version")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    params.push(("api-version".to_string(), API_VERSION.to_string()));
    params.sort_by(|a, b| a.0.cmp(&b.0));

    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    let normalized = format!("{}?{}", base, query);

    let parsed = url::Url::parse(&normalized).map_err(|e| ValidationError::InvalidFormat {
        field: "uri".to_string(),
        message: format!("'{}': {}", base, e),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ValidationError::InvalidFormat {
            field: "uri".to_string(),
            message: format!("unsupported scheme '{}'", parsed.scheme()),
        }
        .into());
    }

    Ok(normalized)
}

fn quote_header_value(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

// ============================================================================
// Response decoding
// ============================================================================

fn protocol_error(response: &HttpResponse) -> ServiceBusError {
    let error = ProtocolError::from_response(response.status, &response.body);
    warn!(status = response.status, error = %error, "Service returned an error");
    error.into()
}

fn expect_status(response: &HttpResponse, accepted: &[u16]) -> Result<()> {
    if accepted.contains(&response.status) {
        Ok(())
    } else {
        Err(protocol_error(response))
    }
}

/// Decode a received message from its response.
///
/// Metadata comes from the `BrokerProperties` header, never the body; the
/// body is the payload as sent. A locked message must carry a lock token
/// and a `Location`.
pub(crate) fn decode_received(response: HttpResponse, locked: bool) -> Result<ReceivedMessage> {
    let raw = response
        .header(BROKER_PROPERTIES_HEADER)
        .ok_or_else(|| DecodeError::MissingHeader {
            header: BROKER_PROPERTIES_HEADER.to_string(),
        })?;
    let properties: BrokerProperties =
        serde_json::from_str(raw).map_err(DecodeError::BrokerProperties)?;

    let location = if locked {
        if properties.lock_token.as_deref().unwrap_or_default().is_empty() {
            return Err(DecodeError::MissingField {
                field: "LockToken".to_string(),
            }
            .into());
        }
        let location = response
            .header(LOCATION_HEADER)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| DecodeError::MissingHeader {
                header: LOCATION_HEADER.to_string(),
            })?;
        Some(location.to_string())
    } else {
        None
    };

    let content_type = response.header(CONTENT_TYPE_HEADER).map(str::to_string);
    let user_properties = user_properties(&response);

    Ok(ReceivedMessage {
        properties,
        content_type,
        user_properties,
        location,
        body: response.body,
    })
}

/// True for headers defined by HTTP or the protocol itself.
pub(crate) fn is_standard_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.starts_with("content-")
        || name.starts_with("x-ms-")
        || STANDARD_HEADERS.contains(&name.as_str())
}

/// Custom properties come back as headers with JSON string values.
fn user_properties(response: &HttpResponse) -> BTreeMap<String, String> {
    response
        .headers
        .iter()
        .filter(|(name, _)| !is_standard_header(name))
        .filter_map(|(name, value)| {
            if !(value.starts_with('"') && value.ends_with('"') && value.len() >= 2) {
                return None;
            }
            serde_json::from_str::<String>(value)
                .ok()
                .map(|v| (name.clone(), v))
        })
        .collect()
}
