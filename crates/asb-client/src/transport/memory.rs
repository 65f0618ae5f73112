//! In-memory Service Bus emulator for testing and development.
//!
//! [`InMemoryServiceBus`] is an [`HttpTransport`] that answers the REST
//! calls the client makes instead of sending them anywhere:
//! - Queues, and topics with subscription fan-out
//! - Peek-lock with lock tokens, lock expiry, unlock, delete and renew
//! - Receive-and-delete
//! - Authorization checks, optionally verifying the signature itself
//!
//! Message state follows [`MessageState`], so every status the emulator
//! returns is the outcome of one lifecycle transition. Receives never wait:
//! an empty entity answers 204 straight away, whatever the timeout.

use super::{HttpRequest, HttpResponse, HttpTransport, Method};
use crate::client::{
    is_standard_header, BROKER_PROPERTIES_HEADER, CONTENT_TYPE_HEADER, LOCATION_HEADER,
};
use crate::config::SecretKey;
use crate::error::TransportError;
use crate::lifecycle::{LifecycleEvent, MessageState};
use crate::message::{BrokerProperties, SendProperties};
use crate::signer;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

const SAS_PREFIX: &str = "SharedAccessSignature ";

/// Configuration for the in-memory emulator
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// How long a peek-lock holds a message
    pub lock_duration: Duration,
    credentials: Option<(String, SecretKey)>,
    record_requests: bool,
}

impl MemoryConfig {
    /// Verify every signature against this key instead of only checking
    /// that one is present.
    pub fn with_credentials(mut self, key_name: impl Into<String>, key: impl Into<String>) -> Self {
        self.credentials = Some((key_name.into(), SecretKey::new(key)));
        self
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    /// Keep a copy of every request for [`InMemoryServiceBus::requests`].
    ///
    /// Off by default; the log grows with every call.
    pub fn with_request_log(mut self) -> Self {
        self.record_requests = true;
        self
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            lock_duration: Duration::seconds(30),
            credentials: None,
            record_requests: false,
        }
    }
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

struct Storage {
    /// Receivable entities: queues and topic subscriptions, keyed by path
    entities: HashMap<String, Entity>,
    /// Topic path to its subscription names
    topics: HashMap<String, Vec<String>>,
    next_sequence: i64,
    request_count: usize,
    requests: Vec<HttpRequest>,
}

impl Storage {
    fn new() -> Self {
        Self {
            entities: HashMap::new(),
            topics: HashMap::new(),
            next_sequence: 1,
            request_count: 0,
            requests: Vec::new(),
        }
    }
}

#[derive(Default)]
struct Entity {
    /// Ordered by sequence number, so the head is the first available entry
    messages: BTreeMap<i64, StoredMessage>,
}

impl Entity {
    /// Release expired locks and drop messages whose time to live has passed.
    fn sweep(&mut self, now: DateTime<Utc>) {
        for message in self.messages.values_mut() {
            if message.lock_expired(now) {
                message.transition(LifecycleEvent::LockExpired);
            }
        }
        self.messages
            .retain(|_, m| !(m.state.is_available() && m.is_stale(now)));
    }

    fn next_available(&mut self, now: DateTime<Utc>) -> Option<&mut StoredMessage> {
        self.messages
            .values_mut()
            .find(|m| m.state.is_available() && m.available_at <= now)
    }
}

#[derive(Clone)]
struct StoredMessage {
    sequence_number: i64,
    message_id: String,
    body: Bytes,
    content_type: Option<String>,
    properties: SendProperties,
    user_properties: BTreeMap<String, String>,
    enqueued_at: DateTime<Utc>,
    available_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    delivery_count: u32,
    state: MessageState,
    lock: Option<Lock>,
}

#[derive(Clone)]
struct Lock {
    token: String,
    locked_until: DateTime<Utc>,
}

impl StoredMessage {
    fn lock_expired(&self, now: DateTime<Utc>) -> bool {
        match &self.lock {
            Some(lock) => self.state == MessageState::Locked && now >= lock.locked_until,
            None => false,
        }
    }

    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }

    fn holds_lock(&self, token: &str) -> bool {
        self.state == MessageState::Locked
            && self.lock.as_ref().map(|l| l.token == token).unwrap_or(false)
    }

    /// Apply a lifecycle event whose validity the caller has already checked.
    fn transition(&mut self, event: LifecycleEvent) {
        if let Ok(next) = self.state.apply(event) {
            self.state = next;
            if next != MessageState::Locked {
                self.lock = None;
            }
        }
    }

    fn broker_properties(&self) -> BrokerProperties {
        let p = &self.properties;
        BrokerProperties {
            message_id: Some(self.message_id.clone()),
            correlation_id: p.correlation_id.clone(),
            session_id: p.session_id.clone(),
            label: p.label.clone(),
            reply_to: p.reply_to.clone(),
            reply_to_session_id: p.reply_to_session_id.clone(),
            to: p.to.clone(),
            partition_key: p.partition_key.clone(),
            delivery_count: self.delivery_count,
            sequence_number: self.sequence_number,
            enqueued_sequence_number: self.sequence_number,
            enqueued_time_utc: Some(self.enqueued_at),
            scheduled_enqueue_time_utc: p.scheduled_enqueue_time_utc,
            lock_token: self.lock.as_ref().map(|l| l.token.clone()),
            locked_until_utc: self.lock.as_ref().map(|l| l.locked_until),
            state: Some("Active".to_string()),
            time_to_live: p.time_to_live,
        }
    }
}

/// Where a request is aimed, once the URL has been taken apart
enum Target {
    Send,
    Head,
    Locked { sequence: i64, lock_token: String },
}

struct Route {
    entity: String,
    /// The URL up to and excluding `/messages`, used to build `Location`
    prefix: String,
    target: Target,
}

// ============================================================================
// InMemoryServiceBus
// ============================================================================

/// In-memory emulation of the Service Bus REST surface
#[derive(Clone)]
pub struct InMemoryServiceBus {
    storage: Arc<RwLock<Storage>>,
    config: MemoryConfig,
}

impl InMemoryServiceBus {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            storage: Arc::new(RwLock::new(Storage::new())),
            config,
        }
    }

    pub fn create_queue(&self, path: &str) {
        let mut storage = self.write();
        storage.entities.entry(path.to_string()).or_default();
    }

    pub fn create_topic(&self, path: &str) {
        let mut storage = self.write();
        storage.topics.entry(path.to_string()).or_default();
    }

    /// Add a subscription to `topic`, creating the topic if needed.
    ///
    /// Only messages sent after this call are delivered to it.
    pub fn create_subscription(&self, topic: &str, subscription: &str) {
        let mut storage = self.write();
        let subscriptions = storage.topics.entry(topic.to_string()).or_default();
        if !subscriptions.iter().any(|s| s == subscription) {
            subscriptions.push(subscription.to_string());
        }
        storage
            .entities
            .entry(subscription_path(topic, subscription))
            .or_default();
    }

    /// Number of messages still held by `entity`, locked or not
    pub fn message_count(&self, entity: &str) -> usize {
        self.read()
            .entities
            .get(entity)
            .map(|e| e.messages.len())
            .unwrap_or(0)
    }

    /// Number of messages in `entity` currently under a lock
    pub fn locked_count(&self, entity: &str) -> usize {
        self.read()
            .entities
            .get(entity)
            .map(|e| {
                e.messages
                    .values()
                    .filter(|m| m.state == MessageState::Locked)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Expire every lock now, as if the lock duration had passed.
    pub fn expire_all_locks(&self) {
        let mut storage = self.write();
        for entity in storage.entities.values_mut() {
            for message in entity.messages.values_mut() {
                if message.state == MessageState::Locked {
                    message.transition(LifecycleEvent::LockExpired);
                }
            }
        }
    }

    /// Every request received so far, in order.
    ///
    /// Empty unless the bus was created with [`MemoryConfig::with_request_log`].
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.read().requests.clone()
    }

    /// Number of requests received so far, whether or not they are logged
    pub fn request_count(&self) -> usize {
        self.read().request_count
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Storage> {
        self.storage.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Storage> {
        self.storage.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, request: &HttpRequest, now: DateTime<Utc>) -> HttpResponse {
        if let Err(response) = self.authorize(request, now) {
            return response;
        }

        let route = match parse_route(&request.url) {
            Some(route) => route,
            None => return error_response(400, "The request URL is not a messages resource."),
        };

        let mut storage = self.write();
        match (request.method, &route.target) {
            (Method::Post, Target::Send) => send(&mut storage, &route, request, now),
            (Method::Post, Target::Head) => self.peek_lock(&mut storage, &route, now),
            (Method::Delete, Target::Head) => receive_and_delete(&mut storage, &route, now),
            (method, Target::Locked { sequence, lock_token }) => {
                let event = match method {
                    Method::Delete => LifecycleEvent::Delete,
                    Method::Put => LifecycleEvent::Unlock,
                    Method::Post => LifecycleEvent::RenewLock,
                    Method::Get => {
                        return error_response(405, "The requested HTTP verb is not allowed.")
                    }
                };
                self.settle(&mut storage, &route, *sequence, lock_token, event, now)
            }
            _ => error_response(405, "The requested HTTP verb is not allowed."),
        }
    }

    /// Check the `Authorization` header and `api-version` parameter.
    fn authorize(&self, request: &HttpRequest, now: DateTime<Utc>) -> Result<(), HttpResponse> {
        let unauthorized = |detail: &str| error_response(401, detail);

        let header = request
            .header("Authorization")
            .ok_or_else(|| unauthorized("MissingToken: The authorization header was not found."))?;
        let token = header
            .strip_prefix(SAS_PREFIX)
            .ok_or_else(|| unauthorized("InvalidSignature: The token has an invalid signature."))?;

        if !has_api_version(&request.url) {
            return Err(error_response(400, "The api-version query parameter is required."));
        }

        let (key_name, key) = match &self.config.credentials {
            Some(credentials) => credentials,
            None => return Ok(()),
        };

        let fields: HashMap<&str, &str> = token
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .collect();
        let field = |name: &str| fields.get(name).copied().unwrap_or_default();

        let canonical = signer::canonicalize(&request.url);
        if field("sr") != canonical {
            return Err(unauthorized(
                "InvalidAudience: The token audience does not match the request.",
            ));
        }
        if field("skn") != key_name.as_str() {
            return Err(unauthorized("InvalidSignature: Unknown key name."));
        }
        let expiry = field("se");
        let expires_at = expiry.parse::<i64>().unwrap_or(0);
        if expires_at <= now.timestamp() {
            return Err(unauthorized("ExpiredToken: The token is expired."));
        }
        let expected = signer::sign(
            &signer::string_to_sign(&canonical, expiry),
            key.expose().as_bytes(),
        );
        if field("sig") != expected {
            return Err(unauthorized(
                "InvalidSignature: The token has an invalid signature.",
            ));
        }

        Ok(())
    }

    fn peek_lock(&self, storage: &mut Storage, route: &Route, now: DateTime<Utc>) -> HttpResponse {
        let entity = match storage.entities.get_mut(&route.entity) {
            Some(entity) => entity,
            None => return entity_not_found(&route.entity),
        };
        entity.sweep(now);

        let message = match entity.next_available(now) {
            Some(message) => message,
            None => return HttpResponse::new(204),
        };

        message.transition(LifecycleEvent::PeekLock);
        message.delivery_count += 1;
        message.lock = Some(Lock {
            token: uuid::Uuid::new_v4().to_string(),
            locked_until: self.lock_deadline(now),
        });

        let location = format!(
            "{}/messages/{}/{}",
            route.prefix,
            message.sequence_number,
            message.lock.as_ref().map(|l| l.token.as_str()).unwrap_or_default()
        );
        debug!(entity = %route.entity, sequence = message.sequence_number, "Emulator locked message");

        message_response(201, message).with_header(LOCATION_HEADER, location)
    }

    /// End of a lock taken at `now`; a duration past the calendar never ends.
    fn lock_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.config.lock_duration)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn settle(
        &self,
        storage: &mut Storage,
        route: &Route,
        sequence: i64,
        lock_token: &str,
        event: LifecycleEvent,
        now: DateTime<Utc>,
    ) -> HttpResponse {
        let entity = match storage.entities.get_mut(&route.entity) {
            Some(entity) => entity,
            None => return entity_not_found(&route.entity),
        };
        entity.sweep(now);

        let holds_lock = entity
            .messages
            .get(&sequence)
            .map(|m| m.holds_lock(lock_token))
            .unwrap_or(false);
        if !holds_lock {
            return error_response(
                410,
                "The lock supplied is invalid. Either the lock expired, or the message has already been removed from the queue.",
            );
        }

        if let Some(message) = entity.messages.get_mut(&sequence) {
            match event {
                LifecycleEvent::RenewLock => {
                    if let Some(lock) = message.lock.as_mut() {
                        lock.locked_until = self.lock_deadline(now);
                    }
                }
                _ => message.transition(event),
            }
        }
        if event == LifecycleEvent::Delete {
            entity.messages.remove(&sequence);
        }

        debug!(entity = %route.entity, sequence, event = %event, "Emulator settled message");
        HttpResponse::new(200)
    }
}

impl Default for InMemoryServiceBus {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

#[async_trait]
impl HttpTransport for InMemoryServiceBus {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let response = self.handle(&request, Utc::now());

        let mut storage = self.write();
        storage.request_count += 1;
        if self.config.record_requests {
            storage.requests.push(request);
        }
        Ok(response)
    }
}

// ============================================================================
// Request handlers
// ============================================================================

fn send(
    storage: &mut Storage,
    route: &Route,
    request: &HttpRequest,
    now: DateTime<Utc>,
) -> HttpResponse {
    let properties = match request.header(BROKER_PROPERTIES_HEADER) {
        Some(raw) => match serde_json::from_str::<SendProperties>(raw) {
            Ok(properties) => properties,
            Err(e) => return error_response(400, &format!("Invalid BrokerProperties: {}", e)),
        },
        None => SendProperties::default(),
    };

    let expires_at = match properties.time_to_live {
        Some(ttl) if !ttl.is_finite() || ttl < 0.0 => {
            return error_response(400, &format!("Invalid TimeToLive: {}", ttl));
        }
        Some(ttl) => expiry_after(now, ttl),
        None => None,
    };

    let targets: Vec<String> = if let Some(subscriptions) = storage.topics.get(&route.entity) {
        subscriptions
            .iter()
            .map(|s| subscription_path(&route.entity, s))
            .collect()
    } else if storage.entities.contains_key(&route.entity)
        && !route.entity.contains("/subscriptions/")
    {
        vec![route.entity.clone()]
    } else {
        return entity_not_found(&route.entity);
    };

    let sequence_number = storage.next_sequence;
    storage.next_sequence += 1;

    let message = StoredMessage {
        sequence_number,
        message_id: properties
            .message_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        body: request.body.clone(),
        content_type: request.header(CONTENT_TYPE_HEADER).map(str::to_string),
        user_properties: quoted_headers(&request.headers),
        enqueued_at: now,
        available_at: properties.scheduled_enqueue_time_utc.unwrap_or(now),
        expires_at,
        delivery_count: 0,
        state: MessageState::Unseen,
        lock: None,
        properties,
    };

    for target in targets {
        if let Some(entity) = storage.entities.get_mut(&target) {
            entity.messages.insert(sequence_number, message.clone());
        }
    }

    debug!(entity = %route.entity, sequence = sequence_number, "Emulator accepted message");
    HttpResponse::new(201)
}

fn receive_and_delete(storage: &mut Storage, route: &Route, now: DateTime<Utc>) -> HttpResponse {
    let entity = match storage.entities.get_mut(&route.entity) {
        Some(entity) => entity,
        None => return entity_not_found(&route.entity),
    };
    entity.sweep(now);

    let sequence = match entity.next_available(now) {
        Some(message) => {
            message.transition(LifecycleEvent::ReceiveAndDelete);
            message.delivery_count += 1;
            message.sequence_number
        }
        None => return HttpResponse::new(204),
    };

    match entity.messages.remove(&sequence) {
        Some(message) => message_response(200, &message),
        None => HttpResponse::new(204),
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Expiry for a time to live in seconds; `None` when it lies past the calendar.
fn expiry_after(now: DateTime<Utc>, ttl_seconds: f64) -> Option<DateTime<Utc>> {
    // Saturating cast; i64::MAX milliseconds is still a valid duration.
    let ttl = Duration::milliseconds((ttl_seconds * 1000.0) as i64);
    now.checked_add_signed(ttl)
}

fn subscription_path(topic: &str, subscription: &str) -> String {
    format!("{}/subscriptions/{}", topic, subscription)
}

fn has_api_version(url: &str) -> bool {
    url.split_once('?')
        .map(|(_, query)| {
            url::form_urlencoded::parse(query.as_bytes())
                .any(|(k, v)| k == "api-version" && !v.is_empty())
        })
        .unwrap_or(false)
}

fn parse_route(raw_url: &str) -> Option<Route> {
    let without_query = raw_url.split_once('?').map(|(u, _)| u).unwrap_or(raw_url);
    let parsed = url::Url::parse(without_query).ok()?;

    let segments: Vec<&str> = parsed.path().trim_matches('/').split('/').collect();
    let at = segments.iter().rposition(|s| *s == "messages")?;
    if at == 0 {
        return None;
    }

    let entity = segments[..at].join("/");
    let rest: Vec<&str> = segments[at + 1..]
        .iter()
        .copied()
        .filter(|s| !s.is_empty())
        .collect();

    let target = match rest.as_slice() {
        [] => Target::Send,
        ["head"] => Target::Head,
        [sequence, lock_token] => Target::Locked {
            sequence: sequence.parse().ok()?,
            lock_token: lock_token.to_string(),
        },
        _ => return None,
    };

    let prefix = without_query.rfind("/messages")?;
    Some(Route {
        entity,
        prefix: without_query[..prefix].to_string(),
        target,
    })
}

/// Headers with a JSON string value are custom message properties.
fn quoted_headers(headers: &[(String, String)]) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !is_standard_header(name))
        .filter(|(_, value)| value.len() >= 2 && value.starts_with('"') && value.ends_with('"'))
        .filter_map(|(name, value)| {
            serde_json::from_str::<String>(value)
                .ok()
                .map(|v| (name.clone(), v))
        })
        .collect()
}

fn message_response(status: u16, message: &StoredMessage) -> HttpResponse {
    let properties = serde_json::to_string(&message.broker_properties()).unwrap_or_default();

    let mut response = HttpResponse::new(status)
        .with_header(BROKER_PROPERTIES_HEADER, properties)
        .with_body(message.body.clone());
    if let Some(content_type) = &message.content_type {
        response = response.with_header(CONTENT_TYPE_HEADER, content_type.as_str());
    }
    for (name, value) in &message.user_properties {
        response = response.with_header(
            name.as_str(),
            serde_json::Value::String(value.clone()).to_string(),
        );
    }
    response
}

fn entity_not_found(entity: &str) -> HttpResponse {
    error_response(
        404,
        &format!("The messaging entity '{}' could not be found.", entity),
    )
}

fn error_response(status: u16, detail: &str) -> HttpResponse {
    let body = format!(
        "<Error><Code>{}</Code><Detail>{}</Detail></Error>",
        status,
        xml_escape(detail)
    );
    HttpResponse::new(status)
        .with_header(CONTENT_TYPE_HEADER, "application/xml; charset=utf-8")
        .with_body(body)
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
