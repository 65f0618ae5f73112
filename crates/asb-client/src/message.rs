//! Message types for send and receive operations.
//!
//! Outbound and inbound messages are deliberately separate types. An
//! [`OutboundMessage`] only knows the properties a sender may set; a
//! [`ReceivedMessage`] additionally carries the server-assigned lock token,
//! sequence number and location. The two share only the body.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;

// ============================================================================
// Outbound
// ============================================================================

/// Sender-controlled broker properties, sent as the `BrokerProperties`
/// request header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SendProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "rfc1123::option"
    )]
    pub scheduled_enqueue_time_utc: Option<DateTime<Utc>>,
    /// Time to live in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_live: Option<f64>,
}

impl SendProperties {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// A message composed for sending
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Raw payload, sent as the request body unmodified
    pub body: Bytes,
    pub content_type: Option<String>,
    pub properties: SendProperties,
    /// Custom properties, sent as individual request headers
    pub user_properties: BTreeMap<String, String>,
}

impl OutboundMessage {
    /// Create new message with body
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            content_type: None,
            properties: SendProperties::default(),
            user_properties: BTreeMap::new(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.properties.message_id = Some(message_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.properties.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.properties.session_id = Some(session_id.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.properties.label = Some(label.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.properties.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.properties.to = Some(to.into());
        self
    }

    pub fn with_partition_key(mut self, partition_key: impl Into<String>) -> Self {
        self.properties.partition_key = Some(partition_key.into());
        self
    }

    /// Deliver no earlier than `time`
    pub fn with_scheduled_enqueue_time(mut self, time: DateTime<Utc>) -> Self {
        self.properties.scheduled_enqueue_time_utc = Some(time);
        self
    }

    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.properties.time_to_live = Some(ttl.num_milliseconds() as f64 / 1000.0);
        self
    }

    pub fn with_user_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_properties.insert(key.into(), value.into());
        self
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// Broker properties returned by the service in the `BrokerProperties`
/// response header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BrokerProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub delivery_count: u32,
    #[serde(default)]
    pub sequence_number: i64,
    #[serde(default)]
    pub enqueued_sequence_number: i64,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "rfc1123::option"
    )]
    pub enqueued_time_utc: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "rfc1123::option"
    )]
    pub scheduled_enqueue_time_utc: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_token: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "rfc1123::option"
    )]
    pub locked_until_utc: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_live: Option<f64>,
}

/// A message received from a queue or subscription
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub properties: BrokerProperties,
    pub content_type: Option<String>,
    pub user_properties: BTreeMap<String, String>,
    /// Address of this locked instance, used for delete, unlock and renew.
    /// Absent for messages obtained by a destructive read.
    pub location: Option<String>,
    pub body: Bytes,
}

impl ReceivedMessage {
    pub fn message_id(&self) -> Option<&str> {
        self.properties.message_id.as_deref()
    }

    pub fn lock_token(&self) -> Option<&str> {
        self.properties.lock_token.as_deref()
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn delivery_count(&self) -> u32 {
        self.properties.delivery_count
    }

    pub fn sequence_number(&self) -> i64 {
        self.properties.sequence_number
    }

    /// Whether this message holds a peek-lock that can be settled
    pub fn is_locked(&self) -> bool {
        self.location.is_some() && self.properties.lock_token.is_some()
    }

    /// Check if the lock has passed its server-reported expiry.
    ///
    /// Advisory only; the service decides whether a lock is still held.
    pub fn is_lock_expired(&self, now: DateTime<Utc>) -> bool {
        match self.properties.locked_until_utc {
            Some(until) => now >= until,
            None => false,
        }
    }

    /// Convert back into an outbound message, for forwarding
    pub fn to_outbound(&self) -> OutboundMessage {
        let p = &self.properties;
        OutboundMessage {
            body: self.body.clone(),
            content_type: self.content_type.clone(),
            properties: SendProperties {
                message_id: p.message_id.clone(),
                correlation_id: p.correlation_id.clone(),
                session_id: p.session_id.clone(),
                label: p.label.clone(),
                reply_to: p.reply_to.clone(),
                reply_to_session_id: p.reply_to_session_id.clone(),
                to: p.to.clone(),
                partition_key: p.partition_key.clone(),
                scheduled_enqueue_time_utc: None,
                time_to_live: p.time_to_live,
            },
            user_properties: self.user_properties.clone(),
        }
    }
}

// ============================================================================
// RFC 1123 timestamps
// ============================================================================

/// Timestamps on the wire use RFC 1123, e.g. `Mon, 25 Apr 2016 12:44:44 GMT`.
pub mod rfc1123 {
    use chrono::{DateTime, Utc};

    const FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

    pub fn format(time: &DateTime<Utc>) -> String {
        time.format(FORMAT).to_string()
    }

    pub fn parse(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        DateTime::parse_from_rfc2822(value.trim()).map(|dt| dt.with_timezone(&Utc))
    }

    /// Serde adapter for `Option<DateTime<Utc>>`; `null` maps to `None`.
    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(time) => serializer.serialize_str(&super::format(time)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let raw = Option::<String>::deserialize(deserializer)?;
            match raw {
                None => Ok(None),
                Some(s) if s.is_empty() => Ok(None),
                Some(s) => super::parse(&s)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
            }
        }
    }
}
