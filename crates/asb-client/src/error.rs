//! Error types for Service Bus operations.
//!
//! Every failure is handed straight back to the caller; nothing in this crate
//! retries. [`ServiceBusError::is_transient`] exists so that callers can build
//! their own retry policy on top.

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Result alias used by all client operations.
pub type Result<T> = std::result::Result<T, ServiceBusError>;

/// Top-level error for all client operations
#[derive(Debug, Error)]
pub enum ServiceBusError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Protocol(#[from] ProtocolError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl ServiceBusError {
    /// Check if the failure is worth retrying by the caller.
    ///
    /// Transport failures, server errors (5xx), request timeouts (408) and
    /// throttling (429) are transient. Configuration, validation and decode
    /// errors never are.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Protocol(e) => e.status >= 500 || e.status == 408 || e.status == 429,
            Self::Configuration(_) => false,
            Self::Decode(_) => false,
            Self::Validation(_) => false,
        }
    }

    /// HTTP status returned by the service, if the failure came from one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Protocol(e) => Some(e.status),
            _ => None,
        }
    }
}

/// Local configuration problems, detected before any request is made
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("A subscription is required for Service Bus topic receive operations")]
    SubscriptionRequired,

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// Failures of the underlying HTTP exchange itself
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Request timed out: {message}")]
    Timeout { message: String },

    #[error("Connection failed: {message}")]
    Connection { message: String },

    #[error("HTTP request failed: {message}")]
    Request { message: String },

    #[error("Failed to read response body: {message}")]
    Body { message: String },
}

/// A success status was returned but the response could not be decoded
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Error unmarshalling BrokerProperties: {0}")]
    BrokerProperties(#[source] serde_json::Error),

    #[error("Response header '{header}' is missing")]
    MissingHeader { header: String },

    #[error("BrokerProperties is missing required field '{field}'")]
    MissingField { field: String },
}

/// Problems with caller-supplied values
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },
}

/// A non-success status returned by the service.
///
/// When the body carries a structured error the `code` and `detail` are
/// populated; otherwise only the status and the raw body text are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub status: u16,
    pub code: Option<i64>,
    pub detail: Option<String>,
    pub raw_body: String,
}

impl ProtocolError {
    /// Decode an error response body.
    ///
    /// Tries the XML error document first, then the JSON shapes the service
    /// has used. Falls back to the raw status and text when neither parses.
    pub fn from_response(status: u16, body: &[u8]) -> Self {
        let raw_body = String::from_utf8_lossy(body).into_owned();

        let decoded = if raw_body.trim().is_empty() {
            None
        } else {
            parse_xml_error(&raw_body).or_else(|| parse_json_error(&raw_body))
        };

        let (code, detail) = decoded.unwrap_or((None, None));
        Self {
            status,
            code,
            detail,
            raw_body,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.detail, self.code) {
            (Some(detail), Some(code)) => write!(f, "{} (Code: {})", detail, code),
            (Some(detail), None) => write!(f, "{} (returned code: {})", detail, self.status),
            (None, Some(code)) => write!(f, "returned code: {} (Code: {})", self.status, code),
            (None, None) if self.raw_body.trim().is_empty() => {
                write!(f, "returned code: {}", self.status)
            }
            (None, None) => write!(f, "{} (returned code: {})", self.raw_body, self.status),
        }
    }
}

impl std::error::Error for ProtocolError {}

type DecodedError = (Option<i64>, Option<String>);

fn parse_xml_error(xml: &str) -> Option<DecodedError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut saw_error = false;
    let mut in_code = false;
    let mut in_detail = false;
    let mut code = None;
    let mut detail = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"Error" => saw_error = true,
                b"Code" if saw_error => in_code = true,
                b"Detail" if saw_error => in_detail = true,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                let text = e.unescape().ok().map(|s| s.trim().to_string());
                if in_code {
                    code = text.and_then(|t| t.parse::<i64>().ok());
                } else if in_detail {
                    detail = text;
                }
            }
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"Code" => in_code = false,
                b"Detail" => in_detail = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }

    if saw_error && (code.is_some() || detail.is_some()) {
        Some((code, detail))
    } else {
        None
    }
}

#[derive(Deserialize)]
struct FlatJsonError {
    #[serde(rename = "Code", alias = "code")]
    code: Option<serde_json::Value>,
    #[serde(rename = "Detail", alias = "detail", alias = "message", alias = "Message")]
    detail: Option<String>,
}

#[derive(Deserialize)]
struct NestedJsonError {
    error: FlatJsonError,
}

fn parse_json_error(json: &str) -> Option<DecodedError> {
    let flat = serde_json::from_str::<NestedJsonError>(json)
        .map(|n| n.error)
        .or_else(|_| serde_json::from_str::<FlatJsonError>(json))
        .ok()?;

    let code = flat.code.and_then(|v| match v {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse::<i64>().ok(),
        _ => None,
    });

    if code.is_none() && flat.detail.is_none() {
        return None;
    }

    Some((code, flat.detail))
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
