//! Client identity and configuration.

use crate::error::ConfigurationError;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;
use zeroize::Zeroizing;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Address template for a namespace
pub const SERVICE_BUS_URL: &str = "https://{namespace}.servicebus.windows.net:443/";

const SERVICE_BUS_HOST_SUFFIX: &str = ".servicebus.windows.net";

fn default_request_timeout_seconds() -> u64 {
    60
}

/// Kind of messaging entity the client talks to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    #[default]
    Queue,
    /// Topics receive through a named subscription
    Topic,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue => write!(f, "queue"),
            Self::Topic => write!(f, "topic"),
        }
    }
}

/// Shared access key secret. Zeroed on drop and never printed.
#[derive(Clone)]
pub struct SecretKey(Zeroizing<String>);

impl SecretKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<redacted>")
    }
}

impl<'de> Deserialize<'de> for SecretKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(SecretKey::new)
    }
}

/// Everything needed to address and authenticate against one namespace.
///
/// Read-only once built, so one identity can back any number of concurrent
/// operations.
///
/// # Examples
///
/// ```
/// use asb_client::{ClientIdentity, EntityKind};
///
/// let identity = ClientIdentity::new(EntityKind::Topic, "tester", "RootManageSharedAccessKey", "secret")
///     .with_subscription("audit");
///
/// assert_eq!(identity.base_url(), "https://tester.servicebus.windows.net:443/");
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ClientIdentity {
    pub namespace: String,
    #[serde(default)]
    pub entity_kind: EntityKind,
    #[serde(default)]
    pub subscription: Option<String>,
    pub key_name: String,
    pub key: SecretKey,
    /// Overrides the address derived from the namespace
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

impl ClientIdentity {
    pub fn new(
        entity_kind: EntityKind,
        namespace: impl Into<String>,
        key_name: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            entity_kind,
            subscription: None,
            key_name: key_name.into(),
            key: SecretKey::new(key),
            endpoint: None,
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }

    /// Build an identity from a connection string of the form
    /// `Endpoint=sb://<namespace>.servicebus.windows.net/;SharedAccessKeyName=<name>;SharedAccessKey=<key>`.
    pub fn from_connection_string(
        entity_kind: EntityKind,
        connection_string: &str,
    ) -> Result<Self, ConfigurationError> {
        let parsed = ConnectionString::parse(connection_string)?;

        let (namespace, endpoint) = match parsed.host.strip_suffix(SERVICE_BUS_HOST_SUFFIX) {
            Some(namespace) => (namespace.to_string(), None),
            None => {
                let namespace = parsed
                    .host
                    .split('.')
                    .next()
                    .unwrap_or_default()
                    .to_string();
                (namespace, Some(format!("https://{}/", parsed.host)))
            }
        };

        Ok(Self {
            namespace,
            entity_kind,
            subscription: None,
            key_name: parsed.key_name,
            key: parsed.key,
            endpoint,
            request_timeout_seconds: default_request_timeout_seconds(),
        })
    }

    /// Set the subscription used by topic receive operations.
    ///
    /// This is part of construction; an identity is not mutated after it is
    /// handed to a client.
    pub fn with_subscription(mut self, subscription: impl Into<String>) -> Self {
        self.subscription = Some(subscription.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_seconds = timeout.as_secs();
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Base address of the namespace, always ending in `/`.
    pub fn base_url(&self) -> String {
        let mut url = match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => SERVICE_BUS_URL.replace("{namespace}", &self.namespace),
        };
        if !url.ends_with('/') {
            url.push('/');
        }
        url
    }

    /// Check the identity is complete.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.namespace.trim().is_empty() && self.endpoint.is_none() {
            return Err(ConfigurationError::Missing {
                key: "namespace".to_string(),
            });
        }

        if self.key_name.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "key_name".to_string(),
            });
        }

        if self.key.is_empty() {
            return Err(ConfigurationError::Missing {
                key: "key".to_string(),
            });
        }

        if let Some(subscription) = &self.subscription {
            if subscription.trim().is_empty() {
                return Err(ConfigurationError::Invalid {
                    message: "subscription must not be empty when set".to_string(),
                });
            }
            if self.entity_kind == EntityKind::Queue {
                return Err(ConfigurationError::Invalid {
                    message: "subscriptions only apply to topics".to_string(),
                });
            }
        }

        if let Some(endpoint) = &self.endpoint {
            url::Url::parse(endpoint).map_err(|e| ConfigurationError::Invalid {
                message: format!("endpoint '{}' is not a valid URL: {}", endpoint, e),
            })?;
        }

        Ok(())
    }
}

/// The parts of a namespace connection string this client uses
#[derive(Debug, Clone)]
pub struct ConnectionString {
    /// Host (and port, if given) of the `Endpoint`
    pub host: String,
    pub key_name: String,
    pub key: SecretKey,
    pub entity_path: Option<String>,
}

impl ConnectionString {
    /// Parse `Key=Value;` pairs. Unknown keys are ignored.
    pub fn parse(value: &str) -> Result<Self, ConfigurationError> {
        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;
        let mut entity_path = None;

        for part in value.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((name, val)) = part.split_once('=') else {
                return Err(ConfigurationError::Invalid {
                    message: "connection string segment is missing '='".to_string(),
                });
            };

            match name.trim() {
                "Endpoint" => endpoint = Some(val.trim().to_string()),
                "SharedAccessKeyName" => key_name = Some(val.trim().to_string()),
                "SharedAccessKey" => key = Some(SecretKey::new(val.trim())),
                "EntityPath" => entity_path = Some(val.trim().to_string()),
                _ => {}
            }
        }

        let endpoint = endpoint.ok_or_else(|| ConfigurationError::Missing {
            key: "Endpoint".to_string(),
        })?;
        let key_name = key_name.ok_or_else(|| ConfigurationError::Missing {
            key: "SharedAccessKeyName".to_string(),
        })?;
        let key = key.ok_or_else(|| ConfigurationError::Missing {
            key: "SharedAccessKey".to_string(),
        })?;

        let url = url::Url::parse(&endpoint).map_err(|e| ConfigurationError::Invalid {
            message: format!("Endpoint '{}' is not a valid URL: {}", endpoint, e),
        })?;
        let host = url
            .host_str()
            .ok_or_else(|| ConfigurationError::Invalid {
                message: format!("Endpoint '{}' has no host", endpoint),
            })?
            .to_string();
        let host = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host,
        };

        Ok(Self {
            host,
            key_name,
            key,
            entity_path,
        })
    }
}
