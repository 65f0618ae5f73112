//! `reqwest`-backed transport.

use super::{HttpRequest, HttpResponse, HttpTransport, Method};
use crate::error::TransportError;
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use std::time::Duration;

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;

/// Default transport over a pooled `reqwest` client
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http_client: HttpClient,
}

impl ReqwestTransport {
    /// Create a transport whose requests are bounded by `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let http_client = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Request {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self { http_client })
    }

    /// Wrap an existing client, e.g. one shared with the rest of an application.
    pub fn from_client(http_client: HttpClient) -> Self {
        Self { http_client }
    }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Delete => reqwest::Method::DELETE,
    }
}

fn map_send_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout {
            message: e.to_string(),
        }
    } else if e.is_connect() {
        TransportError::Connection {
            message: e.to_string(),
        }
    } else {
        TransportError::Request {
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self
            .http_client
            .request(to_reqwest_method(request.method), &request.url);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        // An empty body still goes out, so POSTs carry Content-Length: 0.
        let response = builder
            .body(request.body)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        // Reading to the end releases the connection back to the pool.
        let body = response.bytes().await.map_err(|e| TransportError::Body {
            message: e.to_string(),
        })?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
