//! Shared Access Signature (SAS) signing.
//!
//! Every request to the service carries an `Authorization` header computed
//! from the request URI, a key name and a shared secret:
//!
//! ```text
//! SharedAccessSignature sig=<signature>&se=<expiry>&skn=<key name>&sr=<canonical uri>
//! ```
//!
//! The signing process:
//! 1. Canonicalize the full request URI (percent-encode everything outside
//!    `A-Z a-z 0-9 - _ . ~`, then lower-case the result)
//! 2. Compute the expiry (now + 300 seconds, rounded to whole seconds)
//! 3. Build the string to sign: `<canonical uri>\n<expiry>`
//! 4. HMAC-SHA256 it with the shared secret, base64 encode, percent-encode
//!
//! The encoded alphabet is fixed by known-good vectors rather than derived;
//! the service rejects a mismatched canonical URI with a bare 401.
//!
//! ## References
//!
//! - [Service Bus access control with Shared Access Signatures](https://learn.microsoft.com/azure/service-bus-messaging/service-bus-sas)

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroizing;

#[cfg(test)]
#[path = "signer_tests.rs"]
mod tests;

type HmacSha256 = Hmac<Sha256>;

/// Lifetime of every signature, in seconds.
pub const SIGNATURE_VALIDITY_SECONDS: i64 = 300;

/// Compute the signature expiry as Unix epoch seconds.
///
/// Adds [`SIGNATURE_VALIDITY_SECONDS`] to `now` and rounds half-up to the
/// nearest whole second.
pub fn compute_expiry(now: DateTime<Utc>) -> String {
    let expires = now + Duration::seconds(SIGNATURE_VALIDITY_SECONDS);
    let mut seconds = expires.timestamp();
    if expires.timestamp_subsec_nanos() >= 500_000_000 {
        seconds += 1;
    }
    seconds.to_string()
}

/// Canonical form of a request URI: fully percent-encoded, then lower-cased.
///
/// Not idempotent: applying it twice re-escapes the `%` signs.
pub fn canonicalize(uri: &str) -> String {
    urlencoding::encode(uri).to_lowercase()
}

/// The exact bytes that get signed.
pub fn string_to_sign(canonical_uri: &str, expiry: &str) -> String {
    format!("{}\n{}", canonical_uri, expiry)
}

/// HMAC-SHA256 over `input`, base64 encoded, then percent-encoded.
pub fn sign(input: &str, secret: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(input.as_bytes());
    let encoded = STANDARD.encode(mac.finalize().into_bytes());
    urlencoding::encode(&encoded).into_owned()
}

/// Assemble the `Authorization` header value for `uri`.
pub fn auth_header(uri: &str, expiry: &str, key_name: &str, secret: &[u8]) -> String {
    let canonical = canonicalize(uri);
    let signature = sign(&string_to_sign(&canonical, expiry), secret);
    format_header(&signature, expiry, key_name, &canonical)
}

fn format_header(signature: &str, expiry: &str, key_name: &str, canonical_uri: &str) -> String {
    format!(
        "SharedAccessSignature sig={}&se={}&skn={}&sr={}",
        signature, expiry, key_name, canonical_uri
    )
}

/// One signed HTTP call. Built per request and never stored.
#[derive(Clone, PartialEq, Eq)]
pub struct SignedRequest {
    pub method: String,
    /// The request URI exactly as sent, `api-version` included
    pub uri: String,
    pub canonical_uri: String,
    pub expiry: String,
    pub signature: String,
    pub authorization: String,
}

impl fmt::Debug for SignedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedRequest")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("expiry", &self.expiry)
            .field("signature", &"<redacted>")
            .finish()
    }
}

/// Holds the key name and secret for one namespace and signs request URIs.
#[derive(Clone)]
pub struct SasSigner {
    key_name: String,
    key: Zeroizing<Vec<u8>>,
}

impl SasSigner {
    /// Create a signer for the given shared access key.
    ///
    /// The key is used as raw bytes exactly as configured; it is not base64
    /// decoded first.
    pub fn new(key_name: impl Into<String>, key: impl AsRef<[u8]>) -> Self {
        Self {
            key_name: key_name.into(),
            key: Zeroizing::new(key.as_ref().to_vec()),
        }
    }

    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    /// Authorization header for `uri` with an explicit expiry.
    pub fn auth_header(&self, uri: &str, expiry: &str) -> String {
        auth_header(uri, expiry, &self.key_name, &self.key)
    }

    /// Sign `uri` for `method`, with the expiry computed from `now`.
    pub fn sign_request(&self, method: &str, uri: &str, now: DateTime<Utc>) -> SignedRequest {
        let expiry = compute_expiry(now);
        let canonical_uri = canonicalize(uri);
        let signature = sign(&string_to_sign(&canonical_uri, &expiry), &self.key);
        let authorization = format_header(&signature, &expiry, &self.key_name, &canonical_uri);

        SignedRequest {
            method: method.to_string(),
            uri: uri.to_string(),
            canonical_uri,
            expiry,
            signature,
            authorization,
        }
    }
}

impl fmt::Debug for SasSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SasSigner")
            .field("key_name", &self.key_name)
            .field("key", &"<redacted>")
            .finish()
    }
}
