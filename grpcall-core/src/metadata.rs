//! Response metadata view.
//!
//! [`Metadata`] wraps the header block of a response (initial headers or
//! trailers). Lookups and iteration skip protocol-reserved entries so
//! application code only sees the metadata a server chose to send; the
//! complete block stays reachable through [`Metadata::raw`].

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use bytes::Bytes;
use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};

pub const GRPC_STATUS: &str = "grpc-status";
pub const GRPC_MESSAGE: &str = "grpc-message";
pub const GRPC_STATUS_DETAILS: &str = "grpc-status-details-bin";
pub const GRPC_ENCODING: &str = "grpc-encoding";
pub const GRPC_ACCEPT_ENCODING: &str = "grpc-accept-encoding";
pub const GRPC_TIMEOUT: &str = "grpc-timeout";

/// Suffix marking base64-encoded binary metadata.
pub const BINARY_SUFFIX: &str = "-bin";

const RESERVED: &[&str] = &[
    "content-type",
    "content-length",
    "te",
    GRPC_STATUS,
    GRPC_MESSAGE,
    GRPC_STATUS_DETAILS,
    GRPC_ENCODING,
    GRPC_ACCEPT_ENCODING,
    GRPC_TIMEOUT,
];

/// Whether `name` is managed by the protocol rather than the application.
pub fn is_reserved_header(name: &str) -> bool {
    name.starts_with(':') || RESERVED.iter().any(|r| name.eq_ignore_ascii_case(r))
}

/// Ordered, case-insensitive header block with an application view.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    headers: HeaderMap,
}

impl Metadata {
    pub fn new(headers: HeaderMap) -> Self {
        Self { headers }
    }

    /// The complete header block, reserved entries included.
    pub fn raw(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn into_raw(self) -> HeaderMap {
        self.headers
    }

    /// First value for an application key.
    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        if is_reserved_header(key) {
            return None;
        }
        self.headers.get(key)
    }

    /// First value for an application key, if it is valid visible ASCII.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.to_str().ok())
    }

    /// Decode a binary (`-bin`) entry. Padded and unpadded base64 are both
    /// accepted.
    pub fn get_bin(&self, key: &str) -> Option<Bytes> {
        if !key.ends_with(BINARY_SUFFIX) {
            return None;
        }
        self.headers.get(key).and_then(decode_binary)
    }

    /// All values for an application key.
    pub fn get_all<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a HeaderValue> + 'a {
        let values = if is_reserved_header(key) {
            None
        } else {
            Some(self.headers.get_all(key).iter())
        };
        values.into_iter().flatten()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Application entries in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &HeaderValue)> {
        self.headers
            .iter()
            .filter(|(name, _)| !is_reserved_header(name.as_str()))
    }

    /// Number of application entries.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<HeaderMap> for Metadata {
    fn from(headers: HeaderMap) -> Self {
        Self::new(headers)
    }
}

/// Decode a base64 header value, padded or not.
pub fn decode_binary(value: &HeaderValue) -> Option<Bytes> {
    let raw = value.as_bytes();
    STANDARD
        .decode(raw)
        .or_else(|_| STANDARD_NO_PAD.decode(raw))
        .ok()
        .map(Bytes::from)
}

/// Encode bytes for a `-bin` header, without padding.
pub fn encode_binary(value: &[u8]) -> HeaderValue {
    // base64 output is always a valid header value
    HeaderValue::from_str(&STANDARD_NO_PAD.encode(value))
        .unwrap_or_else(|_| HeaderValue::from_static(""))
}
