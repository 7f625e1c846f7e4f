//! Outbound request headers.
//!
//! [`HeaderContext`] assembles the request line and header block for one
//! call. The protocol-owned entries are written first and always win; the
//! caller's custom headers and credential headers follow, minus any name
//! the protocol reserves.

use std::time::Duration;

use grpcall_core::{GRPC_ACCEPT_ENCODING, GRPC_ENCODING, GRPC_TIMEOUT, is_reserved_header};
use http::header::{CONTENT_TYPE, TE, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method, Request, Uri, Version};

use crate::config::ProtocolConfig;
use crate::deadline::encode_timeout;
use crate::error::ClientError;

pub const CONTENT_TYPE_GRPC: &str = "application/grpc";

/// `application/grpc` or `application/grpc+<subtype>`.
pub fn content_type(subtype: Option<&str>) -> String {
    match subtype {
        Some(subtype) => format!("{CONTENT_TYPE_GRPC}+{subtype}"),
        None => CONTENT_TYPE_GRPC.to_string(),
    }
}

/// Whether a response content-type belongs to this protocol.
pub fn is_grpc_content_type(value: &HeaderValue) -> bool {
    let Ok(value) = value.to_str() else {
        return false;
    };
    let value = value.trim();
    match value.get(..CONTENT_TYPE_GRPC.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(CONTENT_TYPE_GRPC) => {
            matches!(value.as_bytes().get(CONTENT_TYPE_GRPC.len()), None | Some(b'+' | b';'))
        }
        _ => false,
    }
}

/// Builder for the outbound side of one call.
#[derive(Debug)]
pub struct HeaderContext<'a> {
    pub config: &'a ProtocolConfig,
    /// Full method path, `/<service>/<method>`.
    pub path: &'a str,
    pub content_subtype: Option<&'static str>,
    /// Request encoding, if a non-identity codec was chosen.
    pub encoding: Option<&'static str>,
    /// Time left until the deadline.
    pub timeout: Option<Duration>,
}

impl HeaderContext<'_> {
    /// Target URI: `base` with the method path appended to its path prefix.
    pub fn uri(&self, base: &Uri) -> Result<Uri, ClientError> {
        let prefix = base.path().trim_end_matches('/');
        let mut parts = base.clone().into_parts();
        parts.path_and_query = Some(
            format!("{prefix}{}", self.path)
                .parse()
                .map_err(|e| ClientError::InvalidRequest(format!("invalid method path: {e}")))?,
        );
        Uri::from_parts(parts).map_err(|e| ClientError::InvalidRequest(e.to_string()))
    }

    /// Protocol headers followed by `custom`, in that order.
    pub fn headers(&self, custom: &HeaderMap) -> Result<HeaderMap, ClientError> {
        let invalid = |e: http::header::InvalidHeaderValue| {
            ClientError::InvalidRequest(format!("invalid header value: {e}"))
        };

        let mut headers = HeaderMap::with_capacity(6 + custom.len());
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::try_from(content_type(self.content_subtype)).map_err(invalid)?,
        );
        headers.insert(TE, HeaderValue::from_static("trailers"));
        headers.insert(
            GRPC_ACCEPT_ENCODING,
            HeaderValue::try_from(self.config.registry().accept_encoding_header())
                .map_err(invalid)?,
        );
        if let Some(encoding) = self.encoding {
            headers.insert(GRPC_ENCODING, HeaderValue::from_static(encoding));
        }
        if let Some(timeout) = self.timeout {
            headers.insert(
                GRPC_TIMEOUT,
                HeaderValue::try_from(encode_timeout(timeout)).map_err(invalid)?,
            );
        }
        headers.insert(
            USER_AGENT,
            HeaderValue::try_from(self.config.user_agent()).map_err(invalid)?,
        );
        append_custom(&mut headers, custom);
        Ok(headers)
    }

    /// Full request for `base` carrying `body`.
    pub fn request<B>(
        &self,
        base: &Uri,
        custom: &HeaderMap,
        body: B,
    ) -> Result<Request<B>, ClientError> {
        let mut request = Request::new(body);
        *request.method_mut() = Method::POST;
        *request.uri_mut() = self.uri(base)?;
        *request.version_mut() = Version::HTTP_2;
        *request.headers_mut() = self.headers(custom)?;
        Ok(request)
    }
}

/// Append non-reserved entries of `custom` to `headers`.
pub fn append_custom(headers: &mut HeaderMap, custom: &HeaderMap) {
    for (name, value) in custom {
        if is_reserved_header(name.as_str()) || *name == USER_AGENT {
            tracing::debug!(header = %name, "dropping reserved custom header");
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
}
