//! Final status resolution.
//!
//! Every call ends with exactly one [`Status`]. In priority order it comes
//! from an explicit `grpc-status` (trailers, or headers for a trailers-only
//! response), from a transport failure (`Unavailable`), from a framing or
//! deserialization failure (`Internal`), or from cancellation. A response
//! that never produced its expected message is never reported as `OK`.

use std::borrow::Cow;

use grpcall_core::{
    Code, DESERIALIZE_FAILURE_DETAIL, GRPC_MESSAGE, GRPC_STATUS, GRPC_STATUS_DETAILS, Status,
    decode_binary,
};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, StatusCode};

use crate::headers::is_grpc_content_type;

/// Detail used when a response produced its message but no status.
pub const MISSING_STATUS_DETAIL: &str = "No grpc-status found on response.";

/// Percent-decode a `grpc-message` value. Undecodable input is kept as is.
pub fn decode_message(raw: &HeaderValue) -> String {
    let text = String::from_utf8_lossy(raw.as_bytes());
    match urlencoding::decode(&text) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => text.into_owned(),
    }
}

/// Percent-encode a detail string for `grpc-message`.
pub fn encode_message(message: &str) -> Cow<'_, str> {
    urlencoding::encode(message)
}

/// Status carried by `grpc-status` in `headers`, if present.
pub fn from_headers(headers: &HeaderMap) -> Option<Status> {
    let code = Code::from_header_value(headers.get(GRPC_STATUS)?.as_bytes());
    let mut status = match headers.get(GRPC_MESSAGE) {
        Some(message) => Status::new(code, decode_message(message)),
        None => Status::from_code(code),
    };
    if let Some(details) = headers.get(GRPC_STATUS_DETAILS).and_then(decode_binary) {
        status = status.with_details(details);
    }
    Some(status)
}

/// Code for a response that failed at the HTTP layer.
pub fn http_status_to_code(status: StatusCode) -> Code {
    match status.as_u16() {
        400 => Code::Internal,
        401 => Code::Unauthenticated,
        403 => Code::PermissionDenied,
        404 => Code::Unimplemented,
        429 | 502 | 503 | 504 => Code::Unavailable,
        _ => Code::Unknown,
    }
}

/// Reject a response whose initial headers cannot start a valid exchange.
///
/// Only consulted when the headers carry no `grpc-status`.
pub fn validate_response(http_status: StatusCode, headers: &HeaderMap) -> Result<(), Status> {
    if http_status != StatusCode::OK {
        return Err(Status::new(
            http_status_to_code(http_status),
            format!(
                "Bad gRPC response. HTTP status code: {}",
                http_status.as_u16()
            ),
        ));
    }
    match headers.get(CONTENT_TYPE) {
        Some(value) if is_grpc_content_type(value) => Ok(()),
        other => Err(Status::internal(format!(
            "Bad gRPC response. Invalid content-type value: {}",
            other
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .unwrap_or_default()
        ))),
    }
}

/// Status once the body is finished after at least one message (or at the
/// end of a message stream): the trailer status, or `Internal` when the
/// server sent none.
pub fn after_message(trailers: Option<&HeaderMap>) -> Status {
    trailers
        .and_then(from_headers)
        .unwrap_or_else(|| Status::internal(MISSING_STATUS_DETAIL))
}

/// Status when the body ended before the expected message.
///
/// A non-OK trailer status explains the missing message and wins;
/// otherwise the absence is a deserialization failure.
pub fn missing_message(trailers: Option<&HeaderMap>) -> Status {
    match trailers.and_then(from_headers) {
        Some(status) if !status.is_ok() => status,
        _ => Status::internal(DESERIALIZE_FAILURE_DETAIL),
    }
}
