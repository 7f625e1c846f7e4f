//! Protocol-wide configuration.
//!
//! [`ProtocolConfig`] is built once, frozen behind an `Arc`, and read by
//! every call the invoker starts.

use std::time::Duration;

use grpcall_core::{CompressionConfig, CompressionRegistry};

/// Default cap on a single inbound message, after decompression.
pub const DEFAULT_MAX_RECEIVE_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Product name sent in `user-agent` unless overridden.
pub const DEFAULT_USER_AGENT_NAME: &str = "grpcall-rust";

/// Capacity of the per-call message channels between the caller and the
/// tasks driving the exchange.
pub const DEFAULT_STREAM_BUFFER: usize = 16;

/// Strip semver build metadata (`1.2.3+abc` → `1.2.3`).
pub fn strip_build_metadata(version: &str) -> &str {
    version.split_once('+').map_or(version, |(v, _)| v)
}

/// Immutable protocol settings shared by all calls.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub(crate) user_agent_name: String,
    pub(crate) user_agent_version: String,
    pub(crate) registry: CompressionRegistry,
    pub(crate) compression: CompressionConfig,
    pub(crate) default_encoding: Option<String>,
    pub(crate) max_receive_message_size: Option<usize>,
    pub(crate) max_send_message_size: Option<usize>,
    pub(crate) default_timeout: Option<Duration>,
    pub(crate) stream_buffer: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            user_agent_name: DEFAULT_USER_AGENT_NAME.to_string(),
            user_agent_version: strip_build_metadata(env!("CARGO_PKG_VERSION")).to_string(),
            registry: CompressionRegistry::default(),
            compression: CompressionConfig::default(),
            default_encoding: None,
            max_receive_message_size: Some(DEFAULT_MAX_RECEIVE_MESSAGE_SIZE),
            max_send_message_size: None,
            default_timeout: None,
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }
}

impl ProtocolConfig {
    /// `<name>/<version>`, the value of the `user-agent` header.
    pub fn user_agent(&self) -> String {
        format!("{}/{}", self.user_agent_name, self.user_agent_version)
    }

    pub fn registry(&self) -> &CompressionRegistry {
        &self.registry
    }

    pub fn compression(&self) -> CompressionConfig {
        self.compression
    }

    /// Encoding applied to requests when a call does not pick one.
    pub fn default_encoding(&self) -> Option<&str> {
        self.default_encoding.as_deref()
    }

    pub fn max_receive_message_size(&self) -> Option<usize> {
        self.max_receive_message_size
    }

    pub fn max_send_message_size(&self) -> Option<usize> {
        self.max_send_message_size
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    pub fn stream_buffer(&self) -> usize {
        self.stream_buffer
    }
}
