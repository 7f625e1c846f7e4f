//! Fluent construction of a [`CallInvoker`].

use std::sync::Arc;
use std::time::Duration;

use grpcall_core::{Codec, CompressionConfig, CompressionRegistry};
use http::{HeaderValue, Uri};

use crate::config::{ProtocolConfig, strip_build_metadata};
use crate::error::BuildError;
use crate::invoker::CallInvoker;
use crate::transport::{HyperTransport, Transport};

/// Builder for [`CallInvoker`].
///
/// ```ignore
/// use grpcall_client::CallInvoker;
/// use std::time::Duration;
///
/// let invoker = CallInvoker::builder("http://localhost:50051")
///     .default_compression("gzip")
///     .default_timeout(Duration::from_secs(10))
///     .build()?;
/// ```
pub struct InvokerBuilder {
    base_uri: String,
    config: ProtocolConfig,
    transport: Option<Arc<dyn Transport>>,
}

impl std::fmt::Debug for InvokerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokerBuilder")
            .field("base_uri", &self.base_uri)
            .field("config", &self.config)
            .field("transport", &self.transport.is_some())
            .finish()
    }
}

impl CallInvoker {
    /// Start building an invoker for the endpoint at `base_uri`.
    ///
    /// A path on the base URI is kept as a prefix for every method path.
    pub fn builder<S: Into<String>>(base_uri: S) -> InvokerBuilder {
        InvokerBuilder::new(base_uri)
    }
}

impl InvokerBuilder {
    pub fn new<S: Into<String>>(base_uri: S) -> Self {
        Self {
            base_uri: base_uri.into(),
            config: ProtocolConfig::default(),
            transport: None,
        }
    }

    /// Product name and version for `user-agent`. Build metadata after `+`
    /// is dropped from the version.
    pub fn user_agent<N, V>(mut self, name: N, version: V) -> Self
    where
        N: Into<String>,
        V: AsRef<str>,
    {
        self.config.user_agent_name = name.into();
        self.config.user_agent_version = strip_build_metadata(version.as_ref()).to_string();
        self
    }

    /// Replace the codec registry.
    pub fn registry(mut self, registry: CompressionRegistry) -> Self {
        self.config.registry = registry;
        self
    }

    /// Register an extra codec, replacing any codec with the same name.
    pub fn codec<C: Codec>(mut self, codec: C) -> Self {
        self.config.registry.insert(codec);
        self
    }

    /// Threshold and level used when compressing requests.
    pub fn compression(mut self, compression: CompressionConfig) -> Self {
        self.config.compression = compression;
        self
    }

    /// Compress requests with `encoding` unless a call picks its own.
    pub fn default_compression<S: Into<String>>(mut self, encoding: S) -> Self {
        self.config.default_encoding = Some(encoding.into());
        self
    }

    /// Default: 4 MiB.
    pub fn max_receive_message_size(mut self, limit: usize) -> Self {
        self.config.max_receive_message_size = Some(limit);
        self
    }

    pub fn unlimited_receive_message_size(mut self) -> Self {
        self.config.max_receive_message_size = None;
        self
    }

    /// Unlimited by default.
    pub fn max_send_message_size(mut self, limit: usize) -> Self {
        self.config.max_send_message_size = Some(limit);
        self
    }

    /// Timeout for calls that set neither a deadline nor a timeout.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = Some(timeout);
        self
    }

    /// Outbound message buffer per streaming call. Clamped to at least 1.
    pub fn stream_buffer(mut self, capacity: usize) -> Self {
        self.config.stream_buffer = capacity.max(1);
        self
    }

    /// Use `transport` instead of the default [`HyperTransport`].
    pub fn transport<T: Transport>(mut self, transport: T) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn build(self) -> Result<CallInvoker, BuildError> {
        let base_uri: Uri = self.base_uri.parse()?;
        if base_uri.scheme().is_none() || base_uri.authority().is_none() {
            return Err(BuildError::RelativeUri(self.base_uri));
        }

        let user_agent = self.config.user_agent();
        if self.config.user_agent_name.is_empty() || HeaderValue::try_from(&user_agent).is_err() {
            return Err(BuildError::InvalidUserAgent(user_agent));
        }

        let registry = &self.config.registry;
        if let Some(encoding) = self
            .config
            .default_encoding
            .as_deref()
            .filter(|encoding| !registry.contains(encoding))
        {
            return Err(BuildError::UnknownEncoding(encoding.to_string()));
        }

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HyperTransport::new()));
        tracing::debug!(
            base_uri = %base_uri,
            user_agent = %user_agent,
            accept_encoding = %self.config.registry.accept_encoding_header(),
            "call invoker built"
        );
        Ok(CallInvoker::from_parts(base_uri, self.config, transport))
    }
}
