//! Per-call options.
//!
//! [`CallOptions`] carries everything that can differ between two calls to
//! the same method: deadline, cancellation, custom headers, compression and
//! credentials. Options are moved into the call when it starts.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use grpcall_core::Status;
use http::{HeaderMap, HeaderName, HeaderValue};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Source of per-call authentication metadata.
///
/// Invoked once per call before the request is sent. Returned headers are
/// merged after the caller's custom headers; protocol-reserved names are
/// dropped. A failure completes the call with the returned status.
pub trait CallCredentials: Send + Sync + 'static {
    fn metadata(&self, method: &str) -> BoxFuture<'static, Result<HeaderMap, Status>>;
}

/// `authorization: Bearer <token>` credentials.
#[derive(Clone)]
pub struct BearerToken(HeaderValue);

impl BearerToken {
    pub fn new(token: &str) -> Result<Self, http::header::InvalidHeaderValue> {
        let mut value = HeaderValue::try_from(format!("Bearer {token}"))?;
        value.set_sensitive(true);
        Ok(Self(value))
    }
}

impl std::fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BearerToken(..)")
    }
}

impl CallCredentials for BearerToken {
    fn metadata(&self, _method: &str) -> BoxFuture<'static, Result<HeaderMap, Status>> {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, self.0.clone());
        Box::pin(futures::future::ready(Ok(headers)))
    }
}

/// Options for one call.
///
/// ```ignore
/// use grpcall_client::CallOptions;
/// use std::time::Duration;
///
/// let options = CallOptions::new()
///     .timeout(Duration::from_secs(5))
///     .header("x-request-id", "abc-123");
/// ```
#[derive(Clone, Default)]
pub struct CallOptions {
    pub(crate) deadline: Option<Instant>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) cancellation: Option<CancellationToken>,
    pub(crate) headers: HeaderMap,
    pub(crate) compression: Option<String>,
    pub(crate) credentials: Option<Arc<dyn CallCredentials>>,
}

impl std::fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOptions")
            .field("deadline", &self.deadline)
            .field("timeout", &self.timeout)
            .field("cancellation", &self.cancellation.is_some())
            .field("headers", &self.headers)
            .field("compression", &self.compression)
            .field("credentials", &self.credentials.is_some())
            .finish()
    }
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absolute deadline. Combined with [`timeout`](Self::timeout), the
    /// earlier of the two wins.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Relative deadline, measured from the moment the call starts.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Cancel the call when `token` is cancelled.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Append a custom header. Invalid names or values are ignored; use
    /// [`try_header`](Self::try_header) to observe them.
    pub fn header<K, V>(mut self, name: K, value: V) -> Self
    where
        K: TryInto<HeaderName>,
        V: TryInto<HeaderValue>,
    {
        if let (Ok(name), Ok(value)) = (name.try_into(), value.try_into()) {
            self.headers.append(name, value);
        }
        self
    }

    /// Append a custom header, or `None` if the name or value is invalid.
    pub fn try_header<K, V>(mut self, name: K, value: V) -> Option<Self>
    where
        K: TryInto<HeaderName>,
        V: TryInto<HeaderValue>,
    {
        let name = name.try_into().ok()?;
        let value = value.try_into().ok()?;
        self.headers.append(name, value);
        Some(self)
    }

    /// Replace all custom headers.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Compress requests with `encoding` (a name in the registry).
    pub fn compression<S: Into<String>>(mut self, encoding: S) -> Self {
        self.compression = Some(encoding.into());
        self
    }

    pub fn credentials<C: CallCredentials>(mut self, credentials: C) -> Self {
        self.credentials = Some(Arc::new(credentials));
        self
    }

    pub fn get_headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Resolve the effective deadline at call start.
    pub(crate) fn effective_deadline(
        &self,
        now: Instant,
        default_timeout: Option<Duration>,
    ) -> Option<Instant> {
        let relative = self
            .timeout
            .or(if self.deadline.is_none() {
                default_timeout
            } else {
                None
            })
            .map(|t| now.checked_add(t).unwrap_or_else(|| far_future(now)));
        match (self.deadline, relative) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Roughly 30 years out, the same horizon tokio uses for "never".
fn far_future(now: Instant) -> Instant {
    now + FAR_FUTURE
}
