//! Transport seam.
//!
//! The engine only needs "send a request whose body streams out, get back
//! headers, a streaming body and trailers". [`Transport`] is that contract.
//! Two implementations ship with the crate:
//!
//! - [`TowerTransport`]: adapts any `tower::Service` over HTTP requests,
//!   which is also how tests plug in an in-process fake server.
//! - [`HyperTransport`]: a plain-text HTTP/2 client on hyper_util's pooled
//!   legacy client.

mod body;
mod hyper;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{Request, Response};
use http_body::Body;
use http_body_util::BodyExt;
use http_body_util::combinators::UnsyncBoxBody;
use tower::ServiceExt;
use tower_service::Service;

pub use body::RequestBody;
pub use self::hyper::{HyperTransport, HyperTransportBuilder};

use crate::error::BoxError;

/// Response body handed to the engine.
pub type ResponseBody = UnsyncBoxBody<Bytes, BoxError>;

/// A request/response exchange with streaming bodies.
pub trait Transport: Send + Sync + 'static {
    /// Start one exchange. Resolves once response headers are available.
    ///
    /// Dropping the returned future or the response body aborts the
    /// exchange.
    fn send(
        &self,
        request: Request<RequestBody>,
    ) -> BoxFuture<'static, Result<Response<ResponseBody>, BoxError>>;

    /// Whether requests must carry `content-length`, which forces the engine
    /// to buffer the whole request body before sending.
    fn requires_content_length(&self) -> bool {
        false
    }
}

/// [`Transport`] over any cloneable `tower` service.
#[derive(Debug, Clone)]
pub struct TowerTransport<S> {
    service: S,
    requires_content_length: bool,
}

impl<S> TowerTransport<S> {
    pub fn new(service: S) -> Self {
        Self {
            service,
            requires_content_length: false,
        }
    }

    /// Flag the underlying handler as needing an upfront content length.
    pub fn require_content_length(mut self, required: bool) -> Self {
        self.requires_content_length = required;
        self
    }
}

impl<S, B> Transport for TowerTransport<S>
where
    S: Service<Request<RequestBody>, Response = Response<B>> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    fn send(
        &self,
        request: Request<RequestBody>,
    ) -> BoxFuture<'static, Result<Response<ResponseBody>, BoxError>> {
        let service = self.service.clone();
        Box::pin(async move {
            let response = service.oneshot(request).await.map_err(Into::into)?;
            Ok(response.map(|body| body.map_err(Into::into).boxed_unsync()))
        })
    }

    fn requires_content_length(&self) -> bool {
        self.requires_content_length
    }
}
