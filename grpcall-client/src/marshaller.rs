//! Message marshalling and method descriptors.
//!
//! A [`Marshaller`] is the serialize/deserialize pair for one message type.
//! [`MethodDescriptor`] binds a method path and call shape to the request
//! and response marshallers; descriptors are built once and shared by every
//! call to that method.

use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use grpcall_core::FrameError;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Serialize/deserialize contract for one message type.
pub trait Marshaller<T>: Send + Sync + 'static {
    fn serialize(&self, message: &T) -> Result<Bytes, FrameError>;

    fn deserialize(&self, payload: Bytes) -> Result<T, FrameError>;

    /// Suffix appended to `application/grpc` in `content-type`, if any.
    fn content_subtype(&self) -> Option<&'static str> {
        None
    }
}

/// Protobuf marshaller backed by prost.
pub struct ProstMarshaller<T>(PhantomData<fn() -> T>);

impl<T> ProstMarshaller<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for ProstMarshaller<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Marshaller<T> for ProstMarshaller<T>
where
    T: prost::Message + Default + 'static,
{
    fn serialize(&self, message: &T) -> Result<Bytes, FrameError> {
        Ok(Bytes::from(message.encode_to_vec()))
    }

    fn deserialize(&self, payload: Bytes) -> Result<T, FrameError> {
        T::decode(payload).map_err(|e| FrameError::Deserialization(e.to_string()))
    }
}

/// JSON marshaller backed by serde_json, sent as `application/grpc+json`.
pub struct JsonMarshaller<T>(PhantomData<fn() -> T>);

impl<T> JsonMarshaller<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonMarshaller<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Marshaller<T> for JsonMarshaller<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn serialize(&self, message: &T) -> Result<Bytes, FrameError> {
        serde_json::to_vec(message)
            .map(Bytes::from)
            .map_err(|e| FrameError::Serialization(e.to_string()))
    }

    fn deserialize(&self, payload: Bytes) -> Result<T, FrameError> {
        serde_json::from_slice(&payload).map_err(|e| FrameError::Deserialization(e.to_string()))
    }

    fn content_subtype(&self) -> Option<&'static str> {
        Some("json")
    }
}

/// Call shape of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Unary,
    ClientStreaming,
    ServerStreaming,
    Duplex,
}

impl MethodKind {
    /// Whether the client sends more than one message.
    pub fn client_streams(self) -> bool {
        matches!(self, MethodKind::ClientStreaming | MethodKind::Duplex)
    }

    /// Whether the server sends more than one message.
    pub fn server_streams(self) -> bool {
        matches!(self, MethodKind::ServerStreaming | MethodKind::Duplex)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MethodKind::Unary => "unary",
            MethodKind::ClientStreaming => "client_streaming",
            MethodKind::ServerStreaming => "server_streaming",
            MethodKind::Duplex => "duplex",
        }
    }
}

/// Immutable description of one remote method.
pub struct MethodDescriptor<Req, Res> {
    path: Arc<str>,
    kind: MethodKind,
    request: Arc<dyn Marshaller<Req>>,
    response: Arc<dyn Marshaller<Res>>,
}

impl<Req, Res> Clone for MethodDescriptor<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            kind: self.kind,
            request: self.request.clone(),
            response: self.response.clone(),
        }
    }
}

impl<Req, Res> std::fmt::Debug for MethodDescriptor<Req, Res> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl<Req: 'static, Res: 'static> MethodDescriptor<Req, Res> {
    /// Describe `/<service>/<method>`.
    pub fn new(
        kind: MethodKind,
        service: &str,
        method: &str,
        request: impl Marshaller<Req>,
        response: impl Marshaller<Res>,
    ) -> Self {
        Self {
            path: format!("/{}/{}", service.trim_matches('/'), method.trim_matches('/')).into(),
            kind,
            request: Arc::new(request),
            response: Arc::new(response),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn shared_path(&self) -> Arc<str> {
        self.path.clone()
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    pub fn service_name(&self) -> &str {
        self.path[1..].rsplit_once('/').map_or("", |(s, _)| s)
    }

    pub fn method_name(&self) -> &str {
        self.path.rsplit_once('/').map_or("", |(_, m)| m)
    }

    pub fn request_marshaller(&self) -> &Arc<dyn Marshaller<Req>> {
        &self.request
    }

    pub fn response_marshaller(&self) -> &Arc<dyn Marshaller<Res>> {
        &self.response
    }
}

impl<Req, Res> MethodDescriptor<Req, Res>
where
    Req: prost::Message + Default + 'static,
    Res: prost::Message + Default + 'static,
{
    /// Descriptor using protobuf on both directions.
    pub fn prost(kind: MethodKind, service: &str, method: &str) -> Self {
        Self::new(
            kind,
            service,
            method,
            ProstMarshaller::new(),
            ProstMarshaller::new(),
        )
    }
}

impl<Req, Res> MethodDescriptor<Req, Res>
where
    Req: Serialize + DeserializeOwned + 'static,
    Res: Serialize + DeserializeOwned + 'static,
{
    /// Descriptor using JSON on both directions.
    pub fn json(kind: MethodKind, service: &str, method: &str) -> Self {
        Self::new(
            kind,
            service,
            method,
            JsonMarshaller::new(),
            JsonMarshaller::new(),
        )
    }
}
