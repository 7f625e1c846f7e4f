//! Client call engine for the gRPC wire protocol.
//!
//! Turns typed method invocations into framed HTTP/2 exchanges and turns
//! responses (headers, framed body, trailers) back into messages or a
//! precise [`Status`].
//!
//! ## Features
//!
//! - Unary, client-streaming, server-streaming and duplex calls
//! - Per-message compression (gzip and deflate by default, brotli and zstd
//!   behind features)
//! - Deadlines sent as `grpc-timeout` and enforced locally
//! - Cancellation through [`CallHandle::cancel`] or a linked
//!   `CancellationToken`
//! - Any `tower::Service` as transport, including content-length-only
//!   handlers
//!
//! ## Example
//!
//! ```ignore
//! use grpcall_client::{CallInvoker, CallOptions, MethodDescriptor, MethodKind};
//! use std::time::Duration;
//!
//! let invoker = CallInvoker::builder("http://localhost:50051").build()?;
//! let say_hello = MethodDescriptor::<HelloRequest, HelloReply>::prost(
//!     MethodKind::Unary,
//!     "helloworld.Greeter",
//!     "SayHello",
//! );
//!
//! let call = invoker.unary(
//!     &say_hello,
//!     HelloRequest { name: "world".into() },
//!     CallOptions::new().timeout(Duration::from_secs(5)),
//! );
//! let headers = call.handle().response_headers().await?;
//! let reply = call.await?;
//! ```
//!
//! ## Streaming Example
//!
//! ```ignore
//! use futures::StreamExt;
//!
//! let mut call = invoker.duplex_streaming(&chat, CallOptions::new());
//! call.requests().send(ChatMessage::new("hi")).await?;
//! call.requests().complete();
//!
//! while let Some(message) = call.responses().next().await {
//!     println!("{:?}", message?);
//! }
//! let trailers = call.handle().trailers().await;
//! ```

mod builder;
mod config;
mod decoder;
mod encoder;
mod error;
mod headers;
mod invoker;
mod marshaller;
mod options;

pub mod deadline;
pub mod status;
pub mod transport;

pub use builder::InvokerBuilder;
pub use config::{
    DEFAULT_MAX_RECEIVE_MESSAGE_SIZE, DEFAULT_STREAM_BUFFER, DEFAULT_USER_AGENT_NAME,
    ProtocolConfig,
};
pub use decoder::MessageDeframer;
pub use encoder::{FrameBuffer, MessageFramer};
pub use error::{BoxError, BuildError, ClientError};
pub use headers::{CONTENT_TYPE_GRPC, HeaderContext};
pub use invoker::{
    CallHandle, CallInvoker, CallState, ClientStreamingCall, Completion, DuplexStreamingCall,
    RequestSink, ResponseStream, ServerStreamingCall, SingleResponse, UnaryCall,
};
pub use marshaller::{JsonMarshaller, Marshaller, MethodDescriptor, MethodKind, ProstMarshaller};
pub use options::{BearerToken, CallCredentials, CallOptions};
pub use transport::{HyperTransport, RequestBody, TowerTransport, Transport};

pub use grpcall_core::{
    Code, Codec, CompressionConfig, CompressionLevel, CompressionRegistry, FrameError, Metadata,
    Status,
};
