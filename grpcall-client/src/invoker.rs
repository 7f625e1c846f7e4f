//! Call invocation.
//!
//! [`CallInvoker`] turns a [`MethodDescriptor`] plus [`CallOptions`] into a
//! running call. All four call shapes go through one pipeline:
//!
//! 1. Resolve the deadline, request codec and cancellation signal.
//! 2. Spawn the driver (read side) and, when a deadline or external token
//!    is involved, a watcher that turns the signal into a `Canceled` state.
//! 3. Hand the caller a typed call object whose write and read halves talk
//!    to the driver through channels and the shared call state.
//!
//! Calls spawn tasks and must be started inside a Tokio runtime.

mod calls;
mod driver;
mod state;

#[cfg(test)]
mod tests;

use std::sync::{Arc, Mutex};

use grpcall_core::{FrameError, Metadata};
use http::Uri;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{Instrument, Span};

pub use calls::{
    ClientStreamingCall, DuplexStreamingCall, RequestSink, ResponseStream, ServerStreamingCall,
    SingleResponse, UnaryCall,
};
pub use state::{CallHandle, CallState, Completion};

use self::driver::{Exchange, Inbound, Outbound};
use self::state::CallCore;
use crate::config::ProtocolConfig;
use crate::deadline::{CancelReason, CancelSignal, DeadlineManager};
use crate::encoder::MessageFramer;
use crate::marshaller::{Marshaller, MethodDescriptor, MethodKind};
use crate::options::CallOptions;
use crate::transport::Transport;

/// Immutable state shared by every call of one invoker.
pub(crate) struct Shared {
    pub(crate) base_uri: Uri,
    pub(crate) config: ProtocolConfig,
    pub(crate) transport: Arc<dyn Transport>,
}

/// Entry point for issuing calls against one endpoint.
///
/// Cheap to clone; clones share configuration and transport.
#[derive(Clone)]
pub struct CallInvoker {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for CallInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallInvoker")
            .field("base_uri", &self.shared.base_uri)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl CallInvoker {
    /// Invoker over an already-configured transport.
    pub fn new<T: Transport>(base_uri: Uri, config: ProtocolConfig, transport: T) -> Self {
        Self::from_parts(base_uri, config, Arc::new(transport))
    }

    pub(crate) fn from_parts(
        base_uri: Uri,
        config: ProtocolConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                base_uri,
                config,
                transport,
            }),
        }
    }

    pub fn base_uri(&self) -> &Uri {
        &self.shared.base_uri
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.shared.config
    }

    /// Start a unary call.
    pub fn unary<Req, Res>(
        &self,
        method: &MethodDescriptor<Req, Res>,
        request: Req,
        options: CallOptions,
    ) -> UnaryCall<Res>
    where
        Req: Send + 'static,
        Res: Send + 'static,
    {
        let launch = self.prepare(method, MethodKind::Unary, options);
        let slot = Arc::new(Mutex::new(None));
        let response = SingleResponse::new(launch.handle.clone(), slot.clone());
        launch.single(request, Inbound::Single(slot), method.response_marshaller().clone());
        UnaryCall::new(response)
    }

    /// Start a client-streaming call.
    pub fn client_streaming<Req, Res>(
        &self,
        method: &MethodDescriptor<Req, Res>,
        options: CallOptions,
    ) -> ClientStreamingCall<Req, Res>
    where
        Req: Send + 'static,
        Res: Send + 'static,
    {
        let launch = self.prepare(method, MethodKind::ClientStreaming, options);
        let slot = Arc::new(Mutex::new(None));
        let response = SingleResponse::new(launch.handle.clone(), slot.clone());
        let requests = launch.streaming(Inbound::Single(slot), method.response_marshaller().clone());
        ClientStreamingCall::new(requests, response)
    }

    /// Start a server-streaming call.
    pub fn server_streaming<Req, Res>(
        &self,
        method: &MethodDescriptor<Req, Res>,
        request: Req,
        options: CallOptions,
    ) -> ServerStreamingCall<Res>
    where
        Req: Send + 'static,
        Res: Send + 'static,
    {
        let launch = self.prepare(method, MethodKind::ServerStreaming, options);
        let (tx, rx) = mpsc::unbounded_channel();
        let responses = ResponseStream::new(launch.handle.clone(), rx);
        launch.single(request, Inbound::Stream(tx), method.response_marshaller().clone());
        ServerStreamingCall::new(responses)
    }

    /// Start a duplex call.
    pub fn duplex_streaming<Req, Res>(
        &self,
        method: &MethodDescriptor<Req, Res>,
        options: CallOptions,
    ) -> DuplexStreamingCall<Req, Res>
    where
        Req: Send + 'static,
        Res: Send + 'static,
    {
        let launch = self.prepare(method, MethodKind::Duplex, options);
        let (tx, rx) = mpsc::unbounded_channel();
        let responses = ResponseStream::new(launch.handle.clone(), rx);
        let requests = launch.streaming(Inbound::Stream(tx), method.response_marshaller().clone());
        DuplexStreamingCall::new(requests, responses)
    }

    fn prepare<Req, Res>(
        &self,
        method: &MethodDescriptor<Req, Res>,
        kind: MethodKind,
        options: CallOptions,
    ) -> Launch<Req>
    where
        Req: 'static,
        Res: 'static,
    {
        if method.kind() != kind {
            tracing::debug!(
                method = %method.path(),
                declared = method.kind().as_str(),
                invoked = kind.as_str(),
                "method invoked with a different call shape than declared"
            );
        }
        let config = &self.shared.config;
        let signal = match &options.cancellation {
            Some(parent) => CancelSignal::linked(parent),
            None => CancelSignal::new(),
        };
        let core = Arc::new(CallCore::new(method.shared_path(), kind, signal));
        let deadline = DeadlineManager::new(
            options.effective_deadline(Instant::now(), config.default_timeout()),
        );
        let encoding = options
            .compression
            .as_deref()
            .or(config.default_encoding());
        let framer = MessageFramer::new(
            config.registry(),
            encoding,
            config.compression(),
            config.max_send_message_size(),
        );
        let span = tracing::info_span!(
            "grpc.call",
            rpc.method = %method.path(),
            rpc.kind = kind.as_str(),
            otel.kind = "client",
        );

        Launch {
            shared: self.shared.clone(),
            handle: CallHandle::new(core.clone()),
            core,
            framer,
            marshaller: method.request_marshaller().clone(),
            deadline,
            options,
            span,
        }
    }
}

/// A prepared call that has not started its tasks yet.
struct Launch<Req> {
    shared: Arc<Shared>,
    core: Arc<CallCore>,
    handle: CallHandle,
    framer: Result<MessageFramer, FrameError>,
    marshaller: Arc<dyn Marshaller<Req>>,
    deadline: DeadlineManager,
    options: CallOptions,
    span: Span,
}

impl<Req: Send + 'static> Launch<Req> {
    /// Frame the only request message and start the call.
    fn single<Res: Send + 'static>(
        self,
        request: Req,
        inbound: Inbound<Res>,
        marshaller: Arc<dyn Marshaller<Res>>,
    ) {
        let frame = self
            .framer
            .as_ref()
            .map_err(Clone::clone)
            .and_then(|framer| framer.frame(&*self.marshaller, &request, true));
        drop(request);
        match frame {
            Ok(frame) => self.spawn(Outbound::Single(frame), inbound, marshaller),
            Err(err) => {
                self.fail(err);
                drop(inbound);
            }
        }
    }

    /// Start the call with a request stream and return its writer.
    fn streaming<Res: Send + 'static>(
        self,
        inbound: Inbound<Res>,
        marshaller: Arc<dyn Marshaller<Res>>,
    ) -> RequestSink<Req> {
        let framer = match &self.framer {
            Ok(framer) => framer.clone(),
            Err(err) => {
                let sink = RequestSink::new(
                    self.handle.clone(),
                    MessageFramer::uncompressed(None),
                    self.marshaller.clone(),
                    None,
                );
                self.fail(err.clone());
                drop(inbound);
                return sink;
            }
        };
        let (tx, rx) = mpsc::channel(self.shared.config.stream_buffer());
        let sink = RequestSink::new(
            self.handle.clone(),
            framer,
            self.marshaller.clone(),
            Some(tx),
        );
        self.spawn(Outbound::Stream(rx), inbound, marshaller);
        sink
    }

    fn fail(&self, err: FrameError) {
        let _enter = self.span.enter();
        tracing::debug!(error = %err, "call failed before sending");
        self.core.complete(err.to_status(), Metadata::default());
    }

    fn spawn<Res: Send + 'static>(
        self,
        outbound: Outbound,
        inbound: Inbound<Res>,
        marshaller: Arc<dyn Marshaller<Res>>,
    ) {
        let Launch {
            shared,
            core,
            framer,
            marshaller: request_marshaller,
            deadline,
            options,
            span,
            ..
        } = self;

        if core.signal.is_cancelled() {
            core.cancel(CancelReason::Cancelled);
            return;
        }
        if deadline.is_expired(Instant::now()) {
            let _enter = span.enter();
            tracing::debug!("deadline expired before the call started");
            core.cancel(CancelReason::DeadlineExceeded);
            return;
        }
        if deadline.deadline().is_some() || options.cancellation.is_some() {
            deadline.start(core.signal.clone(), core.done.clone());
            tokio::spawn(watch_signal(core.clone()));
        }

        let exchange = Exchange {
            shared,
            core,
            deadline,
            headers: options.headers,
            credentials: options.credentials,
            content_subtype: request_marshaller.content_subtype(),
            encoding: framer.ok().and_then(|f| f.encoding()),
            outbound,
        };
        tokio::spawn(driver::drive(exchange, inbound, marshaller).instrument(span));
    }
}

/// Commit `Canceled` as soon as the deadline timer or a linked token fires
/// the call's signal.
async fn watch_signal(core: Arc<CallCore>) {
    tokio::select! {
        biased;
        _ = core.done.cancelled() => {}
        reason = core.signal.cancelled() => {
            core.cancel(reason);
        }
    }
}
