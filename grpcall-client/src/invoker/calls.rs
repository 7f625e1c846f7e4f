//! Caller-facing call objects.
//!
//! Each call shape is a thin bundle of the same three building blocks:
//! a [`RequestSink`] for the write side, a [`ResponseStream`] or
//! [`SingleResponse`] for the read side, and the [`CallHandle`] both share.

use std::future::IntoFuture;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use grpcall_core::{DESERIALIZE_FAILURE_DETAIL, Metadata, Status};
use tokio::sync::mpsc;

use super::state::{CallCore, CallHandle, CallState};
use crate::encoder::MessageFramer;
use crate::marshaller::Marshaller;

/// Status returned by a write attempted after the call finished.
fn write_after_completion(status: Status) -> Status {
    if status.is_ok() {
        Status::failed_precondition("Can't write the message because the call is complete.")
    } else {
        status
    }
}

/// Write side of a client-streaming or duplex call.
///
/// Each message is framed and handed to the transport as soon as it is
/// sent. Dropping the sink or calling [`RequestSink::complete`] half-closes
/// the request stream.
pub struct RequestSink<Req> {
    handle: CallHandle,
    framer: MessageFramer,
    marshaller: Arc<dyn Marshaller<Req>>,
    tx: Option<mpsc::Sender<Bytes>>,
}

impl<Req> std::fmt::Debug for RequestSink<Req> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSink")
            .field("method", &self.handle.method())
            .field("complete", &self.tx.is_none())
            .finish()
    }
}

impl<Req: 'static> RequestSink<Req> {
    pub(crate) fn new(
        handle: CallHandle,
        framer: MessageFramer,
        marshaller: Arc<dyn Marshaller<Req>>,
        tx: Option<mpsc::Sender<Bytes>>,
    ) -> Self {
        Self {
            handle,
            framer,
            marshaller,
            tx,
        }
    }

    /// Send one message, compressed if the call negotiated a codec.
    ///
    /// Waits while the outbound buffer is full. Fails with the call's final
    /// status once the call has completed.
    pub async fn send(&mut self, message: Req) -> Result<(), Status> {
        self.write(message, true).await
    }

    /// Send one message with compression disabled for this frame.
    pub async fn send_uncompressed(&mut self, message: Req) -> Result<(), Status> {
        self.write(message, false).await
    }

    /// Half-close the request stream. Idempotent.
    pub fn complete(&mut self) {
        if self.tx.take().is_some() {
            tracing::trace!(method = %self.handle.method(), "request stream completed");
        }
    }

    pub fn is_complete(&self) -> bool {
        self.tx.is_none()
    }

    pub fn handle(&self) -> &CallHandle {
        &self.handle
    }

    /// Frame `message`, or fail the call when it cannot be framed.
    fn encode(&self, message: Req, compress: bool) -> Result<Bytes, Status> {
        let core = self.handle.core();
        self.framer
            .frame(&*self.marshaller, &message, compress)
            .map_err(|err| {
                tracing::debug!(method = %core.method(), error = %err, "request message rejected");
                let status = err.to_status();
                core.complete(status.clone(), Metadata::default());
                status
            })
    }

    async fn write(&mut self, message: Req, compress: bool) -> Result<(), Status> {
        let core = self.handle.core().clone();
        if let Some(completion) = core.completion() {
            return Err(write_after_completion(completion.status));
        }
        if self.tx.is_none() {
            return Err(Status::failed_precondition(
                "Request stream has already been completed.",
            ));
        }
        let frame = self.encode(message, compress)?;
        core.advance(CallState::RequestSent);

        if let Some(tx) = self.tx.as_ref() {
            tokio::select! {
                biased;
                _ = core.done.cancelled() => {}
                sent = tx.send(frame) => {
                    if sent.is_ok() {
                        return Ok(());
                    }
                }
            }
        }
        Err(write_after_completion(core.wait_completion().await.status))
    }
}

/// Read side of a server-streaming or duplex call.
///
/// Yields messages in arrival order. A call that ends with a non-OK status
/// yields that status once as the last item. Cancellation cuts the stream
/// short even if messages are still buffered.
pub struct ResponseStream<Res> {
    handle: CallHandle,
    rx: mpsc::UnboundedReceiver<Res>,
    finished: bool,
}

impl<Res> Unpin for ResponseStream<Res> {}

impl<Res> std::fmt::Debug for ResponseStream<Res> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("method", &self.handle.method())
            .field("finished", &self.finished)
            .finish()
    }
}

impl<Res> ResponseStream<Res> {
    pub(crate) fn new(handle: CallHandle, rx: mpsc::UnboundedReceiver<Res>) -> Self {
        Self {
            handle,
            rx,
            finished: false,
        }
    }

    /// Next message. `Ok(None)` marks the end of a successful stream.
    pub async fn message(&mut self) -> Result<Option<Res>, Status> {
        self.next().await.transpose()
    }

    /// Discard everything not yet read and wait for the final status.
    pub async fn drain(self) -> Status {
        let ResponseStream { handle, rx, .. } = self;
        drop(rx);
        handle.status().await
    }

    pub fn handle(&self) -> &CallHandle {
        &self.handle
    }

    fn end(&mut self, core: &CallCore) -> Option<Result<Res, Status>> {
        self.finished = true;
        match core.completion() {
            Some(completion) if completion.status.is_ok() => None,
            Some(completion) => Some(Err(completion.status)),
            None => Some(Err(Status::internal("response stream ended without a status"))),
        }
    }
}

impl<Res> Stream for ResponseStream<Res> {
    type Item = Result<Res, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        let core = this.handle.core().clone();
        if core.is_canceled() {
            return Poll::Ready(this.end(&core));
        }
        match ready!(this.rx.poll_recv(cx)) {
            Some(message) => Poll::Ready(Some(Ok(message))),
            None => Poll::Ready(this.end(&core)),
        }
    }
}

/// The single response message of a unary or client-streaming call.
///
/// Resolves once the call completes: to the message when the status is OK,
/// otherwise to the status. Can be awaited directly.
pub struct SingleResponse<Res> {
    handle: CallHandle,
    slot: Arc<Mutex<Option<Res>>>,
}

impl<Res> std::fmt::Debug for SingleResponse<Res> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleResponse")
            .field("method", &self.handle.method())
            .finish()
    }
}

impl<Res> SingleResponse<Res> {
    pub(crate) fn new(handle: CallHandle, slot: Arc<Mutex<Option<Res>>>) -> Self {
        Self { handle, slot }
    }

    pub fn handle(&self) -> &CallHandle {
        &self.handle
    }

    pub async fn get(self) -> Result<Res, Status> {
        let status = self.handle.status().await;
        if !status.is_ok() {
            return Err(status);
        }
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Status::internal(DESERIALIZE_FAILURE_DETAIL))
    }
}

impl<Res: Send + 'static> IntoFuture for SingleResponse<Res> {
    type Output = Result<Res, Status>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.get())
    }
}

/// One request, one response.
///
/// ```ignore
/// let call = invoker.unary(&method, request, CallOptions::new());
/// let headers = call.handle().response_headers().await?;
/// let reply = call.await?;
/// ```
#[derive(Debug)]
pub struct UnaryCall<Res> {
    response: SingleResponse<Res>,
}

impl<Res> UnaryCall<Res> {
    pub(crate) fn new(response: SingleResponse<Res>) -> Self {
        Self { response }
    }

    pub fn handle(&self) -> &CallHandle {
        self.response.handle()
    }

    pub async fn response(self) -> Result<Res, Status> {
        self.response.get().await
    }

    pub fn into_parts(self) -> (CallHandle, SingleResponse<Res>) {
        (self.response.handle().clone(), self.response)
    }
}

impl<Res: Send + 'static> IntoFuture for UnaryCall<Res> {
    type Output = Result<Res, Status>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        self.response.into_future()
    }
}

/// Many requests, one response.
#[derive(Debug)]
pub struct ClientStreamingCall<Req, Res> {
    requests: RequestSink<Req>,
    response: SingleResponse<Res>,
}

impl<Req, Res> ClientStreamingCall<Req, Res> {
    pub(crate) fn new(requests: RequestSink<Req>, response: SingleResponse<Res>) -> Self {
        Self { requests, response }
    }

    pub fn handle(&self) -> &CallHandle {
        self.response.handle()
    }

    pub fn requests(&mut self) -> &mut RequestSink<Req> {
        &mut self.requests
    }

    /// Complete the request stream and wait for the response.
    pub async fn response(self) -> Result<Res, Status> {
        let ClientStreamingCall { requests, response } = self;
        drop(requests);
        response.get().await
    }

    pub fn into_parts(self) -> (CallHandle, RequestSink<Req>, SingleResponse<Res>) {
        (self.response.handle().clone(), self.requests, self.response)
    }
}

/// One request, many responses.
#[derive(Debug)]
pub struct ServerStreamingCall<Res> {
    responses: ResponseStream<Res>,
}

impl<Res> ServerStreamingCall<Res> {
    pub(crate) fn new(responses: ResponseStream<Res>) -> Self {
        Self { responses }
    }

    pub fn handle(&self) -> &CallHandle {
        self.responses.handle()
    }

    pub fn responses(&mut self) -> &mut ResponseStream<Res> {
        &mut self.responses
    }

    pub async fn message(&mut self) -> Result<Option<Res>, Status> {
        self.responses.message().await
    }

    pub fn into_parts(self) -> (CallHandle, ResponseStream<Res>) {
        (self.responses.handle().clone(), self.responses)
    }
}

/// Independent request and response streams.
#[derive(Debug)]
pub struct DuplexStreamingCall<Req, Res> {
    requests: RequestSink<Req>,
    responses: ResponseStream<Res>,
}

impl<Req, Res> DuplexStreamingCall<Req, Res> {
    pub(crate) fn new(requests: RequestSink<Req>, responses: ResponseStream<Res>) -> Self {
        Self {
            requests,
            responses,
        }
    }

    pub fn handle(&self) -> &CallHandle {
        self.responses.handle()
    }

    pub fn requests(&mut self) -> &mut RequestSink<Req> {
        &mut self.requests
    }

    pub fn responses(&mut self) -> &mut ResponseStream<Res> {
        &mut self.responses
    }

    pub fn into_parts(self) -> (CallHandle, RequestSink<Req>, ResponseStream<Res>) {
        (self.responses.handle().clone(), self.requests, self.responses)
    }
}
