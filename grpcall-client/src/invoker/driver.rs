//! Read side of a call.
//!
//! The driver sends the request, publishes response headers, reads the body
//! through the deframer and commits the final status. It runs as its own
//! task and is dropped mid-flight when the call completes from elsewhere
//! (cancellation, deadline, a rejected write), which aborts the exchange.

use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use futures::StreamExt;
use grpcall_core::{DESERIALIZE_FAILURE_DETAIL, GRPC_ENCODING, Metadata, Status};
use http::HeaderMap;
use http::header::{CONTENT_LENGTH, HeaderValue};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

use super::Shared;
use super::state::{CallCore, CallState};
use crate::deadline::DeadlineManager;
use crate::decoder::MessageDeframer;
use crate::encoder::FrameBuffer;
use crate::error::{BoxError, ClientError};
use crate::headers::{HeaderContext, append_custom};
use crate::marshaller::Marshaller;
use crate::options::CallCredentials;
use crate::status;
use crate::transport::{RequestBody, ResponseBody};

/// Request body source.
pub(crate) enum Outbound {
    /// The one framed request of a unary or server-streaming call.
    Single(Bytes),
    /// Frames produced by a [`RequestSink`](super::RequestSink).
    Stream(mpsc::Receiver<Bytes>),
}

/// Where response messages go.
pub(crate) enum Inbound<Res> {
    Single(Arc<Mutex<Option<Res>>>),
    Stream(mpsc::UnboundedSender<Res>),
}

/// Everything the driver needs, fixed at call start.
pub(crate) struct Exchange {
    pub(crate) shared: Arc<Shared>,
    pub(crate) core: Arc<CallCore>,
    pub(crate) deadline: DeadlineManager,
    pub(crate) headers: HeaderMap,
    pub(crate) credentials: Option<Arc<dyn CallCredentials>>,
    pub(crate) content_subtype: Option<&'static str>,
    pub(crate) encoding: Option<&'static str>,
    pub(crate) outbound: Outbound,
}

/// Run the exchange to completion unless the call completes first.
pub(crate) async fn drive<Res: Send + 'static>(
    exchange: Exchange,
    inbound: Inbound<Res>,
    marshaller: Arc<dyn Marshaller<Res>>,
) {
    let core = exchange.core.clone();
    let outcome = tokio::select! {
        biased;
        _ = core.done.cancelled() => None,
        outcome = exchange.run(&inbound, &*marshaller) => Some(outcome),
    };
    if let Some((status, trailers)) = outcome {
        core.complete(status, trailers);
    }
    // readers see the channel close only after the status is committed
    drop(inbound);
}

impl Exchange {
    async fn run<Res: 'static>(
        self,
        inbound: &Inbound<Res>,
        marshaller: &dyn Marshaller<Res>,
    ) -> (Status, Metadata) {
        match self.exchange(inbound, marshaller).await {
            Ok(outcome) => outcome,
            Err(status) => (status, Metadata::default()),
        }
    }

    async fn exchange<Res: 'static>(
        self,
        inbound: &Inbound<Res>,
        marshaller: &dyn Marshaller<Res>,
    ) -> Result<(Status, Metadata), Status> {
        let Exchange {
            shared,
            core,
            deadline,
            mut headers,
            credentials,
            content_subtype,
            encoding,
            outbound,
        } = self;
        let config = &shared.config;

        if let Some(credentials) = credentials {
            let extra = credentials.metadata(core.method()).await?;
            append_custom(&mut headers, &extra);
        }

        let requires_length = shared.transport.requires_content_length();
        let (body, content_length) = match outbound {
            Outbound::Single(frame) if requires_length => {
                let len = frame.len();
                (RequestBody::full(frame), Some(len))
            }
            Outbound::Single(frame) => (RequestBody::once(frame), None),
            Outbound::Stream(mut rx) if requires_length => {
                let mut buffer = FrameBuffer::new();
                while let Some(frame) = rx.recv().await {
                    buffer.push(frame);
                }
                tracing::trace!(frames = buffer.frame_count(), "request body buffered");
                let len = buffer.content_length();
                (RequestBody::full(buffer.into_bytes()), Some(len))
            }
            Outbound::Stream(rx) => (
                RequestBody::streaming(ReceiverStream::new(rx).map(Ok::<_, BoxError>)),
                None,
            ),
        };

        let context = HeaderContext {
            config,
            path: core.method(),
            content_subtype,
            encoding,
            timeout: deadline.remaining(Instant::now()),
        };
        let mut request = context.request(&shared.base_uri, &headers, body)?;
        if let Some(len) = content_length {
            request
                .headers_mut()
                .insert(CONTENT_LENGTH, HeaderValue::from(len));
        }

        core.advance(CallState::RequestSent);
        tracing::trace!(uri = %request.uri(), "sending request");
        let response = shared.transport.send(request).await.map_err(|err| {
            tracing::warn!(error = %err, "transport failed before response headers");
            ClientError::Transport(err).to_status()
        })?;
        let (parts, body) = response.into_parts();

        if let Some(status) = status::from_headers(&parts.headers) {
            tracing::trace!(code = %status.code(), "trailers-only response");
            let metadata = Metadata::new(parts.headers);
            core.resolve_headers(metadata.clone());
            let status = if status.is_ok() && !core.kind().server_streams() {
                Status::internal(DESERIALIZE_FAILURE_DETAIL)
            } else {
                status
            };
            return Ok((status, metadata));
        }

        status::validate_response(parts.status, &parts.headers)?;
        let response_encoding = parts
            .headers
            .get(GRPC_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        core.resolve_headers(Metadata::new(parts.headers));
        core.advance(CallState::StreamingBody);

        let mut deframer = MessageDeframer::new(
            body,
            config.registry(),
            response_encoding.as_deref(),
            config.max_receive_message_size(),
        );
        let outcome = match inbound {
            Inbound::Single(slot) => read_single(&mut deframer, slot, marshaller).await,
            Inbound::Stream(tx) => read_stream(&mut deframer, tx, marshaller).await,
        };
        Ok(outcome)
    }
}

async fn read_single<Res: 'static>(
    deframer: &mut MessageDeframer<ResponseBody>,
    slot: &Mutex<Option<Res>>,
    marshaller: &dyn Marshaller<Res>,
) -> (Status, Metadata) {
    let read = deframer.read_single(marshaller).await;
    let trailers = deframer.take_trailers();
    let status = match read {
        Ok(Some(message)) => {
            let status = status::after_message(trailers.as_ref());
            if status.is_ok() {
                *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
            }
            status
        }
        Ok(None) => status::missing_message(trailers.as_ref()),
        Err(err) => read_failure(err),
    };
    (status, Metadata::new(trailers.unwrap_or_default()))
}

async fn read_stream<Res: 'static>(
    deframer: &mut MessageDeframer<ResponseBody>,
    tx: &mpsc::UnboundedSender<Res>,
    marshaller: &dyn Marshaller<Res>,
) -> (Status, Metadata) {
    let result = loop {
        match deframer.read_next(marshaller).await {
            Ok(Some(message)) => {
                if tx.send(message).is_err() {
                    tracing::debug!("response stream dropped, draining body");
                    break deframer.drain().await;
                }
            }
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        }
    };
    let trailers = deframer.take_trailers();
    let status = match result {
        Ok(()) => status::after_message(trailers.as_ref()),
        Err(err) => read_failure(err),
    };
    (status, Metadata::new(trailers.unwrap_or_default()))
}

fn read_failure(err: ClientError) -> Status {
    match err {
        ClientError::Transport(err) => {
            tracing::warn!(error = %err, "transport failed while reading response");
            Status::unavailable(format!("Error reading response: {err}"))
        }
        other => other.to_status(),
    }
}
