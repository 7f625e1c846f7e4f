use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use grpcall_core::{
    Code, CompressionRegistry, DESERIALIZE_FAILURE_DETAIL, FRAME_HEADER_SIZE, encode_frame,
};
use http::request::Parts;
use prost::Message as _;
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Version};
use http_body::Frame;
use http_body_util::{BodyExt, Full, StreamBody};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::{InvokerBuilder, MessageDeframer};
use crate::deadline::decode_timeout;
use crate::error::BoxError;
use crate::marshaller::ProstMarshaller;
use crate::options::BearerToken;
use crate::status::MISSING_STATUS_DETAIL;
use crate::transport::{RequestBody, TowerTransport};

#[derive(Clone, PartialEq, prost::Message)]
struct HelloRequest {
    #[prost(string, tag = "1")]
    name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
struct HelloReply {
    #[prost(string, tag = "1")]
    message: String,
}

fn hello(name: &str) -> HelloRequest {
    HelloRequest { name: name.into() }
}

fn reply(message: &str) -> HelloReply {
    HelloReply {
        message: message.into(),
    }
}

fn method(kind: MethodKind) -> MethodDescriptor<HelloRequest, HelloReply> {
    MethodDescriptor::prost(kind, "greet.Greeter", "SayHello")
}

fn frame_of(message: &impl prost::Message) -> Bytes {
    encode_frame(&message.encode_to_vec(), false).unwrap()
}

type ReplyBody =
    StreamBody<futures::stream::Iter<std::vec::IntoIter<Result<Frame<Bytes>, Infallible>>>>;

/// Canned response of the fake server.
struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    frames: Vec<Bytes>,
    trailers: Option<HeaderMap>,
}

impl Reply {
    fn ok() -> Self {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/grpc"));
        Self {
            status: StatusCode::OK,
            headers,
            frames: Vec::new(),
            trailers: None,
        }
    }

    /// Status in the initial headers, no body, no trailers.
    fn trailers_only(code: Code) -> Self {
        let mut reply = Self::ok();
        reply
            .headers
            .insert("grpc-status", HeaderValue::from(code.as_i32()));
        reply
    }

    fn http(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            frames: Vec::new(),
            trailers: None,
        }
    }

    fn message(mut self, message: &impl prost::Message) -> Self {
        self.frames.push(frame_of(message));
        self
    }

    fn raw(mut self, frame: Bytes) -> Self {
        self.frames.push(frame);
        self
    }

    fn header(mut self, name: &'static str, value: &'static str) -> Self {
        self.headers.append(name, HeaderValue::from_static(value));
        self
    }

    fn trailer(mut self, name: &'static str, value: &'static str) -> Self {
        self.trailers
            .get_or_insert_with(HeaderMap::new)
            .append(name, HeaderValue::from_static(value));
        self
    }

    fn grpc_status(self, code: Code) -> Self {
        let mut reply = self;
        reply
            .trailers
            .get_or_insert_with(HeaderMap::new)
            .insert("grpc-status", HeaderValue::from(code.as_i32()));
        reply
    }

    fn into_response(self) -> Response<ReplyBody> {
        let mut chunks: Vec<Result<Frame<Bytes>, Infallible>> =
            self.frames.into_iter().map(|f| Ok(Frame::data(f))).collect();
        if let Some(trailers) = self.trailers {
            chunks.push(Ok(Frame::trailers(trailers)));
        }
        let mut response = Response::new(StreamBody::new(futures::stream::iter(chunks)));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Request head as seen by the fake server.
#[derive(Clone)]
struct Seen {
    method: Method,
    version: Version,
    uri: http::Uri,
    headers: HeaderMap,
}

/// Requests seen by the fake server, with their collected bodies.
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<(Seen, Bytes)>>>);

impl Recorder {
    fn record(&self, parts: Parts, body: Bytes) {
        let seen = Seen {
            method: parts.method,
            version: parts.version,
            uri: parts.uri,
            headers: parts.headers,
        };
        self.0.lock().unwrap().push((seen, body));
    }

    fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    fn last(&self) -> (Seen, Bytes) {
        self.0.lock().unwrap().last().cloned().expect("no request recorded")
    }
}

fn builder() -> InvokerBuilder {
    CallInvoker::builder("http://localhost:50051")
}

/// Fake server that reads the whole request, then answers with `reply()`.
fn serve<F>(reply: F) -> (CallInvoker, Recorder)
where
    F: Fn() -> Reply + Send + Sync + 'static,
{
    serve_with(builder(), false, reply)
}

fn serve_with<F>(builder: InvokerBuilder, requires_length: bool, reply: F) -> (CallInvoker, Recorder)
where
    F: Fn() -> Reply + Send + Sync + 'static,
{
    let recorder = Recorder::default();
    let reply = Arc::new(reply);
    let service = tower::service_fn({
        let recorder = recorder.clone();
        move |request: Request<RequestBody>| {
            let recorder = recorder.clone();
            let reply = reply.clone();
            async move {
                let (parts, body) = request.into_parts();
                let body = body.collect().await?.to_bytes();
                recorder.record(parts, body);
                Ok::<_, BoxError>(reply().into_response())
            }
        }
    });
    let transport = TowerTransport::new(service).require_content_length(requires_length);
    (builder.transport(transport).build().unwrap(), recorder)
}

/// Fake server that records the request head and never answers.
fn hang() -> (CallInvoker, Recorder) {
    let recorder = Recorder::default();
    let service = tower::service_fn({
        let recorder = recorder.clone();
        move |request: Request<RequestBody>| {
            let recorder = recorder.clone();
            async move {
                let (parts, _body) = request.into_parts();
                recorder.record(parts, Bytes::new());
                std::future::pending::<Result<Response<ReplyBody>, Infallible>>().await
            }
        }
    });
    (builder().transport(TowerTransport::new(service)).build().unwrap(), recorder)
}

/// Fake server that answers immediately without reading the request.
fn answer_early<F>(reply: F) -> CallInvoker
where
    F: Fn() -> Reply + Send + Sync + 'static,
{
    let reply = Arc::new(reply);
    let service = tower::service_fn(move |request: Request<RequestBody>| {
        let reply = reply.clone();
        async move {
            drop(request);
            Ok::<_, Infallible>(reply().into_response())
        }
    });
    builder().transport(TowerTransport::new(service)).build().unwrap()
}

async fn read_requests(body: Bytes) -> Vec<HelloRequest> {
    let mut deframer = MessageDeframer::new(
        Full::new(body),
        &CompressionRegistry::default(),
        None,
        None,
    );
    let marshaller = ProstMarshaller::<HelloRequest>::new();
    let mut requests = Vec::new();
    while let Some(request) = deframer.read_next(&marshaller).await.unwrap() {
        requests.push(request);
    }
    requests
}

#[tokio::test]
async fn unary_ok() {
    let (invoker, _) = serve(|| {
        Reply::ok()
            .header("x-served-by", "fake")
            .message(&reply("Hello world"))
            .trailer("x-trailer", "done")
            .grpc_status(Code::Ok)
    });
    let call = invoker.unary(&method(MethodKind::Unary), hello("world"), CallOptions::new());
    let handle = call.handle().clone();

    let headers = handle.response_headers().await.unwrap();
    assert_eq!(headers.get_str("x-served-by"), Some("fake"));
    assert_eq!(headers.len(), 1);

    assert_eq!(call.await.unwrap(), reply("Hello world"));
    assert!(handle.status().await.is_ok());
    let trailers = handle.trailers().await;
    assert_eq!(trailers.get_str("x-trailer"), Some("done"));
    assert_eq!(trailers.len(), 1);
    assert_eq!(handle.state(), CallState::Completed);
}

#[tokio::test]
async fn outbound_headers() {
    let (invoker, recorder) =
        serve(|| Reply::ok().message(&reply("hi")).grpc_status(Code::Ok));
    let options = CallOptions::new()
        .header("x-request-id", "abc-123")
        .header("te", "gzip")
        .header("content-type", "text/plain");
    invoker
        .unary(&method(MethodKind::Unary), hello("world"), options)
        .await
        .unwrap();

    let (parts, _) = recorder.last();
    assert_eq!(parts.method, Method::POST);
    assert_eq!(parts.version, Version::HTTP_2);
    assert_eq!(parts.uri.path(), "/greet.Greeter/SayHello");
    assert_eq!(parts.uri.host(), Some("localhost"));

    let headers = &parts.headers;
    assert_eq!(headers["content-type"], "application/grpc");
    assert_eq!(headers.get_all("content-type").iter().count(), 1);
    assert_eq!(headers["te"], "trailers");
    assert_eq!(headers.get_all("te").iter().count(), 1);

    let accept = headers["grpc-accept-encoding"].to_str().unwrap();
    assert!(accept.starts_with("identity"));
    for name in invoker.config().registry().names() {
        assert!(accept.split(',').any(|n| n == name), "{name} missing");
    }
    assert!(!headers.contains_key("grpc-encoding"));
    assert!(!headers.contains_key("grpc-timeout"));
    assert!(!headers.contains_key("content-length"));

    let agent = headers["user-agent"].to_str().unwrap();
    let (name, version) = agent.split_once('/').unwrap();
    assert_eq!(name, "grpcall-rust");
    assert!(!version.contains('+'));

    assert_eq!(headers["x-request-id"], "abc-123");
}

#[tokio::test]
async fn content_length_matches_single_frame() {
    let (invoker, recorder) = serve_with(builder(), true, || {
        Reply::ok().message(&reply("hi")).grpc_status(Code::Ok)
    });
    invoker
        .unary(&method(MethodKind::Unary), hello("Hello world"), CallOptions::new())
        .await
        .unwrap();

    let (parts, body) = recorder.last();
    assert_eq!(parts.headers["content-length"], "18");
    assert_eq!(body.len(), 18);
    assert_eq!(body.len(), FRAME_HEADER_SIZE + hello("Hello world").encoded_len());
}

#[tokio::test]
async fn request_body_round_trips() {
    let (invoker, recorder) =
        serve(|| Reply::ok().message(&reply("hi")).grpc_status(Code::Ok));
    let request = hello("round trip");
    invoker
        .unary(&method(MethodKind::Unary), request.clone(), CallOptions::new())
        .await
        .unwrap();

    let (_, body) = recorder.last();
    let mut deframer = MessageDeframer::new(
        Full::new(body),
        &CompressionRegistry::default(),
        None,
        None,
    );
    let decoded = deframer
        .read_single(&ProstMarshaller::<HelloRequest>::new())
        .await
        .unwrap();
    assert_eq!(decoded, Some(request));
}

#[tokio::test]
async fn error_trailer_fails_response_but_not_headers() {
    let (invoker, _) = serve(|| {
        Reply::ok()
            .header("x-header", "present")
            .message(&reply("ignored"))
            .trailer("grpc-message", "no%20such%20user")
            .grpc_status(Code::NotFound)
    });
    let call = invoker.unary(&method(MethodKind::Unary), hello("x"), CallOptions::new());
    let handle = call.handle().clone();

    let err = call.await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
    assert_eq!(err.message(), Some("no such user"));

    let headers = handle.response_headers().await.unwrap();
    assert_eq!(headers.get_str("x-header"), Some("present"));
    assert_eq!(handle.status().await, err);
}

#[tokio::test]
async fn trailers_only_ok_is_a_deserialization_failure() {
    let (invoker, _) = serve(|| Reply::trailers_only(Code::Ok).header("custom", "ABC"));
    let call = invoker.unary(&method(MethodKind::Unary), hello("x"), CallOptions::new());
    let handle = call.handle().clone();

    let headers = handle.response_headers().await.unwrap();
    assert_eq!(headers.get_str("custom"), Some("ABC"));
    assert_eq!(headers.len(), 1);

    let err = call.await.unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert_eq!(err.message(), Some(DESERIALIZE_FAILURE_DETAIL));

    let status = handle.status().await;
    assert_eq!(status.code(), err.code());
    assert_eq!(status.message(), err.message());

    let trailers = handle.trailers().await;
    assert_eq!(trailers.get_str("custom"), Some("ABC"));
    assert_eq!(trailers.len(), 1);
}

#[tokio::test]
async fn trailers_only_ok_detail_is_replaced() {
    let (invoker, _) =
        serve(|| Reply::trailers_only(Code::Ok).header("grpc-message", "Detail!"));
    let call = invoker.unary(&method(MethodKind::Unary), hello("x"), CallOptions::new());
    let handle = call.handle().clone();

    let err = call.await.unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert_eq!(err.message(), Some(DESERIALIZE_FAILURE_DETAIL));
    assert_eq!(handle.status().await, err);

    assert_eq!(handle.response_headers().await.unwrap().len(), 0);
    assert_eq!(handle.trailers().await.len(), 0);
}

#[tokio::test]
async fn trailers_only_error_with_custom_headers() {
    let (invoker, _) = serve(|| {
        Reply::trailers_only(Code::Unimplemented)
            .header("grpc-message", "Method%20not%20found")
            .header("x-custom", "1")
    });
    let call = invoker.unary(&method(MethodKind::Unary), hello("x"), CallOptions::new());
    let handle = call.handle().clone();

    let err = call.await.unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
    assert_eq!(err.message(), Some("Method not found"));
    assert_eq!(
        handle.response_headers().await.unwrap().get_str("x-custom"),
        Some("1")
    );
}

#[tokio::test]
async fn http_failure_maps_to_status() {
    let (invoker, _) = serve(|| Reply::http(StatusCode::NOT_FOUND));
    let call = invoker.unary(&method(MethodKind::Unary), hello("x"), CallOptions::new());
    let handle = call.handle().clone();

    let err = call.await.unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
    assert_eq!(err.message(), Some("Bad gRPC response. HTTP status code: 404"));
    assert_eq!(
        handle.response_headers().await.unwrap_err().code(),
        Code::Unimplemented
    );
}

#[tokio::test]
async fn wrong_content_type_is_internal() {
    let (invoker, _) = serve(|| {
        let mut reply = Reply::ok().message(&reply("x")).grpc_status(Code::Ok);
        reply
            .headers
            .insert("content-type", HeaderValue::from_static("text/html"));
        reply
    });
    let err = invoker
        .unary(&method(MethodKind::Unary), hello("x"), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert_eq!(
        err.message(),
        Some("Bad gRPC response. Invalid content-type value: text/html")
    );
}

#[tokio::test]
async fn message_without_status_is_internal() {
    let (invoker, _) = serve(|| Reply::ok().message(&reply("x")));
    let err = invoker
        .unary(&method(MethodKind::Unary), hello("x"), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert_eq!(err.message(), Some(MISSING_STATUS_DETAIL));
}

#[tokio::test]
async fn empty_body_without_trailers_is_never_ok() {
    let (invoker, _) = serve(Reply::ok);
    let err = invoker
        .unary(&method(MethodKind::Unary), hello("x"), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert_eq!(err.message(), Some(DESERIALIZE_FAILURE_DETAIL));
}

#[tokio::test]
async fn truncated_body_is_internal() {
    let (invoker, _) = serve(|| {
        let frame = frame_of(&reply("cut short"));
        Reply::ok()
            .raw(frame.slice(..frame.len() - 2))
            .grpc_status(Code::Ok)
    });
    let err = invoker
        .unary(&method(MethodKind::Unary), hello("x"), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);
}

#[tokio::test]
async fn oversized_response_is_rejected() {
    let (invoker, _) = serve_with(builder().max_receive_message_size(4), false, || {
        Reply::ok()
            .message(&reply("far too long"))
            .grpc_status(Code::Ok)
    });
    let err = invoker
        .unary(&method(MethodKind::Unary), hello("x"), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);
}

#[tokio::test]
async fn transport_failure_is_unavailable() {
    let service = tower::service_fn(|_: Request<RequestBody>| async {
        Err::<Response<ReplyBody>, _>(std::io::Error::other("connection refused"))
    });
    let invoker = builder()
        .transport(TowerTransport::new(service))
        .build()
        .unwrap();
    let call = invoker.unary(&method(MethodKind::Unary), hello("x"), CallOptions::new());
    let handle = call.handle().clone();

    let err = call.await.unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert!(err.message().unwrap().contains("connection refused"));
    assert_eq!(
        handle.response_headers().await.unwrap_err().code(),
        Code::Unavailable
    );
}

#[tokio::test]
async fn cancel_before_headers() {
    let (invoker, recorder) = hang();
    let call = invoker.unary(&method(MethodKind::Unary), hello("x"), CallOptions::new());
    let handle = call.handle().clone();
    assert!(handle.get_status().is_none());

    while recorder.count() == 0 {
        tokio::task::yield_now().await;
    }
    handle.cancel();

    let status = handle.status().await;
    assert_eq!(status.code(), Code::Cancelled);
    assert_eq!(status.message(), Some("Call canceled by the client."));
    assert_eq!(
        handle.response_headers().await.unwrap_err().code(),
        Code::Cancelled
    );
    assert_eq!(handle.state(), CallState::Canceled);
    assert_eq!(call.await.unwrap_err().code(), Code::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn deadline_exceeded_while_waiting() {
    let (invoker, recorder) = hang();
    let call = invoker.unary(
        &method(MethodKind::Unary),
        hello("x"),
        CallOptions::new().timeout(Duration::from_secs(1)),
    );
    let handle = call.handle().clone();

    let status = handle.status().await;
    assert_eq!(status.code(), Code::DeadlineExceeded);
    assert_eq!(status.message(), Some("Deadline Exceeded"));
    assert_eq!(handle.state(), CallState::Canceled);

    let (parts, _) = recorder.last();
    let timeout = parts.headers["grpc-timeout"].to_str().unwrap();
    let decoded = decode_timeout(timeout).unwrap();
    assert!(decoded > Duration::ZERO && decoded <= Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn default_timeout_applies() {
    let recorder = Recorder::default();
    let service = tower::service_fn({
        let recorder = recorder.clone();
        move |request: Request<RequestBody>| {
            let recorder = recorder.clone();
            async move {
                recorder.record(request.into_parts().0, Bytes::new());
                std::future::pending::<Result<Response<ReplyBody>, Infallible>>().await
            }
        }
    });
    let invoker = builder()
        .default_timeout(Duration::from_millis(250))
        .transport(TowerTransport::new(service))
        .build()
        .unwrap();
    let call = invoker.unary(&method(MethodKind::Unary), hello("x"), CallOptions::new());
    assert_eq!(call.await.unwrap_err().code(), Code::DeadlineExceeded);
    assert!(recorder.last().0.headers.contains_key("grpc-timeout"));
}

#[tokio::test]
async fn expired_deadline_sends_nothing() {
    let (invoker, recorder) = hang();
    let call = invoker.unary(
        &method(MethodKind::Unary),
        hello("x"),
        CallOptions::new().deadline(tokio::time::Instant::now()),
    );
    let status = call.handle().get_status().unwrap();
    assert_eq!(status.code(), Code::DeadlineExceeded);
    assert_eq!(call.await.unwrap_err().code(), Code::DeadlineExceeded);
    tokio::task::yield_now().await;
    assert_eq!(recorder.count(), 0);
}

#[tokio::test]
async fn linked_token_cancels() {
    let (invoker, recorder) = hang();
    let token = CancellationToken::new();
    let call = invoker.unary(
        &method(MethodKind::Unary),
        hello("x"),
        CallOptions::new().cancellation(token.clone()),
    );
    while recorder.count() == 0 {
        tokio::task::yield_now().await;
    }
    token.cancel();
    let status = call.handle().status().await;
    assert_eq!(status.code(), Code::Cancelled);
}

#[tokio::test]
async fn cancel_after_completion_is_a_no_op() {
    let (invoker, _) = serve(|| Reply::ok().message(&reply("x")).grpc_status(Code::Ok));
    let call = invoker.unary(&method(MethodKind::Unary), hello("x"), CallOptions::new());
    let handle = call.handle().clone();
    assert!(call.await.is_ok());

    handle.cancel();
    assert!(handle.status().await.is_ok());
    assert!(handle.get_status().unwrap().is_ok());
    assert!(handle.get_trailers().is_some());
    assert_eq!(handle.state(), CallState::Completed);
}

#[tokio::test]
async fn send_limit_fails_without_sending() {
    let (invoker, recorder) = serve_with(builder().max_send_message_size(4), false, || {
        Reply::ok().message(&reply("x")).grpc_status(Code::Ok)
    });
    let err = invoker
        .unary(&method(MethodKind::Unary), hello("Hello world"), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    tokio::task::yield_now().await;
    assert_eq!(recorder.count(), 0);
}

#[tokio::test]
async fn unknown_call_encoding_fails_without_sending() {
    let (invoker, recorder) = serve(|| Reply::ok().message(&reply("x")).grpc_status(Code::Ok));
    let err = invoker
        .unary(
            &method(MethodKind::Unary),
            hello("x"),
            CallOptions::new().compression("snappy"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert_eq!(recorder.count(), 0);
}

#[tokio::test]
async fn credentials_are_attached() {
    let (invoker, recorder) = serve(|| Reply::ok().message(&reply("x")).grpc_status(Code::Ok));
    let options = CallOptions::new().credentials(BearerToken::new("secret").unwrap());
    invoker
        .unary(&method(MethodKind::Unary), hello("x"), options)
        .await
        .unwrap();
    assert_eq!(recorder.last().0.headers["authorization"], "Bearer secret");
}

#[cfg(feature = "compression-gzip")]
#[tokio::test]
async fn gzip_in_both_directions() {
    use grpcall_core::FrameHeader;

    let (invoker, recorder) = serve_with(builder().default_compression("gzip"), false, || {
        let registry = CompressionRegistry::default();
        let codec = registry.resolve(Some("gzip")).unwrap();
        let payload = reply("squeezed").encode_to_vec();
        let compressed = codec.compress(&payload).unwrap();
        Reply::ok()
            .header("grpc-encoding", "gzip")
            .raw(encode_frame(&compressed, true).unwrap())
            .grpc_status(Code::Ok)
    });
    let response = invoker
        .unary(&method(MethodKind::Unary), hello("compress me"), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(response, reply("squeezed"));

    let (parts, body) = recorder.last();
    assert_eq!(parts.headers["grpc-encoding"], "gzip");
    assert!(FrameHeader::parse(&body).unwrap().compressed);

    let mut deframer = MessageDeframer::new(
        Full::new(body),
        &CompressionRegistry::default(),
        Some("gzip"),
        None,
    );
    let decoded = deframer
        .read_single(&ProstMarshaller::<HelloRequest>::new())
        .await
        .unwrap();
    assert_eq!(decoded, Some(hello("compress me")));
}

#[tokio::test]
async fn json_messages_use_json_content_type() {
    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Ping {
        text: String,
    }

    let (invoker, recorder) = serve(|| {
        let payload = serde_json::to_vec(&Ping { text: "pong".into() }).unwrap();
        Reply::ok()
            .raw(encode_frame(&payload, false).unwrap())
            .grpc_status(Code::Ok)
    });
    let method = MethodDescriptor::<Ping, Ping>::json(MethodKind::Unary, "echo.Echo", "Ping");
    let response = invoker
        .unary(&method, Ping { text: "ping".into() }, CallOptions::new())
        .await
        .unwrap();
    assert_eq!(response, Ping { text: "pong".into() });

    let (parts, body) = recorder.last();
    assert_eq!(parts.headers["content-type"], "application/grpc+json");
    assert_eq!(&body[FRAME_HEADER_SIZE..], br#"{"text":"ping"}"#);
}

#[tokio::test]
async fn server_streaming_reads_in_order() {
    let (invoker, _) = serve(|| {
        Reply::ok()
            .message(&reply("one"))
            .message(&reply("two"))
            .message(&reply("three"))
            .grpc_status(Code::Ok)
    });
    let mut call = invoker.server_streaming(
        &method(MethodKind::ServerStreaming),
        hello("x"),
        CallOptions::new(),
    );

    let mut messages = Vec::new();
    while let Some(message) = call.message().await.unwrap() {
        messages.push(message.message);
    }
    assert_eq!(messages, ["one", "two", "three"]);
    assert!(call.message().await.unwrap().is_none());
    assert!(call.handle().status().await.is_ok());
}

#[tokio::test]
async fn server_streaming_error_after_messages() {
    let (invoker, _) = serve(|| {
        Reply::ok()
            .message(&reply("one"))
            .message(&reply("two"))
            .trailer("grpc-message", "backend%20gone")
            .grpc_status(Code::Unavailable)
    });
    let call = invoker.server_streaming(
        &method(MethodKind::ServerStreaming),
        hello("x"),
        CallOptions::new(),
    );
    let (handle, stream) = call.into_parts();
    let items: Vec<_> = stream.collect().await;

    assert_eq!(items.len(), 3);
    assert_eq!(items[0].as_ref().unwrap().message, "one");
    assert_eq!(items[1].as_ref().unwrap().message, "two");
    let err = items[2].as_ref().unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert_eq!(err.message(), Some("backend gone"));
    assert_eq!(handle.status().await.code(), Code::Unavailable);
}

#[tokio::test]
async fn server_streaming_trailers_only_ok_is_empty() {
    let (invoker, _) = serve(|| Reply::trailers_only(Code::Ok));
    let mut call = invoker.server_streaming(
        &method(MethodKind::ServerStreaming),
        hello("x"),
        CallOptions::new(),
    );
    assert!(call.message().await.unwrap().is_none());
    assert!(call.handle().status().await.is_ok());
}

#[tokio::test]
async fn dropped_reader_still_resolves_trailers() {
    let (invoker, _) = serve(|| {
        Reply::ok()
            .message(&reply("one"))
            .message(&reply("two"))
            .trailer("x-summary", "2")
            .grpc_status(Code::Ok)
    });
    let call = invoker.server_streaming(
        &method(MethodKind::ServerStreaming),
        hello("x"),
        CallOptions::new(),
    );
    let (handle, stream) = call.into_parts();
    drop(stream);

    assert!(handle.status().await.is_ok());
    assert_eq!(handle.trailers().await.get_str("x-summary"), Some("2"));
}

#[tokio::test]
async fn drain_returns_final_status() {
    let (invoker, _) = serve(|| {
        Reply::ok()
            .message(&reply("one"))
            .grpc_status(Code::ResourceExhausted)
    });
    let call = invoker.server_streaming(
        &method(MethodKind::ServerStreaming),
        hello("x"),
        CallOptions::new(),
    );
    let (_, stream) = call.into_parts();
    assert_eq!(stream.drain().await.code(), Code::ResourceExhausted);
}

#[tokio::test]
async fn cancel_stops_a_stream_with_buffered_messages() {
    let (tx, rx) = mpsc::channel::<Result<Frame<Bytes>, Infallible>>(4);
    let rx = Arc::new(Mutex::new(Some(rx)));
    let service = tower::service_fn(move |_: Request<RequestBody>| {
        let rx = rx.lock().unwrap().take();
        async move {
            let rx = rx.expect("single call");
            let mut response = Response::new(StreamBody::new(ReceiverStream::new(rx)));
            response
                .headers_mut()
                .insert("content-type", HeaderValue::from_static("application/grpc"));
            Ok::<_, Infallible>(response)
        }
    });
    let invoker = builder()
        .transport(TowerTransport::new(service))
        .build()
        .unwrap();
    let mut call = invoker.server_streaming(
        &method(MethodKind::ServerStreaming),
        hello("x"),
        CallOptions::new(),
    );

    tx.send(Ok(Frame::data(frame_of(&reply("one"))))).await.unwrap();
    assert_eq!(call.message().await.unwrap().unwrap().message, "one");
    tx.send(Ok(Frame::data(frame_of(&reply("two"))))).await.unwrap();
    call.handle().cancel();

    let err = call.message().await.unwrap_err();
    assert_eq!(err.code(), Code::Cancelled);
    assert!(call.message().await.unwrap().is_none());
    // the driver drops the response body once the call is canceled
    tx.closed().await;
}

#[tokio::test]
async fn client_streaming_sends_every_message() {
    let (invoker, recorder) =
        serve(|| Reply::ok().message(&reply("3 greetings")).grpc_status(Code::Ok));
    let mut call = invoker.client_streaming(&method(MethodKind::ClientStreaming), CallOptions::new());
    for name in ["a", "b", "c"] {
        call.requests().send(hello(name)).await.unwrap();
    }
    assert_eq!(call.handle().state(), CallState::RequestSent);
    let response = call.response().await.unwrap();
    assert_eq!(response, reply("3 greetings"));

    let (parts, body) = recorder.last();
    assert!(!parts.headers.contains_key("content-length"));
    assert_eq!(read_requests(body).await, vec![hello("a"), hello("b"), hello("c")]);
}

#[tokio::test]
async fn client_streaming_with_content_length() {
    let (invoker, recorder) = serve_with(builder(), true, || {
        Reply::ok().message(&reply("ok")).grpc_status(Code::Ok)
    });
    let mut call = invoker.client_streaming(&method(MethodKind::ClientStreaming), CallOptions::new());
    call.requests().send(hello("Hello world")).await.unwrap();
    call.requests().send_uncompressed(hello("again")).await.unwrap();
    call.requests().complete();
    assert!(call.requests().is_complete());
    call.response().await.unwrap();

    let (parts, body) = recorder.last();
    let expected = frame_of(&hello("Hello world")).len() + frame_of(&hello("again")).len();
    assert_eq!(parts.headers["content-length"], expected.to_string().as_str());
    assert_eq!(body.len(), expected);
    assert_eq!(read_requests(body).await.len(), 2);
}

#[tokio::test]
async fn client_streaming_with_no_messages() {
    let (invoker, recorder) = serve(|| Reply::ok().message(&reply("none")).grpc_status(Code::Ok));
    let call = invoker.client_streaming(&method(MethodKind::ClientStreaming), CallOptions::new());
    assert_eq!(call.response().await.unwrap(), reply("none"));
    assert!(recorder.last().1.is_empty());
}

#[tokio::test]
async fn write_after_failure_returns_the_status() {
    let invoker = answer_early(|| Reply::trailers_only(Code::Unavailable));
    let mut call = invoker.client_streaming(&method(MethodKind::ClientStreaming), CallOptions::new());
    assert_eq!(call.handle().status().await.code(), Code::Unavailable);

    let err = call.requests().send(hello("late")).await.unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert_eq!(call.response().await.unwrap_err().code(), Code::Unavailable);
}

#[tokio::test]
async fn write_after_success_is_rejected() {
    let invoker = answer_early(|| Reply::ok().message(&reply("early")).grpc_status(Code::Ok));
    let mut call = invoker.client_streaming(&method(MethodKind::ClientStreaming), CallOptions::new());
    assert!(call.handle().status().await.is_ok());

    let err = call.requests().send(hello("late")).await.unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
    assert_eq!(
        err.message(),
        Some("Can't write the message because the call is complete.")
    );
    assert_eq!(call.response().await.unwrap(), reply("early"));
}

#[tokio::test]
async fn oversized_write_fails_the_call() {
    let (invoker, _) = serve_with(builder().max_send_message_size(4), false, || {
        Reply::ok().message(&reply("x")).grpc_status(Code::Ok)
    });
    let mut call = invoker.client_streaming(&method(MethodKind::ClientStreaming), CallOptions::new());
    let err = call.requests().send(hello("Hello world")).await.unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert_eq!(call.handle().status().await, err);
}

/// Echo server that answers each request frame as it arrives.
fn echo() -> CallInvoker {
    let service = tower::service_fn(|request: Request<RequestBody>| async move {
        let (tx, rx) = mpsc::channel::<Result<Frame<Bytes>, Infallible>>(8);
        tokio::spawn(async move {
            let mut deframer = MessageDeframer::new(
                request.into_body(),
                &CompressionRegistry::default(),
                None,
                None,
            );
            let marshaller = ProstMarshaller::<HelloRequest>::new();
            while let Ok(Some(request)) = deframer.read_next(&marshaller).await {
                let echoed = reply(&format!("echo {}", request.name));
                if tx.send(Ok(Frame::data(frame_of(&echoed)))).await.is_err() {
                    return;
                }
            }
            let mut trailers = HeaderMap::new();
            trailers.insert("grpc-status", HeaderValue::from_static("0"));
            let _ = tx.send(Ok(Frame::trailers(trailers))).await;
        });
        let mut response = Response::new(StreamBody::new(ReceiverStream::new(rx)));
        response
            .headers_mut()
            .insert("content-type", HeaderValue::from_static("application/grpc"));
        Ok::<_, Infallible>(response)
    });
    builder()
        .transport(TowerTransport::new(service))
        .build()
        .unwrap()
}

#[tokio::test]
async fn duplex_reads_while_writing() {
    let invoker = echo();
    let mut call = invoker.duplex_streaming(&method(MethodKind::Duplex), CallOptions::new());

    call.requests().send(hello("first")).await.unwrap();
    let first = call.responses().message().await.unwrap().unwrap();
    assert_eq!(first.message, "echo first");
    assert_eq!(call.handle().state(), CallState::StreamingBody);

    call.requests().send(hello("second")).await.unwrap();
    let second = call.responses().message().await.unwrap().unwrap();
    assert_eq!(second.message, "echo second");

    call.requests().complete();
    assert!(call.responses().message().await.unwrap().is_none());
    assert!(call.handle().status().await.is_ok());
    assert_eq!(call.handle().state(), CallState::Completed);
}

#[tokio::test]
async fn duplex_halves_move_independently() {
    let invoker = echo();
    let call = invoker.duplex_streaming(&method(MethodKind::Duplex), CallOptions::new());
    let (handle, mut requests, responses) = call.into_parts();

    let writer = tokio::spawn(async move {
        for name in ["a", "b", "c", "d"] {
            requests.send(hello(name)).await.unwrap();
        }
    });
    let echoed: Vec<String> = responses
        .map(|item| item.unwrap().message)
        .collect()
        .await;
    writer.await.unwrap();

    assert_eq!(echoed, ["echo a", "echo b", "echo c", "echo d"]);
    assert!(handle.status().await.is_ok());
}

#[tokio::test]
async fn repeated_status_reads_are_identical() {
    let (invoker, _) = serve(|| Reply::trailers_only(Code::PermissionDenied));
    let call = invoker.unary(&method(MethodKind::Unary), hello("x"), CallOptions::new());
    let handle = call.handle().clone();
    let first = handle.status().await;
    let second = handle.status().await;
    assert_eq!(first, second);
    assert_eq!(handle.get_status(), Some(first.clone()));
    let completion = handle.completion().await;
    assert_eq!(completion.status, first);
}
