//! Request body type.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;

use crate::error::BoxError;

pin_project! {
    /// Outbound body of a call: nothing, one buffered chunk (single-message
    /// requests or content-length mode), or frames streamed as the caller
    /// writes them.
    #[project = RequestBodyProj]
    pub enum RequestBody {
        Empty,
        Full {
            data: Option<Bytes>,
            sized: bool,
        },
        Streaming {
            #[pin]
            stream: Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send>>,
        },
    }
}

impl RequestBody {
    pub fn empty() -> Self {
        RequestBody::Empty
    }

    /// One chunk whose length is advertised through the size hint, which
    /// lets the HTTP layer set `content-length`.
    pub fn full(data: Bytes) -> Self {
        RequestBody::Full {
            data: Some(data),
            sized: true,
        }
    }

    /// One chunk sent without an advertised length.
    pub fn once(data: Bytes) -> Self {
        RequestBody::Full {
            data: Some(data),
            sized: false,
        }
    }

    pub fn streaming<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, BoxError>> + Send + 'static,
    {
        RequestBody::Streaming {
            stream: Box::pin(stream),
        }
    }
}

impl Body for RequestBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.project() {
            RequestBodyProj::Empty => Poll::Ready(None),
            RequestBodyProj::Full { data, .. } => Poll::Ready(data.take().map(|d| Ok(Frame::data(d)))),
            RequestBodyProj::Streaming { stream } => stream
                .poll_next(cx)
                .map(|chunk| chunk.map(|result| result.map(Frame::data))),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            RequestBody::Empty => true,
            RequestBody::Full { data, .. } => data.is_none(),
            RequestBody::Streaming { .. } => false,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            RequestBody::Empty => SizeHint::with_exact(0),
            RequestBody::Full { data, sized: true } => {
                SizeHint::with_exact(data.as_ref().map_or(0, |d| d.len() as u64))
            }
            RequestBody::Full { .. } => SizeHint::default(),
            RequestBody::Streaming { .. } => SizeHint::default(),
        }
    }
}

impl Default for RequestBody {
    fn default() -> Self {
        RequestBody::Empty
    }
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("RequestBody::Empty"),
            RequestBody::Full { data, sized } => f
                .debug_struct("RequestBody::Full")
                .field("len", &data.as_ref().map(Bytes::len))
                .field("sized", sized)
                .finish(),
            RequestBody::Streaming { .. } => f.write_str("RequestBody::Streaming"),
        }
    }
}
