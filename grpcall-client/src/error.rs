//! Client-side error types.
//!
//! Call futures always fail with a [`Status`]. [`ClientError`] is the
//! intermediate error raised inside the engine before it is turned into the
//! status a call completes with; [`BuildError`] covers invoker construction.

use grpcall_core::{FrameError, Status};

/// Boxed error used at the transport seam.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failures raised while driving a call.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Connection failure, reset stream or body read error.
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),

    /// Framing, compression or (de)serialization failure.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The outbound request could not be assembled.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ClientError {
    pub fn transport<E: Into<BoxError>>(err: E) -> Self {
        ClientError::Transport(err.into())
    }

    /// Status a call completes with when this error aborts it.
    ///
    /// Transport failures map to `Unavailable`; everything else is local and
    /// maps to `Internal`.
    pub fn to_status(&self) -> Status {
        match self {
            ClientError::Transport(err) => {
                Status::unavailable(format!("Error starting call: {err}"))
            }
            ClientError::Frame(err) => err.to_status(),
            ClientError::InvalidRequest(msg) => Status::internal(msg.clone()),
        }
    }
}

impl From<ClientError> for Status {
    fn from(err: ClientError) -> Self {
        err.to_status()
    }
}

/// Failures while building a [`CallInvoker`](crate::CallInvoker).
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid base uri: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),

    #[error("base uri must be absolute: {0}")]
    RelativeUri(String),

    #[error("invalid user agent: {0}")]
    InvalidUserAgent(String),

    #[error("default compression `{0}` is not registered")]
    UnknownEncoding(String),
}
