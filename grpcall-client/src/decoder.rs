//! Inbound message deframing.
//!
//! [`MessageDeframer`] pulls bytes from a response body, cuts them into
//! frames, decompresses and deserializes each payload. Trailers are captured
//! when the body yields them and stay available after the last frame.

use bytes::{Buf, Bytes, BytesMut};
use grpcall_core::{
    BoxedCodec, CompressionRegistry, FRAME_HEADER_SIZE, FrameError, FrameHeader, IDENTITY,
};
use http::HeaderMap;
use http_body::Body;
use http_body_util::BodyExt;

use crate::error::{BoxError, ClientError};
use crate::marshaller::Marshaller;

/// Reads framed messages from a response body.
pub struct MessageDeframer<B> {
    body: B,
    buf: BytesMut,
    encoding: Option<String>,
    codec: Option<BoxedCodec>,
    max_message_size: Option<usize>,
    trailers: Option<HeaderMap>,
    eof: bool,
}

impl<B> std::fmt::Debug for MessageDeframer<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageDeframer")
            .field("buffered", &self.buf.len())
            .field("encoding", &self.encoding)
            .field("max_message_size", &self.max_message_size)
            .field("eof", &self.eof)
            .finish_non_exhaustive()
    }
}

impl<B> MessageDeframer<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    /// `encoding` is the response's `grpc-encoding` value, used for frames
    /// flagged as compressed.
    pub fn new(
        body: B,
        registry: &CompressionRegistry,
        encoding: Option<&str>,
        max_message_size: Option<usize>,
    ) -> Self {
        Self {
            body,
            buf: BytesMut::new(),
            encoding: encoding.map(str::to_string),
            codec: registry.resolve(encoding).cloned(),
            max_message_size,
            trailers: None,
            eof: false,
        }
    }

    /// Next message, or `None` at a clean end of stream.
    pub async fn read_next<T: 'static>(
        &mut self,
        marshaller: &dyn Marshaller<T>,
    ) -> Result<Option<T>, ClientError> {
        loop {
            if let Some(payload) = self.next_payload()? {
                return Ok(Some(marshaller.deserialize(payload)?));
            }
            if self.eof {
                return match self.truncation() {
                    None => Ok(None),
                    Some(err) => Err(err.into()),
                };
            }
            self.fill().await?;
        }
    }

    /// Exactly one message, then confirm the body carries nothing else.
    ///
    /// `None` means the body ended before any frame started.
    pub async fn read_single<T: 'static>(
        &mut self,
        marshaller: &dyn Marshaller<T>,
    ) -> Result<Option<T>, ClientError> {
        let Some(message) = self.read_next(marshaller).await? else {
            return Ok(None);
        };
        loop {
            if !self.buf.is_empty() {
                return Err(FrameError::ProtocolViolation(
                    "unexpected data after the response message".into(),
                )
                .into());
            }
            if self.eof {
                return Ok(Some(message));
            }
            self.fill().await?;
        }
    }

    /// Discard everything left in the body, keeping the trailers.
    pub async fn drain(&mut self) -> Result<(), ClientError> {
        loop {
            self.buf.clear();
            if self.eof {
                return Ok(());
            }
            self.fill().await?;
        }
    }

    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    pub fn take_trailers(&mut self) -> Option<HeaderMap> {
        self.trailers.take()
    }

    /// The body has ended and every buffered byte was consumed.
    pub fn is_end_stream(&self) -> bool {
        self.eof && self.buf.is_empty()
    }

    async fn fill(&mut self) -> Result<(), ClientError> {
        match self.body.frame().await {
            None => self.eof = true,
            Some(Err(err)) => return Err(ClientError::Transport(err.into())),
            Some(Ok(frame)) => match frame.into_data() {
                Ok(data) => self.buf.extend_from_slice(&data),
                Err(frame) => {
                    if let Ok(trailers) = frame.into_trailers() {
                        match &mut self.trailers {
                            Some(existing) => existing.extend(trailers),
                            None => self.trailers = Some(trailers),
                        }
                    }
                }
            },
        }
        Ok(())
    }

    fn next_payload(&mut self) -> Result<Option<Bytes>, FrameError> {
        if self.buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let header = FrameHeader::parse(&self.buf)?;
        let length = header.length as usize;
        self.check_size(length)?;
        if self.buf.len() < FRAME_HEADER_SIZE + length {
            return Ok(None);
        }

        self.buf.advance(FRAME_HEADER_SIZE);
        let payload = self.buf.split_to(length).freeze();
        if !header.compressed {
            return Ok(Some(payload));
        }

        let codec = self
            .codec
            .as_ref()
            .filter(|codec| !codec.is_identity())
            .ok_or_else(|| {
                FrameError::UnsupportedEncoding(
                    self.encoding.clone().unwrap_or_else(|| IDENTITY.to_string()),
                )
            })?;
        let decompressed = codec
            .decompress(&payload)
            .map_err(|e| FrameError::Compression(e.to_string()))?;
        self.check_size(decompressed.len())?;
        Ok(Some(decompressed))
    }

    fn check_size(&self, size: usize) -> Result<(), FrameError> {
        match self.max_message_size {
            Some(limit) if size > limit => Err(FrameError::MessageTooLarge { size, limit }),
            _ => Ok(()),
        }
    }

    fn truncation(&self) -> Option<FrameError> {
        if self.buf.is_empty() {
            return None;
        }
        let expected = match FrameHeader::parse(&self.buf) {
            Ok(header) => FRAME_HEADER_SIZE + header.length as usize,
            Err(_) => FRAME_HEADER_SIZE,
        };
        Some(FrameError::Truncated {
            expected,
            actual: self.buf.len(),
        })
    }
}
