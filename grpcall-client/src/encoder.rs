//! Outbound message framing.
//!
//! [`MessageFramer`] turns one message into one frame: serialize, maybe
//! compress, prefix with the 5-byte header. It never performs I/O.
//! [`FrameBuffer`] collects frames when the transport needs the full body
//! (and its length) before sending.

use bytes::{Bytes, BytesMut};
use grpcall_core::{BoxedCodec, CompressionConfig, CompressionRegistry, FrameError, encode_frame};

use crate::marshaller::Marshaller;

/// Frames messages for one call.
#[derive(Debug, Clone)]
pub struct MessageFramer {
    codec: Option<BoxedCodec>,
    compression: CompressionConfig,
    max_message_size: Option<usize>,
}

impl MessageFramer {
    /// Framer compressing with `encoding`, if given and not identity.
    ///
    /// Fails with [`FrameError::UnsupportedEncoding`] when `encoding` is not
    /// registered.
    pub fn new(
        registry: &CompressionRegistry,
        encoding: Option<&str>,
        compression: CompressionConfig,
        max_message_size: Option<usize>,
    ) -> Result<Self, FrameError> {
        let codec = match encoding {
            None => None,
            Some(name) => {
                let codec = registry
                    .resolve(Some(name))
                    .ok_or_else(|| FrameError::UnsupportedEncoding(name.to_string()))?;
                (!codec.is_identity()).then(|| codec.clone())
            }
        };
        Ok(Self {
            codec,
            compression,
            max_message_size,
        })
    }

    /// Framer that never compresses.
    pub fn uncompressed(max_message_size: Option<usize>) -> Self {
        Self {
            codec: None,
            compression: CompressionConfig::disabled(),
            max_message_size,
        }
    }

    /// Non-identity request encoding, the value of `grpc-encoding`.
    pub fn encoding(&self) -> Option<&'static str> {
        self.codec.as_ref().map(BoxedCodec::name)
    }

    /// Serialize `message` and frame it. `compress = false` forces an
    /// uncompressed frame for this message.
    pub fn frame<T: 'static>(
        &self,
        marshaller: &dyn Marshaller<T>,
        message: &T,
        compress: bool,
    ) -> Result<Bytes, FrameError> {
        let payload = marshaller.serialize(message)?;
        if let Some(limit) = self.max_message_size.filter(|limit| payload.len() > *limit) {
            return Err(FrameError::MessageTooLarge {
                size: payload.len(),
                limit,
            });
        }

        match &self.codec {
            Some(codec) if compress && self.compression.should_compress(payload.len()) => {
                let compressed = codec
                    .compress(&payload)
                    .map_err(|e| FrameError::Compression(e.to_string()))?;
                encode_frame(&compressed, true)
            }
            _ => encode_frame(&payload, false),
        }
    }
}

/// Whole request body, accumulated before sending.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
    frames: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Bytes) {
        self.buf.extend_from_slice(&frame);
        self.frames += 1;
    }

    /// Exact body size, the value of `content-length`.
    pub fn content_length(&self) -> usize {
        self.buf.len()
    }

    pub fn frame_count(&self) -> usize {
        self.frames
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}
