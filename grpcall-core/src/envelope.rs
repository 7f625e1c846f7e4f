//! Length-prefixed message framing.
//!
//! ```text
//! [compressed:1][length:4, big endian][payload:length]
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FrameError;

/// Flag values for the first frame byte.
pub mod frame_flags {
    pub const UNCOMPRESSED: u8 = 0x00;
    pub const COMPRESSED: u8 = 0x01;
}

/// Size of the fixed frame header.
pub const FRAME_HEADER_SIZE: usize = 5;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub compressed: bool,
    pub length: u32,
}

impl FrameHeader {
    /// Parse the first [`FRAME_HEADER_SIZE`] bytes of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::Truncated {
                expected: FRAME_HEADER_SIZE,
                actual: data.len(),
            });
        }
        let compressed = match data[0] {
            frame_flags::UNCOMPRESSED => false,
            frame_flags::COMPRESSED => true,
            other => {
                return Err(FrameError::ProtocolViolation(format!(
                    "invalid frame flag 0x{other:02x}"
                )));
            }
        };
        let length = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        Ok(Self { compressed, length })
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(if self.compressed {
            frame_flags::COMPRESSED
        } else {
            frame_flags::UNCOMPRESSED
        });
        dst.put_u32(self.length);
    }
}

/// Prefix `payload` with a frame header.
pub fn encode_frame(payload: &[u8], compressed: bool) -> Result<Bytes, FrameError> {
    let length = u32::try_from(payload.len()).map_err(|_| FrameError::MessageTooLarge {
        size: payload.len(),
        limit: u32::MAX as usize,
    })?;
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    FrameHeader { compressed, length }.encode(&mut frame);
    frame.extend_from_slice(payload);
    Ok(frame.freeze())
}
