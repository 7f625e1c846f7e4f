//! Protocol primitives for the grpcall call engine.
//!
//! Shared by anything that speaks the length-prefixed message protocol,
//! independent of how calls are driven.
//!
//! ## Modules
//!
//! - `error`: status codes, [`Status`] and [`FrameError`]
//! - `codec`: per-message compression codecs
//! - `compression`: [`CompressionRegistry`] and compression policy
//! - `envelope`: frame header encoding and parsing
//! - `metadata`: [`Metadata`] view over response headers and trailers

mod codec;
mod compression;
mod envelope;
mod error;
mod metadata;

pub use codec::*;
pub use compression::*;
pub use envelope::*;
pub use error::*;
pub use metadata::*;
