//! Compression negotiation.
//!
//! - [`CompressionRegistry`]: the set of codecs a peer understands, keyed by
//!   `grpc-encoding` name, with `identity` always present and listed first.
//! - [`CompressionLevel`] / [`CompressionConfig`]: how aggressively to
//!   compress outbound messages.

use crate::codec::{BoxedCodec, IDENTITY, IdentityCodec};

#[cfg(feature = "compression-br")]
use crate::codec::BrotliCodec;
#[cfg(feature = "compression-deflate")]
use crate::codec::DeflateCodec;
#[cfg(feature = "compression-gzip")]
use crate::codec::GzipCodec;
#[cfg(feature = "compression-zstd")]
use crate::codec::ZstdCodec;

/// Compression quality, translated per algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionLevel {
    Fastest,
    Best,
    #[default]
    Default,
    /// Algorithm-specific value, clamped to the algorithm's range.
    Precise(u32),
}

#[cfg(any(feature = "compression-gzip", feature = "compression-deflate"))]
fn flate2_level(level: CompressionLevel) -> u32 {
    match level {
        CompressionLevel::Fastest => 1,
        CompressionLevel::Best => 9,
        CompressionLevel::Default => 6,
        CompressionLevel::Precise(n) => n.min(9),
    }
}

#[cfg(feature = "compression-br")]
fn brotli_quality(level: CompressionLevel) -> u32 {
    match level {
        CompressionLevel::Fastest => 0,
        CompressionLevel::Best => 11,
        CompressionLevel::Default => 4,
        CompressionLevel::Precise(n) => n.min(11),
    }
}

#[cfg(feature = "compression-zstd")]
fn zstd_level(level: CompressionLevel) -> i32 {
    match level {
        CompressionLevel::Fastest => 1,
        CompressionLevel::Best => 22,
        CompressionLevel::Default => 3,
        CompressionLevel::Precise(n) => (n.min(22) as i32).max(1),
    }
}

/// Outbound compression policy.
#[derive(Debug, Clone, Copy)]
pub struct CompressionConfig {
    /// Payloads shorter than this are framed uncompressed. Default 0.
    pub min_bytes: usize,
    pub level: CompressionLevel,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            min_bytes: 0,
            level: CompressionLevel::Default,
        }
    }
}

impl CompressionConfig {
    pub fn new(min_bytes: usize) -> Self {
        Self {
            min_bytes,
            ..Self::default()
        }
    }

    pub fn level(mut self, level: CompressionLevel) -> Self {
        self.level = level;
        self
    }

    /// Never compress, whatever encoding was negotiated.
    pub fn disabled() -> Self {
        Self::new(usize::MAX)
    }

    pub fn is_disabled(&self) -> bool {
        self.min_bytes == usize::MAX
    }

    /// Whether a payload of `len` bytes should be compressed.
    pub fn should_compress(&self, len: usize) -> bool {
        !self.is_disabled() && len >= self.min_bytes
    }
}

/// Codecs known to this peer, in advertisement order.
///
/// Immutable once built and shared read-only by every call.
#[derive(Debug, Clone)]
pub struct CompressionRegistry {
    codecs: Vec<BoxedCodec>,
}

impl Default for CompressionRegistry {
    /// Identity plus every codec enabled through cargo features, at
    /// [`CompressionLevel::Default`].
    fn default() -> Self {
        Self::with_level(CompressionLevel::Default)
    }
}

impl CompressionRegistry {
    /// A registry that only knows `identity`.
    pub fn identity_only() -> Self {
        Self {
            codecs: vec![BoxedCodec::new(IdentityCodec)],
        }
    }

    /// Identity plus every feature-enabled codec, tuned to `level`.
    #[allow(unused_variables, unused_mut)]
    pub fn with_level(level: CompressionLevel) -> Self {
        let mut registry = Self::identity_only();
        #[cfg(feature = "compression-gzip")]
        registry.insert(GzipCodec::with_level(flate2_level(level)));
        #[cfg(feature = "compression-deflate")]
        registry.insert(DeflateCodec::with_level(flate2_level(level)));
        #[cfg(feature = "compression-br")]
        registry.insert(BrotliCodec::with_quality(brotli_quality(level)));
        #[cfg(feature = "compression-zstd")]
        registry.insert(ZstdCodec::with_level(zstd_level(level)));
        registry
    }

    /// Register a codec, replacing any codec with the same name.
    ///
    /// The identity codec cannot be replaced.
    pub fn insert<C: crate::codec::Codec>(&mut self, codec: C) -> &mut Self {
        let codec = BoxedCodec::new(codec);
        if codec.is_identity() {
            return self;
        }
        match self.codecs.iter_mut().find(|c| c.name() == codec.name()) {
            Some(slot) => *slot = codec,
            None => self.codecs.push(codec),
        }
        self
    }

    /// Look up a codec by wire name. A missing or empty name resolves to
    /// identity.
    pub fn resolve(&self, name: Option<&str>) -> Option<&BoxedCodec> {
        let name = match name.map(str::trim) {
            None | Some("") => IDENTITY,
            Some(name) => name,
        };
        self.codecs.iter().find(|c| c.name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(Some(name)).is_some()
    }

    /// Registered names in advertisement order, `identity` first.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.codecs.iter().map(BoxedCodec::name)
    }

    /// Value for `grpc-accept-encoding`.
    pub fn accept_encoding_header(&self) -> String {
        self.names().collect::<Vec<_>>().join(",")
    }
}
