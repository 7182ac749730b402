//! Compression codec registry.
//!
//! An external collaborator per spec.md §1; kept here as a small registry
//! over real codec crates so `send_async`'s dispatch step (spec.md §4.2.6)
//! has something concrete to call.

use bytes::Bytes;
use std::io::{Read, Write};

/// Compression algorithm applied to a send's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    #[default]
    None,
    Lz4,
    Zlib,
}

impl CompressionType {
    /// Compress `payload`. Returns the input unchanged for `None`.
    pub fn compress(&self, payload: &Bytes) -> Bytes {
        match self {
            CompressionType::None => payload.clone(),
            CompressionType::Lz4 => Bytes::from(lz4_flex::compress_prepend_size(payload)),
            CompressionType::Zlib => {
                let mut encoder = flate2::write::ZlibEncoder::new(
                    Vec::with_capacity(payload.len()),
                    flate2::Compression::default(),
                );
                // In-memory writers never fail.
                encoder.write_all(payload).expect("zlib compression");
                Bytes::from(encoder.finish().expect("zlib compression"))
            }
        }
    }

    /// Decompress `payload` given the original uncompressed size.
    pub fn decompress(&self, payload: &Bytes, uncompressed_size: usize) -> Result<Bytes, String> {
        match self {
            CompressionType::None => Ok(payload.clone()),
            CompressionType::Lz4 => lz4_flex::decompress_size_prepended(payload)
                .map(Bytes::from)
                .map_err(|e| e.to_string()),
            CompressionType::Zlib => {
                let mut decoder = flate2::read::ZlibDecoder::new(&payload[..]);
                let mut out = Vec::with_capacity(uncompressed_size);
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| e.to_string())?;
                Ok(Bytes::from(out))
            }
        }
    }
}
