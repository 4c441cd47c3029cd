//! Chunk codecs and the decompression capability handed to readers.
//!
//! # Identity rules
//! A codec is identified on the command line by its name and in-process by
//! [`CodecId`].  The blob store does not record which codec compressed its
//! chunks: the reader is configured with a matching [`Decompressor`] when it
//! is opened, so the algorithm is a runtime choice of whoever opens the
//! container.
//!
//! # Decompressor contract
//! A [`Decompressor`] receives the compressed payload and an output buffer
//! already sized to the declared uncompressed length.  It must fill the
//! buffer exactly and fail with [`CodecError::SizeMismatch`] when the payload
//! expands to any other length.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use thiserror::Error;

// ── CodecId enum ─────────────────────────────────────────────────────────────

/// Runtime codec discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CodecId {
    None,
    #[default]
    Deflate,
    Zstd,
    Lz4,
    Brotli,
    Lzma,
}

impl CodecId {
    pub const ALL: [CodecId; 6] = [
        CodecId::None,
        CodecId::Deflate,
        CodecId::Zstd,
        CodecId::Lz4,
        CodecId::Brotli,
        CodecId::Lzma,
    ];

    /// Human-readable name (for diagnostics and the CLI).
    pub fn name(self) -> &'static str {
        match self {
            CodecId::None    => "none",
            CodecId::Deflate => "deflate",
            CodecId::Zstd    => "zstd",
            CodecId::Lz4     => "lz4",
            CodecId::Brotli  => "brotli",
            CodecId::Lzma    => "lzma",
        }
    }

    /// Parse from a CLI string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none"           => Some(CodecId::None),
            "deflate" | "zlib" => Some(CodecId::Deflate),
            "zstd"           => Some(CodecId::Zstd),
            "lz4"            => Some(CodecId::Lz4),
            "brotli"         => Some(CodecId::Brotli),
            "lzma"           => Some(CodecId::Lzma),
            _                => None,
        }
    }
}

impl std::fmt::Display for CodecId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    /// The payload expanded to a length other than the one declared next to it.
    #[error("Decompressed size mismatch: declared {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn codec_id(&self) -> CodecId;
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError>;
    /// `expected_len` is the declared uncompressed size.  Streaming codecs
    /// stop one byte past it, so the output is at most `expected_len + 1`
    /// bytes long whatever the payload claims.  LZMA fails outright once
    /// the payload outgrows it.
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError>;
}

fn compression(e: impl fmt::Display) -> CodecError {
    CodecError::Compression(e.to_string())
}

fn decompression(e: impl fmt::Display) -> CodecError {
    CodecError::Decompression(e.to_string())
}

fn read_bounded<R: Read>(reader: R, expected_len: usize) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(expected_len);
    reader
        .take(expected_len as u64 + 1)
        .read_to_end(&mut out)
        .map_err(decompression)?;
    Ok(out)
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct NoneCodec;
impl Codec for NoneCodec {
    fn codec_id(&self) -> CodecId { CodecId::None }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn decompress(&self, data: &[u8], _: usize) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
}

/// Raw deflate, the codec map chunks have historically been written with.
pub struct DeflateCodec;
impl Codec for DeflateCodec {
    fn codec_id(&self) -> CodecId { CodecId::Deflate }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        let level = flate2::Compression::new(level.clamp(0, 9) as u32);
        let mut w = flate2::write::DeflateEncoder::new(Vec::with_capacity(data.len() / 2), level);
        w.write_all(data).map_err(compression)?;
        w.finish().map_err(compression)
    }
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        read_bounded(flate2::read::DeflateDecoder::new(data), expected_len)
    }
}

pub struct ZstdCodec;
impl Codec for ZstdCodec {
    fn codec_id(&self) -> CodecId { CodecId::Zstd }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        zstd::bulk::compress(data, level).map_err(compression)
    }
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        let decoder = zstd::stream::read::Decoder::new(data).map_err(decompression)?;
        read_bounded(decoder, expected_len)
    }
}

/// LZ4 block format with the uncompressed length prepended.
pub struct Lz4Codec;
impl Codec for Lz4Codec {
    fn codec_id(&self) -> CodecId { CodecId::Lz4 }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        Ok(lz4_flex::compress_prepend_size(data))
    }
    fn decompress(&self, data: &[u8], _: usize) -> Result<Vec<u8>, CodecError> {
        lz4_flex::decompress_size_prepended(data).map_err(decompression)
    }
}

pub struct BrotliCodec;
impl Codec for BrotliCodec {
    fn codec_id(&self) -> CodecId { CodecId::Brotli }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        let mut w = brotli::CompressorWriter::new(&mut out, 4096, level.clamp(0, 11) as u32, 22);
        w.write_all(data).map_err(compression)?;
        drop(w);
        Ok(out)
    }
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        read_bounded(brotli::Decompressor::new(data, 4096), expected_len)
    }
}

pub struct LzmaCodec;
impl Codec for LzmaCodec {
    fn codec_id(&self) -> CodecId { CodecId::Lzma }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_compress(&mut io::Cursor::new(data), &mut out).map_err(compression)?;
        Ok(out)
    }
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        // Both the dictionary window and the output stop at the declared size.
        let opts = lzma_rs::decompress::Options {
            memlimit: Some(expected_len),
            ..Default::default()
        };
        let mut out = vec![0u8; expected_len];
        let mut rest = out.as_mut_slice();
        lzma_rs::lzma_decompress_with_options(&mut io::Cursor::new(data), &mut rest, &opts)
            .map_err(decompression)?;
        let written = expected_len - rest.len();
        out.truncate(written);
        Ok(out)
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

pub fn get_codec(id: CodecId) -> Box<dyn Codec> {
    match id {
        CodecId::None    => Box::new(NoneCodec),
        CodecId::Deflate => Box::new(DeflateCodec),
        CodecId::Zstd    => Box::new(ZstdCodec),
        CodecId::Lz4     => Box::new(Lz4Codec),
        CodecId::Brotli  => Box::new(BrotliCodec),
        CodecId::Lzma    => Box::new(LzmaCodec),
    }
}

// ── Decompressor capability ──────────────────────────────────────────────────

/// Fills `dst` (sized to the declared uncompressed length) from `src`.
pub type Decompressor =
    Arc<dyn Fn(&[u8], &mut [u8]) -> Result<(), CodecError> + Send + Sync>;

/// Wrap a built-in codec as a [`Decompressor`] that enforces the declared size.
///
/// For streaming codecs `actual` in a [`CodecError::SizeMismatch`] is capped
/// at one byte past the declared size.
pub fn decompressor(id: CodecId) -> Decompressor {
    let codec = get_codec(id);
    Arc::new(move |src: &[u8], dst: &mut [u8]| {
        let out = codec.decompress(src, dst.len())?;
        if out.len() != dst.len() {
            return Err(CodecError::SizeMismatch { expected: dst.len(), actual: out.len() });
        }
        dst.copy_from_slice(&out);
        Ok(())
    })
}
