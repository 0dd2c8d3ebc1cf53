//! Per-entry compression codecs.
//!
//! # Identity rules
//! Every codec is identified on disk by a single byte in the entry header.
//! These values are permanent: an id is never reused, even if a codec is
//! retired.  A reader that meets an id it does not know MUST fail the whole
//! archive; there is no fallback codec.
//!
//! # Streaming
//! Both directions are streaming.  [`EntryEncoder`] is a `Write` sink that
//! must be `finish()`ed; [`EntryDecoder`] is a `Read` source whose input is
//! pulled incrementally, so the security guard sitting above it observes
//! every decompressed chunk before the next one is produced.

use std::io::{self, BufReader, Read, Write};
use thiserror::Error;

// ── Frozen codec ids ─────────────────────────────────────────────────────────

/// No compression: content stored verbatim.
pub const ID_NONE:   u8 = 0;
/// Zstandard (default).
pub const ID_ZSTD:   u8 = 1;
/// LZ4 frame format.
pub const ID_LZ4:    u8 = 2;
/// Brotli.
pub const ID_BROTLI: u8 = 3;

/// Default Zstd compression level.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

const BROTLI_BUFFER: usize = 4096;
const BROTLI_LGWIN:  u32   = 22;

// ── CodecId enum ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecId {
    None,
    Zstd,
    Lz4,
    Brotli,
}

impl CodecId {
    /// The byte written into every entry header.
    #[inline]
    pub fn id(self) -> u8 {
        match self {
            CodecId::None   => ID_NONE,
            CodecId::Zstd   => ID_ZSTD,
            CodecId::Lz4    => ID_LZ4,
            CodecId::Brotli => ID_BROTLI,
        }
    }

    /// Resolve an on-disk id.  `None` if this build does not know it.
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            ID_NONE   => Some(CodecId::None),
            ID_ZSTD   => Some(CodecId::Zstd),
            ID_LZ4    => Some(CodecId::Lz4),
            ID_BROTLI => Some(CodecId::Brotli),
            _         => None,
        }
    }

    /// Human-readable name (diagnostics only, never parsed from disk).
    pub fn name(self) -> &'static str {
        match self {
            CodecId::None   => "none",
            CodecId::Zstd   => "zstd",
            CodecId::Lz4    => "lz4",
            CodecId::Brotli => "brotli",
        }
    }

    /// Parse from a CLI string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" | "store" => Some(CodecId::None),
            "zstd"           => Some(CodecId::Zstd),
            "lz4"            => Some(CodecId::Lz4),
            "brotli"         => Some(CodecId::Brotli),
            _                => None,
        }
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    /// The entry names a codec id this build does not provide.
    /// Decoding MUST NOT continue.
    #[error("Unknown codec id {0}: cannot decode without it")]
    UnavailableCodec(u8),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Encoder ──────────────────────────────────────────────────────────────────

/// Streaming compressor for one entry.
pub enum EntryEncoder<W: Write> {
    None(W),
    Zstd(zstd::stream::write::Encoder<'static, W>),
    Lz4(lz4_flex::frame::FrameEncoder<W>),
    Brotli(Box<brotli::CompressorWriter<W>>),
}

impl<W: Write> EntryEncoder<W> {
    pub fn new(codec: CodecId, sink: W, level: i32) -> Result<Self, CodecError> {
        Ok(match codec {
            CodecId::None => EntryEncoder::None(sink),
            CodecId::Zstd => EntryEncoder::Zstd(
                zstd::stream::write::Encoder::new(sink, level)
                    .map_err(|e| CodecError::Compression(e.to_string()))?,
            ),
            CodecId::Lz4 => EntryEncoder::Lz4(lz4_flex::frame::FrameEncoder::new(sink)),
            CodecId::Brotli => {
                let quality = level.clamp(0, 11) as u32;
                EntryEncoder::Brotli(Box::new(brotli::CompressorWriter::new(
                    sink, BROTLI_BUFFER, quality, BROTLI_LGWIN,
                )))
            }
        })
    }

    /// Flush the codec's trailing frame data and hand back the sink.
    pub fn finish(self) -> Result<W, CodecError> {
        match self {
            EntryEncoder::None(w) => Ok(w),
            EntryEncoder::Zstd(e) => e.finish()
                .map_err(|e| CodecError::Compression(e.to_string())),
            EntryEncoder::Lz4(e) => e.finish()
                .map_err(|e| CodecError::Compression(e.to_string())),
            EntryEncoder::Brotli(e) => Ok(e.into_inner()),
        }
    }
}

impl<W: Write> Write for EntryEncoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            EntryEncoder::None(w)   => w.write(buf),
            EntryEncoder::Zstd(e)   => e.write(buf),
            EntryEncoder::Lz4(e)    => e.write(buf),
            EntryEncoder::Brotli(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            EntryEncoder::None(w)   => w.flush(),
            EntryEncoder::Zstd(e)   => e.flush(),
            EntryEncoder::Lz4(e)    => e.flush(),
            EntryEncoder::Brotli(e) => e.flush(),
        }
    }
}

// ── Decoder ──────────────────────────────────────────────────────────────────

/// Streaming decompressor for one entry.
pub enum EntryDecoder<R: Read> {
    None(R),
    Zstd(zstd::stream::read::Decoder<'static, BufReader<R>>),
    Lz4(lz4_flex::frame::FrameDecoder<R>),
    Brotli(Box<brotli::Decompressor<R>>),
}

impl<R: Read> EntryDecoder<R> {
    pub fn new(codec: CodecId, source: R) -> Result<Self, CodecError> {
        Ok(match codec {
            CodecId::None => EntryDecoder::None(source),
            CodecId::Zstd => EntryDecoder::Zstd(
                zstd::stream::read::Decoder::new(source)
                    .map_err(|e| CodecError::Decompression(e.to_string()))?,
            ),
            CodecId::Lz4 => EntryDecoder::Lz4(lz4_flex::frame::FrameDecoder::new(source)),
            CodecId::Brotli => EntryDecoder::Brotli(Box::new(
                brotli::Decompressor::new(source, BROTLI_BUFFER),
            )),
        })
    }
}

impl<R: Read> Read for EntryDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            EntryDecoder::None(r)   => r.read(buf),
            EntryDecoder::Zstd(d)   => d.read(buf),
            EntryDecoder::Lz4(d)    => d.read(buf),
            EntryDecoder::Brotli(d) => d.read(buf),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(codec: CodecId, data: &[u8]) -> Vec<u8> {
        let mut enc = EntryEncoder::new(codec, Vec::new(), DEFAULT_COMPRESSION_LEVEL).unwrap();
        enc.write_all(data).unwrap();
        let compressed = enc.finish().unwrap();
        let mut out = Vec::new();
        EntryDecoder::new(codec, &compressed[..]).unwrap().read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn every_codec_restores_input() {
        let data = b"quartz quartz quartz calcite fluorite quartz".repeat(50);
        for codec in [CodecId::None, CodecId::Zstd, CodecId::Lz4, CodecId::Brotli] {
            assert_eq!(roundtrip(codec, &data), data, "codec {}", codec.name());
        }
    }

    #[test]
    fn ids_are_stable() {
        for codec in [CodecId::None, CodecId::Zstd, CodecId::Lz4, CodecId::Brotli] {
            assert_eq!(CodecId::from_id(codec.id()), Some(codec));
        }
        assert_eq!(CodecId::from_id(200), None);
    }

    #[test]
    fn names_parse_case_insensitively() {
        assert_eq!(CodecId::from_name("ZSTD"), Some(CodecId::Zstd));
        assert_eq!(CodecId::from_name("store"), Some(CodecId::None));
        assert_eq!(CodecId::from_name("lzma"), None);
    }
}
