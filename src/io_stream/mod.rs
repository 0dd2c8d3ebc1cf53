//! Streaming archive writer and reader.
//!
//! # Writer
//! [`ArchiveWriter`] declares its entry count in the superblock up front,
//! then accepts entries one at a time.  Each entry is compressed in
//! 64 KiB chunks into a staging buffer, hashed with BLAKE3, and written as
//! a self-describing header followed by the compressed bytes.  Only
//! `Write` is required of the sink.
//!
//! # Reader
//! [`ArchiveReader`] reads the superblock, refuses implausible entry counts,
//! then yields entries lazily through [`ArchiveReader::next_entry`].  Each
//! [`Entry`] exposes `Read` over a streaming decoder wrapped by the security
//! guard, so nothing is materialised unless the caller asks for it.  Bytes
//! an entry's caller leaves unread are skipped (and still counted against
//! the archive size cap) when the next entry is requested.
//!
//! # Endianness
//! All binary I/O is strictly little-endian; see `entry.rs` and
//! `superblock.rs` for field-level layouts.

use std::cell::Cell;
use std::io::{self, Read, Write};
use thiserror::Error;
use tracing::{debug, trace};

use crate::cancel::CancelToken;
use crate::codec::{CodecError, CodecId, EntryDecoder, EntryEncoder, DEFAULT_COMPRESSION_LEVEL};
use crate::entry::{EntryHeader, HeaderFault, ENTRY_FIXED_SIZE, FLAG_SEALED};
use crate::guard::{
    integrity_of, sanitize_entry_name, violation_of, GuardedReader, Limits, Metered,
    SecurityViolation, Source, ViolationKind,
};
use crate::superblock::{Superblock, SuperblockError, SUPERBLOCK_SIZE};

/// Chunk size of every streaming copy loop.
pub const CHUNK_SIZE: usize = 64 * 1024;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("not a valid archive: {0}")]
    Corrupt(String),
    #[error("archive truncated: {0}")]
    Truncated(String),
    #[error("archive declares {declared} entries but {found} were found")]
    EntryCountMismatch { declared: u32, found: u32 },
    #[error(transparent)]
    Security(#[from] SecurityViolation),
    #[error("operation cancelled")]
    Cancelled,
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("I/O error: {0}")]
    Io(io::Error),
    /// Writing would produce an archive that readers refuse.
    #[error("archive would exceed reader limits: {0}")]
    ExceedsLimits(String),
}

impl From<io::Error> for ContainerError {
    fn from(e: io::Error) -> Self {
        if let Some(v) = violation_of(&e) {
            return ContainerError::Security(v.clone());
        }
        if let Some(i) = integrity_of(&e) {
            return ContainerError::Corrupt(i.0.clone());
        }
        match e.kind() {
            io::ErrorKind::UnexpectedEof => ContainerError::Truncated(e.to_string()),
            // Decoders report malformed input as InvalidData or Other.
            io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::Other => {
                ContainerError::Corrupt(e.to_string())
            }
            _ => ContainerError::Io(e),
        }
    }
}

impl From<SuperblockError> for ContainerError {
    fn from(e: SuperblockError) -> Self {
        match e {
            SuperblockError::Io(io) => io.into(),
            other => ContainerError::Corrupt(other.to_string()),
        }
    }
}

impl From<HeaderFault> for ContainerError {
    fn from(fault: HeaderFault) -> Self {
        match fault {
            HeaderFault::Io(io) => io.into(),
            HeaderFault::NameTooLong(len) => ContainerError::Security(SecurityViolation::new(
                ViolationKind::NameTooLong,
                format!("entry name of {len} bytes"),
            )),
            HeaderFault::BadMagic(m) => ContainerError::Corrupt(format!("bad entry magic {m:#010x}")),
            HeaderFault::NameNotUtf8 => ContainerError::Corrupt("entry name is not UTF-8".into()),
            HeaderFault::ChecksumMismatch => ContainerError::Corrupt("entry header checksum mismatch".into()),
            HeaderFault::UnknownCodec(id) => ContainerError::Codec(CodecError::UnavailableCodec(id)),
        }
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// Writes archives that a reader holding the same [`Limits`] will accept:
/// entry count, name length, sizes and compression ratio are all checked
/// on the way out.
pub struct ArchiveWriter<W: Write> {
    writer:            W,
    pub superblock:    Superblock,
    written:           u32,
    pub compression_level: i32,
    limits:            Limits,
    bytes_out:         u64,
    total_uncompressed: u64,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(writer: W, entry_count: u32) -> Result<Self, ContainerError> {
        Self::with_level(writer, entry_count, DEFAULT_COMPRESSION_LEVEL)
    }

    pub fn with_level(writer: W, entry_count: u32, compression_level: i32) -> Result<Self, ContainerError> {
        Self::with_limits(writer, entry_count, compression_level, Limits::STANDARD)
    }

    /// Writer checked against `limits` instead of [`Limits::STANDARD`].
    pub fn with_limits(
        mut writer:        W,
        entry_count:       u32,
        compression_level: i32,
        limits:            Limits,
    ) -> Result<Self, ContainerError> {
        if entry_count > limits.max_entries {
            return Err(ContainerError::ExceedsLimits(format!(
                "{entry_count} entries, limit {}",
                limits.max_entries
            )));
        }
        let superblock = Superblock::new(entry_count);
        superblock.write(&mut writer).map_err(ContainerError::Io)?;
        Ok(Self {
            writer,
            superblock,
            written: 0,
            compression_level,
            limits,
            bytes_out: SUPERBLOCK_SIZE as u64,
            total_uncompressed: 0,
        })
    }

    /// Add an entry whose content is already in memory.
    pub fn add_bytes(
        &mut self,
        name:   &str,
        data:   &[u8],
        codec:  CodecId,
        sealed: bool,
    ) -> Result<EntryHeader, ContainerError> {
        self.add_entry(name, &mut &data[..], codec, sealed, &CancelToken::new())
    }

    /// Add an entry streamed from `src`, checking `cancel` between chunks.
    ///
    /// Sealed entries carry AEAD ciphertext: no digest is recorded because
    /// the tag already authenticates the content.
    pub fn add_entry(
        &mut self,
        name:   &str,
        src:    &mut dyn Read,
        codec:  CodecId,
        sealed: bool,
        cancel: &CancelToken,
    ) -> Result<EntryHeader, ContainerError> {
        if self.written >= self.superblock.entry_count {
            return Err(ContainerError::EntryCountMismatch {
                declared: self.superblock.entry_count,
                found:    self.written + 1,
            });
        }
        let limits = self.limits;
        if name.len() > limits.max_name_len {
            return Err(ContainerError::ExceedsLimits(format!(
                "entry name of {} bytes, limit {}",
                name.len(),
                limits.max_name_len
            )));
        }

        let mut encoder = EntryEncoder::new(codec, Vec::new(), self.compression_level)?;
        let mut hasher = blake3::Hasher::new();
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let mut uncompressed_size = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(ContainerError::Cancelled);
            }
            let n = match src.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ContainerError::Io(e)),
            };
            hasher.update(&chunk[..n]);
            encoder.write_all(&chunk[..n]).map_err(ContainerError::Io)?;
            uncompressed_size += n as u64;
        }
        let mut body = encoder.finish()?;
        let mut codec = codec;

        if uncompressed_size > limits.max_entry_bytes {
            return Err(ContainerError::ExceedsLimits(format!(
                "entry '{name}' holds {uncompressed_size} bytes, limit {}",
                limits.max_entry_bytes
            )));
        }
        self.total_uncompressed += uncompressed_size;
        if self.total_uncompressed > limits.max_total_bytes {
            return Err(ContainerError::ExceedsLimits(format!(
                "{} bytes of content, limit {}",
                self.total_uncompressed, limits.max_total_bytes
            )));
        }
        if limits.ratio_exceeded(uncompressed_size, body.len() as u64) {
            // Readers refuse this ratio as a bomb; store the content verbatim.
            debug!(entry = name, codec = codec.name(), "ratio over limit, storing uncompressed");
            body = expand(codec, &body, uncompressed_size)?;
            codec = CodecId::None;
        }
        self.bytes_out += (ENTRY_FIXED_SIZE + name.len() + 4) as u64 + body.len() as u64;
        if self.bytes_out > limits.max_archive_bytes {
            return Err(ContainerError::ExceedsLimits(format!(
                "archive reaches {} bytes, limit {}",
                self.bytes_out, limits.max_archive_bytes
            )));
        }

        let header = EntryHeader {
            codec,
            flags: if sealed { FLAG_SEALED } else { 0 },
            name: name.to_owned(),
            compressed_size: body.len() as u64,
            uncompressed_size,
            digest: if sealed { [0u8; 32] } else { *hasher.finalize().as_bytes() },
        };
        header.write(&mut self.writer).map_err(ContainerError::Io)?;
        self.writer.write_all(&body).map_err(ContainerError::Io)?;
        self.written += 1;

        debug!(
            entry = name,
            codec = codec.name(),
            compressed = header.compressed_size,
            uncompressed = header.uncompressed_size,
            "entry written"
        );
        Ok(header)
    }

    /// Verify every declared entry was written, flush, and return the sink.
    pub fn finish(mut self) -> Result<W, ContainerError> {
        if self.written != self.superblock.entry_count {
            return Err(ContainerError::EntryCountMismatch {
                declared: self.superblock.entry_count,
                found:    self.written,
            });
        }
        self.writer.flush().map_err(ContainerError::Io)?;
        Ok(self.writer)
    }
}

/// Decode an entry body this writer just produced.
fn expand(codec: CodecId, body: &[u8], len: u64) -> Result<Vec<u8>, ContainerError> {
    let mut raw = Vec::with_capacity(len as usize);
    EntryDecoder::new(codec, body)?.read_to_end(&mut raw).map_err(ContainerError::Io)?;
    Ok(raw)
}

// ── Reader ───────────────────────────────────────────────────────────────────

pub struct ArchiveReader<R: Read> {
    source:       Source<R>,
    superblock:   Superblock,
    limits:       Limits,
    entries_seen: u32,
    decompressed: u64,
    consumed:     Cell<u64>,
}

impl<R: Read> ArchiveReader<R> {
    pub fn open(reader: R) -> Result<Self, ContainerError> {
        Self::with_limits(reader, Limits::STANDARD)
    }

    pub(crate) fn with_limits(reader: R, limits: Limits) -> Result<Self, ContainerError> {
        let mut source = Source::new(reader, limits.max_archive_bytes);
        let mut buf = [0u8; SUPERBLOCK_SIZE];
        source.read_exact_raw(&mut buf)?;
        let superblock = Superblock::from_bytes(&buf)?;

        if superblock.entry_count > limits.max_entries {
            return Err(SecurityViolation::new(
                ViolationKind::TooManyEntries,
                format!("archive declares {} entries, limit {}", superblock.entry_count, limits.max_entries),
            ).into());
        }
        debug!(uuid = %superblock.archive_uuid, entries = superblock.entry_count, "archive opened");

        Ok(Self {
            source,
            superblock,
            limits,
            entries_seen: 0,
            decompressed: 0,
            consumed: Cell::new(0),
        })
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Archive bytes read so far.
    pub fn bytes_read(&self) -> u64 {
        self.source.consumed()
    }

    /// Advance to the next entry.  Returns `Ok(None)` once every declared
    /// entry has been produced and the input is exhausted.
    pub fn next_entry(&mut self) -> Result<Option<Entry<'_, R>>, ContainerError> {
        self.source.skip_entry_remainder()?;

        if self.entries_seen == self.superblock.entry_count {
            if !self.source.at_eof()? {
                return Err(ContainerError::Corrupt("trailing data after the last entry".into()));
            }
            return Ok(None);
        }

        let max_name_len = self.limits.max_name_len;
        let header = {
            let source = &mut self.source;
            EntryHeader::read_with(|buf| source.read_exact_raw(buf), max_name_len)
        };
        let header = match header {
            Ok(h) => h,
            Err(HeaderFault::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(ContainerError::EntryCountMismatch {
                    declared: self.superblock.entry_count,
                    found:    self.entries_seen,
                });
            }
            Err(fault) => return Err(fault.into()),
        };
        self.entries_seen += 1;

        self.limits.check_declared(&header.name, header.compressed_size, header.uncompressed_size)?;
        trace!(entry = %header.name, compressed = header.compressed_size, "entry header read");

        let path = sanitize_entry_name(&header.name);
        self.source.begin_entry(header.compressed_size);

        let Self { source, limits, decompressed, consumed, .. } = self;
        let consumed: &Cell<u64> = consumed;
        let metered = Metered::new(source, consumed);
        let decoder = EntryDecoder::new(header.codec, metered)?;
        let body = GuardedReader::new(
            decoder,
            header.name.clone(),
            *limits,
            consumed,
            decompressed,
            header.uncompressed_size,
            header.expected_digest(),
        );
        Ok(Some(Entry { header, path, body }))
    }
}

// ── Entry ────────────────────────────────────────────────────────────────────

/// One entry of an archive being read.
pub struct Entry<'a, R: Read> {
    header: EntryHeader,
    path:   Result<String, SecurityViolation>,
    body:   GuardedReader<'a, EntryDecoder<Metered<'a, R>>>,
}

impl<R: Read> Entry<'_, R> {
    pub fn header(&self) -> &EntryHeader {
        &self.header
    }

    /// The name exactly as stored in the archive.
    pub fn raw_name(&self) -> &str {
        &self.header.name
    }

    /// Normalised name, or the violation that disqualifies it.
    pub fn path(&self) -> Result<&str, &SecurityViolation> {
        self.path.as_deref()
    }

    pub fn compressed_size(&self) -> u64 {
        self.header.compressed_size
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.header.uncompressed_size
    }

    /// Stream the decompressed content into `dst`, checking `cancel`
    /// between chunks.  Returns the number of bytes produced.
    pub fn copy_to(&mut self, dst: &mut dyn Write, cancel: &CancelToken) -> Result<u64, ContainerError> {
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(ContainerError::Cancelled);
            }
            let n = match self.body.read(&mut chunk) {
                Ok(0) => return Ok(total),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            dst.write_all(&chunk[..n]).map_err(ContainerError::Io)?;
            total += n as u64;
        }
    }

    /// Read the whole entry into memory, refusing anything larger than `cap`.
    pub fn read_capped(&mut self, cap: u64, cancel: &CancelToken) -> Result<Vec<u8>, ContainerError> {
        if self.header.uncompressed_size > cap {
            return Err(SecurityViolation::new(
                ViolationKind::DecompressedSizeLimit,
                format!("entry '{}' declares {} bytes, limit {cap}", self.header.name, self.header.uncompressed_size),
            ).into());
        }
        // The declared size is untrusted; grow only as content arrives.
        let mut out = Vec::with_capacity(self.header.uncompressed_size.min(CHUNK_SIZE as u64) as usize);
        self.copy_to(&mut out, cancel)?;
        Ok(out)
    }
}

impl<R: Read> Read for Entry<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.body.read(buf)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn build(entries: &[(&str, &[u8], CodecId)]) -> Vec<u8> {
        let mut w = ArchiveWriter::new(Vec::new(), entries.len() as u32).unwrap();
        for (name, data, codec) in entries {
            w.add_bytes(name, data, *codec, false).unwrap();
        }
        w.finish().unwrap()
    }

    fn read_all(bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>, ContainerError> {
        let mut reader = ArchiveReader::open(bytes)?;
        let mut out = Vec::new();
        while let Some(mut entry) = reader.next_entry()? {
            let data = entry.read_capped(u64::MAX, &CancelToken::new())?;
            out.push((entry.raw_name().to_owned(), data));
        }
        Ok(out)
    }

    #[test]
    fn entries_come_back_in_write_order() {
        let bytes = build(&[
            ("manifest", b"{}", CodecId::Zstd),
            ("payload", b"[1,2,3]", CodecId::Lz4),
            ("asset/a.jpg", &[0xFFu8, 0xD8, 0xFF], CodecId::None),
        ]);
        let entries = read_all(&bytes).unwrap();
        let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["manifest", "payload", "asset/a.jpg"]);
        assert_eq!(entries[1].1, b"[1,2,3]");
    }

    #[test]
    fn unread_entries_are_skipped() {
        let bytes = build(&[
            ("a", &[1u8; 5000], CodecId::Zstd),
            ("b", b"second", CodecId::Brotli),
        ]);
        let mut reader = ArchiveReader::open(&bytes[..]).unwrap();
        reader.next_entry().unwrap().unwrap();
        let mut b = reader.next_entry().unwrap().unwrap();
        assert_eq!(b.read_capped(100, &CancelToken::new()).unwrap(), b"second");
        drop(b);
        assert!(reader.next_entry().unwrap().is_none());
        assert_eq!(reader.bytes_read(), bytes.len() as u64);
    }

    #[test]
    fn truncation_is_structural() {
        let bytes = build(&[("payload", &[42u8; 2000], CodecId::None)]);
        let cut = &bytes[..bytes.len() - 100];
        assert!(matches!(read_all(cut), Err(ContainerError::Truncated(_))));
    }

    #[test]
    fn missing_entries_are_structural() {
        let mut w = ArchiveWriter::new(Vec::new(), 2).unwrap();
        w.add_bytes("manifest", b"{}", CodecId::Zstd, false).unwrap();
        assert!(matches!(w.finish(), Err(ContainerError::EntryCountMismatch { declared: 2, found: 1 })));
    }

    #[test]
    fn corrupted_content_fails_digest() {
        let mut bytes = build(&[("payload", b"stored verbatim", CodecId::None)]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(read_all(&bytes), Err(ContainerError::Corrupt(_))));
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let mut bytes = build(&[("manifest", b"{}", CodecId::None)]);
        bytes.extend_from_slice(b"junk");
        assert!(matches!(read_all(&bytes), Err(ContainerError::Corrupt(_))));
    }

    #[test]
    fn entry_count_cap_applies_before_iteration() {
        let bytes = build(&[("manifest", b"{}", CodecId::None)]);
        let limits = Limits { max_entries: 0, ..Limits::STANDARD };
        match ArchiveReader::with_limits(&bytes[..], limits) {
            Err(ContainerError::Security(v)) => assert_eq!(v.kind, ViolationKind::TooManyEntries),
            other => panic!("expected violation, got {:?}", other.err()),
        }
    }

    #[test]
    fn archive_size_cap_is_streaming() {
        let bytes = build(&[
            ("a", &[3u8; 3_000], CodecId::None),
            ("b", &[4u8; 3_000], CodecId::None),
        ]);
        let limits = Limits { max_archive_bytes: 4_000, ..Limits::STANDARD };
        let mut reader = ArchiveReader::with_limits(&bytes[..], limits).unwrap();
        let mut seen = 0;
        let err = loop {
            match reader.next_entry() {
                Ok(Some(mut entry)) => match entry.read_capped(u64::MAX, &CancelToken::new()) {
                    Ok(_) => seen += 1,
                    Err(e) => break e,
                },
                Ok(None) => panic!("cap never triggered"),
                Err(e) => break e,
            }
        };
        assert_eq!(seen, 1);
        match err {
            ContainerError::Security(v) => assert_eq!(v.kind, ViolationKind::ArchiveTooLarge),
            other => panic!("expected violation, got {other:?}"),
        }
    }

    #[test]
    fn traversal_names_are_flagged_not_fatal() {
        let bytes = build(&[("../../etc/passwd", b"x", CodecId::None), ("manifest", b"{}", CodecId::None)]);
        let mut reader = ArchiveReader::open(&bytes[..]).unwrap();
        let first = reader.next_entry().unwrap().unwrap();
        assert_eq!(first.path().unwrap_err().kind, ViolationKind::PathTraversal);
        drop(first);
        let second = reader.next_entry().unwrap().unwrap();
        assert_eq!(second.path().unwrap(), "manifest");
    }

    #[test]
    fn cancellation_stops_the_copy_loop() {
        let bytes = build(&[("payload", &[0u8; 1000], CodecId::Zstd)]);
        let mut reader = ArchiveReader::open(&bytes[..]).unwrap();
        let mut entry = reader.next_entry().unwrap().unwrap();
        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(entry.copy_to(&mut io::sink(), &token), Err(ContainerError::Cancelled)));
    }

    #[test]
    fn highly_compressible_entries_are_stored_verbatim() {
        let zeros = vec![0u8; 4 * 1024 * 1024];
        let mut w = ArchiveWriter::new(Vec::new(), 1).unwrap();
        let header = w.add_bytes("payload", &zeros, CodecId::Zstd, false).unwrap();
        assert_eq!(header.codec, CodecId::None);
        assert_eq!(header.compressed_size, zeros.len() as u64);

        let bytes = w.finish().unwrap();
        let entries = read_all(&bytes).unwrap();
        assert_eq!(entries[0].1, zeros);
    }

    #[test]
    fn writer_refuses_what_readers_would_refuse() {
        assert!(matches!(ArchiveWriter::new(Vec::new(), 10_001), Err(ContainerError::ExceedsLimits(_))));

        let mut w = ArchiveWriter::new(Vec::new(), 1).unwrap();
        let long = format!("asset/{}", "n".repeat(300));
        assert!(matches!(w.add_bytes(&long, b"x", CodecId::None, false), Err(ContainerError::ExceedsLimits(_))));

        let limits = Limits { max_archive_bytes: 1_000, ..Limits::STANDARD };
        let mut w = ArchiveWriter::with_limits(Vec::new(), 1, DEFAULT_COMPRESSION_LEVEL, limits).unwrap();
        let err = w.add_bytes("payload", &[9u8; 2_000], CodecId::None, false).unwrap_err();
        assert!(err.to_string().contains("reader limits"), "{err}");
    }
}
