//! Streaming defenses applied to every byte read from an untrusted archive.
//!
//! The guard sits at two points of the read stack:
//!
//! ```text
//!   archive file ─▶ Source (size cap, entry bound) ─▶ Metered (compressed
//!   bytes consumed) ─▶ codec decoder ─▶ GuardedReader (ratio, size caps,
//!   digest) ─▶ caller
//! ```
//!
//! All checks run as bytes flow, so an oversized or malicious entry is
//! rejected before it is materialised.  Violations travel through
//! `std::io::Error` (decoders only speak `io`) and are recovered with
//! [`violation_of`], which keeps them distinct from ordinary corruption.

use std::cell::Cell;
use std::fmt;
use std::io::{self, Read};
use thiserror::Error;

const MIB: u64 = 1024 * 1024;

// ── Limits ───────────────────────────────────────────────────────────────────

/// Security limits.  These are a trust boundary and are not configurable
/// outside this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Total bytes of archive (compressed) input.
    pub max_archive_bytes:      u64,
    /// Decompressed bytes produced by a single entry.
    pub max_entry_bytes:        u64,
    /// Decompressed bytes produced across all entries of one archive.
    pub max_total_bytes:        u64,
    /// Decompressed / compressed ratio ceiling for a single entry.
    pub max_ratio:              u64,
    /// Output an entry may produce before the ratio is enforced.
    pub ratio_grace_bytes:      u64,
    /// Entries an archive may declare.
    pub max_entries:            u32,
    /// Byte length of an entry name.
    pub max_name_len:           usize,
    /// Decompressed size of the manifest entry.
    pub max_manifest_bytes:     u64,
}

impl Limits {
    pub const STANDARD: Limits = Limits {
        max_archive_bytes:  100 * MIB,
        max_entry_bytes:    500 * MIB,
        max_total_bytes:    500 * MIB,
        max_ratio:          100,
        ratio_grace_bytes:  MIB,
        max_entries:        10_000,
        max_name_len:       255,
        max_manifest_bytes: 64 * 1024,
    };

    /// Declared sizes are checked before any content is read.
    pub fn check_declared(
        &self,
        name: &str,
        compressed: u64,
        uncompressed: u64,
    ) -> Result<(), SecurityViolation> {
        if compressed > self.max_archive_bytes {
            return Err(SecurityViolation::new(
                ViolationKind::ArchiveTooLarge,
                format!("entry '{name}' declares {compressed} compressed bytes"),
            ));
        }
        if uncompressed > self.max_entry_bytes {
            return Err(SecurityViolation::new(
                ViolationKind::DecompressedSizeLimit,
                format!("entry '{name}' declares {uncompressed} bytes, limit {}", self.max_entry_bytes),
            ));
        }
        if self.ratio_exceeded(uncompressed, compressed) {
            return Err(SecurityViolation::new(
                ViolationKind::DecompressionRatio,
                format!("entry '{name}' declares {uncompressed}:{compressed}, limit {}:1", self.max_ratio),
            ));
        }
        Ok(())
    }

    pub(crate) fn ratio_exceeded(&self, produced: u64, consumed: u64) -> bool {
        produced > self.ratio_grace_bytes
            && produced > consumed.max(1).saturating_mul(self.max_ratio)
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::STANDARD
    }
}

// ── Violations ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    ArchiveTooLarge,
    DecompressionRatio,
    DecompressedSizeLimit,
    PathTraversal,
    TooManyEntries,
    NameTooLong,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ViolationKind::ArchiveTooLarge       => "archive too large",
            ViolationKind::DecompressionRatio    => "decompression ratio exceeded",
            ViolationKind::DecompressedSizeLimit => "decompressed size limit exceeded",
            ViolationKind::PathTraversal         => "path traversal",
            ViolationKind::TooManyEntries        => "too many entries",
            ViolationKind::NameTooLong           => "entry name too long",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("security violation ({kind}): {detail}")]
pub struct SecurityViolation {
    pub kind:   ViolationKind,
    pub detail: String,
}

impl SecurityViolation {
    pub fn new(kind: ViolationKind, detail: impl Into<String>) -> Self {
        Self { kind, detail: detail.into() }
    }

    pub(crate) fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::Other, self)
    }
}

/// Integrity failure detected while streaming (digest or size mismatch).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct IntegrityError(pub String);

/// Recover a [`SecurityViolation`] carried inside an `io::Error`.
pub fn violation_of(err: &io::Error) -> Option<&SecurityViolation> {
    err.get_ref().and_then(|inner| inner.downcast_ref::<SecurityViolation>())
}

/// Recover an [`IntegrityError`] carried inside an `io::Error`.
pub fn integrity_of(err: &io::Error) -> Option<&IntegrityError> {
    err.get_ref().and_then(|inner| inner.downcast_ref::<IntegrityError>())
}

// ── Path sanitization ────────────────────────────────────────────────────────

/// Normalise an entry name and verify it stays inside the archive root.
///
/// Backslashes are treated as separators, `.` segments and empty segments
/// are dropped and `..` pops a segment lexically.  Absolute paths, drive
/// prefixes, NUL bytes and any `..` that would climb above the root are
/// violations.  Returns the normalised `/`-joined relative path.
pub fn sanitize_entry_name(raw: &str) -> Result<String, SecurityViolation> {
    let traversal = |why: &str| {
        SecurityViolation::new(ViolationKind::PathTraversal, format!("entry '{raw}': {why}"))
    };

    if raw.contains('\0') {
        return Err(traversal("contains NUL"));
    }
    let unified = raw.replace('\\', "/");
    if unified.starts_with('/') {
        return Err(traversal("absolute path"));
    }
    let first = unified.split('/').next().unwrap_or("");
    if first.len() >= 2 && first.as_bytes()[1] == b':' {
        return Err(traversal("drive prefix"));
    }

    let mut stack: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if stack.pop().is_none() {
                    return Err(traversal("escapes archive root"));
                }
            }
            s => stack.push(s),
        }
    }
    if stack.is_empty() {
        return Err(traversal("empty path"));
    }
    Ok(stack.join("/"))
}

// ── Source ───────────────────────────────────────────────────────────────────

/// The raw archive input.  Counts every byte against the archive cap and
/// bounds content reads to the current entry.
pub(crate) struct Source<R: Read> {
    inner:     R,
    consumed:  u64,
    limit:     u64,
    remaining: u64,
}

impl<R: Read> Source<R> {
    pub(crate) fn new(inner: R, limit: u64) -> Self {
        Self { inner, consumed: 0, limit, remaining: 0 }
    }

    pub(crate) fn consumed(&self) -> u64 {
        self.consumed
    }

    fn account(&mut self, n: usize) -> io::Result<()> {
        self.consumed += n as u64;
        if self.consumed > self.limit {
            return Err(SecurityViolation::new(
                ViolationKind::ArchiveTooLarge,
                format!("archive exceeds {} bytes", self.limit),
            ).into_io());
        }
        Ok(())
    }

    /// Read header bytes, which sit outside any entry bound.
    pub(crate) fn read_exact_raw(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_exact(buf)?;
        self.account(buf.len())
    }

    /// True when the underlying input has no further bytes.
    pub(crate) fn at_eof(&mut self) -> io::Result<bool> {
        let mut byte = [0u8; 1];
        loop {
            match self.inner.read(&mut byte) {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    self.account(n)?;
                    return Ok(false);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) fn begin_entry(&mut self, compressed: u64) {
        self.remaining = compressed;
    }

    /// Discard whatever the previous entry's reader left unread.
    pub(crate) fn skip_entry_remainder(&mut self) -> io::Result<()> {
        if self.remaining > 0 {
            io::copy(self, &mut io::sink())?;
        }
        Ok(())
    }
}

impl<R: Read> Read for Source<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("archive truncated, {} entry bytes missing", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        self.account(n)?;
        Ok(n)
    }
}

/// Counts compressed bytes handed to a decoder.
pub(crate) struct Metered<'a, R: Read> {
    inner:    &'a mut Source<R>,
    consumed: &'a Cell<u64>,
}

impl<'a, R: Read> Metered<'a, R> {
    pub(crate) fn new(inner: &'a mut Source<R>, consumed: &'a Cell<u64>) -> Self {
        consumed.set(0);
        Self { inner, consumed }
    }
}

impl<R: Read> Read for Metered<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consumed.set(self.consumed.get() + n as u64);
        Ok(n)
    }
}

// ── GuardedReader ────────────────────────────────────────────────────────────

/// Decompressed side of one entry.  Enforces size and ratio caps on every
/// chunk, then verifies declared size and digest at end of stream.
pub struct GuardedReader<'a, D: Read> {
    inner:    D,
    name:     String,
    limits:   Limits,
    consumed: &'a Cell<u64>,
    total:    &'a mut u64,
    produced: u64,
    declared: u64,
    digest:   Option<([u8; 32], blake3::Hasher)>,
    done:     bool,
}

impl<'a, D: Read> GuardedReader<'a, D> {
    pub(crate) fn new(
        inner:    D,
        name:     String,
        limits:   Limits,
        consumed: &'a Cell<u64>,
        total:    &'a mut u64,
        declared: u64,
        digest:   Option<[u8; 32]>,
    ) -> Self {
        Self {
            inner,
            name,
            limits,
            consumed,
            total,
            produced: 0,
            declared,
            digest: digest.map(|d| (d, blake3::Hasher::new())),
            done: false,
        }
    }

    fn check_chunk(&self) -> io::Result<()> {
        if self.produced > self.limits.max_entry_bytes {
            return Err(SecurityViolation::new(
                ViolationKind::DecompressedSizeLimit,
                format!("entry '{}' expanded past {} bytes", self.name, self.limits.max_entry_bytes),
            ).into_io());
        }
        if *self.total > self.limits.max_total_bytes {
            return Err(SecurityViolation::new(
                ViolationKind::DecompressedSizeLimit,
                format!("archive expanded past {} bytes", self.limits.max_total_bytes),
            ).into_io());
        }
        let consumed = self.consumed.get();
        if self.limits.ratio_exceeded(self.produced, consumed) {
            return Err(SecurityViolation::new(
                ViolationKind::DecompressionRatio,
                format!(
                    "entry '{}' reached {}:{}, limit {}:1",
                    self.name, self.produced, consumed, self.limits.max_ratio
                ),
            ).into_io());
        }
        if self.produced > self.declared {
            return Err(integrity(format!(
                "entry '{}' produced more than its declared {} bytes",
                self.name, self.declared
            )));
        }
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        self.done = true;
        if self.produced != self.declared {
            return Err(integrity(format!(
                "entry '{}' declared {} bytes but produced {}",
                self.name, self.declared, self.produced
            )));
        }
        if let Some((expected, hasher)) = self.digest.take() {
            if *hasher.finalize().as_bytes() != expected {
                return Err(integrity(format!("entry '{}' content digest mismatch", self.name)));
            }
        }
        Ok(())
    }
}

impl<D: Read> Read for GuardedReader<'_, D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }
        let n = self.inner.read(buf)?;
        if n == 0 {
            self.finish()?;
            return Ok(0);
        }
        self.produced += n as u64;
        *self.total += n as u64;
        self.check_chunk()?;
        if let Some((_, hasher)) = self.digest.as_mut() {
            hasher.update(&buf[..n]);
        }
        Ok(n)
    }
}

fn integrity(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, IntegrityError(msg))
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn normalises_dot_segments_inside_root() {
        assert_eq!(sanitize_entry_name("asset/./a.jpg").unwrap(), "asset/a.jpg");
        assert_eq!(sanitize_entry_name("asset/x/../a.jpg").unwrap(), "asset/a.jpg");
        assert_eq!(sanitize_entry_name("asset\\a.jpg").unwrap(), "asset/a.jpg");
        assert_eq!(sanitize_entry_name("manifest").unwrap(), "manifest");
    }

    #[test]
    fn rejects_escapes() {
        for name in ["../evil", "asset/../../evil", "/etc/passwd", "\\evil", "C:\\evil", "C:/x",
                     "", ".", "a/..", "a\0b"] {
            let err = sanitize_entry_name(name).unwrap_err();
            assert_eq!(err.kind, ViolationKind::PathTraversal, "{name:?}");
        }
    }

    proptest! {
        #[test]
        fn sanitized_paths_never_climb(segs in proptest::collection::vec(
            prop_oneof![Just("..".to_string()), Just(".".to_string()), "[a-z]{1,4}"], 1..8)
        ) {
            let raw = segs.join("/");
            if let Ok(clean) = sanitize_entry_name(&raw) {
                prop_assert!(!clean.starts_with('/'));
                prop_assert!(clean.split('/').all(|s| s != ".." && s != "." && !s.is_empty()));
            }
        }
    }

    #[test]
    fn declared_bomb_is_rejected_up_front() {
        let limits = Limits::STANDARD;
        let err = limits.check_declared("payload", 1_000, 50 * MIB).unwrap_err();
        assert_eq!(err.kind, ViolationKind::DecompressionRatio);
        let err = limits.check_declared("payload", 10 * MIB, 600 * MIB).unwrap_err();
        assert_eq!(err.kind, ViolationKind::DecompressedSizeLimit);
        assert!(limits.check_declared("payload", 100, 5_000).is_ok());
    }

    #[test]
    fn source_enforces_archive_cap() {
        let data = vec![7u8; 64];
        let mut src = Source::new(&data[..], 32);
        src.begin_entry(64);
        let mut out = Vec::new();
        let err = src.read_to_end(&mut out).unwrap_err();
        assert_eq!(violation_of(&err).unwrap().kind, ViolationKind::ArchiveTooLarge);
    }

    #[test]
    fn source_reports_truncation() {
        let data = vec![1u8; 10];
        let mut src = Source::new(&data[..], 1_000);
        src.begin_entry(20);
        let mut out = Vec::new();
        let err = src.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn guarded_reader_stops_a_lying_bomb() {
        let limits = Limits { ratio_grace_bytes: 1024, ..Limits::STANDARD };
        let consumed = Cell::new(10);
        let mut total = 0u64;
        let zeros = io::repeat(0).take(10 * MIB);
        let mut guarded = GuardedReader::new(
            zeros, "payload".into(), limits, &consumed, &mut total, 10 * MIB, None,
        );
        let err = io::copy(&mut guarded, &mut io::sink()).unwrap_err();
        assert_eq!(violation_of(&err).unwrap().kind, ViolationKind::DecompressionRatio);
        assert!(total < 10 * MIB);
    }

    #[test]
    fn guarded_reader_verifies_digest() {
        let data = b"fluorite".to_vec();
        let consumed = Cell::new(data.len() as u64);
        let mut total = 0u64;
        let mut guarded = GuardedReader::new(
            &data[..], "asset/a".into(), Limits::STANDARD, &consumed, &mut total,
            data.len() as u64, Some([0u8; 32]),
        );
        let err = io::copy(&mut guarded, &mut io::sink()).unwrap_err();
        assert!(integrity_of(&err).is_some());
    }
}
