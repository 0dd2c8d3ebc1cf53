//! Export/import orchestration, the primary embedding surface.
//!
//! ```no_run
//! use geode::engine::BackupEngine;
//! use geode::store::{DirectoryStore, ImportMode};
//! use geode::crypto::Passphrase;
//!
//! let engine = BackupEngine::new(DirectoryStore::open("collection")?);
//! let pass = Passphrase::from("hunter2");
//!
//! // Export
//! let mut archive = Vec::new();
//! engine.export(&mut archive, Some(&pass))?;
//!
//! // Import, supplying the passphrase only once it is known to be needed
//! let staged = engine.stage(&archive[..], &Default::default())?;
//! if staged.is_encrypted() {
//!     let result = engine.apply(&staged, Some(&pass), ImportMode::Merge, &Default::default())?;
//!     println!("{} imported, {} skipped", result.imported, result.skipped);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Exports take the store's read lock for the whole of `Collecting` through
//! `Containerizing`; imports take the write lock only for `Applying`.  One
//! export and one import may be in flight per engine at a time; further
//! callers wait.

mod export;
mod import;

use std::fmt;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::codec::{CodecId, DEFAULT_COMPRESSION_LEVEL};
use crate::guard::Limits;
use crate::manifest::Manifest;

pub use import::StagedImport;

/// Entry name of the manifest.
pub const MANIFEST_ENTRY: &str = "manifest";
/// Entry name of the serialized (and possibly encrypted) snapshot.
pub const PAYLOAD_ENTRY: &str = "payload";

// ── States ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportState {
    Idle,
    Collecting,
    Serializing,
    Encrypting,
    Containerizing,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportState {
    Idle,
    OpeningContainer,
    ReadingManifest,
    CheckingSchema,
    ExtractingPayload,
    Decrypting,
    Deserializing,
    Applying,
    Done,
    /// Terminal for this attempt, but the staged archive can be applied
    /// again with a (different) passphrase.
    PasswordRequired,
    Failed,
}

/// Receives state transitions.  Called on the thread running the operation.
pub trait Progress: Send + Sync {
    fn on_export(&self, _state: ExportState) {}
    fn on_import(&self, _state: ImportState) {}
}

/// Discards every transition.
#[derive(Debug, Default)]
pub struct NoProgress;

impl Progress for NoProgress {}

/// Per-call cancellation and progress reporting.
#[derive(Clone)]
pub struct Control {
    pub cancel:   CancelToken,
    pub progress: Arc<dyn Progress>,
}

impl Control {
    pub fn new(cancel: CancelToken, progress: Arc<dyn Progress>) -> Self {
        Self { cancel, progress }
    }
}

impl Default for Control {
    fn default() -> Self {
        Self { cancel: CancelToken::new(), progress: Arc::new(NoProgress) }
    }
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Control").field("cancelled", &self.cancel.is_cancelled()).finish_non_exhaustive()
    }
}

// ── Results ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordErrorKind {
    /// The destination refused the record.  Counted in `skipped`.
    Validation,
    /// A record references an asset the archive does not contain.  The
    /// record itself is still imported.
    MissingAsset,
    /// An entry was dropped by the security guard.
    SecurityViolation,
    /// An entry with no meaning to this reader was ignored.
    UnexpectedEntry,
}

/// A non-fatal problem found while importing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordError {
    /// Record id or entry name the problem concerns.
    pub subject: String,
    pub kind:    RecordErrorKind,
    pub reason:  String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportResult {
    pub imported: usize,
    pub skipped:  usize,
    pub errors:   Vec<RecordError>,
}

impl ImportResult {
    pub fn errors_of(&self, kind: RecordErrorKind) -> impl Iterator<Item = &RecordError> {
        self.errors.iter().filter(move |e| e.kind == kind)
    }
}

/// What a successful export produced.
#[derive(Debug, Clone)]
pub struct ArchiveHandle {
    /// Set when the archive was written to a file by this crate.
    pub path:          Option<PathBuf>,
    pub archive_id:    Uuid,
    pub manifest:      Manifest,
    pub bytes_written: u64,
}

// ── Options ──────────────────────────────────────────────────────────────────

/// Tunables for [`BackupEngine`].  Security limits are fixed in
/// [`Limits::STANDARD`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub compression_level: i32,
    pub asset_codec:       CodecId,
    /// Where extracted assets wait before `Applying`; the system temp
    /// directory when unset.
    pub staging_dir:       Option<PathBuf>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            asset_codec:       CodecId::Lz4,
            staging_dir:       None,
        }
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct BackupEngine<S> {
    store:       RwLock<S>,
    export_gate: Mutex<()>,
    import_gate: Mutex<()>,
    options:     EngineOptions,
    limits:      Limits,
}

impl<S> BackupEngine<S> {
    pub fn new(store: S) -> Self {
        Self::with_options(store, EngineOptions::default())
    }

    pub fn with_options(store: S, options: EngineOptions) -> Self {
        Self {
            store: RwLock::new(store),
            export_gate: Mutex::new(()),
            import_gate: Mutex::new(()),
            options,
            limits: Limits::STANDARD,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Shared read access for unrelated features.  Blocks only while an
    /// import is `Applying`.
    pub fn store(&self) -> RwLockReadGuard<'_, S> {
        self.store.read()
    }

    pub fn into_store(self) -> S {
        self.store.into_inner()
    }
}

impl<S> fmt::Debug for BackupEngine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupEngine").field("options", &self.options).finish_non_exhaustive()
    }
}

/// Counts bytes on their way to the caller's sink.
struct CountingWriter<W> {
    inner:   W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
