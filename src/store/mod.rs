//! The data-access contract the engine consumes, and two implementations.
//!
//! A store provides exactly two operations: a full snapshot for export and
//! a transactional write for import.  Anything else about how records are
//! kept is the store's business.

pub mod directory;
pub mod memory;

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

use thiserror::Error;

use crate::model::{AssetId, Record, Snapshot};

pub use directory::DirectoryStore;
pub use memory::MemoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("store data is corrupt: {0}")]
    Corrupt(String),
    #[error("transaction aborted: {0}")]
    Aborted(String),
}

/// How incoming records are reconciled with what the store already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImportMode {
    /// Clear the destination, then insert everything.
    Replace,
    /// Insert or update by record id; leave everything else alone.
    #[default]
    Merge,
}

impl fmt::Display for ImportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ImportMode::Replace => "replace",
            ImportMode::Merge => "merge",
        })
    }
}

type Opener = Box<dyn FnOnce() -> io::Result<Box<dyn Read + Send>> + Send>;

/// An asset's content, opened only when the exporter reaches it.
pub struct AssetStream {
    pub id: AssetId,
    opener: Opener,
}

impl AssetStream {
    pub fn from_bytes(id: AssetId, bytes: Vec<u8>) -> Self {
        Self { id, opener: Box::new(move || Ok(Box::new(io::Cursor::new(bytes)) as Box<dyn Read + Send>)) }
    }

    pub fn from_path(id: AssetId, path: PathBuf) -> Self {
        Self { id, opener: Box::new(move || Ok(Box::new(File::open(path)?) as Box<dyn Read + Send>)) }
    }

    pub fn open(self) -> io::Result<Box<dyn Read + Send>> {
        (self.opener)()
    }
}

impl fmt::Debug for AssetStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetStream").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Everything an export needs from a store.  Assets appear in the order
/// of [`Snapshot::asset_ids`]; ids the store has no content for are absent.
#[derive(Debug, Default)]
pub struct StoreSnapshot {
    pub snapshot: Snapshot,
    pub assets:   Vec<AssetStream>,
}

/// An extracted asset waiting in the engine's staging area.
#[derive(Debug, Clone)]
pub struct StagedAsset {
    pub id:   AssetId,
    pub path: PathBuf,
    pub len:  u64,
}

impl StagedAsset {
    pub fn open(&self) -> io::Result<File> {
        File::open(&self.path)
    }
}

/// Records to write, plus the staged assets they may reference.
#[derive(Debug)]
pub struct ImportBatch<'a> {
    pub records: Vec<Record>,
    pub assets:  &'a [StagedAsset],
}

impl ImportBatch<'_> {
    pub fn asset(&self, id: &AssetId) -> Option<&StagedAsset> {
        self.assets.iter().find(|a| &a.id == id)
    }
}

/// Per-record result of [`CollectionStore::apply_records`], in input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    Updated,
    Rejected(String),
}

pub trait CollectionStore {
    /// Read everything needed for an export.
    fn snapshot_all(&self) -> Result<StoreSnapshot, StoreError>;

    /// Apply a batch inside one transaction.  Rejected records do not
    /// abort the batch; an `Err` means nothing was changed.
    fn apply_records(&mut self, batch: ImportBatch<'_>, mode: ImportMode) -> Result<Vec<RecordOutcome>, StoreError>;
}

/// Destination-side checks shared by every store.
pub fn validate_record(record: &Record) -> Result<(), String> {
    if record.id.trim().is_empty() {
        return Err("record id is empty".into());
    }
    if record.name.trim().is_empty() {
        return Err("name is required".into());
    }

    let mohs_min = record.mohs_min.as_ref().map(|q| q.to_f64());
    let mohs_max = record.mohs_max.as_ref().map(|q| q.to_f64());
    for mohs in [mohs_min, mohs_max].into_iter().flatten() {
        if !(1.0..=10.0).contains(&mohs) {
            return Err(format!("Mohs hardness {mohs} outside 1-10"));
        }
    }
    if let (Some(min), Some(max)) = (mohs_min, mohs_max) {
        if min > max {
            return Err(format!("Mohs minimum {min} exceeds maximum {max}"));
        }
    }

    if let Some(q) = record.quality_rating {
        if !(1..=5).contains(&q) {
            return Err(format!("quality rating {q} outside 1-5"));
        }
    }

    if let Some(p) = &record.provenance {
        if let Some(lat) = p.latitude.as_ref().map(|q| q.to_f64()) {
            if !(-90.0..=90.0).contains(&lat) {
                return Err(format!("latitude {lat} outside -90..90"));
            }
        }
        if let Some(lon) = p.longitude.as_ref().map(|q| q.to_f64()) {
            if !(-180.0..=180.0).contains(&lon) {
                return Err(format!("longitude {lon} outside -180..180"));
            }
        }
    }
    Ok(())
}
