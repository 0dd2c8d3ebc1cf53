//! A store backed by a plain directory:
//!
//! ```text
//! <root>/collection.json   all records, pretty-printed
//! <root>/media/<asset id>  one file per asset
//! ```
//!
//! `collection.json` is the commit point.  Incoming media are staged in a
//! hidden directory under `<root>` and moved into `media/` only after the
//! new `collection.json` has been persisted, so a failed batch leaves the
//! directory as it was.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::{
    validate_record, AssetStream, CollectionStore, ImportBatch, ImportMode, RecordOutcome, StoreError, StoreSnapshot,
};
use crate::model::{AssetId, Record, Snapshot};

pub const COLLECTION_FILE: &str = "collection.json";
pub const MEDIA_DIR: &str = "media";

#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Open (creating if needed) a collection directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join(MEDIA_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn media_path(&self, id: &AssetId) -> PathBuf {
        self.root.join(MEDIA_DIR).join(id.as_str())
    }

    pub fn records(&self) -> Result<Vec<Record>, StoreError> {
        Ok(self.load()?.records)
    }

    fn load(&self) -> Result<Snapshot, StoreError> {
        let file = match File::open(self.root.join(COLLECTION_FILE)) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Snapshot::default()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| StoreError::Corrupt(format!("{COLLECTION_FILE}: {e}")))
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let tmp = NamedTempFile::new_in(&self.root)?;
        {
            let mut out = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut out, snapshot)
                .map_err(|e| StoreError::Aborted(format!("cannot encode collection: {e}")))?;
            out.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(self.root.join(COLLECTION_FILE)).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }

    fn prune_media(&self, keep: &HashSet<&AssetId>) -> io::Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(self.root.join(MEDIA_DIR))? {
            let entry = entry?;
            let unreferenced = entry
                .file_name()
                .to_str()
                .and_then(|name| AssetId::new(name).ok())
                .map_or(false, |id| !keep.contains(&id));
            if unreferenced && entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

impl CollectionStore for DirectoryStore {
    fn snapshot_all(&self) -> Result<StoreSnapshot, StoreError> {
        let snapshot = self.load()?;
        let assets = snapshot
            .asset_ids()
            .into_iter()
            .filter_map(|id| {
                let path = self.media_path(&id);
                if path.is_file() {
                    Some(AssetStream::from_path(id, path))
                } else {
                    warn!(asset = %id, "referenced media file is missing; exporting without it");
                    None
                }
            })
            .collect();
        Ok(StoreSnapshot { snapshot, assets })
    }

    fn apply_records(&mut self, batch: ImportBatch<'_>, mode: ImportMode) -> Result<Vec<RecordOutcome>, StoreError> {
        let mut records = match mode {
            ImportMode::Replace => Vec::new(),
            ImportMode::Merge => self.load()?.records,
        };

        let staging = tempfile::Builder::new().prefix(".incoming-").tempdir_in(&self.root)?;
        let mut incoming: Vec<AssetId> = Vec::new();
        let mut outcomes = Vec::with_capacity(batch.records.len());

        for record in &batch.records {
            if let Err(reason) = validate_record(record) {
                outcomes.push(RecordOutcome::Rejected(reason));
                continue;
            }
            for photo in &record.photos {
                let Some(staged) = batch.asset(&photo.asset) else { continue };
                if incoming.contains(&photo.asset) {
                    continue;
                }
                let mut dst = File::create(staging.path().join(photo.asset.as_str()))?;
                io::copy(&mut staged.open()?, &mut dst)?;
                dst.sync_all()?;
                incoming.push(photo.asset.clone());
            }
            match records.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => {
                    *existing = record.clone();
                    outcomes.push(RecordOutcome::Updated);
                }
                None => {
                    records.push(record.clone());
                    outcomes.push(RecordOutcome::Inserted);
                }
            }
        }

        let snapshot = Snapshot::new(records);
        self.save(&snapshot)?;

        // Committed.  From here on failures are reported, not propagated.
        for id in &incoming {
            if let Err(e) = fs::rename(staging.path().join(id.as_str()), self.media_path(id)) {
                warn!(asset = %id, error = %e, "failed to move imported media into place");
            }
        }
        if mode == ImportMode::Replace {
            let keep: HashSet<&AssetId> = snapshot.records.iter().flat_map(|r| r.photos.iter().map(|p| &p.asset)).collect();
            match self.prune_media(&keep) {
                Ok(n) => debug!(removed = n, "pruned unreferenced media"),
                Err(e) => warn!(error = %e, "failed to prune unreferenced media"),
            }
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Photo, Timestamp};
    use crate::store::StagedAsset;

    fn record(id: &str, asset: Option<&str>) -> Record {
        let mut r = Record::new(id, format!("Specimen {id}"), Timestamp(1));
        if let Some(a) = asset {
            r.photos.push(Photo {
                id: format!("{id}-photo"),
                kind: "normal".into(),
                caption: None,
                taken_at: None,
                asset: AssetId::new(a).unwrap(),
            });
        }
        r
    }

    fn stage(dir: &Path, id: &str, bytes: &[u8]) -> StagedAsset {
        let path = dir.join(id);
        fs::write(&path, bytes).unwrap();
        StagedAsset { id: AssetId::new(id).unwrap(), path, len: bytes.len() as u64 }
    }

    #[test]
    fn merge_writes_records_and_media() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let mut store = DirectoryStore::open(root.path()).unwrap();
        let assets = [stage(scratch.path(), "a.jpg", b"jpeg")];

        let batch = ImportBatch { records: vec![record("m1", Some("a.jpg"))], assets: &assets };
        assert_eq!(store.apply_records(batch, ImportMode::Merge).unwrap(), [RecordOutcome::Inserted]);

        assert_eq!(store.records().unwrap().len(), 1);
        assert_eq!(fs::read(store.media_path(&AssetId::new("a.jpg").unwrap())).unwrap(), b"jpeg");
        let leftovers: Vec<_> = fs::read_dir(root.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".incoming-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn replace_prunes_unreferenced_media() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let mut store = DirectoryStore::open(root.path()).unwrap();
        let old = [stage(scratch.path(), "old.jpg", b"old")];
        store
            .apply_records(ImportBatch { records: vec![record("m0", Some("old.jpg"))], assets: &old }, ImportMode::Merge)
            .unwrap();

        let new = [stage(scratch.path(), "new.jpg", b"new")];
        store
            .apply_records(ImportBatch { records: vec![record("m1", Some("new.jpg"))], assets: &new }, ImportMode::Replace)
            .unwrap();

        let ids: Vec<String> = store.records().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, ["m1"]);
        assert!(!store.media_path(&AssetId::new("old.jpg").unwrap()).exists());
        assert!(store.media_path(&AssetId::new("new.jpg").unwrap()).exists());
    }

    #[test]
    fn snapshot_lists_only_present_media() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let mut store = DirectoryStore::open(root.path()).unwrap();
        let assets = [stage(scratch.path(), "here.jpg", b"x")];
        let batch = ImportBatch {
            records: vec![record("m1", Some("here.jpg")), record("m2", Some("gone.jpg"))],
            assets:  &assets,
        };
        store.apply_records(batch, ImportMode::Merge).unwrap();

        let snap = store.snapshot_all().unwrap();
        assert_eq!(snap.snapshot.records.len(), 2);
        let ids: Vec<&str> = snap.assets.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, ["here.jpg"]);
    }

    #[test]
    fn corrupt_collection_file_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let store = DirectoryStore::open(root.path()).unwrap();
        fs::write(root.path().join(COLLECTION_FILE), b"{not json").unwrap();
        assert!(matches!(store.snapshot_all(), Err(StoreError::Corrupt(_))));
    }
}
