use std::collections::HashMap;
use std::io::Read;

use super::{
    validate_record, AssetStream, CollectionStore, ImportBatch, ImportMode, RecordOutcome, StoreError, StoreSnapshot,
};
use crate::model::{AssetId, Record, Snapshot};

/// A store held entirely in memory.  Batches are applied to a working copy
/// which replaces the live state only when the whole batch succeeds.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Vec<Record>,
    assets:  HashMap<AssetId, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<Record>) -> Self {
        Self { records, assets: HashMap::new() }
    }

    pub fn put_asset(&mut self, id: AssetId, bytes: Vec<u8>) {
        self.assets.insert(id, bytes);
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn record(&self, id: &str) -> Option<&Record> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn asset(&self, id: &AssetId) -> Option<&[u8]> {
        self.assets.get(id).map(Vec::as_slice)
    }

    pub fn asset_count(&self) -> usize {
        self.assets.len()
    }
}

impl CollectionStore for MemoryStore {
    fn snapshot_all(&self) -> Result<StoreSnapshot, StoreError> {
        let snapshot = Snapshot::new(self.records.clone());
        let assets = snapshot
            .asset_ids()
            .into_iter()
            .filter_map(|id| self.assets.get(&id).map(|bytes| AssetStream::from_bytes(id.clone(), bytes.clone())))
            .collect();
        Ok(StoreSnapshot { snapshot, assets })
    }

    fn apply_records(&mut self, batch: ImportBatch<'_>, mode: ImportMode) -> Result<Vec<RecordOutcome>, StoreError> {
        let mut working = match mode {
            ImportMode::Replace => MemoryStore::new(),
            ImportMode::Merge => self.clone(),
        };

        let mut outcomes = Vec::with_capacity(batch.records.len());
        for record in &batch.records {
            if let Err(reason) = validate_record(record) {
                outcomes.push(RecordOutcome::Rejected(reason));
                continue;
            }
            for photo in &record.photos {
                if let Some(staged) = batch.asset(&photo.asset) {
                    let mut bytes = Vec::with_capacity(staged.len as usize);
                    staged.open()?.read_to_end(&mut bytes)?;
                    working.assets.insert(photo.asset.clone(), bytes);
                }
            }
            match working.records.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => {
                    *existing = record.clone();
                    outcomes.push(RecordOutcome::Updated);
                }
                None => {
                    working.records.push(record.clone());
                    outcomes.push(RecordOutcome::Inserted);
                }
            }
        }

        *self = working;
        Ok(outcomes)
    }
}
