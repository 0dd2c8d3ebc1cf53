use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use tempfile::TempDir;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::{
    BackupEngine, Control, ImportResult, ImportState, RecordError, RecordErrorKind, MANIFEST_ENTRY, PAYLOAD_ENTRY,
};
use crate::crypto::{self, Passphrase};
use crate::error::ImportError;
use crate::guard::{SecurityViolation, ViolationKind};
use crate::io_stream::ArchiveReader;
use crate::manifest::Manifest;
use crate::model::{AssetId, Snapshot};
use crate::payload;
use crate::schema::{Compatible, Upgrade};
use crate::store::{CollectionStore, ImportBatch, ImportMode, RecordOutcome, StagedAsset};

/// An archive that has been read, checked and extracted, but not yet
/// decrypted or applied.  Can be applied any number of times, so a wrong
/// or missing passphrase never forces the file to be read again.
///
/// Extracted assets live in a private temporary directory removed when
/// this value is dropped.
#[derive(Debug)]
pub struct StagedImport {
    archive_id:     Uuid,
    manifest:       Manifest,
    compat:         Compatible,
    payload:        Vec<u8>,
    payload_sealed: bool,
    assets:         Vec<StagedAsset>,
    dropped:        Vec<RecordError>,
    _staging:       TempDir,
}

impl StagedImport {
    pub fn archive_id(&self) -> Uuid {
        self.archive_id
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn is_encrypted(&self) -> bool {
        self.manifest.encrypted
    }

    pub fn assets(&self) -> &[StagedAsset] {
        &self.assets
    }

    /// Entries the reader refused or ignored.
    pub fn dropped_entries(&self) -> &[RecordError] {
        &self.dropped
    }
}

fn final_state(err: &ImportError) -> ImportState {
    match err {
        ImportError::PasswordRequired | ImportError::AuthenticationFailure => ImportState::PasswordRequired,
        _ => ImportState::Failed,
    }
}

impl<S: CollectionStore> BackupEngine<S> {
    /// Read, check and apply an archive in one call.
    pub fn import<R: Read>(
        &self,
        archive:    R,
        passphrase: Option<&Passphrase>,
        mode:       ImportMode,
    ) -> Result<ImportResult, ImportError> {
        self.import_with(archive, passphrase, mode, &Control::default())
    }

    pub fn import_with<R: Read>(
        &self,
        archive:    R,
        passphrase: Option<&Passphrase>,
        mode:       ImportMode,
        control:    &Control,
    ) -> Result<ImportResult, ImportError> {
        let _gate = self.import_gate.lock();
        let staged = self.tracked(control, |report| self.run_stage(archive, control, report))?;
        self.tracked(control, |report| self.run_apply(&staged, passphrase, mode, control, report))
    }

    /// Import from a file, refusing it up front if it is larger than the
    /// archive size cap.
    pub fn import_path(
        &self,
        path:       &Path,
        passphrase: Option<&Passphrase>,
        mode:       ImportMode,
        control:    &Control,
    ) -> Result<ImportResult, ImportError> {
        let file = self.open_archive(path)?;
        self.import_with(BufReader::new(file), passphrase, mode, control)
    }

    /// `OpeningContainer` through `ExtractingPayload`.  Does not touch the
    /// store.
    pub fn stage<R: Read>(&self, archive: R, control: &Control) -> Result<StagedImport, ImportError> {
        self.tracked(control, |report| self.run_stage(archive, control, report))
    }

    pub fn stage_path(&self, path: &Path, control: &Control) -> Result<StagedImport, ImportError> {
        let file = self.open_archive(path)?;
        self.stage(BufReader::new(file), control)
    }

    /// `Decrypting` through `Applying` for a staged archive.
    pub fn apply(
        &self,
        staged:     &StagedImport,
        passphrase: Option<&Passphrase>,
        mode:       ImportMode,
        control:    &Control,
    ) -> Result<ImportResult, ImportError> {
        let _gate = self.import_gate.lock();
        self.tracked(control, |report| self.run_apply(staged, passphrase, mode, control, report))
    }

    fn open_archive(&self, path: &Path) -> Result<File, ImportError> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len > self.limits.max_archive_bytes {
            return Err(SecurityViolation::new(
                ViolationKind::ArchiveTooLarge,
                format!("archive is {len} bytes, limit {}", self.limits.max_archive_bytes),
            )
            .into());
        }
        Ok(file)
    }

    /// Run one phase, reporting its terminal state on failure.
    fn tracked<T>(
        &self,
        control: &Control,
        phase:   impl FnOnce(&dyn Fn(ImportState)) -> Result<T, ImportError>,
    ) -> Result<T, ImportError> {
        let report = |state: ImportState| {
            debug!(?state, "import");
            control.progress.on_import(state);
        };
        let result = phase(&report);
        if let Err(e) = &result {
            report(final_state(e));
            match e {
                ImportError::Security(v) => warn!(kind = %v.kind, detail = %v.detail, "import refused"),
                ImportError::PasswordRequired => info!("archive is encrypted; waiting for a passphrase"),
                other => warn!(error = %other, "import failed"),
            }
        }
        result
    }

    fn run_stage<R: Read>(
        &self,
        archive: R,
        control: &Control,
        report:  &dyn Fn(ImportState),
    ) -> Result<StagedImport, ImportError> {
        let cancel = &control.cancel;
        if cancel.is_cancelled() {
            return Err(ImportError::Cancelled);
        }

        report(ImportState::OpeningContainer);
        let mut reader = ArchiveReader::with_limits(archive, self.limits)?;
        let archive_id = reader.superblock().archive_uuid;
        let staging = match &self.options.staging_dir {
            Some(dir) => tempfile::Builder::new().prefix("geode-import-").tempdir_in(dir)?,
            None => tempfile::Builder::new().prefix("geode-import-").tempdir()?,
        };

        report(ImportState::ReadingManifest);
        let mut manifest: Option<(Manifest, Compatible)> = None;
        let mut payload: Option<(Vec<u8>, bool)> = None;
        let mut assets: Vec<StagedAsset> = Vec::new();
        let mut dropped: Vec<RecordError> = Vec::new();

        while let Some(mut entry) = reader.next_entry()? {
            if cancel.is_cancelled() {
                return Err(ImportError::Cancelled);
            }
            let path = match entry.path() {
                Ok(p) => p.to_owned(),
                Err(v) => {
                    warn!(entry = %entry.raw_name(), kind = %v.kind, "dropping entry");
                    dropped.push(RecordError {
                        subject: entry.raw_name().to_owned(),
                        kind:    RecordErrorKind::SecurityViolation,
                        reason:  v.to_string(),
                    });
                    continue;
                }
            };

            if path == MANIFEST_ENTRY {
                if manifest.is_some() {
                    return Err(ImportError::Structural("duplicate manifest entry".into()));
                }
                let bytes = entry.read_capped(self.limits.max_manifest_bytes, cancel)?;
                report(ImportState::CheckingSchema);
                let (parsed, compat) = Manifest::parse(&bytes)?;
                debug!(
                    schema = %parsed.schema_version,
                    producer = %parsed.producer_id,
                    encrypted = parsed.encrypted,
                    "manifest accepted"
                );
                manifest = Some((parsed, compat));
                report(ImportState::ExtractingPayload);
            } else if path == PAYLOAD_ENTRY {
                if payload.is_some() {
                    return Err(ImportError::Structural("duplicate payload entry".into()));
                }
                let sealed = entry.header().is_sealed();
                let bytes = entry.read_capped(self.limits.max_entry_bytes, cancel)?;
                payload = Some((bytes, sealed));
            } else if let Some(id) = AssetId::from_entry_name(&path) {
                if assets.iter().any(|a| a.id == id) {
                    dropped.push(unexpected(&path, "duplicate asset entry"));
                    continue;
                }
                let dst = staging.path().join(id.as_str());
                let mut file = File::create(&dst)?;
                let len = entry.copy_to(&mut file, cancel)?;
                assets.push(StagedAsset { id, path: dst, len });
            } else {
                debug!(entry = %path, "ignoring unknown entry");
                dropped.push(unexpected(&path, "not a manifest, payload or asset entry"));
            }
        }

        let (manifest, compat) =
            manifest.ok_or_else(|| ImportError::Structural("archive has no manifest entry".into()))?;
        let (payload, payload_sealed) =
            payload.ok_or_else(|| ImportError::Structural("archive has no payload entry".into()))?;
        if payload_sealed != manifest.encrypted {
            return Err(ImportError::Structural(format!(
                "manifest says encrypted={} but the payload entry disagrees",
                manifest.encrypted
            )));
        }
        if assets.len() as u64 != manifest.counts.asset_files {
            warn!(declared = manifest.counts.asset_files, found = assets.len(), "asset count differs from manifest");
        }

        debug!(archive = %archive_id, assets = assets.len(), dropped = dropped.len(), "archive staged");
        Ok(StagedImport {
            archive_id,
            manifest,
            compat,
            payload,
            payload_sealed,
            assets,
            dropped,
            _staging: staging,
        })
    }

    fn run_apply(
        &self,
        staged:     &StagedImport,
        passphrase: Option<&Passphrase>,
        mode:       ImportMode,
        control:    &Control,
        report:     &dyn Fn(ImportState),
    ) -> Result<ImportResult, ImportError> {
        let cancel = &control.cancel;
        if cancel.is_cancelled() {
            return Err(ImportError::Cancelled);
        }

        let snapshot = if staged.payload_sealed {
            let pass = passphrase.filter(|p| !p.is_empty()).ok_or(ImportError::PasswordRequired)?;
            let meta = staged
                .manifest
                .encryption
                .as_ref()
                .ok_or_else(|| ImportError::Structural("encrypted archive without encryption metadata".into()))?;
            report(ImportState::Decrypting);
            let plain: Zeroizing<Vec<u8>> =
                crypto::open(pass, &meta.algorithm_id, &meta.salt, &meta.nonce, &staged.payload)?;
            report(ImportState::Deserializing);
            payload::deserialize(&plain)?
        } else {
            report(ImportState::Deserializing);
            payload::deserialize(&staged.payload)?
        };
        let snapshot = upgrade(snapshot, staged.compat);

        if snapshot.records.len() as u64 != staged.manifest.counts.primary_records {
            return Err(ImportError::Structural(format!(
                "manifest declares {} records but the payload holds {}",
                staged.manifest.counts.primary_records,
                snapshot.records.len()
            )));
        }

        let mut errors = staged.dropped.clone();
        for record in &snapshot.records {
            for photo in &record.photos {
                if !staged.assets.iter().any(|a| a.id == photo.asset) {
                    errors.push(RecordError {
                        subject: record.id.clone(),
                        kind:    RecordErrorKind::MissingAsset,
                        reason:  format!("asset '{}' is not in the archive", photo.asset),
                    });
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(ImportError::Cancelled);
        }

        report(ImportState::Applying);
        let subjects: Vec<(String, String)> = snapshot.records.iter().map(|r| (r.id.clone(), r.name.clone())).collect();
        let batch = ImportBatch { records: snapshot.records, assets: &staged.assets };
        let outcomes = {
            let mut store = self.store.write();
            store.apply_records(batch, mode)?
        };

        let mut result = ImportResult { imported: 0, skipped: 0, errors };
        for ((id, name), outcome) in subjects.into_iter().zip(outcomes) {
            match outcome {
                RecordOutcome::Inserted | RecordOutcome::Updated => result.imported += 1,
                RecordOutcome::Rejected(reason) => {
                    result.skipped += 1;
                    result.errors.push(RecordError {
                        subject: id,
                        kind:    RecordErrorKind::Validation,
                        reason:  format!("Failed to import {name}: {reason}"),
                    });
                }
            }
        }

        report(ImportState::Done);
        info!(
            archive = %staged.archive_id,
            %mode,
            imported = result.imported,
            skipped = result.skipped,
            problems = result.errors.len(),
            "import complete"
        );
        Ok(result)
    }
}

fn unexpected(path: &str, reason: &str) -> RecordError {
    RecordError { subject: path.to_owned(), kind: RecordErrorKind::UnexpectedEntry, reason: reason.to_owned() }
}

/// Bring a payload of an older accepted schema up to the current shape.
fn upgrade(mut snapshot: Snapshot, compat: Compatible) -> Snapshot {
    match compat.upgrade {
        Upgrade::None => {}
        Upgrade::DefaultPhotoKinds => {
            debug!(from = %compat.version, "upgrading payload");
            for photo in snapshot.records.iter_mut().flat_map(|r| r.photos.iter_mut()) {
                if photo.kind.trim().is_empty() {
                    photo.kind = "normal".to_owned();
                }
            }
        }
    }
    snapshot
}
