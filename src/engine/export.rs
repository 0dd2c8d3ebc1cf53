use std::io::{BufWriter, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::{ArchiveHandle, BackupEngine, Control, CountingWriter, ExportState, MANIFEST_ENTRY, PAYLOAD_ENTRY};
use crate::codec::CodecId;
use crate::crypto::{self, CryptoError, Passphrase};
use crate::error::ExportError;
use crate::io_stream::ArchiveWriter;
use crate::manifest::{Counts, EncryptionMetadata, Manifest};
use crate::payload;
use crate::store::{CollectionStore, StoreSnapshot};

impl<S: CollectionStore> BackupEngine<S> {
    /// Export the whole collection into `sink`.
    pub fn export<W: Write>(&self, sink: W, passphrase: Option<&Passphrase>) -> Result<ArchiveHandle, ExportError> {
        self.export_with(sink, passphrase, &Control::default())
    }

    /// Export with cancellation and progress reporting.  On error the sink
    /// holds an incomplete archive that must be discarded.
    pub fn export_with<W: Write>(
        &self,
        sink:       W,
        passphrase: Option<&Passphrase>,
        control:    &Control,
    ) -> Result<ArchiveHandle, ExportError> {
        let _gate = self.export_gate.lock();
        let report = |state: ExportState| {
            debug!(?state, "export");
            control.progress.on_export(state);
        };

        let result = self.run_export(sink, passphrase, control, &report);
        match &result {
            Ok(handle) => {
                report(ExportState::Done);
                info!(
                    archive = %handle.archive_id,
                    records = handle.manifest.counts.primary_records,
                    assets = handle.manifest.counts.asset_files,
                    encrypted = handle.manifest.encrypted,
                    bytes = handle.bytes_written,
                    "export complete"
                );
            }
            Err(e) => {
                report(ExportState::Failed);
                warn!(error = %e, "export failed");
            }
        }
        result
    }

    /// Export into a file.  The archive is written to a temporary sibling
    /// and moved over `path` only once complete.
    pub fn export_to_path(
        &self,
        path:       &Path,
        passphrase: Option<&Passphrase>,
        control:    &Control,
    ) -> Result<ArchiveHandle, ExportError> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let tmp = NamedTempFile::new_in(dir)?;
        let mut handle = self.export_with(BufWriter::new(tmp.as_file()), passphrase, control)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| ExportError::Io(e.error))?;
        handle.path = Some(path.to_path_buf());
        Ok(handle)
    }

    fn run_export<W: Write>(
        &self,
        sink:       W,
        passphrase: Option<&Passphrase>,
        control:    &Control,
        report:     &dyn Fn(ExportState),
    ) -> Result<ArchiveHandle, ExportError> {
        let cancel = &control.cancel;
        if cancel.is_cancelled() {
            return Err(ExportError::Cancelled);
        }

        report(ExportState::Collecting);
        let store = self.store.read();
        let StoreSnapshot { snapshot, assets } = store.snapshot_all()?;
        let counts = Counts {
            primary_records: snapshot.records.len() as u64,
            asset_files:     assets.len() as u64,
        };
        debug!(records = counts.primary_records, assets = counts.asset_files, "snapshot collected");

        report(ExportState::Serializing);
        let mut plain = Zeroizing::new(payload::serialize(&snapshot)?);
        drop(snapshot);

        let (body, encryption) = match passphrase {
            Some(pass) => {
                if pass.is_empty() {
                    return Err(CryptoError::EmptyPassphrase.into());
                }
                report(ExportState::Encrypting);
                let sealed = crypto::seal(pass, &plain)?;
                let meta = EncryptionMetadata::from(&sealed);
                (sealed.ciphertext, Some(meta))
            }
            None => (std::mem::take(&mut *plain), None),
        };
        drop(plain);

        if cancel.is_cancelled() {
            return Err(ExportError::Cancelled);
        }

        report(ExportState::Containerizing);
        let manifest = Manifest::new(counts, encryption);
        let manifest_bytes = manifest.to_bytes().map_err(|e| ExportError::Serialization(e.to_string()))?;
        let entry_count = u32::try_from(assets.len() + 2)
            .map_err(|_| ExportError::Serialization(format!("{} assets is too many for one archive", assets.len())))?;

        let mut sink = CountingWriter { inner: sink, written: 0 };
        let mut writer =
            ArchiveWriter::with_limits(&mut sink, entry_count, self.options.compression_level, self.limits)?;
        let archive_id = writer.superblock.archive_uuid;

        writer.add_bytes(MANIFEST_ENTRY, &manifest_bytes, CodecId::Zstd, false)?;
        if manifest.encrypted {
            // Ciphertext does not compress and is authenticated by its tag.
            writer.add_entry(PAYLOAD_ENTRY, &mut &body[..], CodecId::None, true, cancel)?;
        } else {
            writer.add_entry(PAYLOAD_ENTRY, &mut &body[..], CodecId::Zstd, false, cancel)?;
        }
        for asset in assets {
            let name = asset.id.entry_name();
            let mut src = asset.open()?;
            writer.add_entry(&name, &mut src, self.options.asset_codec, false, cancel)?;
        }
        writer.finish()?;
        drop(store);

        Ok(ArchiveHandle { path: None, archive_id, manifest, bytes_written: sink.written })
    }
}
