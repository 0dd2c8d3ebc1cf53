//! Run exports and imports off the calling thread.
//!
//! Each `spawn_*` function moves the synchronous engine call onto tokio's
//! blocking pool and returns an [`OperationHandle`].  The handle publishes
//! state transitions on a `watch` channel, can request cooperative
//! cancellation, and resolves to the operation's result.  All of them must
//! be called from within a tokio runtime.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cancel::CancelToken;
use crate::crypto::Passphrase;
use crate::engine::{
    ArchiveHandle, BackupEngine, Control, ExportState, ImportResult, ImportState, Progress, StagedImport,
};
use crate::error::{ExportError, ImportError};
use crate::store::{CollectionStore, ImportMode};

struct ExportWatch(watch::Sender<ExportState>);

impl Progress for ExportWatch {
    fn on_export(&self, state: ExportState) {
        self.0.send_replace(state);
    }
}

struct ImportWatch(watch::Sender<ImportState>);

impl Progress for ImportWatch {
    fn on_import(&self, state: ImportState) {
        self.0.send_replace(state);
    }
}

/// A running operation.
pub struct OperationHandle<T, E, St> {
    states: watch::Receiver<St>,
    cancel: CancelToken,
    join:   JoinHandle<Result<T, E>>,
}

impl<T, E, St> OperationHandle<T, E, St>
where
    E: From<io::Error>,
{
    /// A receiver of state transitions.  Only the latest state is kept.
    pub fn states(&self) -> watch::Receiver<St> {
        self.states.clone()
    }

    /// Ask the operation to stop at its next chunk boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the operation to finish.
    pub async fn wait(self) -> Result<T, E> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(E::from(io::Error::new(io::ErrorKind::Other, e))),
        }
    }
}

fn spawn<T, E, St>(
    initial:  St,
    progress: impl FnOnce(watch::Sender<St>) -> Arc<dyn Progress>,
    run:      impl FnOnce(Control) -> Result<T, E> + Send + 'static,
) -> OperationHandle<T, E, St>
where
    T: Send + 'static,
    E: Send + 'static,
{
    let (tx, states) = watch::channel(initial);
    let cancel = CancelToken::new();
    let control = Control::new(cancel.clone(), progress(tx));
    let join = tokio::task::spawn_blocking(move || run(control));
    OperationHandle { states, cancel, join }
}

/// Export the collection to `path`.
pub fn spawn_export<S>(
    engine:     Arc<BackupEngine<S>>,
    path:       PathBuf,
    passphrase: Option<Passphrase>,
) -> OperationHandle<ArchiveHandle, ExportError, ExportState>
where
    S: CollectionStore + Send + Sync + 'static,
{
    spawn(
        ExportState::Idle,
        |tx| Arc::new(ExportWatch(tx)) as Arc<dyn Progress>,
        move |control| engine.export_to_path(&path, passphrase.as_ref(), &control),
    )
}

/// Read, check and apply the archive at `path`.
pub fn spawn_import<S>(
    engine:     Arc<BackupEngine<S>>,
    path:       PathBuf,
    passphrase: Option<Passphrase>,
    mode:       ImportMode,
) -> OperationHandle<ImportResult, ImportError, ImportState>
where
    S: CollectionStore + Send + Sync + 'static,
{
    spawn(
        ImportState::Idle,
        |tx| Arc::new(ImportWatch(tx)) as Arc<dyn Progress>,
        move |control| engine.import_path(&path, passphrase.as_ref(), mode, &control),
    )
}

/// Stage the archive at `path` without touching the store.
pub fn spawn_stage<S>(
    engine: Arc<BackupEngine<S>>,
    path:   PathBuf,
) -> OperationHandle<StagedImport, ImportError, ImportState>
where
    S: CollectionStore + Send + Sync + 'static,
{
    spawn(
        ImportState::Idle,
        |tx| Arc::new(ImportWatch(tx)) as Arc<dyn Progress>,
        move |control| engine.stage_path(&path, &control),
    )
}

/// Apply a previously staged archive, e.g. once a passphrase is known.
pub fn spawn_apply<S>(
    engine:     Arc<BackupEngine<S>>,
    staged:     Arc<StagedImport>,
    passphrase: Option<Passphrase>,
    mode:       ImportMode,
) -> OperationHandle<ImportResult, ImportError, ImportState>
where
    S: CollectionStore + Send + Sync + 'static,
{
    spawn(
        ImportState::Idle,
        |tx| Arc::new(ImportWatch(tx)) as Arc<dyn Progress>,
        move |control| engine.apply(&staged, passphrase.as_ref(), mode, &control),
    )
}
