pub mod cancel;
pub mod codec;
pub mod crypto;
pub mod engine;
pub mod entry;
pub mod error;
pub mod guard;
pub mod io_stream;
pub mod manifest;
pub mod model;
pub mod payload;
pub mod schema;
pub mod store;
pub mod superblock;
pub mod task;

pub use cancel::CancelToken;
pub use crypto::Passphrase;
pub use engine::{
    ArchiveHandle, BackupEngine, Control, EngineOptions, ExportState, ImportResult, ImportState, Progress,
    RecordError, RecordErrorKind, StagedImport,
};
pub use error::{ErrorKind, ExportError, ImportError};
pub use guard::{Limits, SecurityViolation, ViolationKind};
pub use model::{AssetId, Record, Snapshot};
pub use store::{CollectionStore, DirectoryStore, ImportMode, MemoryStore};
