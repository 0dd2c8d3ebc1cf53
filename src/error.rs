//! Top-level error types returned by export and import.

use std::io;

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::guard::SecurityViolation;
use crate::io_stream::ContainerError;
use crate::manifest::ManifestError;
use crate::payload::PayloadError;
use crate::schema::SchemaError;
use crate::store::StoreError;

/// Coarse classification of an [`ImportError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Structural,
    Security,
    SchemaIncompatible,
    AuthenticationFailure,
    PasswordRequired,
    Cancelled,
    Store,
    Io,
}

#[derive(Error, Debug)]
pub enum ImportError {
    /// Not a valid archive: truncated, corrupt, or missing required entries.
    #[error("invalid archive: {0}")]
    Structural(String),
    /// A hostile archive.  Never folded into `Structural`.
    #[error("security violation: {0}")]
    Security(SecurityViolation),
    #[error("incompatible archive: {0}")]
    SchemaIncompatible(String),
    #[error("wrong passphrase or tampered archive")]
    AuthenticationFailure,
    #[error("archive is encrypted; a passphrase is required")]
    PasswordRequired,
    #[error("import cancelled")]
    Cancelled,
    #[error("destination store refused the import: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ImportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ImportError::Structural(_) => ErrorKind::Structural,
            ImportError::Security(_) => ErrorKind::Security,
            ImportError::SchemaIncompatible(_) => ErrorKind::SchemaIncompatible,
            ImportError::AuthenticationFailure => ErrorKind::AuthenticationFailure,
            ImportError::PasswordRequired => ErrorKind::PasswordRequired,
            ImportError::Cancelled => ErrorKind::Cancelled,
            ImportError::Store(_) => ErrorKind::Store,
            ImportError::Io(_) => ErrorKind::Io,
        }
    }

    /// The violation behind a `Security` error.
    pub fn violation(&self) -> Option<&SecurityViolation> {
        match self {
            ImportError::Security(v) => Some(v),
            _ => None,
        }
    }
}

impl From<SecurityViolation> for ImportError {
    fn from(v: SecurityViolation) -> Self {
        ImportError::Security(v)
    }
}

impl From<ContainerError> for ImportError {
    fn from(e: ContainerError) -> Self {
        match e {
            ContainerError::Security(v) => ImportError::Security(v),
            ContainerError::Cancelled => ImportError::Cancelled,
            ContainerError::Io(io) => ImportError::Io(io),
            other => ImportError::Structural(other.to_string()),
        }
    }
}

impl From<ManifestError> for ImportError {
    fn from(e: ManifestError) -> Self {
        match e {
            ManifestError::Malformed(msg) => ImportError::Structural(format!("manifest: {msg}")),
            ManifestError::Schema(s) => s.into(),
            unknown @ ManifestError::UnknownAlgorithm(_) => ImportError::SchemaIncompatible(unknown.to_string()),
        }
    }
}

impl From<SchemaError> for ImportError {
    fn from(e: SchemaError) -> Self {
        ImportError::SchemaIncompatible(e.to_string())
    }
}

impl From<PayloadError> for ImportError {
    fn from(e: PayloadError) -> Self {
        ImportError::Structural(e.to_string())
    }
}

impl From<CryptoError> for ImportError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::EmptyPassphrase => ImportError::PasswordRequired,
            CryptoError::UnsupportedSuite(id) => {
                ImportError::SchemaIncompatible(format!("unsupported encryption algorithm '{id}'"))
            }
            bad @ CryptoError::BadParameter { .. } => ImportError::Structural(bad.to_string()),
            _ => ImportError::AuthenticationFailure,
        }
    }
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("cannot read collection: {0}")]
    Store(#[from] StoreError),
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("encryption failed: {0}")]
    Encryption(#[from] CryptoError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("export cancelled")]
    Cancelled,
}

impl From<PayloadError> for ExportError {
    fn from(e: PayloadError) -> Self {
        ExportError::Serialization(e.to_string())
    }
}

impl From<ContainerError> for ExportError {
    fn from(e: ContainerError) -> Self {
        match e {
            ContainerError::Cancelled => ExportError::Cancelled,
            ContainerError::Io(io) => ExportError::Io(io),
            other => ExportError::Serialization(other.to_string()),
        }
    }
}
