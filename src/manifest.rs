//! The leading `manifest` entry of every archive.
//!
//! Parsing is two-phase: `schemaVersion` is pulled out of the raw JSON and
//! checked first, so a newer archive whose manifest shape has changed is
//! reported as incompatible rather than as malformed.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::crypto::{self, Sealed};
use crate::model::Timestamp;
use crate::schema::{self, Compatible, SchemaError};

/// Producer id written by this build.
pub const PRODUCER_ID: &str = concat!("geode/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("malformed manifest: {0}")]
    Malformed(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("unsupported encryption algorithm '{0}'")]
    UnknownAlgorithm(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub producer_id:    String,
    pub schema_version: String,
    pub exported_at:    Timestamp,
    pub counts:         Counts,
    pub encrypted:      bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption:     Option<EncryptionMetadata>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counts {
    pub primary_records: u64,
    pub asset_files:     u64,
}

/// Public parameters of an encrypted payload.  Not secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionMetadata {
    pub algorithm_id: String,
    #[serde(with = "b64")]
    pub salt:         Vec<u8>,
    #[serde(with = "b64")]
    pub nonce:        Vec<u8>,
}

impl From<&Sealed> for EncryptionMetadata {
    fn from(sealed: &Sealed) -> Self {
        Self {
            algorithm_id: sealed.suite.to_owned(),
            salt:         sealed.salt.to_vec(),
            nonce:        sealed.nonce.to_vec(),
        }
    }
}

impl Manifest {
    pub fn new(counts: Counts, encryption: Option<EncryptionMetadata>) -> Self {
        Self {
            producer_id:    PRODUCER_ID.to_owned(),
            schema_version: schema::CURRENT_VERSION.to_owned(),
            exported_at:    Timestamp::now(),
            counts,
            encrypted:      encryption.is_some(),
            encryption,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// Parse and validate a manifest.  Returns the schema check outcome
    /// alongside it.
    pub fn parse(bytes: &[u8]) -> Result<(Manifest, Compatible), ManifestError> {
        let raw: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| ManifestError::Malformed(e.to_string()))?;
        let version = raw.get("schemaVersion").and_then(|v| v.as_str());
        let compat = schema::check(version)?;

        let manifest: Manifest =
            serde_json::from_value(raw).map_err(|e| ManifestError::Malformed(e.to_string()))?;
        manifest.validate()?;
        Ok((manifest, compat))
    }

    /// `encryption` is present exactly when `encrypted` is set, and names a
    /// suite with well-formed parameters.
    pub fn validate(&self) -> Result<(), ManifestError> {
        match (&self.encryption, self.encrypted) {
            (None, false) => Ok(()),
            (Some(meta), true) => {
                crypto::suite(&meta.algorithm_id)
                    .map_err(|_| ManifestError::UnknownAlgorithm(meta.algorithm_id.clone()))?;
                if meta.salt.len() != crypto::SALT_LEN || meta.nonce.len() != crypto::NONCE_LEN {
                    return Err(ManifestError::Malformed(format!(
                        "salt/nonce must be {}/{} bytes, got {}/{}",
                        crypto::SALT_LEN,
                        crypto::NONCE_LEN,
                        meta.salt.len(),
                        meta.nonce.len()
                    )));
                }
                Ok(())
            }
            (Some(_), false) => Err(ManifestError::Malformed("encryption metadata on a plain archive".into())),
            (None, true) => Err(ManifestError::Malformed("encrypted archive without encryption metadata".into())),
        }
    }
}

mod b64 {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        BASE64.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}
