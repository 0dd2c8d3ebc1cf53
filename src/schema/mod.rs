//! Manifest schema version negotiation.
//!
//! Versions are `MAJOR.MINOR.PATCH`.  An archive is readable when its
//! version is one this build has shipped; anything newer than the highest
//! known version is refused outright.

use std::cmp::Ordering;
use std::fmt;

use thiserror::Error;

/// Every schema version this build can read, oldest first.
pub const SUPPORTED_VERSIONS: &[&str] = &["1.0.0", "1.1.0"];

/// The version written by exports.
pub const CURRENT_VERSION: &str = "1.1.0";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("manifest has no schema version")]
    Missing,
    #[error("malformed schema version '{0}'")]
    Malformed(String),
    #[error("schema version {found} is newer than the newest supported version {newest}")]
    TooNew { found: String, newest: &'static str },
    #[error("schema version {0} is not supported")]
    Unsupported(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split('.');
        let mut next = || -> Option<u32> {
            let part = parts.next()?;
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            part.parse().ok()
        };
        let version = Version { major: next()?, minor: next()?, patch: next()? };
        if parts.next().is_some() {
            return None;
        }
        Some(version)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// How payloads of an accepted version must be treated before decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upgrade {
    /// The payload is already in the current shape.
    None,
    /// 1.0.0 payloads predate photo kinds; the codec defaults them.
    DefaultPhotoKinds,
}

/// Outcome of a successful check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compatible {
    pub version: Version,
    pub upgrade: Upgrade,
}

fn newest() -> &'static str {
    SUPPORTED_VERSIONS[SUPPORTED_VERSIONS.len() - 1]
}

/// Decide whether a manifest's `schemaVersion` can be read.
pub fn check(version: Option<&str>) -> Result<Compatible, SchemaError> {
    let text = version.map(str::trim).filter(|v| !v.is_empty()).ok_or(SchemaError::Missing)?;
    let found = Version::parse(text).ok_or_else(|| SchemaError::Malformed(text.to_owned()))?;

    let newest_text = newest();
    let newest_version = Version::parse(newest_text).ok_or(SchemaError::Missing)?;
    if found.cmp(&newest_version) == Ordering::Greater {
        return Err(SchemaError::TooNew { found: text.to_owned(), newest: newest_text });
    }
    if !SUPPORTED_VERSIONS.iter().any(|v| Version::parse(v) == Some(found)) {
        return Err(SchemaError::Unsupported(text.to_owned()));
    }

    let upgrade = match (found.major, found.minor) {
        (1, 0) => Upgrade::DefaultPhotoKinds,
        _ => Upgrade::None,
    };
    Ok(Compatible { version: found, upgrade })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_shipped_version_is_accepted() {
        for v in SUPPORTED_VERSIONS {
            assert!(check(Some(v)).is_ok(), "{v} refused");
        }
        assert_eq!(check(Some(CURRENT_VERSION)).unwrap().upgrade, Upgrade::None);
        assert_eq!(check(Some("1.0.0")).unwrap().upgrade, Upgrade::DefaultPhotoKinds);
    }

    #[test]
    fn the_future_is_refused() {
        assert!(matches!(check(Some("1.2.0")), Err(SchemaError::TooNew { .. })));
        assert!(matches!(check(Some("2.0.0")), Err(SchemaError::TooNew { .. })));
    }

    #[test]
    fn gaps_and_garbage_are_refused() {
        assert_eq!(check(Some("0.9.0")), Err(SchemaError::Unsupported("0.9.0".into())));
        assert_eq!(check(None), Err(SchemaError::Missing));
        assert_eq!(check(Some("  ")), Err(SchemaError::Missing));
        for bad in ["1.0", "1.0.0.0", "v1.0.0", "1.-1.0", "1..0", "one"] {
            assert!(matches!(check(Some(bad)), Err(SchemaError::Malformed(_))), "{bad}");
        }
    }

    #[test]
    fn versions_order_numerically() {
        assert!(Version::parse("1.10.0") > Version::parse("1.9.9"));
    }
}
