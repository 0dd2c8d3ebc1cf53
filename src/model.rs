//! Collection records as they travel through an archive.
//!
//! Every measured quantity is kept as an exact decimal string and every
//! timestamp as UTC epoch milliseconds, so a record read back from an
//! archive compares equal, field for field, with the one that was written.

use std::fmt;

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Maximum length of an asset identifier in bytes.
pub const MAX_ASSET_ID_LEN: usize = 128;

/// Prefix of every asset entry inside an archive.
pub const ASSET_PREFIX: &str = "asset/";

// ── Scalars ──────────────────────────────────────────────────────────────────

/// UTC instant as milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Timestamp(Utc::now().timestamp_millis())
    }

    pub fn millis(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Utc.timestamp_millis_opt(self.0).single() {
            Some(dt) => write!(f, "{}", dt.to_rfc3339()),
            None => write!(f, "{}ms", self.0),
        }
    }
}

/// An exact decimal such as `"2.65"` or `"-12.5"`.  Never a float.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Quantity(String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidValue(pub String);

impl fmt::Display for InvalidValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for InvalidValue {}

impl Quantity {
    pub fn new(text: impl Into<String>) -> Result<Self, InvalidValue> {
        let text = text.into();
        let digits = text.strip_prefix('-').unwrap_or(&text);
        let (int, frac) = match digits.split_once('.') {
            Some((i, f)) => (i, Some(f)),
            None => (digits, None),
        };
        let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        if !all_digits(int) || !frac.map_or(true, all_digits) {
            return Err(InvalidValue(format!("'{text}' is not a decimal quantity")));
        }
        Ok(Quantity(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Approximate numeric value, for range validation only.
    pub fn to_f64(&self) -> f64 {
        self.0.parse().unwrap_or(f64::NAN)
    }
}

impl TryFrom<String> for Quantity {
    type Error = InvalidValue;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Quantity::new(s)
    }
}

impl From<Quantity> for String {
    fn from(q: Quantity) -> Self {
        q.0
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a binary asset.  Always a single, harmless path segment,
/// so `asset/<id>` and `media/<id>` can never name anything outside their
/// directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AssetId(String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidValue> {
        let id = id.into();
        let charset_ok = id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
        if id.is_empty() || id.len() > MAX_ASSET_ID_LEN || !charset_ok || id == "." || id == ".." {
            return Err(InvalidValue(format!("'{id}' is not a valid asset id")));
        }
        Ok(AssetId(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Archive entry name holding this asset.
    pub fn entry_name(&self) -> String {
        format!("{ASSET_PREFIX}{}", self.0)
    }

    /// Inverse of [`AssetId::entry_name`] for an already-sanitised path.
    pub fn from_entry_name(path: &str) -> Option<Self> {
        path.strip_prefix(ASSET_PREFIX).and_then(|id| AssetId::new(id).ok())
    }
}

impl TryFrom<String> for AssetId {
    type Error = InvalidValue;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        AssetId::new(s)
    }
}

impl From<AssetId> for String {
    fn from(id: AssetId) -> Self {
        id.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Records ──────────────────────────────────────────────────────────────────

/// A specimen in the collection.  The primary record of an archive.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id:   String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crystal_system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mohs_min: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mohs_max: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specific_gravity: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_grams: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions_mm: Option<String>,
    #[serde(default)]
    pub magnetic: bool,
    #[serde(default)]
    pub radioactive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_rating: Option<u8>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<Storage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub photos: Vec<Photo>,
    /// Opaque pointer into a reference catalog outside the archive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
}

impl Record {
    pub fn new(id: impl Into<String>, name: impl Into<String>, at: Timestamp) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            created_at: at,
            updated_at: at,
            ..Self::default()
        }
    }
}

/// Where and how a specimen was acquired.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquired_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

/// Physical storage location.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Storage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#box: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Photo {
    pub id: String,
    /// Free-form lighting kind (`normal`, `uv-sw`, `uv-lw`, `macro`, ...).
    #[serde(default = "Photo::default_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taken_at: Option<Timestamp>,
    pub asset: AssetId,
}

impl Photo {
    fn default_kind() -> String {
        "normal".to_owned()
    }
}

// ── Snapshot ─────────────────────────────────────────────────────────────────

/// Everything an export writes: the records, in insertion order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub records: Vec<Record>,
}

impl Snapshot {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    /// Every referenced asset, first reference wins, in record order.
    pub fn asset_ids(&self) -> Vec<AssetId> {
        let mut seen = std::collections::HashSet::new();
        self.records
            .iter()
            .flat_map(|r| r.photos.iter())
            .filter(|p| seen.insert(p.asset.clone()))
            .map(|p| p.asset.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantities_are_exact_decimals() {
        assert!(Quantity::new("2.65").is_ok());
        assert!(Quantity::new("-0.5").is_ok());
        assert!(Quantity::new("7").is_ok());
        for bad in ["", ".5", "5.", "1e3", "NaN", "--1", "1.2.3"] {
            assert!(Quantity::new(bad).is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn asset_ids_are_single_segments() {
        assert_eq!(AssetId::new("IMG_0042.jpg").unwrap().entry_name(), "asset/IMG_0042.jpg");
        for bad in ["", ".", "..", "a/b", "a\\b", "ç.jpg", "x".repeat(129).as_str()] {
            assert!(AssetId::new(bad).is_err(), "{bad} accepted");
        }
        assert_eq!(AssetId::from_entry_name("asset/p1").unwrap().as_str(), "p1");
        assert!(AssetId::from_entry_name("payload").is_none());
    }

    #[test]
    fn camel_case_on_the_wire() {
        let mut r = Record::new("m1", "Quartz", Timestamp(1_700_000_000_000));
        r.mohs_min = Some(Quantity::new("7").unwrap());
        r.reference_id = Some("ref:quartz".into());
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["mohsMin"], "7");
        assert_eq!(json["createdAt"], 1_700_000_000_000i64);
        assert_eq!(json["referenceId"], "ref:quartz");
        assert!(json.get("provenance").is_none());
    }

    #[test]
    fn asset_order_follows_records() {
        let photo = |id: &str| Photo {
            id: id.into(),
            kind: "normal".into(),
            caption: None,
            taken_at: None,
            asset: AssetId::new(id).unwrap(),
        };
        let mut a = Record::new("a", "A", Timestamp(0));
        a.photos = vec![photo("p2"), photo("p1")];
        let mut b = Record::new("b", "B", Timestamp(0));
        b.photos = vec![photo("p1"), photo("p3")];
        let ids: Vec<String> = Snapshot::new(vec![a, b]).asset_ids().into_iter().map(String::from).collect();
        assert_eq!(ids, ["p2", "p1", "p3"]);
    }

    #[test]
    fn timestamps_render_as_utc() {
        assert_eq!(Timestamp(0).to_string(), "1970-01-01T00:00:00+00:00");
    }
}
