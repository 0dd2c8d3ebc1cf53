//! Snapshot codec.
//!
//! The payload is a UTF-8 JSON document `{"records": [...]}` with
//! camelCase, field-tagged members.  Readers ignore members they do not
//! know, so later schema versions may add optional fields freely; the
//! manifest's `schemaVersion` is what decides whether an archive is read
//! at all.

use thiserror::Error;

use crate::model::Snapshot;

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("failed to serialize snapshot: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("malformed payload: {0}")]
    Malformed(#[source] serde_json::Error),
}

/// Serialize a snapshot to payload bytes.
pub fn serialize(snapshot: &Snapshot) -> Result<Vec<u8>, PayloadError> {
    serde_json::to_vec(snapshot).map_err(PayloadError::Serialize)
}

/// Parse payload bytes back into a snapshot.
pub fn deserialize(bytes: &[u8]) -> Result<Snapshot, PayloadError> {
    serde_json::from_slice(bytes).map_err(PayloadError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssetId, Photo, Provenance, Quantity, Record, Storage, Timestamp};
    use proptest::prelude::*;

    fn quantity() -> impl Strategy<Value = Option<Quantity>> {
        proptest::option::of("-?[0-9]{1,4}(\\.[0-9]{1,6})?".prop_map(|s| Quantity::new(s).unwrap()))
    }

    fn text() -> impl Strategy<Value = Option<String>> {
        proptest::option::of("\\PC{0,24}")
    }

    fn photo() -> impl Strategy<Value = Photo> {
        ("[a-z0-9]{1,8}", "[A-Za-z0-9_-]{1,16}\\.jpg", text(), proptest::option::of(any::<i64>())).prop_map(
            |(id, asset, caption, taken)| Photo {
                id,
                kind: "normal".into(),
                caption,
                taken_at: taken.map(Timestamp),
                asset: AssetId::new(asset).unwrap(),
            },
        )
    }

    prop_compose! {
        fn record()(
            id in "[a-z0-9-]{1,12}",
            name in "\\PC{1,32}",
            formula in text(),
            mohs in (quantity(), quantity()),
            weight in quantity(),
            flags in (any::<bool>(), any::<bool>()),
            tags in proptest::collection::vec("[a-z]{1,8}", 0..4),
            rating in proptest::option::of(1u8..=5),
            at in (any::<i64>(), any::<i64>()),
            place in text(),
            lat in quantity(),
            photos in proptest::collection::vec(photo(), 0..3),
            reference_id in text(),
        ) -> Record {
            Record {
                id,
                name,
                formula,
                mohs_min: mohs.0,
                mohs_max: mohs.1,
                weight_grams: weight,
                magnetic: flags.0,
                radioactive: flags.1,
                tags,
                quality_rating: rating,
                created_at: Timestamp(at.0),
                updated_at: Timestamp(at.1),
                provenance: lat.map(|l| Provenance { latitude: Some(l), ..Provenance::default() }),
                storage: place.map(|p| Storage { place: Some(p), ..Storage::default() }),
                photos,
                reference_id,
                ..Record::default()
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn snapshots_survive_the_codec(records in proptest::collection::vec(record(), 0..8)) {
            let snapshot = Snapshot::new(records);
            let bytes = serialize(&snapshot).unwrap();
            prop_assert_eq!(deserialize(&bytes).unwrap(), snapshot);
        }
    }

    #[test]
    fn empty_snapshot_is_valid() {
        let bytes = serialize(&Snapshot::default()).unwrap();
        assert_eq!(bytes, b"{\"records\":[]}");
        assert_eq!(deserialize(&bytes).unwrap(), Snapshot::default());
    }

    #[test]
    fn unknown_members_are_ignored() {
        let json = br#"{
            "records": [{
                "id": "m1", "name": "Fluorite",
                "createdAt": 1, "updatedAt": 2,
                "fluorescence": {"sw": "blue"},
                "photos": [{"id": "p", "asset": "p.jpg", "exif": {}}]
            }],
            "exportedBy": "a newer build"
        }"#;
        let snapshot = deserialize(json).unwrap();
        assert_eq!(snapshot.records[0].name, "Fluorite");
        assert_eq!(snapshot.records[0].photos[0].kind, "normal");
    }

    #[test]
    fn float_quantities_are_refused() {
        let json = br#"{"records":[{"id":"m","name":"n","createdAt":0,"updatedAt":0,"mohsMin":7.5}]}"#;
        assert!(matches!(deserialize(json), Err(PayloadError::Malformed(_))));
    }

    #[test]
    fn hostile_asset_ids_are_refused() {
        let json = br#"{"records":[{"id":"m","name":"n","createdAt":0,"updatedAt":0,
            "photos":[{"id":"p","asset":"../../etc/passwd"}]}]}"#;
        assert!(matches!(deserialize(json), Err(PayloadError::Malformed(_))));
    }
}
