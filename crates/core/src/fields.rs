use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};

/// Field type the tracker reports for two-level cascading select lists.
pub const CASCADING_SELECT_TYPE: &str = "option-with-child";

/// Prefix shared by all tracker-defined custom field identifiers.
pub const CUSTOM_FIELD_PREFIX: &str = "customfield_";

/// Display metadata for a single standard or custom field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMetadata {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: Option<String>,
}

impl FieldMetadata {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        field_type: Option<impl Into<String>>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            field_type: field_type.map(Into::into),
        }
    }

    /// Returns `true` when the field is a cascading select list.
    pub fn is_cascading_select(&self) -> bool {
        self.field_type.as_deref() == Some(CASCADING_SELECT_TYPE)
    }
}

/// Immutable field-id keyed view of the catalog.
pub type FieldMap = HashMap<String, FieldMetadata>;

/// Process-wide field catalog shared between the refresh job and readers.
///
/// Writers never mutate the published map. [`FieldMetadataCache::replace`]
/// builds a fresh map and swaps the shared pointer, so a reader holding a
/// [`FieldMetadataCache::snapshot`] keeps a complete catalog for as long as
/// it needs one.
#[derive(Debug, Default)]
pub struct FieldMetadataCache {
    current: RwLock<Arc<FieldMap>>,
}

impl FieldMetadataCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a cache pre-populated with the provided fields.
    pub fn with_fields(fields: impl IntoIterator<Item = FieldMetadata>) -> Self {
        let cache = Self::new();
        cache.replace(fields);
        cache
    }

    /// Returns the currently published catalog.
    pub fn snapshot(&self) -> Arc<FieldMap> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Looks up metadata for a single field id.
    pub fn get(&self, id: &str) -> Option<FieldMetadata> {
        self.snapshot().get(id).cloned()
    }

    /// Publishes a new catalog, discarding the previous one wholesale.
    ///
    /// Returns the number of entries in the published map. Duplicate ids keep
    /// the last occurrence.
    pub fn replace(&self, fields: impl IntoIterator<Item = FieldMetadata>) -> usize {
        let next: FieldMap = fields
            .into_iter()
            .map(|field| (field.id.clone(), field))
            .collect();
        let len = next.len();
        let next = Arc::new(next);

        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = next;
        len
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Returns all entries sorted by field id.
    pub fn sorted(&self) -> Vec<FieldMetadata> {
        let snapshot = self.snapshot();
        let mut fields: Vec<FieldMetadata> = snapshot.values().cloned().collect();
        fields.sort_by(|a, b| a.id.cmp(&b.id));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        thread,
        time::Duration,
    };

    fn field(index: usize) -> FieldMetadata {
        FieldMetadata::new(
            format!("customfield_{index}"),
            format!("Field {index}"),
            Some("string"),
        )
    }

    #[test]
    fn get_returns_cached_metadata() {
        let cache = FieldMetadataCache::with_fields(vec![
            FieldMetadata::new("summary", "Summary", Some("string")),
            FieldMetadata::new("customfield_10010", "Region", Some(CASCADING_SELECT_TYPE)),
        ]);

        let region = cache.get("customfield_10010").expect("region cached");
        assert_eq!(region.name, "Region");
        assert!(region.is_cascading_select());
        assert!(cache.get("customfield_missing").is_none());
    }

    #[test]
    fn replace_discards_previous_entries() {
        let cache = FieldMetadataCache::with_fields((0..3).map(field));
        assert_eq!(cache.len(), 3);

        let published = cache.replace(vec![field(7)]);
        assert_eq!(published, 1);
        assert!(cache.get("customfield_0").is_none());
        assert!(cache.get("customfield_7").is_some());
    }

    #[test]
    fn snapshot_survives_replacement() {
        let cache = FieldMetadataCache::with_fields((0..4).map(field));
        let held = cache.snapshot();

        cache.replace(Vec::new());

        assert_eq!(held.len(), 4);
        assert!(cache.is_empty());
    }

    #[test]
    fn metadata_type_deserializes_from_type_key() {
        let parsed: FieldMetadata = serde_json::from_str(
            r#"{"id":"customfield_1","name":"Region","type":"option-with-child"}"#,
        )
        .expect("parse metadata");
        assert!(parsed.is_cascading_select());

        let untyped: FieldMetadata =
            serde_json::from_str(r#"{"id":"x","name":"X"}"#).expect("parse metadata");
        assert_eq!(untyped.field_type, None);
    }

    #[test]
    fn readers_never_observe_partial_catalog_during_refresh() {
        const BASELINE: usize = 200;
        let cache = Arc::new(FieldMetadataCache::with_fields((0..BASELINE).map(field)));
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let done = done.clone();
                thread::spawn(move || {
                    let mut observed = 0usize;
                    while !done.load(Ordering::Acquire) {
                        let len = cache.len();
                        assert!(len >= BASELINE, "reader saw {len} entries mid-refresh");
                        observed += 1;
                    }
                    observed
                })
            })
            .collect();

        for round in 0..5 {
            let next = (0..BASELINE + round).map(|index| {
                thread::sleep(Duration::from_micros(50));
                field(index)
            });
            cache.replace(next);
        }
        done.store(true, Ordering::Release);

        for reader in readers {
            let observed = reader.join().expect("reader thread");
            assert!(observed > 0);
        }
        assert_eq!(cache.len(), BASELINE + 4);
    }
}
