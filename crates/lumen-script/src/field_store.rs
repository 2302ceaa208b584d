//! Field values held outside of any live managed object.
//!
//! A [`FieldValueStore`] holds the field values of one entity's script: edits
//! made in the editor while no instance exists, and values loaded from a
//! scene file. They seed the instance created when the scene starts playing
//! and survive when it stops.
//!
//! Entries may go stale when the user assembly changes: a field may disappear
//! or change its declared type. [`FieldValueStore::prune_stale`] and
//! [`FieldValueStore::revalidate`] reconcile the store with the current class
//! descriptor.

use std::collections::BTreeMap;

use lumen_scene::Uuid;
use serde::{Deserialize, Serialize};

use crate::field::{buffer_to_json, json_to_buffer, FieldBuffer, FieldType, FieldValue};
use crate::reflect::{FieldDescriptor, ScriptClass};

// ---------------------------------------------------------------------------
// ScriptFieldValue
// ---------------------------------------------------------------------------

/// The stored value of one field.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptFieldValue {
    name: String,
    field_type: FieldType,
    buffer: FieldBuffer,
}

impl ScriptFieldValue {
    /// A zeroed value of `field_type`.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self::from_raw(name, field_type, FieldBuffer::ZERO)
    }

    pub fn from_raw(name: impl Into<String>, field_type: FieldType, buffer: FieldBuffer) -> Self {
        Self {
            name: name.into(),
            field_type,
            buffer,
        }
    }

    /// A zeroed value typed after `descriptor`.
    pub fn for_descriptor(descriptor: &FieldDescriptor) -> Self {
        Self::new(descriptor.name.clone(), descriptor.field_type)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    pub fn buffer(&self) -> &FieldBuffer {
        &self.buffer
    }

    /// The value as `T`, or `None` if the stored type is not `T`'s.
    pub fn value<T: FieldValue>(&self) -> Option<T> {
        (self.field_type == T::FIELD_TYPE).then(|| self.buffer.to_value())
    }

    /// Store `value`, retagging the entry with `T`'s field type.
    pub fn set_value<T: FieldValue>(&mut self, value: T) {
        self.field_type = T::FIELD_TYPE;
        self.buffer = FieldBuffer::from_value(value);
    }

    pub fn set_raw(&mut self, buffer: FieldBuffer) {
        self.buffer = buffer;
    }
}

// ---------------------------------------------------------------------------
// FieldValueStore
// ---------------------------------------------------------------------------

/// What [`FieldValueStore::revalidate`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevalidationReport {
    /// Entries whose field no longer exists.
    pub pruned: Vec<String>,
    /// `Invalid` entries that took the descriptor's type.
    pub resolved: Vec<String>,
    /// Entries whose stored type contradicts the descriptor.
    pub dropped: Vec<String>,
}

impl RevalidationReport {
    pub fn is_empty(&self) -> bool {
        self.pruned.is_empty() && self.resolved.is_empty() && self.dropped.is_empty()
    }
}

/// Stored field values of one entity's script, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldValueStore {
    class_name: String,
    values: BTreeMap<String, ScriptFieldValue>,
}

impl FieldValueStore {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            values: BTreeMap::new(),
        }
    }

    /// Full name of the script class these values belong to.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Set a typed value, creating the entry if needed.
    pub fn set<T: FieldValue>(&mut self, name: &str, value: T) {
        self.values
            .entry(name.to_owned())
            .or_insert_with(|| ScriptFieldValue::new(name, T::FIELD_TYPE))
            .set_value(value);
    }

    /// Set a raw value, replacing any existing entry.
    pub fn set_raw(&mut self, name: &str, field_type: FieldType, buffer: FieldBuffer) {
        self.values.insert(
            name.to_owned(),
            ScriptFieldValue::from_raw(name, field_type, buffer),
        );
    }

    /// Typed read; `None` if the entry is missing or holds another type.
    pub fn get<T: FieldValue>(&self, name: &str) -> Option<T> {
        self.values.get(name).and_then(ScriptFieldValue::value::<T>)
    }

    pub fn entry(&self, name: &str) -> Option<&ScriptFieldValue> {
        self.values.get(name)
    }

    pub fn entry_mut(&mut self, name: &str) -> Option<&mut ScriptFieldValue> {
        self.values.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<ScriptFieldValue> {
        self.values.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScriptFieldValue> {
        self.values.values()
    }

    /// Remove entries for fields `class` no longer exposes. Returns the
    /// removed names.
    pub fn prune_stale(&mut self, class: &ScriptClass) -> Vec<String> {
        let stale: Vec<String> = self
            .values
            .keys()
            .filter(|name| class.field(name).is_none())
            .cloned()
            .collect();
        for name in &stale {
            self.values.remove(name);
            tracing::debug!(class = %class.full_name(), field = %name, "pruned stale field value");
        }
        stale
    }

    /// Reconcile every entry with `class`: prune stale entries, give `Invalid`
    /// entries the descriptor's type, and drop entries whose stored type
    /// contradicts the descriptor.
    pub fn revalidate(&mut self, class: &ScriptClass) -> RevalidationReport {
        let mut report = RevalidationReport {
            pruned: self.prune_stale(class),
            ..RevalidationReport::default()
        };

        self.values.retain(|name, value| {
            let Some(descriptor) = class.field(name) else {
                return true;
            };
            if value.field_type == descriptor.field_type {
                return true;
            }
            if value.field_type == FieldType::Invalid {
                value.field_type = descriptor.field_type;
                report.resolved.push(name.clone());
                return true;
            }
            if descriptor.field_type == FieldType::Invalid {
                // Declared type is unsupported; the stored value is kept.
                return true;
            }
            tracing::warn!(
                class = %class.full_name(),
                field = %name,
                stored = %value.field_type,
                declared = %descriptor.field_type,
                "stored field value has the wrong type, dropped"
            );
            report.dropped.push(name.clone());
            false
        });
        report
    }

    // -- Persistence ---------------------------------------------------------

    /// Persisted records for this store.
    pub fn to_serialized(&self, entity: Uuid) -> Vec<SerializedFieldValue> {
        self.values
            .values()
            .map(|value| SerializedFieldValue {
                entity,
                class_name: self.class_name.clone(),
                name: value.name.clone(),
                field_type: value.field_type,
                value: buffer_to_json(value.field_type, &value.buffer),
            })
            .collect()
    }

    /// Insert one persisted record. Records whose value does not fit their
    /// type tag are logged and skipped.
    pub fn insert_serialized(&mut self, record: &SerializedFieldValue) -> bool {
        let buffer = if record.field_type == FieldType::Invalid {
            FieldBuffer::ZERO
        } else {
            match json_to_buffer(record.field_type, &record.value) {
                Ok(buffer) => buffer,
                Err(reason) => {
                    tracing::warn!(
                        entity = %record.entity,
                        field = %record.name,
                        reason = %reason,
                        "persisted field value skipped"
                    );
                    return false;
                }
            }
        };
        self.set_raw(&record.name, record.field_type, buffer);
        true
    }
}

// ---------------------------------------------------------------------------
// SerializedFieldValue
// ---------------------------------------------------------------------------

/// One persisted field value, as written into scene files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedFieldValue {
    pub entity: Uuid,
    pub class_name: String,
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub value: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{EntityRef, Vector3};
    use proptest::prelude::*;

    #[test]
    fn typed_get_checks_the_tag() {
        let mut store = FieldValueStore::new("Sandbox.Player");
        store.set("Speed", 7i32);
        assert_eq!(store.get::<i32>("Speed"), Some(7));
        assert_eq!(store.get::<f32>("Speed"), None);
        assert_eq!(store.get::<i32>("Missing"), None);
    }

    #[test]
    fn set_retags_existing_entry() {
        let mut store = FieldValueStore::new("Sandbox.Player");
        store.set_raw("Speed", FieldType::Invalid, FieldBuffer::ZERO);
        store.set("Speed", 2.5f32);
        assert_eq!(store.entry("Speed").map(ScriptFieldValue::field_type), Some(FieldType::Float));
        assert_eq!(store.get::<f32>("Speed"), Some(2.5));
    }

    #[test]
    fn serialized_records_round_trip_through_json() {
        let entity = Uuid::from_raw(42).unwrap();
        let target = Uuid::from_raw(7).unwrap();
        let mut store = FieldValueStore::new("Sandbox.Player");
        store.set("Velocity", Vector3::new(1.0, 2.0, 3.0));
        store.set("Target", EntityRef::to(target));

        let records = store.to_serialized(entity);
        let json = serde_json::to_string(&records).unwrap();
        assert!(json.contains("\"type\":\"Vector3\""));
        let back: Vec<SerializedFieldValue> = serde_json::from_str(&json).unwrap();

        let mut restored = FieldValueStore::new("Sandbox.Player");
        for record in &back {
            assert!(restored.insert_serialized(record));
        }
        assert_eq!(restored, store);
    }

    #[test]
    fn bad_persisted_value_is_skipped() {
        let mut store = FieldValueStore::new("Sandbox.Player");
        let record = SerializedFieldValue {
            entity: Uuid::from_raw(1).unwrap(),
            class_name: "Sandbox.Player".to_owned(),
            name: "Speed".to_owned(),
            field_type: FieldType::Int,
            value: serde_json::json!("fast"),
        };
        assert!(!store.insert_serialized(&record));
        assert!(store.is_empty());
    }

    proptest! {
        #[test]
        fn typed_values_survive_the_store(
            int in any::<i64>(),
            float_bits in any::<u32>(),
            flag in any::<bool>(),
        ) {
            let mut store = FieldValueStore::new("Sandbox.AllTypes");
            store.set("Long", int);
            store.set("Float", f32::from_bits(float_bits));
            store.set("Bool", flag);

            prop_assert_eq!(store.get::<i64>("Long"), Some(int));
            prop_assert_eq!(store.get::<f32>("Float").map(f32::to_bits), Some(float_bits));
            prop_assert_eq!(store.get::<bool>("Bool"), Some(flag));
        }
    }
}
