// ABOUTME: Member tables holding legacy display-name keyed entries alongside identity keyed entries.
// ABOUTME: Provides the field merge used when a legacy entry is folded into its canonical entry.

use std::collections::BTreeMap;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

/// Keys carried by `CanonicalEntry`'s own fields. They never live in the
/// free-form field map.
const RESERVED_KEYS: [&str; 2] = ["id", "name"];

fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// A historical entry keyed by the member's display name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegacyEntry {
    /// Identity this entry was folded into. Migrated entries are kept, never deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrated_to: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl LegacyEntry {
    pub fn is_migrated(&self) -> bool {
        self.migrated_to.is_some()
    }
}

/// An entry keyed by a stable member identity.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CanonicalEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl CanonicalEntry {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            fields: Map::new(),
        }
    }
}

// Written by hand so a stray "id" or "name" in `fields` cannot shadow the
// typed values on the wire.
impl Serialize for CanonicalEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("id", &self.id)?;
        if let Some(name) = &self.name {
            map.serialize_entry("name", name)?;
        }
        for (key, value) in self.fields.iter().filter(|(key, _)| !is_reserved(key)) {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// A domain module's member records, as persisted under a single store key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberTable {
    #[serde(default)]
    pub legacy: BTreeMap<String, LegacyEntry>,
    #[serde(default)]
    pub canonical: BTreeMap<String, CanonicalEntry>,
}

impl MemberTable {
    /// Display-name keys of legacy entries that have not been migrated yet, in key order.
    pub fn pending_legacy(&self) -> Vec<String> {
        self.legacy
            .iter()
            .filter(|(_, entry)| !entry.is_migrated())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Fold the legacy entry stored under `legacy_key` into the canonical entry
    /// for `identity`, creating it if absent. Existing non-empty canonical values
    /// win. The legacy `"id"` is dropped and its `"name"` only fills an empty
    /// canonical name. Returns false if there is no such legacy entry.
    pub fn fold_legacy(&mut self, legacy_key: &str, identity: &str) -> bool {
        let Some(legacy) = self.legacy.get_mut(legacy_key) else {
            return false;
        };

        let canonical = self
            .canonical
            .entry(identity.to_string())
            .or_insert_with(|| CanonicalEntry::new(identity));

        let incoming: Map<String, Value> = legacy
            .fields
            .iter()
            .filter(|(key, _)| !is_reserved(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        merge_preferring_existing(&mut canonical.fields, &incoming);
        canonical.fields.retain(|key, _| !is_reserved(key));

        if canonical.name.as_deref().is_none_or(|n| n.trim().is_empty()) {
            let legacy_name = legacy
                .fields
                .get("name")
                .and_then(Value::as_str)
                .filter(|n| !n.trim().is_empty())
                .unwrap_or(legacy_key);
            canonical.name = Some(legacy_name.to_string());
        }

        legacy.migrated_to = Some(identity.to_string());
        true
    }
}

/// True for values that count as "unset" when resolving merge conflicts.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Merge `incoming` into `target`. A key already holding a non-empty value keeps
/// it; nested objects are merged recursively under the same rule.
/// Returns whether `target` changed.
pub fn merge_preferring_existing(target: &mut Map<String, Value>, incoming: &Map<String, Value>) -> bool {
    let mut changed = false;

    for (key, value) in incoming {
        if let (Some(Value::Object(existing)), Value::Object(nested)) = (target.get_mut(key), value)
        {
            changed |= merge_preferring_existing(existing, nested);
            continue;
        }

        let keep_existing = target.get(key).is_some_and(|existing| !is_empty_value(existing));
        if keep_existing || target.get(key) == Some(value) {
            continue;
        }

        target.insert(key.clone(), value.clone());
        changed = true;
    }

    changed
}
