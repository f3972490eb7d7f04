use serde_json::{Map, Value};

/// Record-level keys that never make an update material.
pub const VOLATILE_KEYS: [&str; 3] = ["_id", "uuid", "id"];

/// `properties` keys that change on every write and never make an update
/// material.
pub const VOLATILE_PROPERTIES: [&str; 5] = [
    "created_date",
    "modified_date",
    "revision",
    "file_created",
    "file_modified",
];

/// Right-favoring deep merge. Objects merge key by key; anything else in
/// `overlay`, arrays included, replaces the value in `base` wholesale.
pub fn merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => Value::Object(merge_maps(base, overlay)),
        (_, overlay) => overlay.clone(),
    }
}

pub fn merge_maps(base: &Map<String, Value>, overlay: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (key, value) in overlay {
        let next = match merged.get(key) {
            Some(existing) => merge(existing, value),
            None => value.clone(),
        };
        merged.insert(key.clone(), next);
    }
    merged
}

/// Copy of `map` without the named top-level keys.
pub fn filter_keys(map: &Map<String, Value>, keys: &[&str]) -> Map<String, Value> {
    map.iter()
        .filter(|(key, _)| !keys.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// True when the maps differ once the record-level identity keys and the
/// volatile `properties` keys are set aside. Nested objects compare verbatim.
pub fn diff(a: &Map<String, Value>, b: &Map<String, Value>) -> bool {
    strip_volatile(a) != strip_volatile(b)
}

fn strip_volatile(map: &Map<String, Value>) -> Map<String, Value> {
    let mut stripped = filter_keys(map, &VOLATILE_KEYS);
    if let Some(Value::Object(properties)) = stripped.get("properties") {
        let properties = filter_keys(properties, &VOLATILE_PROPERTIES);
        stripped.insert("properties".to_string(), Value::Object(properties));
    }
    stripped
}
