use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::CatalogId;
use crate::error::CatalogError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    #[value(name = "files", alias = "file")]
    File,
    #[value(name = "samples", alias = "sample")]
    Sample,
    #[value(name = "measurements", alias = "measurement")]
    Measurement,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::File => "file",
            RecordKind::Sample => "sample",
            RecordKind::Measurement => "measurement",
        }
    }

    /// Top-level field holding the natural key the uuid is derived from.
    pub fn natural_key_field(&self) -> &'static str {
        match self {
            RecordKind::File => "filename",
            RecordKind::Sample | RecordKind::Measurement => "id",
        }
    }

    /// Field holding uuids of related records, if this kind has one.
    pub fn references_field(&self) -> Option<&'static str> {
        match self {
            RecordKind::File => None,
            RecordKind::Sample => Some("measurements_ids"),
            RecordKind::Measurement => Some("files_ids"),
        }
    }

    /// Input-only field carrying inlined related objects; never persisted.
    pub fn inline_field(&self) -> Option<&'static str> {
        match self {
            RecordKind::File => None,
            RecordKind::Sample => Some("measurements"),
            RecordKind::Measurement => Some("files"),
        }
    }

    pub fn update_failure(&self, message: impl Into<String>) -> CatalogError {
        let message = message.into();
        match self {
            RecordKind::File => CatalogError::FileUpdateFailure(message),
            RecordKind::Sample => CatalogError::SampleUpdateFailure(message),
            RecordKind::Measurement => CatalogError::MeasurementUpdateFailure(message),
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fields every record carries inside `properties`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseProperties {
    pub created_date: DateTime<Utc>,
    pub modified_date: DateTime<Utc>,
    pub revision: u64,
}

impl BaseProperties {
    pub const KEYS: [&'static str; 3] = ["created_date", "modified_date", "revision"];

    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_date: now,
            modified_date: now,
            revision: 0,
        }
    }

    fn write_into(&self, properties: &mut Map<String, Value>) {
        properties.insert("created_date".to_string(), timestamp(self.created_date));
        properties.insert("modified_date".to_string(), timestamp(self.modified_date));
        properties.insert("revision".to_string(), Value::from(self.revision));
    }
}

/// A validated catalog document of one kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub kind: RecordKind,
    pub uuid: CatalogId,
    pub natural_key: String,
    pub base: BaseProperties,
    /// Domain fields of `properties`, base fields excluded.
    pub properties: Map<String, Value>,
    /// Sorted, de-duplicated related uuids. Always empty for files.
    pub references: Vec<String>,
    /// Remaining top-level fields.
    pub extra: Map<String, Value>,
}

impl Record {
    pub fn from_document(kind: RecordKind, document: Map<String, Value>) -> Result<Self, CatalogError> {
        let mut document = document;
        document.remove("_id");

        let uuid = match document.remove("uuid") {
            Some(Value::String(uuid)) => uuid.parse::<CatalogId>()?,
            _ => return Err(invalid(kind, "uuid")),
        };
        let key_field = kind.natural_key_field();
        let natural_key = match document.remove(key_field) {
            Some(Value::String(key)) if !key.is_empty() => key,
            _ => return Err(invalid(kind, key_field)),
        };
        let mut properties = match document.remove("properties") {
            Some(Value::Object(properties)) => properties,
            _ => return Err(invalid(kind, "properties")),
        };

        let base_fields: Map<String, Value> = BaseProperties::KEYS
            .iter()
            .filter_map(|key| properties.remove(*key).map(|value| (key.to_string(), value)))
            .collect();
        let base: BaseProperties = serde_json::from_value(Value::Object(base_fields))
            .map_err(|err| CatalogError::Data(format!("{kind} record {uuid}: {err}")))?;

        let references = match kind.references_field() {
            Some(field) => match document.remove(field) {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(items)) => {
                    let refs = items
                        .into_iter()
                        .map(|item| match item {
                            Value::String(id) => Ok(id),
                            _ => Err(invalid(kind, field)),
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    dedup_sorted(refs)
                }
                Some(_) => return Err(invalid(kind, field)),
            },
            None => Vec::new(),
        };

        Ok(Self {
            kind,
            uuid,
            natural_key,
            base,
            properties,
            references,
            extra: document,
        })
    }

    pub fn to_document(&self) -> Map<String, Value> {
        let mut document = self.extra.clone();
        document.insert("uuid".to_string(), Value::String(self.uuid.to_string()));
        document.insert(
            self.kind.natural_key_field().to_string(),
            Value::String(self.natural_key.clone()),
        );
        let mut properties = self.properties.clone();
        self.base.write_into(&mut properties);
        document.insert("properties".to_string(), Value::Object(properties));
        if let Some(field) = self.kind.references_field() {
            document.insert(
                field.to_string(),
                Value::Array(self.references.iter().cloned().map(Value::String).collect()),
            );
        }
        document
    }

    pub fn revision(&self) -> u64 {
        self.base.revision
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn checksum(&self) -> Option<&str> {
        self.property("checksum").and_then(Value::as_str)
    }
}

impl Serialize for Record {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_document().serialize(serializer)
    }
}

pub(crate) fn timestamp(at: DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339_opts(SecondsFormat::Micros, true))
}

pub(crate) fn dedup_sorted(mut ids: Vec<String>) -> Vec<String> {
    ids.sort();
    ids.dedup();
    ids
}

fn invalid(kind: RecordKind, field: &str) -> CatalogError {
    CatalogError::Data(format!("{kind} record has missing or invalid {field}"))
}
