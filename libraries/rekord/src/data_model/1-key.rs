//! # Key
//! Every model is identified by the values of its key fields. A single key field gives a key equal to that value's text; composite keys join the parts with [`KEY_SEPARATOR`].
//! Keys are compared as text, so `5` and `"5"` name the same model. This keeps foreign keys stable no matter how a backend chose to type them.

use serde_json::Value;

use crate::Record;

pub const KEY_SEPARATOR: &str = "/";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The individual parts of a composite key.
    pub fn parts(&self) -> impl Iterator<Item = &str> {
        self.0.split(KEY_SEPARATOR)
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for Key {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// The text of a single key value. Null, empty strings and structured values cannot be part of a key.
pub(crate) fn key_part(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Whether `fields` of `left` hold the same key values as `other_fields` of `right`.
pub(crate) fn props_match(
    left: &Record,
    fields: &[String],
    right: &Record,
    other_fields: &[String],
) -> bool {
    fields.len() == other_fields.len()
        && fields.iter().zip(other_fields).all(|(field, other)| {
            match (
                left.get(field).and_then(key_part),
                right.get(other).and_then(key_part),
            ) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        })
}

pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Clone, Debug)]
pub(crate) struct KeyHandler {
    fields: Vec<String>,
}

impl KeyHandler {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn is_composite(&self) -> bool {
        self.fields.len() > 1
    }

    /// Returns None if any key field is missing.
    pub fn get_key(&self, record: &Record) -> Option<Key> {
        let parts = self
            .fields
            .iter()
            .map(|field| record.get(field).and_then(key_part))
            .collect::<Option<Vec<_>>>()?;

        Some(Key(parts.join(KEY_SEPARATOR)))
    }

    pub fn get_keys(&self, record: &Record) -> Vec<Value> {
        self.fields
            .iter()
            .map(|field| record.get(field).cloned().unwrap_or(Value::Null))
            .collect()
    }

    pub fn has_key(&self, record: &Record) -> bool {
        self.fields
            .iter()
            .all(|field| record.get(field).and_then(key_part).is_some())
    }

    /// Accepts an object holding the key fields, an array of key parts, or a single key value.
    pub fn build_key_from_input(&self, input: &Value) -> Option<Key> {
        match input {
            Value::Object(record) => self.get_key(record),
            Value::Array(parts) => {
                if parts.len() != self.fields.len() {
                    return None;
                }
                let parts = parts.iter().map(key_part).collect::<Option<Vec<_>>>()?;
                Some(Key(parts.join(KEY_SEPARATOR)))
            }
            other => {
                let part = key_part(other)?;
                if self.is_composite() && part.split(KEY_SEPARATOR).count() != self.fields.len() {
                    return None;
                }
                Some(Key(part))
            }
        }
    }

    /// The key value as it is written into foreign key fields: a scalar for single keys, an array for composite ones.
    pub fn key_value(&self, record: &Record) -> Value {
        match self.fields.as_slice() {
            [single] => record.get(single).cloned().unwrap_or(Value::Null),
            _ => Value::Array(self.get_keys(record)),
        }
    }

    pub fn build_object_from_key(&self, key: &Key) -> Record {
        let mut record = Record::new();
        self.apply_key(key, &mut record);
        record
    }

    pub fn apply_key(&self, key: &Key, record: &mut Record) {
        if self.is_composite() {
            for (field, part) in self.fields.iter().zip(key.parts()) {
                record.insert(field.clone(), Value::String(part.to_string()));
            }
        } else if let Some(field) = self.fields.first() {
            record.insert(field.clone(), Value::String(key.as_str().to_string()));
        }
    }
}
