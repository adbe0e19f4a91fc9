//! Configuration, deserialised from JSON.
//!
//! ```json
//! {
//!   "name": "task",
//!   "fields": ["id", "name", "done", "user_id"],
//!   "defaults": { "id": { "generate": "uuid" }, "done": false },
//!   "hasOne": { "creator": { "model": "user", "local": "user_id" } }
//! }
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::data_model::{Cascade, generate_uuid};
use crate::error::Result;
use crate::validation::ValidationOptions;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreOptions {
    /// Load every database as soon as it is defined.
    pub autoload: bool,
    pub online: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            autoload: false,
            online: true,
        }
    }
}

impl StoreOptions {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseOptions {
    pub name: String,
    /// Defaults to the name in PascalCase.
    pub class_name: Option<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub key: Vec<String>,
    pub fields: Vec<String>,
    pub defaults: IndexMap<String, DefaultValue>,
    /// Fields that never count as unsaved changes.
    pub ignored_fields: Vec<String>,
    pub cascade: Cascade,
    pub key_changes: bool,
    pub load_relations: bool,
    pub cache: Cache,
    pub load: Load,
    /// Remote data carrying a lower value in this field than the model is ignored.
    pub revision: Option<String>,
    /// Remote data overwrites local edits instead of being reported as a conflict.
    pub full_save: bool,
    pub prune: PruneOptions,
    pub priority: i32,
    pub has_one: IndexMap<String, HasOneOptions>,
    pub validation: ValidationOptions,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            class_name: None,
            key: vec!["id".to_string()],
            fields: Vec::new(),
            defaults: IndexMap::new(),
            ignored_fields: Vec::new(),
            cascade: Cascade::ALL,
            key_changes: false,
            load_relations: true,
            cache: Cache::All,
            load: Load::None,
            revision: None,
            full_save: false,
            prune: PruneOptions::default(),
            priority: 0,
            has_one: IndexMap::new(),
            validation: ValidationOptions::default(),
        }
    }
}

impl DatabaseOptions {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn class_name(&self) -> String {
        self.class_name
            .clone()
            .unwrap_or_else(|| pascal_case(&self.name))
    }

    /// Declared fields with the key fields first, without duplicates.
    pub(crate) fn all_fields(&self) -> Vec<String> {
        let mut fields = self.key.clone();
        for field in &self.fields {
            if !fields.contains(field) {
                fields.push(field.clone());
            }
        }
        fields
    }
}

fn pascal_case(name: &str) -> String {
    name.split(['_', '-', ' '])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(one) => vec![one],
        OneOrMany::Many(many) => many,
    })
}

fn optional_one_or_many<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Vec<String>>, D::Error> {
    one_or_many(deserializer).map(Some)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Cache {
    /// Nothing is written locally.
    None,
    /// Records are kept locally only until the remote has them.
    Pending,
    All,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Load {
    None,
    /// Related models that are not in memory are fetched from the remote on demand.
    Lazy,
    /// Every remote record is fetched when the database loads.
    All,
    Both,
}

impl Load {
    pub fn lazy(self) -> bool {
        matches!(self, Load::Lazy | Load::Both)
    }

    pub fn all(self) -> bool {
        matches!(self, Load::All | Load::Both)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PruneOptions {
    pub max: Option<usize>,
    /// Milliseconds a model may go untouched before it is dropped from memory.
    pub keep_alive: Option<u64>,
}

impl PruneOptions {
    pub fn enabled(&self) -> bool {
        self.max.is_some() || self.keep_alive.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefaultValue {
    Generated { generate: Generator },
    Value(Value),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Generator {
    Uuid,
    /// Epoch milliseconds.
    Now,
}

impl DefaultValue {
    pub fn evaluate(&self) -> Value {
        match self {
            DefaultValue::Generated {
                generate: Generator::Uuid,
            } => Value::String(generate_uuid()),
            DefaultValue::Generated {
                generate: Generator::Now,
            } => Value::from(chrono::Utc::now().timestamp_millis()),
            DefaultValue::Value(value) => value.clone(),
        }
    }
}

/// How a related model is written when its owner is encoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StoreMode {
    #[default]
    None,
    Key,
    Model,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HasOneOptions {
    /// Name of the related database.
    pub model: String,
    /// Foreign key fields on the owner. Defaults to `<model>_<key field>` for each related key field.
    #[serde(deserialize_with = "optional_one_or_many")]
    pub local: Option<Vec<String>>,
    /// Encoding used for the local cache.
    pub store: StoreMode,
    /// Encoding used for the remote.
    pub save: StoreMode,
    /// Save the owner when its foreign key changes.
    pub auto: bool,
    /// Announce changes of the related model with `relation-update`.
    pub property: bool,
    /// Remove the related model when it is replaced, unrelated or its owner is removed.
    pub cascade: bool,
    /// Only load when asked for with `Model::load`.
    pub lazy: bool,
}

impl Default for HasOneOptions {
    fn default() -> Self {
        Self {
            model: String::new(),
            local: None,
            store: StoreMode::None,
            save: StoreMode::None,
            auto: true,
            property: true,
            cascade: false,
            lazy: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_database_options_from_json() {
        let options = DatabaseOptions::from_json(
            r#"{
                "name": "task_list",
                "key": "id",
                "fields": ["name", "done"],
                "defaults": {"id": {"generate": "uuid"}, "done": false},
                "cache": "pending",
                "hasOne": {"creator": {"model": "user", "local": "user_id", "cascade": true}}
            }"#,
        )
        .unwrap();

        assert_eq!(options.class_name(), "TaskList");
        assert_eq!(options.all_fields(), vec!["id", "name", "done"]);
        assert_eq!(options.cache, Cache::Pending);
        assert_eq!(options.cascade, Cascade::ALL);
        assert_eq!(
            options.defaults.get("done"),
            Some(&DefaultValue::Value(json!(false)))
        );

        let creator = &options.has_one["creator"];
        assert_eq!(creator.local, Some(vec!["user_id".to_string()]));
        assert!(creator.cascade);
        assert!(creator.auto);
    }

    #[test]
    fn test_generated_defaults() {
        let uuid = DefaultValue::Generated {
            generate: Generator::Uuid,
        };
        assert_ne!(uuid.evaluate(), uuid.evaluate());
        assert!(
            DefaultValue::Generated {
                generate: Generator::Now
            }
            .evaluate()
            .is_i64()
        );
    }

    #[test]
    fn test_bad_options_are_reported() {
        assert!(DatabaseOptions::from_json(r#"{"name": 4}"#).is_err());
        assert!(StoreOptions::from_json(r#"{"online": false}"#).is_ok_and(|o| !o.online));
    }
}
