use thiserror::Error;

use crate::data_model::Key;
use crate::validation::ValidationMessages;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RekordError {
    #[error("key missing from {database} model")]
    MissingKey { database: String },

    #[error("key changes are not supported by {database}, enable keyChanges to allow them")]
    KeyChangeUnsupported { database: String },

    #[error("a clone cannot have the same key as the original model ({key})")]
    CloneKeyConflict { key: Key },

    #[error("no database named {0}")]
    UnknownDatabase(String),

    #[error("{database} has no relation named {relation}")]
    UnknownRelation { database: String, relation: String },

    #[error("{0} has pending changes")]
    PendingChanges(String),

    #[error("invalid {rule} rule on {field}: {reason}")]
    InvalidRule {
        field: String,
        rule: String,
        reason: String,
    },

    #[error("{database} model failed validation")]
    Invalid {
        database: String,
        messages: ValidationMessages,
    },

    #[error("invalid options: {0}")]
    Options(String),

    /// The model was pruned, cleared or unloaded, so its handle no longer points at anything.
    #[error("model is no longer attached to its store")]
    Detached,
}

impl From<serde_json::Error> for RekordError {
    fn from(error: serde_json::Error) -> Self {
        RekordError::Options(error.to_string())
    }
}

pub type Result<T, E = RekordError> = std::result::Result<T, E>;
