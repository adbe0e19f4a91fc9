//! Rekord is a client-side model layer. It binds in-memory model instances to a remote REST-like API and a local cache, and keeps the two in sync.
//!
//! How it fits together:
//! 1. A [`Store`] owns every [`Database`] and every model instance. Models live in an arena and are addressed by id, so relations and listeners never hold strong references to each other.
//! 2. A database describes one model type: its fields, key, defaults, has-one relations, codecs and validation rules. It also owns the identity map, so there is exactly one live [`Model`] per key.
//! 3. Calling [`Model::save`], [`Model::remove`] or [`Model::refresh`] queues an operation on that model. Only one operation per model runs at a time; the rest wait their turn.
//! 4. Operations talk to the [`backend::Rest`] and [`backend::LocalStore`] collaborators. When they finish they fire lifecycle events, which settle the returned [`Deferred`] and let relations react.
//! 5. If the remote is offline, pending saves and removes are resumed the next time the store comes online.

pub mod backend;
pub mod data_model;
mod database;
mod error;
mod model;
mod operation;
mod options;
mod relation;
mod store;
pub mod validation;

#[cfg(test)]
mod test_support;

pub use data_model::{
    Cascade, DatabaseEvent, DatabaseEventKind, Deferred, EventKind, Key, ListenerKey, ModelEvent,
    Outcome, StoreEvent, StoreEventKind,
};
pub use database::{Database, DatabaseBuilder, FieldCodec};
pub use error::{RekordError, Result};
pub use model::{Model, ModelInput, Status};
pub use operation::OperationKind;
pub use options::{
    Cache, DatabaseOptions, DefaultValue, Generator, HasOneOptions, Load, PruneOptions, StoreMode,
    StoreOptions,
};
pub use store::Store;

/// Encoded field values of one model, as exchanged with the backends.
pub type Record = serde_json::Map<String, serde_json::Value>;
