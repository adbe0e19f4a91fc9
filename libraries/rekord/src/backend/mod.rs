//! The collaborators a database reads from and writes to.
//!
//! Both traits are callback based: every call receives a boxed completion that the backend invokes exactly once, either before returning or at some later point.
//! The crate never holds a borrow of its own state while calling into a backend, so completions may re-enter the store freely.

mod memory;

pub use memory::{LocalCall, MemoryLocal, MemoryRest, RestCall};

use serde_json::Value;

use crate::Record;
use crate::data_model::Key;
use crate::model::Status;

#[derive(Clone, Debug, PartialEq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[error("backend responded with status {status}")]
pub struct BackendFailure {
    pub status: u16,
    pub payload: Value,
}

impl BackendFailure {
    pub const OFFLINE: u16 = 0;
    pub const CONFLICT: u16 = 409;
    pub const NOT_FOUND: u16 = 404;
    pub const GONE: u16 = 410;

    pub fn new(status: u16, payload: Value) -> Self {
        Self { status, payload }
    }

    pub fn offline() -> Self {
        Self::new(Self::OFFLINE, Value::Null)
    }

    pub fn not_found() -> Self {
        Self::new(Self::NOT_FOUND, Value::Null)
    }

    pub fn is_offline(&self) -> bool {
        self.status == Self::OFFLINE
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Self::NOT_FOUND || self.status == Self::GONE
    }

    pub fn is_conflict(&self) -> bool {
        self.status == Self::CONFLICT
    }
}

pub type RestCompletion = Box<dyn FnOnce(Result<Option<Record>, BackendFailure>)>;
pub type RestAllCompletion = Box<dyn FnOnce(Result<Vec<Record>, BackendFailure>)>;

/// The remote API of one database.
pub trait Rest {
    fn all(&self, done: RestAllCompletion);
    fn get(&self, key: &Key, done: RestCompletion);
    fn create(&self, key: &Key, encoded: &Record, done: RestCompletion);
    /// `changes` only holds the fields that differ from the last saved snapshot.
    fn update(&self, key: &Key, changes: &Record, done: RestCompletion);
    fn remove(&self, key: &Key, done: RestCompletion);
}

/// What the local cache keeps for each model. Pending statuses are persisted so an interrupted save or remove can be resumed after a restart.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalRecord {
    pub key: Key,
    pub status: Status,
    pub data: Record,
    pub saved: Option<Record>,
}

pub type LocalCompletion = Box<dyn FnOnce(Result<(), BackendFailure>)>;
pub type LocalGetCompletion = Box<dyn FnOnce(Result<Option<LocalRecord>, BackendFailure>)>;
pub type LocalAllCompletion = Box<dyn FnOnce(Result<Vec<LocalRecord>, BackendFailure>)>;

/// The local cache of one database.
pub trait LocalStore {
    fn all(&self, done: LocalAllCompletion);
    fn get(&self, key: &Key, done: LocalGetCompletion);
    fn put(&self, record: &LocalRecord, done: LocalCompletion);
    fn remove(&self, key: &Key, done: LocalCompletion);
}
