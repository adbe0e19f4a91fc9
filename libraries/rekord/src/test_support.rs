//! Shared setup for the unit tests.

use futures::executor::block_on;
use serde_json::{Value, json};

use crate::backend::{MemoryLocal, MemoryRest};
use crate::options::{DatabaseOptions, DefaultValue, HasOneOptions};
use crate::{Database, Record, Store};

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub(crate) fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

pub(crate) fn user_options() -> DatabaseOptions {
    DatabaseOptions {
        name: "user".to_string(),
        fields: vec!["name".to_string(), "email".to_string()],
        ..Default::default()
    }
}

/// Tasks get a generated id and a `creator` relation to `user` through `user_id`.
pub(crate) fn task_options() -> DatabaseOptions {
    let mut options = DatabaseOptions {
        name: "task".to_string(),
        fields: vec!["name".to_string(), "done".to_string(), "user_id".to_string()],
        ..Default::default()
    };
    options.defaults.insert(
        "id".to_string(),
        serde_json::from_value(json!({"generate": "uuid"})).unwrap(),
    );
    options
        .defaults
        .insert("done".to_string(), DefaultValue::Value(json!(false)));
    options.has_one.insert(
        "creator".to_string(),
        HasOneOptions {
            model: "user".to_string(),
            ..Default::default()
        },
    );
    options
}

/// A loaded store with `user` and `task` databases, each backed by in-memory backends.
pub(crate) struct Fixture {
    pub store: Store,
    pub users: Database,
    pub tasks: Database,
    pub user_rest: MemoryRest,
    pub user_local: MemoryLocal,
    pub task_rest: MemoryRest,
    pub task_local: MemoryLocal,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_task_rest(MemoryRest::new())
    }

    pub fn with_task_rest(task_rest: MemoryRest) -> Self {
        init_logging();
        let store = Store::default();
        let user_rest = MemoryRest::new();
        let user_local = MemoryLocal::new();
        let task_local = MemoryLocal::new();

        let users = store
            .define(user_options())
            .rest(user_rest.clone())
            .local(user_local.clone())
            .build()
            .unwrap();
        let tasks = store
            .define(task_options())
            .rest(task_rest.clone())
            .local(task_local.clone())
            .build()
            .unwrap();
        block_on(store.load());

        Self {
            store,
            users,
            tasks,
            user_rest,
            user_local,
            task_rest,
            task_local,
        }
    }
}
