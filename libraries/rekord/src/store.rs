//! # Store
//! The registry every database and model lives in. All state sits behind one `RefCell`; handles ([`Database`], [`crate::Model`]) keep a weak reference to it plus an arena id.
//! Borrows are kept short and never span a callback, so listeners and backend completions are free to call back in.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use slotmap::SlotMap;

use crate::data_model::{
    Deferred, ListenerKey, Listeners, Outcome, StoreCallback, StoreEvent, StoreEventKind,
};
use crate::database::{Database, DatabaseBuilder, DatabaseState};
use crate::error::{RekordError, Result};
use crate::model::ModelState;
use crate::options::{DatabaseOptions, StoreOptions};

slotmap::new_key_type! {
    pub(crate) struct DatabaseId;
    pub(crate) struct ModelId;
}

pub(crate) struct StoreState {
    pub(crate) options: StoreOptions,
    pub(crate) online: bool,
    pub(crate) databases: SlotMap<DatabaseId, DatabaseState>,
    /// Both the name and the class name of each database point at it.
    pub(crate) names: HashMap<String, DatabaseId>,
    pub(crate) models: SlotMap<ModelId, ModelState>,
    pub(crate) listeners: Listeners<StoreEventKind, StoreCallback>,
}

pub(crate) type WeakState = Weak<RefCell<StoreState>>;

#[derive(Clone)]
pub struct Store {
    inner: Rc<RefCell<StoreState>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new(StoreOptions::default())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.borrow();
        f.debug_struct("Store")
            .field("online", &state.online)
            .field("databases", &state.databases.len())
            .field("models", &state.models.len())
            .finish()
    }
}

impl Store {
    pub fn new(options: StoreOptions) -> Self {
        Self {
            inner: Rc::new(RefCell::new(StoreState {
                online: options.online,
                options,
                databases: SlotMap::with_key(),
                names: HashMap::new(),
                models: SlotMap::with_key(),
                listeners: Listeners::default(),
            })),
        }
    }

    pub(crate) fn upgrade(weak: &WeakState) -> Result<Self> {
        weak.upgrade()
            .map(|inner| Self { inner })
            .ok_or(RekordError::Detached)
    }

    pub(crate) fn downgrade(&self) -> WeakState {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn state(&self) -> Ref<'_, StoreState> {
        self.inner.borrow()
    }

    pub(crate) fn state_mut(&self) -> RefMut<'_, StoreState> {
        self.inner.borrow_mut()
    }

    /// Starts the definition of a database. Backends and codecs are attached on the returned builder.
    pub fn define(&self, options: DatabaseOptions) -> DatabaseBuilder {
        DatabaseBuilder::new(self.clone(), options)
    }

    pub fn define_json(&self, json: &str) -> Result<DatabaseBuilder> {
        Ok(self.define(DatabaseOptions::from_json(json)?))
    }

    /// Looks a database up by name or class name.
    pub fn database(&self, name: &str) -> Option<Database> {
        let id = self.state().names.get(name).copied()?;
        Some(Database::new(self.downgrade(), id))
    }

    pub fn databases(&self) -> Vec<Database> {
        let ids: Vec<DatabaseId> = self.state().databases.keys().collect();
        ids.into_iter()
            .map(|id| Database::new(self.downgrade(), id))
            .collect()
    }

    /// Loads every database that hasn't been loaded yet, highest priority first, one after the other.
    pub fn load(&self) -> Deferred {
        let mut pending: Vec<(i32, DatabaseId)> = {
            let state = self.state();
            state
                .databases
                .iter()
                .filter(|(_, db)| !db.loaded)
                .map(|(id, db)| (db.options.priority, id))
                .collect()
        };
        pending.sort_by_key(|(priority, _)| std::cmp::Reverse(*priority));

        let queue = pending
            .into_iter()
            .map(|(_, id)| Database::new(self.downgrade(), id))
            .collect();

        let deferred = Deferred::new();
        load_in_order(self.downgrade(), queue, deferred.clone());
        deferred
    }

    /// Drops every model from memory. Local caches are left alone.
    pub fn reset(&self, fail_on_pending: bool) -> Result<()> {
        let databases = self.databases();
        if fail_on_pending {
            check_pending(&databases)?;
        }
        for database in &databases {
            database.reset();
        }
        Ok(())
    }

    /// Removes databases from the registry; an empty `names` unloads all of them.
    /// With `reset` their models are told they are being detached first.
    pub fn unload(&self, names: &[&str], reset: bool, fail_on_pending: bool) -> Result<()> {
        let targets = if names.is_empty() {
            self.databases()
        } else {
            names
                .iter()
                .map(|name| {
                    self.database(name)
                        .ok_or_else(|| RekordError::UnknownDatabase(name.to_string()))
                })
                .collect::<Result<Vec<_>>>()?
        };

        if fail_on_pending {
            check_pending(&targets)?;
        }

        for database in targets {
            if reset {
                database.clear();
            }

            let mut state = self.state_mut();
            let id = database.id;
            state.names.retain(|_, named| *named != id);
            state.models.retain(|_, model| model.db != id);
            if let Some(removed) = state.databases.remove(id) {
                log::debug!("unloaded {}", removed.options.name);
            }
        }
        Ok(())
    }

    pub fn is_online(&self) -> bool {
        self.state().online
    }

    pub fn set_online(&self, online: bool) {
        let changed = {
            let mut state = self.state_mut();
            std::mem::replace(&mut state.online, online) != online
        };

        if changed {
            log::debug!("store is now {}", if online { "online" } else { "offline" });
            self.trigger(if online {
                StoreEvent::Online
            } else {
                StoreEvent::Offline
            });
        }
    }

    pub fn on(
        &self,
        kinds: &[StoreEventKind],
        callback: impl Fn(&StoreEvent) + 'static,
    ) -> ListenerKey {
        self.state_mut()
            .listeners
            .insert(kinds, false, Rc::new(callback))
    }

    pub fn once(
        &self,
        kinds: &[StoreEventKind],
        callback: impl Fn(&StoreEvent) + 'static,
    ) -> ListenerKey {
        self.state_mut()
            .listeners
            .insert(kinds, true, Rc::new(callback))
    }

    pub fn off(&self, key: ListenerKey) -> bool {
        self.state_mut().listeners.remove(key)
    }

    pub(crate) fn trigger(&self, event: StoreEvent) {
        let due = self.state_mut().listeners.collect(event.kind());
        for callback in due {
            callback(&event);
        }
    }
}

fn check_pending(databases: &[Database]) -> Result<()> {
    match databases.iter().find(|database| database.has_pending()) {
        Some(database) => Err(RekordError::PendingChanges(database.name())),
        None => Ok(()),
    }
}

fn load_in_order(store: WeakState, mut queue: VecDeque<Database>, done: Deferred) {
    match queue.pop_front() {
        Some(database) => database
            .load()
            .then(move |_| load_in_order(store, queue, done)),
        None => {
            if let Ok(store) = Store::upgrade(&store) {
                store.trigger(StoreEvent::Loaded);
            }
            done.complete(Outcome::Settled(None));
        }
    }
}
