//! # Database
//! One database per model type. It holds the schema, the backends and the identity map, and it is what operations and relations go through to find, merge and drop models.
//!
//! Two maps are kept per database:
//! - `all` holds every instance that has a key, including ones that were never saved and ones whose removal is still pending. It guarantees one instance per key.
//! - `models` is the live collection: saved or loaded models that haven't been removed.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use indexmap::IndexMap;
use serde_json::Value;

use crate::Record;
use crate::backend::{LocalRecord, LocalStore, Rest};
use crate::data_model::{
    Cascade, DatabaseCallback, DatabaseEvent, DatabaseEventKind, Deferred, EventKind, Key,
    KeyHandler, ListenerKey, Listeners, ModelEvent, Outcome, StoreEventKind,
};
use crate::error::{RekordError, Result};
use crate::model::{Model, ModelInput, ModelState, Status, now_millis};
use crate::operation::OperationKind;
use crate::options::{Cache, DatabaseOptions};
use crate::relation::HasOne;
use crate::store::{DatabaseId, ModelId, Store, StoreState, WeakState};
use crate::validation::Validator;

/// Converts a field between its in-memory and its stored representation.
/// Codecs run while the store is borrowed, so they must not call back into it.
pub trait FieldCodec {
    fn encode(&self, value: &Value) -> Value;
    fn decode(&self, value: &Value) -> Value;
}

pub(crate) struct DatabaseState {
    pub(crate) options: DatabaseOptions,
    pub(crate) class_name: String,
    pub(crate) key_handler: KeyHandler,
    /// Key fields first.
    pub(crate) fields: Vec<String>,
    pub(crate) relations: IndexMap<String, Rc<HasOne>>,
    pub(crate) rest: Option<Rc<dyn Rest>>,
    pub(crate) local: Option<Rc<dyn LocalStore>>,
    pub(crate) codecs: HashMap<String, Rc<dyn FieldCodec>>,
    pub(crate) validator: Rc<Validator>,
    pub(crate) all: HashMap<Key, ModelId>,
    pub(crate) models: IndexMap<Key, ModelId>,
    pub(crate) listeners: Listeners<DatabaseEventKind, DatabaseCallback>,
    pub(crate) loading: bool,
    pub(crate) loaded: bool,
    pub(crate) remote_loaded: bool,
    /// A refresh is waiting for the store to come online.
    pub(crate) refresh_pending: bool,
}

impl DatabaseState {
    /// Drops the tiers this database has no backend for.
    pub(crate) fn effective_cascade(&self, cascade: Cascade) -> Cascade {
        let mut cascade = cascade;
        if self.rest.is_none() {
            cascade = cascade.without(Cascade::REMOTE);
        }
        if !self.has_local_cache() {
            cascade = cascade.without(Cascade::LOCAL);
        }
        cascade
    }

    pub(crate) fn has_local_cache(&self) -> bool {
        self.local.is_some() && self.options.cache != Cache::None
    }

    pub(crate) fn default_values(&self) -> Record {
        self.fields
            .iter()
            .map(|field| {
                let value = self
                    .options
                    .defaults
                    .get(field)
                    .map(|default| default.evaluate())
                    .unwrap_or(Value::Null);
                (field.clone(), value)
            })
            .collect()
    }

    /// Encodes the declared fields of `values`.
    pub(crate) fn encode(&self, values: &Record) -> Record {
        self.fields
            .iter()
            .map(|field| {
                let value = values.get(field).unwrap_or(&Value::Null);
                let encoded = match self.codecs.get(field) {
                    Some(codec) => codec.encode(value),
                    None => value.clone(),
                };
                (field.clone(), encoded)
            })
            .collect()
    }

    /// Decodes every field that has a codec and passes everything else through.
    pub(crate) fn decode(&self, encoded: &Record) -> Record {
        encoded
            .iter()
            .map(|(field, value)| {
                let decoded = match self.codecs.get(field) {
                    Some(codec) => codec.decode(value),
                    None => value.clone(),
                };
                (field.clone(), decoded)
            })
            .collect()
    }
}

pub struct DatabaseBuilder {
    store: Store,
    options: DatabaseOptions,
    rest: Option<Rc<dyn Rest>>,
    local: Option<Rc<dyn LocalStore>>,
    codecs: HashMap<String, Rc<dyn FieldCodec>>,
}

impl DatabaseBuilder {
    pub(crate) fn new(store: Store, options: DatabaseOptions) -> Self {
        Self {
            store,
            options,
            rest: None,
            local: None,
            codecs: HashMap::new(),
        }
    }

    pub fn rest(mut self, rest: impl Rest + 'static) -> Self {
        self.rest = Some(Rc::new(rest));
        self
    }

    pub fn local(mut self, local: impl LocalStore + 'static) -> Self {
        self.local = Some(Rc::new(local));
        self
    }

    pub fn codec(mut self, field: impl Into<String>, codec: impl FieldCodec + 'static) -> Self {
        self.codecs.insert(field.into(), Rc::new(codec));
        self
    }

    /// Registers the database, or returns the one already registered under the same name.
    pub fn build(self) -> Result<Database> {
        let DatabaseBuilder {
            store,
            options,
            rest,
            local,
            codecs,
        } = self;

        if let Some(existing) = store.database(&options.name) {
            log::debug!("{} is already defined", options.name);
            return Ok(existing);
        }
        if options.name.is_empty() {
            return Err(RekordError::Options("a database needs a name".to_string()));
        }
        if options.key.is_empty() {
            return Err(RekordError::Options(format!(
                "{} needs at least one key field",
                options.name
            )));
        }

        let fields = options.all_fields();
        let validator = Validator::new(&options.validation, &fields)?;
        let relations = options
            .has_one
            .iter()
            .map(|(name, relation)| {
                (
                    name.clone(),
                    Rc::new(HasOne::new(name.clone(), relation.clone())),
                )
            })
            .collect();

        let name = options.name.clone();
        let class_name = options.class_name();
        let state = DatabaseState {
            key_handler: KeyHandler::new(options.key.clone()),
            class_name: class_name.clone(),
            fields,
            relations,
            rest,
            local,
            codecs,
            validator: Rc::new(validator),
            all: HashMap::new(),
            models: IndexMap::new(),
            listeners: Listeners::default(),
            loading: false,
            loaded: false,
            remote_loaded: false,
            refresh_pending: false,
            options,
        };

        let (id, autoload) = {
            let mut registry = store.state_mut();
            let id = registry.databases.insert(state);
            registry.names.insert(name.clone(), id);
            registry.names.insert(class_name, id);
            (id, registry.options.autoload)
        };
        log::debug!("defined {name}");
        store.trigger(crate::StoreEvent::Defined { name });

        let database = Database::new(store.downgrade(), id);
        if autoload {
            database.load();
        }
        Ok(database)
    }
}

#[derive(Clone)]
pub struct Database {
    store: WeakState,
    pub(crate) id: DatabaseId,
}

impl PartialEq for Database {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.store.ptr_eq(&other.store)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Database({})", self.name())
    }
}

impl Database {
    pub(crate) fn new(store: WeakState, id: DatabaseId) -> Self {
        Self { store, id }
    }

    pub fn store(&self) -> Result<Store> {
        Store::upgrade(&self.store)
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&DatabaseState) -> R) -> Result<R> {
        let store = self.store()?;
        let state = store.state();
        let database = state
            .databases
            .get(self.id)
            .ok_or(RekordError::Detached)?;
        Ok(f(database))
    }

    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut DatabaseState) -> R) -> Result<R> {
        let store = self.store()?;
        let mut state = store.state_mut();
        let database = state
            .databases
            .get_mut(self.id)
            .ok_or(RekordError::Detached)?;
        Ok(f(database))
    }

    /// Gives access to the whole registry, after checking this database is still in it.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> Result<R> {
        let store = self.store()?;
        let mut state = store.state_mut();
        if !state.databases.contains_key(self.id) {
            return Err(RekordError::Detached);
        }
        Ok(f(&mut state))
    }

    pub(crate) fn model(&self, id: ModelId) -> Model {
        Model::new(self.store.clone(), id)
    }

    pub fn name(&self) -> String {
        self.read(|db| db.options.name.clone()).unwrap_or_default()
    }

    pub fn class_name(&self) -> String {
        self.read(|db| db.class_name.clone()).unwrap_or_default()
    }

    pub fn key_fields(&self) -> Vec<String> {
        self.read(|db| db.key_handler.fields().to_vec())
            .unwrap_or_default()
    }

    pub fn fields(&self) -> Vec<String> {
        self.read(|db| db.fields.clone()).unwrap_or_default()
    }

    pub fn options(&self) -> Result<DatabaseOptions> {
        self.read(|db| db.options.clone())
    }

    pub fn is_loaded(&self) -> bool {
        self.read(|db| db.loaded).unwrap_or(false)
    }

    pub fn is_remote_loaded(&self) -> bool {
        self.read(|db| db.remote_loaded).unwrap_or(false)
    }

    pub fn effective_cascade(&self, cascade: Cascade) -> Cascade {
        self.read(|db| db.effective_cascade(cascade))
            .unwrap_or(Cascade::NONE)
    }

    pub fn get_key(&self, record: &Record) -> Option<Key> {
        self.read(|db| db.key_handler.get_key(record)).ok().flatten()
    }

    pub fn build_key_from_input(&self, input: &Value) -> Option<Key> {
        self.read(|db| db.key_handler.build_key_from_input(input))
            .ok()
            .flatten()
    }

    pub fn apply_key(&self, key: &Key, record: &mut Record) {
        if let Ok(handler) = self.read(|db| db.key_handler.clone()) {
            handler.apply_key(key, record);
        }
    }

    pub fn encode(&self, values: &Record) -> Record {
        self.read(|db| db.encode(values)).unwrap_or_default()
    }

    pub fn decode(&self, encoded: &Record) -> Record {
        self.read(|db| db.decode(encoded)).unwrap_or_default()
    }

    /// Builds a model from `props`, or returns the live model with that key after applying `props` to it.
    pub fn instantiate(&self, props: Record) -> Result<Model> {
        self.instantiate_with(props, false)
    }

    /// `remote` instances start from empty fields instead of the defaults and never auto-save relations.
    pub(crate) fn instantiate_with(&self, props: Record, remote: bool) -> Result<Model> {
        let existing = self.read(|db| {
            db.key_handler
                .get_key(&props)
                .and_then(|key| db.all.get(&key).copied())
        })?;
        if let Some(id) = existing {
            let model = self.model(id);
            if model.is_attached() {
                model.assign(props, remote)?;
                model.changed();
                return Ok(model);
            }
        }

        let database = self.id;
        let id = self.with_state(|state| {
            let StoreState {
                databases, models, ..
            } = state;
            let db = databases.get_mut(database)?;

            let mut values = if remote {
                db.fields
                    .iter()
                    .map(|field| (field.clone(), Value::Null))
                    .collect()
            } else {
                db.default_values()
            };

            let key = match db.key_handler.get_key(&props) {
                Some(key) => {
                    for field in db.key_handler.fields() {
                        if let Some(value) = props.get(field) {
                            values.insert(field.clone(), value.clone());
                        }
                    }
                    Some(key)
                }
                None => db.key_handler.get_key(&values),
            };

            let id = models.insert(ModelState::new(database, values, key.clone()));
            if let Some(key) = key {
                db.all.insert(key, id);
            }
            Some(id)
        })?;
        let id = id.ok_or(RekordError::Detached)?;

        let model = self.model(id);
        crate::relation::init_relations(&model, props, remote)?;
        Ok(model)
    }

    /// Instantiates and saves in one go.
    pub fn create(&self, props: Record) -> Result<(Model, Deferred)> {
        let model = self.instantiate(props)?;
        let deferred = model.save()?;
        Ok((model, deferred))
    }

    /// A live model by key, given as a key value, an array of key parts or an object holding the key fields.
    pub fn get(&self, input: &Value) -> Option<Model> {
        let id = self
            .read(|db| {
                db.key_handler
                    .build_key_from_input(input)
                    .and_then(|key| db.models.get(&key).copied())
            })
            .ok()
            .flatten()?;
        Some(self.model(id))
    }

    /// The live collection, in insertion order.
    pub fn all(&self) -> Vec<Model> {
        let ids: Vec<ModelId> = self
            .read(|db| db.models.values().copied().collect())
            .unwrap_or_default();
        ids.into_iter().map(|id| self.model(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.read(|db| db.models.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves `input` to a model of this database without touching any backend.
    /// Objects are instantiated when no instance with their key exists yet.
    pub fn parse_model(&self, input: impl Into<ModelInput>) -> Result<Option<Model>> {
        match input.into() {
            ModelInput::Model(model) => {
                if model.database()? == *self {
                    Ok(Some(model))
                } else {
                    log::warn!("{} can't hold a model of another database", self.name());
                    Ok(None)
                }
            }
            ModelInput::Key(key) => self.lookup(&key),
            ModelInput::Value(Value::Null) => Ok(None),
            ModelInput::Value(Value::Object(props)) => self.instantiate(props).map(Some),
            ModelInput::Value(value) => match self.build_key_from_input(&value) {
                Some(key) => self.lookup(&key),
                None => Ok(None),
            },
        }
    }

    fn lookup(&self, key: &Key) -> Result<Option<Model>> {
        let id = self.read(|db| db.all.get(key).copied())?;
        Ok(id.map(|id| self.model(id)).filter(Model::is_attached))
    }

    fn input_key(&self, input: &ModelInput) -> Option<Key> {
        match input {
            ModelInput::Model(model) => model.key(),
            ModelInput::Key(key) => Some(key.clone()),
            ModelInput::Value(value) => self.build_key_from_input(value),
        }
    }

    /// Like [`Database::parse_model`], but waits for a pending local load and fetches missing models from the remote when the database loads lazily.
    pub fn grab_model(&self, input: ModelInput, callback: impl FnOnce(Option<Model>) + 'static) {
        match self.parse_model(input.clone()) {
            Ok(Some(model)) => return callback(Some(model)),
            Ok(None) => {}
            Err(error) => {
                log::warn!("could not resolve a {} model: {error}", self.name());
                return callback(None);
            }
        }

        let Ok((waiting, lazy)) = self.read(|db| {
            (
                db.has_local_cache() && !db.loaded,
                db.options.load.lazy() && db.rest.is_some(),
            )
        }) else {
            return callback(None);
        };

        if waiting {
            let database = self.clone();
            let callback = RefCell::new(Some(callback));
            self.once(&[DatabaseEventKind::LocalLoad], move |_| {
                if let Some(callback) = callback.borrow_mut().take() {
                    database.grab_model(input.clone(), callback);
                }
            });
            return;
        }

        let key = self.input_key(&input);
        match key.filter(|_| lazy) {
            Some(key) => {
                let props = self
                    .read(|db| db.key_handler.build_object_from_key(&key))
                    .unwrap_or_default();
                let stub = match self.instantiate_with(props, true) {
                    Ok(stub) => stub,
                    Err(error) => {
                        log::warn!("could not fetch {key} lazily: {error}");
                        return callback(None);
                    }
                };

                let callback = RefCell::new(Some(callback));
                stub.once(EventKind::REMOTE_GETS, move |model, event| {
                    if let Some(callback) = callback.borrow_mut().take() {
                        let found = matches!(event, ModelEvent::RemoteGet { data: Some(_) });
                        callback(found.then(|| model.clone()));
                    }
                });
                stub.refresh_with(Cascade::REMOTE);
            }
            None => callback(None),
        }
    }

    /// Applies a record received from the remote. The model is looked up by `key` (or the record's own key) unless it is given.
    /// Returns the model the data ended up in, or None when it was ignored.
    pub fn put_remote_data(
        &self,
        encoded: Record,
        key: Option<Key>,
        model: Option<&Model>,
        overwrite: bool,
    ) -> Result<Option<Model>> {
        let key = match key {
            Some(key) => key,
            None => match self.get_key(&encoded) {
                Some(key) => key,
                None => {
                    log::warn!("remote {} data without a key ignored", self.name());
                    return Ok(None);
                }
            },
        };

        let model = match model {
            Some(model) => Some(model.clone()),
            None => self.lookup(&key)?,
        };

        match model {
            Some(model) => {
                if self.merge_remote(&model, &encoded, overwrite)? {
                    Ok(Some(model))
                } else {
                    Ok(None)
                }
            }
            None => {
                let decoded = self.decode(&encoded);
                let model = self.instantiate_with(decoded, true)?;
                let (fields, cascade) =
                    self.read(|db| (db.fields.clone(), db.effective_cascade(db.options.cascade)))?;
                let saved = fields
                    .iter()
                    .filter_map(|field| Some((field.clone(), encoded.get(field)?.clone())))
                    .collect();
                model.write(|m, _| {
                    m.saved = Some(saved);
                    m.status = Status::Synced;
                })?;

                self.add_to_collection(&model);
                if self.read(|db| db.options.cache == Cache::All)? {
                    model.add_operation(OperationKind::SaveNow, cascade);
                }
                Ok(Some(model))
            }
        }
    }

    /// Returns false when the data was ignored.
    fn merge_remote(&self, model: &Model, encoded: &Record, overwrite: bool) -> Result<bool> {
        let merged = model.write(|m, db| {
            if m.status.is_deleted() {
                return None;
            }

            if let Some(revision) = &db.options.revision {
                let incoming = encoded.get(revision).and_then(Value::as_f64);
                let current = m
                    .saved
                    .as_ref()
                    .and_then(|saved| saved.get(revision))
                    .or_else(|| m.values.get(revision))
                    .and_then(Value::as_f64);
                if let (Some(incoming), Some(current)) = (incoming, current)
                    && incoming < current
                {
                    return None;
                }
            }

            let decoded = db.decode(encoded);
            let previous = m.saved.as_ref().map(|saved| db.decode(saved));
            let take_all = overwrite || db.options.full_save || previous.is_none();

            let mut updated = Record::new();
            let mut conflicts = Record::new();
            for field in &db.fields {
                let Some(value) = decoded.get(field) else {
                    continue;
                };
                let current = m.values.get(field).unwrap_or(&Value::Null);
                let untouched = previous
                    .as_ref()
                    .is_none_or(|previous| previous.get(field).unwrap_or(&Value::Null) == current);

                if take_all || untouched {
                    m.values.insert(field.clone(), value.clone());
                    updated.insert(field.clone(), value.clone());
                } else if current != value {
                    conflicts.insert(field.clone(), value.clone());
                }
            }

            let saved = m.saved.get_or_insert_with(Record::new);
            for field in &db.fields {
                if let Some(value) = encoded.get(field) {
                    saved.insert(field.clone(), value.clone());
                }
            }

            let relations: Vec<(String, Value)> = db
                .relations
                .keys()
                .filter_map(|name| Some((name.clone(), encoded.get(name)?.clone())))
                .collect();
            let refresh_cache =
                m.status == Status::Synced && db.options.cache == Cache::All;

            Some((updated, conflicts, relations, refresh_cache))
        })?;

        let Some((updated, conflicts, relations, refresh_cache)) = merged else {
            log::debug!("remote data for {} ignored", model.uid());
            return Ok(false);
        };

        for (name, value) in relations {
            if let Some(relation) = crate::relation::find(model, &name) {
                relation.set(model, Some(ModelInput::Value(value)), true)?;
            }
        }

        if conflicts.is_empty() {
            model.trigger(ModelEvent::FullUpdate {
                encoded: encoded.clone(),
                updated,
            });
        } else {
            log::debug!("{} kept local values over remote data", model.uid());
            model.trigger(ModelEvent::PartialUpdate {
                encoded: encoded.clone(),
                updated,
                conflicts,
            });
        }
        model.trigger(ModelEvent::RemoteUpdate {
            encoded: encoded.clone(),
        });

        self.add_to_collection(model);
        if refresh_cache {
            let cascade = self.read(|db| db.effective_cascade(db.options.cascade))?;
            model.add_operation(OperationKind::SaveNow, cascade);
        }
        self.trigger(DatabaseEvent::ModelUpdated(model.clone()));
        Ok(true)
    }

    /// Reads the local cache into memory, resuming interrupted saves and removes, then refreshes from the remote when `load` includes `all`.
    pub fn load(&self) -> Deferred {
        let deferred = Deferred::new();
        let state = self.read(|db| {
            (
                db.loaded,
                db.loading,
                db.local.clone().filter(|_| db.has_local_cache()),
                db.options.load.all() && db.rest.is_some(),
            )
        });
        let Ok((loaded, loading, local, load_all)) = state else {
            deferred.complete(Outcome::Settled(None));
            return deferred;
        };

        if loaded {
            deferred.complete(Outcome::Settled(None));
            return deferred;
        }
        if loading {
            let done = deferred.clone();
            self.once(&[DatabaseEventKind::LocalLoad], move |_| {
                done.complete(Outcome::Settled(None));
            });
            return deferred;
        }
        let _ = self.write(|db| db.loading = true);

        let database = self.clone();
        let done = deferred.clone();
        let finish = move || {
            let _ = database.write(|db| {
                db.loading = false;
                db.loaded = true;
            });
            database.trigger(DatabaseEvent::LocalLoad);
            if load_all {
                database
                    .refresh()
                    .then(move |outcome| {
                        done.complete(outcome.clone());
                    });
            } else {
                done.complete(Outcome::Settled(None));
            }
        };

        match local {
            Some(local) => {
                let database = self.clone();
                local.all(Box::new(move |result| {
                    match result {
                        Ok(records) => {
                            for record in records {
                                if let Err(error) = database.restore(record) {
                                    log::error!("could not restore a cached model: {error}");
                                }
                            }
                        }
                        Err(failure) => {
                            log::error!("could not read the {} cache: {failure}", database.name())
                        }
                    }
                    finish();
                }));
            }
            None => finish(),
        }

        deferred
    }

    fn restore(&self, record: LocalRecord) -> Result<()> {
        let (local, cascade) =
            self.read(|db| (db.local.clone(), db.effective_cascade(db.options.cascade)))?;

        // A removal the remote never needs to hear about is already complete.
        let removed = record.status == Status::Removed
            || (record.status == Status::RemovePending && record.saved.is_none());
        if removed {
            if let Some(local) = local {
                local.remove(&record.key, Box::new(|_| {}));
            }
            return Ok(());
        }

        let decoded = self.decode(&record.data);
        let model = self.instantiate_with(decoded, true)?;
        model.write(|m, _| {
            m.local = Some(record.data);
            m.saved = record.saved;
            m.status = record.status;
        })?;

        match record.status {
            Status::RemovePending => model.add_operation(OperationKind::RemoveRemote, cascade),
            Status::SavePending => {
                self.add_to_collection(&model);
                model.add_operation(OperationKind::SaveRemote, cascade);
            }
            _ => {
                self.add_to_collection(&model);
            }
        }
        Ok(())
    }

    /// Fetches every remote record, merges them in and drops synced models the remote no longer has.
    pub fn refresh(&self) -> Deferred {
        let deferred = Deferred::new();
        let Ok(rest) = self.read(|db| db.rest.clone()) else {
            deferred.complete(Outcome::Settled(None));
            return deferred;
        };
        let Some(rest) = rest else {
            deferred.complete(Outcome::Settled(None));
            return deferred;
        };

        if !self.store().is_ok_and(|store| store.is_online()) {
            self.refresh_when_online();
            deferred.complete(Outcome::Offline);
            return deferred;
        }

        let database = self.clone();
        let done = deferred.clone();
        rest.all(Box::new(move |result| match result {
            Ok(records) => {
                database.apply_remote_records(records);
                done.complete(Outcome::Settled(None));
            }
            Err(failure) if failure.is_offline() => {
                database.refresh_when_online();
                done.complete(Outcome::Offline);
            }
            Err(failure) => {
                log::error!("refreshing {} failed: {failure}", database.name());
                done.complete(Outcome::Rejected(failure));
            }
        }));
        deferred
    }

    /// Refreshes once the store is back online. Repeated calls while offline share one refresh.
    fn refresh_when_online(&self) {
        let subscribe = self
            .write(|db| !std::mem::replace(&mut db.refresh_pending, true))
            .unwrap_or(false);
        if !subscribe {
            return;
        }
        if let Ok(store) = self.store() {
            let database = self.clone();
            store.once(&[StoreEventKind::Online], move |_| {
                let _ = database.write(|db| db.refresh_pending = false);
                database.refresh();
            });
        }
    }

    fn apply_remote_records(&self, records: Vec<Record>) {
        let mut seen = HashSet::new();
        for record in records {
            match self.put_remote_data(record, None, None, false) {
                Ok(Some(model)) => {
                    if let Some(key) = model.key() {
                        seen.insert(key);
                    }
                }
                Ok(None) => {}
                Err(error) => log::error!("could not apply remote {} data: {error}", self.name()),
            }
        }

        let stale: Vec<Model> = self
            .all()
            .into_iter()
            .filter(|model| {
                model.key().is_some_and(|key| !seen.contains(&key))
                    && model.is_synced()
                    && model.is_saved()
            })
            .collect();
        for model in stale {
            log::debug!("{} is gone from the remote", model.uid());
            self.destroy_model(&model);
        }

        let _ = self.write(|db| db.remote_loaded = true);
        self.trigger(DatabaseEvent::RemoteLoad);
    }

    /// Whether any model has a save or remove that hasn't reached every tier yet.
    pub fn has_pending(&self) -> bool {
        let database = self.id;
        self.with_state(|state| {
            state
                .models
                .values()
                .any(|model| {
                    model.db == database && (model.status.is_pending() || model.operation.is_some())
                })
        })
        .unwrap_or(false)
    }

    /// Detaches every model of this database from the store.
    pub fn clear(&self) {
        let database = self.id;
        let ids: Vec<ModelId> = self
            .with_state(|state| {
                state
                    .models
                    .iter()
                    .filter(|(_, model)| model.db == database)
                    .map(|(id, _)| id)
                    .collect()
            })
            .unwrap_or_default();

        for id in &ids {
            self.model(*id).trigger(ModelEvent::Detach);
        }

        let _ = self.with_state(|state| {
            state.models.retain(|_, model| model.db != database);
            if let Some(db) = state.databases.get_mut(database) {
                db.all.clear();
                db.models.clear();
            }
        });
    }

    pub(crate) fn reset(&self) {
        self.clear();
        let _ = self.write(|db| {
            db.loaded = false;
            db.remote_loaded = false;
        });
    }

    pub fn has_pruning(&self) -> bool {
        self.read(|db| db.options.prune.enabled()).unwrap_or(false)
    }

    /// Drops idle models from memory once they outlive `prune.keepAlive` or exceed `prune.max`, oldest first.
    pub fn prune_models(&self) {
        let Ok(prune) = self.read(|db| db.options.prune.clone()) else {
            return;
        };
        if !prune.enabled() {
            return;
        }

        let database = self.id;
        let (mut idle, live) = self
            .with_state(|state| {
                let Some(db) = state.databases.get(database) else {
                    return (Vec::new(), 0);
                };
                let idle: Vec<(ModelId, i64)> = db
                    .models
                    .values()
                    .filter_map(|id| {
                        let model = state.models.get(*id)?;
                        let idle = model.operation.is_none() && !model.status.is_pending();
                        idle.then_some((*id, model.touched))
                    })
                    .collect();
                (idle, db.models.len())
            })
            .unwrap_or_default();
        idle.sort_by_key(|(_, touched)| *touched);

        let now = now_millis();
        let mut doomed = Vec::new();
        let mut live = live;
        for (id, touched) in idle {
            let expired = prune
                .keep_alive
                .is_some_and(|keep_alive| touched + keep_alive as i64 <= now);
            let excess = prune.max.is_some_and(|max| live > max);
            if expired || excess {
                doomed.push(id);
                live -= 1;
            }
        }

        for id in doomed {
            let model = self.model(id);
            log::debug!("pruning {}", model.uid());
            model.trigger(ModelEvent::Detach);
            self.trigger(DatabaseEvent::ModelRemoved(model.clone()));
            let _ = self.with_state(|state| {
                if let Some(db) = state.databases.get_mut(database) {
                    db.models.retain(|_, model| *model != id);
                    db.all.retain(|_, model| *model != id);
                }
                state.models.remove(id);
            });
        }
    }

    pub fn on(
        &self,
        kinds: &[DatabaseEventKind],
        callback: impl Fn(&DatabaseEvent) + 'static,
    ) -> ListenerKey {
        self.listen(kinds, false, Rc::new(callback))
    }

    pub fn once(
        &self,
        kinds: &[DatabaseEventKind],
        callback: impl Fn(&DatabaseEvent) + 'static,
    ) -> ListenerKey {
        self.listen(kinds, true, Rc::new(callback))
    }

    fn listen(
        &self,
        kinds: &[DatabaseEventKind],
        once: bool,
        callback: Rc<DatabaseCallback>,
    ) -> ListenerKey {
        match self.write(|db| db.listeners.insert(kinds, once, callback)) {
            Ok(key) => key,
            Err(_) => ListenerKey(slotmap::DefaultKey::default()),
        }
    }

    pub fn off(&self, key: ListenerKey) -> bool {
        self.write(|db| db.listeners.remove(key)).unwrap_or(false)
    }

    pub(crate) fn trigger(&self, event: DatabaseEvent) {
        let due = self
            .write(|db| db.listeners.collect(event.kind()))
            .unwrap_or_default();
        for callback in due {
            callback(&event);
        }
    }

    pub(crate) fn add_reference(&self, key: Key, id: ModelId) {
        let _ = self.write(|db| {
            if let Some(previous) = db.all.insert(key.clone(), id)
                && previous != id
            {
                log::warn!("{key} now refers to a different {} model", db.options.name);
            }
        });
    }

    pub(crate) fn remove_reference(&self, key: &Key, id: ModelId) {
        let _ = self.write(|db| {
            if db.all.get(key) == Some(&id) {
                db.all.remove(key);
            }
        });
    }

    /// Returns true if the model wasn't in the live collection yet.
    pub(crate) fn add_to_collection(&self, model: &Model) -> bool {
        let Some(key) = model.key() else {
            return false;
        };
        let added = self
            .write(|db| {
                if db.models.contains_key(&key) {
                    false
                } else {
                    db.models.insert(key, model.id);
                    true
                }
            })
            .unwrap_or(false);
        if added {
            self.trigger(DatabaseEvent::ModelAdded(model.clone()));
        }
        added
    }

    pub(crate) fn save(&self, model: &Model, cascade: Cascade) {
        if model.is_deleted() {
            return;
        }

        if self.add_to_collection(model) {
            model.trigger(ModelEvent::Created);
        } else {
            model.trigger(ModelEvent::Updated);
            self.trigger(DatabaseEvent::ModelUpdated(model.clone()));
        }
        model.add_operation(OperationKind::SaveLocal, cascade);
    }

    pub(crate) fn remove(&self, model: &Model, cascade: Cascade) {
        if let Some(key) = model.key() {
            let _ = self.write(|db| db.models.shift_remove(&key));
        }
        let _ = model.write(|m, _| m.status = Status::RemovePending);

        model.trigger(ModelEvent::Removed);
        self.trigger(DatabaseEvent::ModelRemoved(model.clone()));
        model.add_operation(OperationKind::RemoveLocal, cascade);
    }

    /// Drops a model the remote reported as gone.
    pub(crate) fn destroy_model(&self, model: &Model) {
        let key = model.key();
        let _ = model.write(|m, _| {
            m.status = Status::Removed;
            m.saved = None;
        });
        if let Some(key) = &key {
            let _ = self.write(|db| db.models.shift_remove(key));
            self.remove_reference(key, model.id);
        }

        model.trigger(ModelEvent::Removed);
        self.trigger(DatabaseEvent::ModelRemoved(model.clone()));

        let cascade = self.effective_cascade(Cascade::ALL);
        model.add_operation(OperationKind::RemoveNow, cascade);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use serde_json::json;

    use super::*;
    use crate::backend::{BackendFailure, LocalCall, MemoryLocal, MemoryRest, RestCall};
    use crate::options::{Load, PruneOptions};
    use crate::test_support::{Fixture, init_logging, record, user_options};

    struct Cents;

    impl FieldCodec for Cents {
        fn encode(&self, value: &Value) -> Value {
            value
                .as_f64()
                .map(|dollars| Value::from((dollars * 100.0).round() as i64))
                .unwrap_or(Value::Null)
        }

        fn decode(&self, value: &Value) -> Value {
            value
                .as_i64()
                .map(|cents| Value::from(cents as f64 / 100.0))
                .unwrap_or(Value::Null)
        }
    }

    #[test]
    fn test_instantiate_returns_the_live_instance() {
        let fixture = Fixture::new();
        let first = fixture
            .users
            .instantiate(record(json!({"id": "1", "name": "Ann"})))
            .unwrap();
        let second = fixture
            .users
            .instantiate(record(json!({"id": "1", "name": "Annie"})))
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first.get("name"), Some(json!("Annie")));
    }

    #[test]
    fn test_defaults_and_generated_keys() {
        let fixture = Fixture::new();
        let task = fixture.tasks.instantiate(Record::new()).unwrap();

        assert!(task.key().is_some());
        assert_eq!(task.get("done"), Some(json!(false)));
        assert!(task.is_new());
    }

    #[test]
    fn test_codecs_apply_to_stored_values() {
        init_logging();
        let store = Store::default();
        let rest = MemoryRest::new();
        let products = store
            .define(DatabaseOptions {
                name: "product".to_string(),
                fields: vec!["price".to_string()],
                ..Default::default()
            })
            .rest(rest.clone())
            .codec("price", Cents)
            .build()
            .unwrap();

        let (product, saved) = products
            .create(record(json!({"id": "p1", "price": 12.5})))
            .unwrap();
        futures::executor::block_on(saved);

        assert_eq!(rest.record("p1"), Some(record(json!({"id": "p1", "price": 1250}))));
        assert_eq!(product.get("price"), Some(json!(12.5)));
    }

    #[test]
    fn test_put_remote_data_reports_conflicts() {
        let fixture = Fixture::new();
        let (ann, saved) = fixture
            .users
            .create(record(json!({"id": "1", "name": "Ann", "email": "ann@old"})))
            .unwrap();
        futures::executor::block_on(saved);

        ann.set("name", json!("Anne")).unwrap();
        let conflicts = Rc::new(RefCell::new(None));
        let sink = conflicts.clone();
        ann.once(&[EventKind::PartialUpdate], move |_, event| {
            if let ModelEvent::PartialUpdate { conflicts, .. } = event {
                *sink.borrow_mut() = Some(conflicts.clone());
            }
        });

        fixture
            .users
            .put_remote_data(
                record(json!({"id": "1", "name": "Annabel", "email": "ann@new"})),
                None,
                None,
                false,
            )
            .unwrap();

        assert_eq!(ann.get("name"), Some(json!("Anne")));
        assert_eq!(ann.get("email"), Some(json!("ann@new")));
        assert_eq!(
            *conflicts.borrow(),
            Some(record(json!({"name": "Annabel"})))
        );
    }

    #[test]
    fn test_put_remote_data_creates_unknown_models() {
        let fixture = Fixture::new();
        let added = Rc::new(RefCell::new(0));
        let counter = added.clone();
        fixture.users.on(&[DatabaseEventKind::ModelAdded], move |_| {
            *counter.borrow_mut() += 1
        });

        let bo = fixture
            .users
            .put_remote_data(record(json!({"id": "2", "name": "Bo"})), None, None, false)
            .unwrap()
            .unwrap();

        assert!(bo.is_saved());
        assert!(bo.is_synced());
        assert_eq!(fixture.users.get(&json!("2")), Some(bo));
        assert_eq!(*added.borrow(), 1);
    }

    #[test]
    fn test_revision_guards_stale_data() {
        init_logging();
        let store = Store::default();
        let docs = store
            .define(DatabaseOptions {
                name: "doc".to_string(),
                fields: vec!["body".to_string(), "rev".to_string()],
                revision: Some("rev".to_string()),
                ..Default::default()
            })
            .build()
            .unwrap();

        let doc = docs
            .put_remote_data(record(json!({"id": "d", "body": "new", "rev": 3})), None, None, false)
            .unwrap()
            .unwrap();
        let stale = docs
            .put_remote_data(record(json!({"id": "d", "body": "old", "rev": 2})), None, None, false)
            .unwrap();

        assert!(stale.is_none());
        assert_eq!(doc.get("body"), Some(json!("new")));
    }

    #[test]
    fn test_load_restores_cached_models_and_resumes_saves() {
        init_logging();
        let store = Store::default();
        let rest = MemoryRest::new();
        let local = MemoryLocal::new();
        local.seed(LocalRecord {
            key: "1".into(),
            status: Status::SavePending,
            data: record(json!({"id": "1", "name": "Ann"})),
            saved: None,
        });
        local.seed(LocalRecord {
            key: "2".into(),
            status: Status::Synced,
            data: record(json!({"id": "2", "name": "Bo"})),
            saved: Some(record(json!({"id": "2", "name": "Bo"}))),
        });
        local.seed(LocalRecord {
            key: "3".into(),
            status: Status::Removed,
            data: record(json!({"id": "3"})),
            saved: None,
        });

        let users = store
            .define(user_options())
            .rest(rest.clone())
            .local(local.clone())
            .build()
            .unwrap();
        futures::executor::block_on(users.load());

        assert!(users.is_loaded());
        assert_eq!(users.len(), 2);
        assert_eq!(
            rest.record("1"),
            Some(record(json!({"id": "1", "name": "Ann", "email": null})))
        );
        assert!(users.get(&json!("1")).is_some_and(|ann| ann.is_synced()));
        assert!(local.record("3").is_none());
        assert!(local.calls().contains(&LocalCall::Remove("3".into())));
    }

    #[test]
    fn test_load_discards_removals_never_saved_remotely() {
        init_logging();
        let store = Store::default();
        let local = MemoryLocal::new();
        local.seed(LocalRecord {
            key: "1".into(),
            status: Status::RemovePending,
            data: record(json!({"id": "1", "name": "Ann"})),
            saved: None,
        });

        let users = store
            .define(user_options())
            .rest(MemoryRest::new())
            .local(local.clone())
            .build()
            .unwrap();
        futures::executor::block_on(users.load());

        assert!(users.get(&json!("1")).is_none());
        assert!(local.record("1").is_none());
        assert!(!users.has_pending());
        assert_eq!(store.reset(true), Ok(()));

        let ann = users.instantiate(record(json!({"id": "1"}))).unwrap();
        assert!(!ann.is_deleted());
    }

    #[test]
    fn test_refresh_merges_and_drops_missing() {
        let fixture = Fixture::new();
        let (gone, saved) = fixture
            .users
            .create(record(json!({"id": "9", "name": "Gone"})))
            .unwrap();
        futures::executor::block_on(saved);
        fixture.user_rest.fail_next(BackendFailure::new(500, Value::Null));

        let failed = futures::executor::block_on(fixture.users.refresh());
        assert!(matches!(failed, Outcome::Rejected(_)));

        let rest = MemoryRest::new();
        rest.seed("1", record(json!({"id": "1", "name": "Ann"})));
        let store = Store::default();
        let users = store.define(user_options()).rest(rest).build().unwrap();
        let stale = users
            .put_remote_data(record(json!({"id": "7", "name": "Old"})), None, None, false)
            .unwrap()
            .unwrap();

        futures::executor::block_on(users.refresh());

        assert!(users.is_remote_loaded());
        assert!(users.get(&json!("1")).is_some());
        assert!(stale.is_deleted());
        assert!(users.get(&json!("7")).is_none());
        assert!(!gone.is_deleted());
    }

    #[test]
    fn test_refresh_offline_waits_for_online() {
        let fixture = Fixture::new();
        fixture.user_rest.seed("1", record(json!({"id": "1", "name": "Ann"})));
        fixture.store.set_online(false);

        let outcome = futures::executor::block_on(fixture.users.refresh());
        assert_eq!(outcome, Outcome::Offline);
        assert!(fixture.users.is_empty());

        fixture.store.set_online(true);
        assert_eq!(fixture.users.len(), 1);
    }

    #[test]
    fn test_repeated_offline_refreshes_run_once_online() {
        let fixture = Fixture::new();
        fixture.store.set_online(false);
        let before = fixture.user_rest.calls().len();

        for _ in 0..3 {
            let outcome = futures::executor::block_on(fixture.users.refresh());
            assert_eq!(outcome, Outcome::Offline);
        }

        fixture.store.set_online(true);
        let calls = fixture.user_rest.calls();
        assert_eq!(calls[before..], [RestCall::All]);

        fixture.store.set_online(false);
        fixture.store.set_online(true);
        assert_eq!(fixture.user_rest.calls().len(), before + 1);
    }

    #[test]
    fn test_prune_keeps_the_newest_models() {
        init_logging();
        let store = Store::default();
        let users = store
            .define(DatabaseOptions {
                prune: PruneOptions {
                    max: Some(2),
                    keep_alive: None,
                },
                ..user_options()
            })
            .build()
            .unwrap();

        let mut models = Vec::new();
        for id in ["1", "2", "3"] {
            let (model, _) = users.create(record(json!({"id": id}))).unwrap();
            models.push(model);
        }

        assert_eq!(users.len(), 2);
        assert!(users.get(&json!("1")).is_none());
        assert!(!models[0].is_attached());
        assert!(models[2].is_attached());
    }

    #[test]
    fn test_grab_model_fetches_lazily() {
        init_logging();
        let store = Store::default();
        let rest = MemoryRest::new();
        rest.seed("5", record(json!({"id": "5", "name": "Eve"})));
        let users = store
            .define(DatabaseOptions {
                load: Load::Lazy,
                ..user_options()
            })
            .rest(rest)
            .build()
            .unwrap();

        let grabbed = Rc::new(RefCell::new(None));
        let sink = grabbed.clone();
        users.grab_model(ModelInput::Key("5".into()), move |model| {
            *sink.borrow_mut() = model
        });
        let missing = Rc::new(RefCell::new(Some(())));
        let sink = missing.clone();
        users.grab_model(ModelInput::Key("6".into()), move |model| {
            assert!(model.is_none());
            *sink.borrow_mut() = None;
        });

        let eve = grabbed.borrow().clone().unwrap();
        assert_eq!(eve.get("name"), Some(json!("Eve")));
        assert_eq!(users.get(&json!("5")), Some(eve));
        assert!(missing.borrow().is_none());
    }
}
