//! # Model
//! A [`Model`] is a cheap handle: a weak reference to the store plus an arena id. Cloning it never clones the instance.
//! The instance itself is a [`ModelState`], owned by the store. Once it is pruned, cleared or unloaded every handle to it is detached: mutators return [`RekordError::Detached`] and getters return nothing.

use std::collections::VecDeque;
use std::collections::HashMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Record;
use crate::backend::LocalRecord;
use crate::data_model::{
    Cascade, Deferred, EventKind, Key, ListenerKey, Listeners, ModelCallback, ModelEvent, Outcome,
    StoreEventKind,
};
use crate::database::{Database, DatabaseState};
use crate::error::{RekordError, Result};
use crate::operation::{Operation, OperationKind};
use crate::relation::{self, HasOneState};
use crate::store::{ModelId, Store, StoreState, WeakState};
use crate::validation::ValidationMessages;

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum Status {
    #[default]
    Synced,
    SavePending,
    RemovePending,
    Removed,
}

impl Status {
    pub fn is_pending(self) -> bool {
        matches!(self, Status::SavePending | Status::RemovePending)
    }

    pub fn is_deleted(self) -> bool {
        self >= Status::RemovePending
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) struct ModelState {
    pub(crate) db: crate::store::DatabaseId,
    /// Decoded field values.
    pub(crate) values: Record,
    pub(crate) status: Status,
    pub(crate) key: Option<Key>,
    /// Encoded values the remote last acknowledged.
    pub(crate) saved: Option<Record>,
    /// Encoded values last written to the local cache.
    pub(crate) local: Option<Record>,
    pub(crate) saved_state: Option<Record>,
    pub(crate) touched: i64,
    pub(crate) operation: Option<Operation>,
    pub(crate) queue: VecDeque<Operation>,
    pub(crate) relations: HashMap<String, HasOneState>,
    pub(crate) listeners: Listeners<EventKind, ModelCallback>,
    pub(crate) offline: bool,
    pub(crate) resume_cascade: Cascade,
    pub(crate) messages: ValidationMessages,
}

impl ModelState {
    pub(crate) fn new(db: crate::store::DatabaseId, values: Record, key: Option<Key>) -> Self {
        Self {
            db,
            values,
            status: Status::Synced,
            key,
            saved: None,
            local: None,
            saved_state: None,
            touched: now_millis(),
            operation: None,
            queue: VecDeque::new(),
            relations: HashMap::new(),
            listeners: Listeners::default(),
            offline: false,
            resume_cascade: Cascade::ALL,
            messages: ValidationMessages::new(),
        }
    }
}

/// Anything a model can be looked up or related by.
#[derive(Clone, Debug)]
pub enum ModelInput {
    Model(Model),
    Key(Key),
    /// A key value, an array of key parts, or an object of field values.
    Value(Value),
}

impl ModelInput {
    pub(crate) fn is_null(&self) -> bool {
        matches!(self, ModelInput::Value(Value::Null))
    }
}

impl From<Model> for ModelInput {
    fn from(model: Model) -> Self {
        ModelInput::Model(model)
    }
}

impl From<&Model> for ModelInput {
    fn from(model: &Model) -> Self {
        ModelInput::Model(model.clone())
    }
}

impl From<Key> for ModelInput {
    fn from(key: Key) -> Self {
        ModelInput::Key(key)
    }
}

impl From<&str> for ModelInput {
    fn from(key: &str) -> Self {
        ModelInput::Key(Key::from(key))
    }
}

impl From<Value> for ModelInput {
    fn from(value: Value) -> Self {
        ModelInput::Value(value)
    }
}

impl From<Record> for ModelInput {
    fn from(record: Record) -> Self {
        ModelInput::Value(Value::Object(record))
    }
}

#[derive(Clone)]
pub struct Model {
    store: WeakState,
    pub(crate) id: ModelId,
}

impl PartialEq for Model {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.store.ptr_eq(&other.store)
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.read(|m, db| (db.class_name.clone(), m.values.clone(), m.status)) {
            Ok((class_name, values, status)) => f
                .debug_struct(&class_name)
                .field("values", &values)
                .field("status", &status)
                .finish(),
            Err(_) => f.write_str("Model(detached)"),
        }
    }
}

impl Model {
    pub(crate) fn new(store: WeakState, id: ModelId) -> Self {
        Self { store, id }
    }

    pub(crate) fn store(&self) -> Result<Store> {
        Store::upgrade(&self.store)
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&ModelState, &DatabaseState) -> R) -> Result<R> {
        let store = self.store()?;
        let state = store.state();
        let model = state.models.get(self.id).ok_or(RekordError::Detached)?;
        let database = state
            .databases
            .get(model.db)
            .ok_or(RekordError::Detached)?;
        Ok(f(model, database))
    }

    pub(crate) fn write<R>(
        &self,
        f: impl FnOnce(&mut ModelState, &mut DatabaseState) -> R,
    ) -> Result<R> {
        let store = self.store()?;
        let mut state = store.state_mut();
        let StoreState {
            models, databases, ..
        } = &mut *state;
        let model = models.get_mut(self.id).ok_or(RekordError::Detached)?;
        let database = databases
            .get_mut(model.db)
            .ok_or(RekordError::Detached)?;
        Ok(f(model, database))
    }

    pub fn database(&self) -> Result<Database> {
        let db = self.read(|m, _| m.db)?;
        Ok(Database::new(self.store.clone(), db))
    }

    pub fn is_attached(&self) -> bool {
        self.read(|_, _| ()).is_ok()
    }

    pub(crate) fn trigger(&self, event: ModelEvent) {
        let due = self
            .write(|m, _| m.listeners.collect(event.kind()))
            .unwrap_or_default();
        for callback in due {
            callback(self, &event);
        }
    }

    pub(crate) fn changed(&self) {
        self.trigger(ModelEvent::Change { field: None });
    }

    pub fn on(
        &self,
        kinds: &[EventKind],
        callback: impl Fn(&Model, &ModelEvent) + 'static,
    ) -> ListenerKey {
        self.listen(kinds, false, Rc::new(callback))
    }

    pub fn once(
        &self,
        kinds: &[EventKind],
        callback: impl Fn(&Model, &ModelEvent) + 'static,
    ) -> ListenerKey {
        self.listen(kinds, true, Rc::new(callback))
    }

    /// Listens for every event that changes what the model looks like.
    pub fn on_change(&self, callback: impl Fn(&Model, &ModelEvent) + 'static) -> ListenerKey {
        self.on(EventKind::CHANGES, callback)
    }

    fn listen(&self, kinds: &[EventKind], once: bool, callback: Rc<ModelCallback>) -> ListenerKey {
        match self.write(|m, _| m.listeners.insert(kinds, once, callback)) {
            Ok(key) => key,
            Err(_) => ListenerKey(slotmap::DefaultKey::default()),
        }
    }

    pub fn off(&self, key: ListenerKey) -> bool {
        self.write(|m, _| m.listeners.remove(key)).unwrap_or(false)
    }

    pub fn key(&self) -> Option<Key> {
        self.write(|m, db| {
            if m.key.is_none() {
                m.key = db.key_handler.get_key(&m.values);
            }
            m.key.clone()
        })
        .ok()
        .flatten()
    }

    pub fn keys(&self) -> Vec<Value> {
        self.read(|m, db| db.key_handler.get_keys(&m.values))
            .unwrap_or_default()
    }

    /// Unique across databases, e.g. `task$42`.
    pub fn uid(&self) -> String {
        let name = self.read(|_, db| db.options.name.clone()).unwrap_or_default();
        let key = self.key().map(|key| key.to_string()).unwrap_or_default();
        format!("{name}${key}")
    }

    pub fn has_key(&self) -> bool {
        self.read(|m, db| db.key_handler.has_key(&m.values))
            .unwrap_or(false)
    }

    /// Moves the model to a new key. Assigning the first key is always allowed; changing it requires `keyChanges`.
    pub fn set_key(&self, input: &Value) -> Result<Key> {
        let database = self.database()?;
        let key = database
            .build_key_from_input(input)
            .ok_or_else(|| RekordError::MissingKey {
                database: database.name(),
            })?;
        let (old, key_changes) = self.read(|m, db| (m.key.clone(), db.options.key_changes))?;

        if old.as_ref() == Some(&key) {
            return Ok(key);
        }
        if old.is_some() && !key_changes {
            return Err(RekordError::KeyChangeUnsupported {
                database: database.name(),
            });
        }

        if let Some(old) = &old {
            database.remove_reference(old, self.id);
        }
        database.add_reference(key.clone(), self.id);

        let id = self.id;
        self.write(|m, db| {
            db.key_handler.apply_key(&key, &mut m.values);
            m.key = Some(key.clone());
            if let Some(old) = &old
                && db.models.shift_remove(old).is_some()
            {
                db.models.insert(key.clone(), id);
            }
        })?;

        self.trigger(ModelEvent::KeyChange {
            old,
            new: key.clone(),
        });
        Ok(key)
    }

    /// The value of a field. For a relation this is the related model's JSON, or null.
    pub fn get(&self, field: &str) -> Option<Value> {
        if let Some(relation) = relation::find(self, field) {
            return Some(
                relation
                    .get(self)
                    .map(|related| Value::Object(related.to_json(false)))
                    .unwrap_or(Value::Null),
            );
        }
        self.read(|m, _| m.values.get(field).cloned()).ok().flatten()
    }

    pub fn get_many(&self, fields: &[String]) -> Record {
        self.read(|m, _| {
            fields
                .iter()
                .map(|field| {
                    let value = m.values.get(field).cloned().unwrap_or(Value::Null);
                    (field.clone(), value)
                })
                .collect()
        })
        .unwrap_or_default()
    }

    pub fn values(&self) -> Record {
        self.read(|m, _| m.values.clone()).unwrap_or_default()
    }

    /// The related model of a has-one relation, loading the relation first if needed.
    pub fn related(&self, relation: &str) -> Option<Model> {
        let found = relation::find(self, relation)?;
        if let Err(error) = found.load(self, None, false) {
            log::warn!("could not load {relation} of {}: {error}", self.uid());
        }
        found.get(self)
    }

    /// Sets a field, or relates the given model when `field` names a relation.
    pub fn set(&self, field: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        match relation::find(self, field) {
            Some(relation) => relation.set(self, Some(ModelInput::Value(value)), false)?,
            None => {
                self.write(|m, _| m.values.insert(field.to_string(), value))?;
            }
        }
        self.trigger(ModelEvent::Change {
            field: Some(field.to_string()),
        });
        Ok(())
    }

    /// Sets several fields with a single `change` event.
    pub fn set_many(&self, values: Record) -> Result<()> {
        self.assign(values, false)?;
        self.changed();
        Ok(())
    }

    pub(crate) fn assign(&self, props: Record, remote: bool) -> Result<()> {
        for (field, value) in props {
            match relation::find(self, &field) {
                Some(relation) => relation.set(self, Some(ModelInput::Value(value)), remote)?,
                None => {
                    self.write(|m, _| m.values.insert(field, value))?;
                }
            }
        }
        Ok(())
    }

    fn relation(&self, name: &str) -> Result<Rc<relation::HasOne>> {
        relation::find(self, name).ok_or_else(|| RekordError::UnknownRelation {
            database: self.database().map(|db| db.name()).unwrap_or_default(),
            relation: name.to_string(),
        })
    }

    pub fn relate(&self, relation: &str, input: impl Into<ModelInput>) -> Result<()> {
        self.relation(relation)?.relate(self, input.into())
    }

    /// Clears the relation, but only if `input` is absent or names the currently related model.
    pub fn unrelate(&self, relation: &str, input: Option<ModelInput>) -> Result<()> {
        self.relation(relation)?.unrelate(self, input)
    }

    pub fn is_related(&self, relation: &str, input: impl Into<ModelInput>) -> Result<bool> {
        self.relation(relation)?.is_related(self, input.into())
    }

    /// Loads the named relations, or all of them when `relations` is empty. Needed for lazy relations.
    pub fn load(&self, relations: &[&str]) -> Result<()> {
        let names: Vec<String> = if relations.is_empty() {
            self.read(|_, db| db.relations.keys().cloned().collect())?
        } else {
            relations.iter().map(|name| name.to_string()).collect()
        };
        for name in names {
            self.relation(&name)?.load(self, None, false)?;
        }
        Ok(())
    }

    pub fn save(&self) -> Result<Deferred> {
        let cascade = self.read(|_, db| db.options.cascade)?;
        self.save_with(cascade)
    }

    /// Sets `values`, then saves.
    pub fn save_values(&self, values: Record) -> Result<Deferred> {
        self.set_many(values)?;
        self.save()
    }

    pub fn save_with(&self, cascade: Cascade) -> Result<Deferred> {
        let database = self.database()?;

        if self.is_deleted() {
            log::debug!("save on removed model {} ignored", self.uid());
            return Ok(Deferred::settled(None));
        }
        if !self.has_key() {
            return Err(RekordError::MissingKey {
                database: database.name(),
            });
        }

        let (required, cascade) =
            self.read(|_, db| (db.options.validation.required, db.effective_cascade(cascade)))?;
        if required && !self.validate() {
            return Err(RekordError::Invalid {
                database: database.name(),
                messages: self.validation_messages(),
            });
        }

        let deferred = self.deferred_for(cascade, EventKind::REMOTE_SAVES, EventKind::LOCAL_SAVES);

        self.touch();
        if let Some(key) = self.key() {
            database.add_reference(key, self.id);
        }
        relation::pre_save(self);
        self.trigger(ModelEvent::PreSave);
        database.save(self, cascade);
        database.prune_models();
        self.trigger(ModelEvent::PostSave);

        Ok(deferred)
    }

    pub fn remove(&self) -> Deferred {
        let cascade = self
            .read(|_, db| db.options.cascade)
            .unwrap_or(Cascade::ALL);
        self.remove_with(cascade)
    }

    pub fn remove_with(&self, cascade: Cascade) -> Deferred {
        if !self.exists() {
            return Deferred::settled(None);
        }
        let Ok(database) = self.database() else {
            return Deferred::settled(None);
        };

        let cascade = database.effective_cascade(cascade);
        let deferred =
            self.deferred_for(cascade, EventKind::REMOTE_REMOVES, EventKind::LOCAL_REMOVES);

        self.trigger(ModelEvent::PreRemove);
        database.remove(self, cascade);
        relation::post_remove(self);
        self.trigger(ModelEvent::PostRemove);

        deferred
    }

    pub fn refresh(&self) -> Deferred {
        let cascade = self
            .read(|_, db| db.options.cascade)
            .unwrap_or(Cascade::ALL);
        self.refresh_with(cascade)
    }

    /// Settles right away for a model without a key, since there is nothing to look up.
    pub fn refresh_with(&self, cascade: Cascade) -> Deferred {
        if !self.has_key() {
            log::debug!("refresh of a model without a key ignored");
            return Deferred::settled(None);
        }
        let cascade = self
            .read(|_, db| db.effective_cascade(cascade))
            .unwrap_or(Cascade::NONE);
        let deferred = self.deferred_for(cascade, EventKind::REMOTE_GETS, EventKind::LOCAL_GETS);

        if cascade.can(Cascade::REMOTE) {
            self.add_operation(OperationKind::GetRemote, cascade);
        } else if cascade.can(Cascade::LOCAL) {
            self.add_operation(OperationKind::GetLocal, cascade);
        }
        deferred
    }

    /// Refreshes the model every time the store comes back online.
    pub fn auto_refresh(&self, cascade: Cascade) -> Result<ListenerKey> {
        let model = self.clone();
        Ok(self.store()?.on(&[StoreEventKind::Online], move |_| {
            model.refresh_with(cascade);
        }))
    }

    /// Reverts unsaved changes by saving the remotely saved values again. Without a saved version, `reset` restores the defaults.
    pub fn cancel(&self, reset: bool) -> Result<()> {
        let saved = self.read(|m, db| m.saved.as_ref().map(|saved| db.decode(saved)))?;
        match saved {
            Some(saved) => {
                self.save_values(saved)?;
            }
            None if reset => {
                self.write(|m, db| {
                    let mut values = db.default_values();
                    for field in db.key_handler.fields() {
                        if let Some(value) = m.values.get(field) {
                            values.insert(field.clone(), value.clone());
                        }
                    }
                    m.values = values;
                })?;
                self.changed();
            }
            None => {}
        }
        Ok(())
    }

    /// A copy of this model with `overrides` applied. Single-field keys are regenerated; relations are not copied.
    pub fn clone_with(&self, overrides: Record) -> Result<Model> {
        let database = self.database()?;
        let (mut values, key_fields, relations) = self.read(|m, db| {
            let values: Record = db
                .fields
                .iter()
                .map(|field| {
                    let value = overrides
                        .get(field)
                        .or_else(|| m.values.get(field))
                        .cloned()
                        .unwrap_or(Value::Null);
                    (field.clone(), value)
                })
                .collect();
            let relations: Vec<String> = db.relations.keys().cloned().collect();
            (values, db.key_handler.fields().to_vec(), relations)
        })?;

        if let [key_field] = key_fields.as_slice()
            && !overrides.contains_key(key_field)
        {
            values.remove(key_field);
        }

        let clone_key = database.get_key(&values);
        if let Some(key) = clone_key
            && Some(&key) == self.key().as_ref()
        {
            return Err(RekordError::CloneKeyConflict { key });
        }

        for name in relations {
            if let Some(value) = overrides.get(&name) {
                values.insert(name, value.clone());
            }
        }
        database.instantiate(values)
    }

    /// Remembers the current values of `fields` (all fields when None) so they can be restored with [`Model::pop`].
    pub fn push(&self, fields: Option<&[String]>) {
        let _ = self.write(|m, db| {
            let fields = fields.unwrap_or(db.fields.as_slice());
            let values: Record = fields
                .iter()
                .filter_map(|field| Some((field.clone(), m.values.get(field)?.clone())))
                .collect();
            let encoded: Record = db
                .encode(&values)
                .into_iter()
                .filter(|(field, _)| values.contains_key(field))
                .collect();
            m.saved_state = Some(encoded);
        });
    }

    pub fn pop(&self, dont_discard: bool) -> Result<()> {
        let pushed = self.read(|m, db| m.saved_state.as_ref().map(|state| db.decode(state)))?;
        if let Some(values) = pushed {
            self.set_many(values)?;
            if !dont_discard {
                self.discard();
            }
        }
        Ok(())
    }

    pub fn discard(&self) {
        let _ = self.write(|m, _| m.saved_state = None);
    }

    /// Whether the model is in its database's live collection.
    pub fn exists(&self) -> bool {
        let Some(key) = self.key() else {
            return false;
        };
        self.read(|m, db| !m.status.is_deleted() && db.models.get(&key) == Some(&self.id))
            .unwrap_or(false)
    }

    pub fn status(&self) -> Option<Status> {
        self.read(|m, _| m.status).ok()
    }

    pub fn is_synced(&self) -> bool {
        self.status() == Some(Status::Synced)
    }

    pub fn is_saving(&self) -> bool {
        self.status() == Some(Status::SavePending)
    }

    pub fn is_pending(&self) -> bool {
        self.status().is_some_and(Status::is_pending)
    }

    pub fn is_deleted(&self) -> bool {
        self.status().is_some_and(Status::is_deleted)
    }

    /// Whether the remote has acknowledged the model at some point.
    pub fn is_saved(&self) -> bool {
        self.read(|m, _| m.saved.is_some()).unwrap_or(false)
    }

    pub fn is_saved_locally(&self) -> bool {
        self.read(|m, _| m.local.is_some()).unwrap_or(false)
    }

    pub fn is_new(&self) -> bool {
        self.read(|m, _| m.saved.is_none() && m.local.is_none())
            .unwrap_or(true)
    }

    /// Applies data received from the remote to this model.
    pub fn remote(&self, encoded: Record, overwrite: bool) -> Result<()> {
        self.database()?
            .put_remote_data(encoded, self.key(), Some(self), overwrite)?;
        Ok(())
    }

    /// Encoded fields that differ from the saved version, or every field when it was never saved.
    pub fn get_changes(&self) -> Record {
        self.read(|m, db| {
            let encoded = db.encode(&m.values);
            match &m.saved {
                None => encoded,
                Some(saved) => encoded
                    .into_iter()
                    .filter(|(field, value)| saved.get(field).unwrap_or(&Value::Null) != value)
                    .collect(),
            }
        })
        .unwrap_or_default()
    }

    /// Compares against the local copy when `local` is set, the remote one otherwise. Ignored fields never count.
    pub fn has_changes(&self, local: bool) -> bool {
        self.read(|m, db| {
            let Some(compare_to) = (if local { &m.local } else { &m.saved }) else {
                return true;
            };
            let saved = db.decode(compare_to);
            db.fields
                .iter()
                .filter(|field| !db.options.ignored_fields.contains(field))
                .any(|field| {
                    m.values.get(field).unwrap_or(&Value::Null)
                        != saved.get(field).unwrap_or(&Value::Null)
                })
        })
        .unwrap_or(false)
    }

    pub fn has_change(&self, field: &str, local: bool) -> bool {
        self.read(|m, db| {
            let Some(compare_to) = (if local { &m.local } else { &m.saved }) else {
                return true;
            };
            let saved = db.decode(compare_to);
            m.values.get(field).unwrap_or(&Value::Null) != saved.get(field).unwrap_or(&Value::Null)
        })
        .unwrap_or(false)
    }

    /// Encoded fields plus whatever the relations contribute. `for_saving` picks the remote encoding over the cache one.
    pub fn to_json(&self, for_saving: bool) -> Record {
        let Ok((mut encoded, relations)) = self.read(|m, db| {
            (
                db.encode(&m.values),
                db.relations.values().cloned().collect::<Vec<_>>(),
            )
        }) else {
            return Record::new();
        };
        for relation in relations {
            relation.encode(self, &mut encoded, for_saving);
        }
        encoded
    }

    pub fn touch(&self) {
        let _ = self.write(|m, db| {
            if db.options.prune.enabled() {
                m.touched = now_millis();
            }
        });
    }

    /// Runs the validation rules, which may normalise values, and fires `valid` or `invalid`.
    pub fn validate(&self) -> bool {
        let Ok((validator, mut values)) =
            self.read(|m, db| (db.validator.clone(), m.values.clone()))
        else {
            return false;
        };
        let messages = validator.validate(&mut values);
        let valid = messages.is_empty();
        let _ = self.write(|m, _| {
            m.values = values;
            m.messages = messages;
        });

        self.trigger(if valid {
            ModelEvent::Valid
        } else {
            ModelEvent::Invalid
        });
        valid
    }

    pub fn validation_messages(&self) -> ValidationMessages {
        self.read(|m, _| m.messages.clone()).unwrap_or_default()
    }

    pub fn operation_active(&self) -> Option<OperationKind> {
        self.read(|m, _| m.operation.map(|operation| operation.kind))
            .ok()
            .flatten()
    }

    pub fn pending_operations(&self) -> usize {
        self.read(|m, _| m.queue.len()).unwrap_or(0)
    }

    /// Settles with the outcome of the highest tier taking part in the operation.
    fn deferred_for(
        &self,
        cascade: Cascade,
        remote: &'static [EventKind],
        local: &'static [EventKind],
    ) -> Deferred {
        let deferred = Deferred::new();
        let kinds = if cascade.can(Cascade::REMOTE) {
            remote
        } else if cascade.can(Cascade::LOCAL) {
            local
        } else {
            deferred.complete(Outcome::Settled(None));
            return deferred;
        };

        let done = deferred.clone();
        self.once(kinds, move |_, event| {
            done.complete(event.outcome());
        });
        deferred
    }

    pub(crate) fn local_record(&self) -> Result<LocalRecord> {
        let data = self.to_json(false);
        let key = self.key().ok_or_else(|| RekordError::MissingKey {
            database: self.database().map(|db| db.name()).unwrap_or_default(),
        })?;
        self.read(|m, _| LocalRecord {
            key,
            status: m.status,
            data,
            saved: m.saved.clone(),
        })
    }

    /// Resumes the pending save or remove with `cascade` the next time the store comes online.
    pub(crate) fn listen_for_online(&self, cascade: Cascade) {
        let subscribe = self
            .write(|m, _| {
                m.resume_cascade = cascade;
                !std::mem::replace(&mut m.offline, true)
            })
            .unwrap_or(false);

        if subscribe && let Ok(store) = self.store() {
            let model = self.clone();
            store.once(&[StoreEventKind::Online], move |_| model.resume());
        }
    }

    fn resume(&self) {
        let Ok((status, cascade)) = self.write(|m, _| {
            m.offline = false;
            (m.status, m.resume_cascade)
        }) else {
            return;
        };

        match status {
            Status::RemovePending => {
                log::debug!("resuming remove of {}", self.uid());
                self.add_operation(OperationKind::RemoveRemote, cascade);
            }
            Status::SavePending => {
                log::debug!("resuming save of {}", self.uid());
                self.add_operation(OperationKind::SaveRemote, cascade);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use futures::executor::block_on;
    use serde_json::json;

    use super::*;
    use crate::backend::{BackendFailure, LocalCall, MemoryLocal, MemoryRest, RestCall};
    use crate::options::DatabaseOptions;
    use crate::test_support::{Fixture, init_logging, record, user_options};

    fn record_events(model: &Model) -> Rc<RefCell<Vec<EventKind>>> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        model.on(&EventKind::ALL, move |_, event| sink.borrow_mut().push(event.kind()));
        events
    }

    #[test]
    fn test_save_reaches_both_tiers() {
        let fixture = Fixture::new();
        let task = fixture
            .tasks
            .instantiate(record(json!({"name": "Write tests"})))
            .unwrap();
        let events = record_events(&task);

        let outcome = block_on(task.save().unwrap());

        assert!(matches!(outcome, Outcome::Settled(Some(_))));
        let key = task.key().unwrap();
        assert!(fixture.task_rest.record(key.clone()).is_some());
        assert_eq!(
            fixture.task_local.record(key).map(|cached| cached.status),
            Some(Status::Synced)
        );
        assert!(task.is_synced());
        assert!(task.is_saved());
        assert!(task.is_saved_locally());
        assert!(!task.has_changes(false));
        assert_eq!(
            *events.borrow(),
            vec![
                EventKind::PreSave,
                EventKind::Created,
                EventKind::OperationsStarted,
                EventKind::LocalSave,
                EventKind::RemoteSave,
                EventKind::Saved,
                EventKind::OperationsFinished,
                EventKind::PostSave,
            ]
        );
    }

    #[test]
    fn test_save_without_key_fails_before_any_call() {
        let fixture = Fixture::new();
        let nameless = fixture
            .users
            .instantiate(record(json!({"name": "Nobody"})))
            .unwrap();

        assert_eq!(
            nameless.save().unwrap_err(),
            RekordError::MissingKey {
                database: "user".to_string()
            }
        );
        assert!(fixture.user_rest.calls().is_empty());
        assert_eq!(fixture.user_local.calls(), vec![LocalCall::All]);
    }

    #[test]
    fn test_refresh_without_key_settles_immediately() {
        let fixture = Fixture::new();
        let nameless = fixture
            .users
            .instantiate(record(json!({"name": "Nobody"})))
            .unwrap();

        assert_eq!(block_on(nameless.refresh()), Outcome::Settled(None));
        assert!(nameless.operation_active().is_none());
        assert_eq!(fixture.user_local.calls(), vec![LocalCall::All]);
        assert!(fixture.user_rest.calls().is_empty());
    }

    #[test]
    fn test_local_failure_rejects_a_local_only_save() {
        init_logging();
        let store = Store::default();
        let local = MemoryLocal::new();
        let users = store.define(user_options()).local(local.clone()).build().unwrap();
        let ann = users
            .instantiate(record(json!({"id": "1", "name": "Ann"})))
            .unwrap();
        let events = record_events(&ann);

        local.fail_next(BackendFailure::new(500, json!("disk full")));
        let outcome = block_on(ann.save().unwrap());

        assert_eq!(
            outcome,
            Outcome::Rejected(BackendFailure::new(500, json!("disk full")))
        );
        assert!(local.is_empty());
        assert!(!ann.is_saved_locally());
        assert!(!ann.is_saved());
        assert_eq!(ann.status(), Some(Status::Synced));
        assert_eq!(
            *events.borrow(),
            vec![
                EventKind::PreSave,
                EventKind::Created,
                EventKind::OperationsStarted,
                EventKind::LocalSaveFailure,
                EventKind::Saved,
                EventKind::OperationsFinished,
                EventKind::PostSave,
            ]
        );
    }

    #[test]
    fn test_one_operation_at_a_time() {
        let fixture = Fixture::with_task_rest(MemoryRest::manual());
        let task = fixture
            .tasks
            .instantiate(record(json!({"name": "Queue"})))
            .unwrap();

        let saved = task.save().unwrap();
        assert_eq!(task.operation_active(), Some(OperationKind::SaveRemote));
        assert!(task.is_saving());

        let removed = task.remove();
        assert_eq!(task.pending_operations(), 1);
        assert_eq!(fixture.task_rest.held(), 1);

        fixture.task_rest.release_all();

        assert!(matches!(saved.outcome(), Some(Outcome::Settled(Some(_)))));
        assert_eq!(removed.outcome(), Some(Outcome::Settled(None)));
        assert_eq!(task.status(), Some(Status::Removed));
        assert!(task.operation_active().is_none());
        assert!(fixture.task_rest.is_empty());
        assert!(fixture.task_local.is_empty());
        assert!(matches!(
            fixture.task_rest.calls().as_slice(),
            [RestCall::Create(_), RestCall::Remove(_)]
        ));
    }

    #[test]
    fn test_offline_save_resumes_when_online() {
        let fixture = Fixture::new();
        fixture.store.set_online(false);
        let task = fixture
            .tasks
            .instantiate(record(json!({"name": "Later"})))
            .unwrap();

        let outcome = block_on(task.save().unwrap());
        assert_eq!(outcome, Outcome::Offline);
        assert!(task.is_saving());
        assert!(fixture.task_rest.is_empty());
        assert!(task.is_saved_locally());

        fixture.store.set_online(true);

        assert!(task.is_synced());
        assert_eq!(fixture.task_rest.len(), 1);
    }

    #[test]
    fn test_remote_failure_rejects() {
        let fixture = Fixture::new();
        fixture
            .task_rest
            .fail_next(BackendFailure::new(500, json!({"error": "boom"})));
        let task = fixture.tasks.instantiate(record(json!({"name": "Fail"}))).unwrap();

        let outcome = block_on(task.save().unwrap());

        assert_eq!(
            outcome,
            Outcome::Rejected(BackendFailure::new(500, json!({"error": "boom"})))
        );
        assert!(task.is_saving());
        assert!(!task.is_saved());
    }

    #[test]
    fn test_update_only_sends_changes() {
        let fixture = Fixture::new();
        let (ann, saved) = fixture
            .users
            .create(record(json!({"id": "1", "name": "Ann", "email": "ann@example.com"})))
            .unwrap();
        block_on(saved);

        ann.set("name", "Anne").unwrap();
        assert_eq!(ann.get_changes(), record(json!({"name": "Anne"})));
        assert!(ann.has_change("name", false));
        assert!(!ann.has_change("email", false));

        block_on(ann.save().unwrap());
        let second = block_on(ann.save().unwrap());

        assert_eq!(second, Outcome::Settled(None));
        assert_eq!(
            fixture.user_rest.calls(),
            vec![RestCall::Create("1".into()), RestCall::Update("1".into())]
        );
    }

    #[test]
    fn test_remove_unsaved_model_settles_immediately() {
        let fixture = Fixture::new();
        let task = fixture.tasks.instantiate(Record::new()).unwrap();

        assert_eq!(task.remove().outcome(), Some(Outcome::Settled(None)));
        assert!(fixture.task_rest.calls().is_empty());
    }

    #[test]
    fn test_refresh_applies_remote_data_and_detects_removal() {
        let fixture = Fixture::new();
        let (ann, saved) = fixture
            .users
            .create(record(json!({"id": "1", "name": "Ann"})))
            .unwrap();
        block_on(saved);

        fixture
            .user_rest
            .seed("1", record(json!({"id": "1", "name": "Annabel", "email": null})));
        let outcome = block_on(ann.refresh());
        assert!(matches!(outcome, Outcome::Settled(Some(_))));
        assert_eq!(ann.get("name"), Some(json!("Annabel")));

        let (bo, saved) = fixture
            .users
            .create(record(json!({"id": "2", "name": "Bo"})))
            .unwrap();
        block_on(saved);
        fixture.user_rest.fail_next(BackendFailure::not_found());

        let outcome = block_on(bo.refresh());
        assert!(matches!(outcome, Outcome::Rejected(failure) if failure.is_not_found()));
        assert!(bo.is_deleted());
        assert!(fixture.users.get(&json!("2")).is_none());
    }

    #[test]
    fn test_key_changes() {
        init_logging();
        let store = Store::default();
        let fixed = store.define(user_options()).build().unwrap();
        let movable = store
            .define(DatabaseOptions {
                name: "alias".to_string(),
                key_changes: true,
                ..Default::default()
            })
            .build()
            .unwrap();

        let ann = fixed.instantiate(record(json!({"id": "1"}))).unwrap();
        assert_eq!(
            ann.set_key(&json!("2")),
            Err(RekordError::KeyChangeUnsupported {
                database: "user".to_string()
            })
        );

        let alias = movable.instantiate(record(json!({"id": "a"}))).unwrap();
        let changes = Rc::new(RefCell::new(Vec::new()));
        let sink = changes.clone();
        alias.on(&[EventKind::KeyChange], move |_, event| {
            sink.borrow_mut().push(event.clone())
        });

        assert_eq!(alias.set_key(&json!("b")), Ok(Key::from("b")));
        assert_eq!(alias.get("id"), Some(json!("b")));
        assert_eq!(movable.parse_model(Key::from("b")).unwrap(), Some(alias.clone()));
        assert_eq!(movable.parse_model(Key::from("a")).unwrap(), None);
        assert_eq!(
            *changes.borrow(),
            vec![ModelEvent::KeyChange {
                old: Some(Key::from("a")),
                new: Key::from("b")
            }]
        );
    }

    #[test]
    fn test_clone_regenerates_single_keys() {
        let fixture = Fixture::new();
        let task = fixture
            .tasks
            .instantiate(record(json!({"name": "Original", "done": true})))
            .unwrap();

        let copy = task.clone_with(record(json!({"name": "Copy"}))).unwrap();

        assert_ne!(copy.key(), task.key());
        assert_eq!(copy.get("name"), Some(json!("Copy")));
        assert_eq!(copy.get("done"), Some(json!(true)));
    }

    #[test]
    fn test_clone_with_shared_composite_key_fails() {
        init_logging();
        let store = Store::default();
        let members = store
            .define(DatabaseOptions {
                name: "member".to_string(),
                key: vec!["user_id".to_string(), "group_id".to_string()],
                fields: vec!["role".to_string()],
                ..Default::default()
            })
            .build()
            .unwrap();
        let member = members
            .instantiate(record(json!({"user_id": 1, "group_id": 2, "role": "admin"})))
            .unwrap();

        assert_eq!(
            member.clone_with(Record::new()).unwrap_err(),
            RekordError::CloneKeyConflict {
                key: Key::from("1/2")
            }
        );
        assert!(member.clone_with(record(json!({"group_id": 3}))).is_ok());
    }

    #[test]
    fn test_push_pop_and_cancel() {
        let fixture = Fixture::new();
        let (ann, saved) = fixture
            .users
            .create(record(json!({"id": "1", "name": "Ann"})))
            .unwrap();
        block_on(saved);

        ann.push(None);
        ann.set("name", "Draft").unwrap();
        ann.pop(false).unwrap();
        assert_eq!(ann.get("name"), Some(json!("Ann")));

        ann.set("name", "Mistake").unwrap();
        assert!(ann.has_changes(false));
        ann.cancel(false).unwrap();
        assert_eq!(ann.get("name"), Some(json!("Ann")));
        assert!(!ann.has_changes(false));
    }

    #[test]
    fn test_auto_refresh_runs_when_online() {
        let fixture = Fixture::new();
        let (ann, saved) = fixture
            .users
            .create(record(json!({"id": "1", "name": "Ann"})))
            .unwrap();
        block_on(saved);
        ann.auto_refresh(Cascade::ALL).unwrap();

        fixture.store.set_online(false);
        fixture.store.set_online(true);

        assert_eq!(fixture.user_rest.calls().last(), Some(&RestCall::Get("1".into())));
    }

    #[test]
    fn test_set_fires_change() {
        let fixture = Fixture::new();
        let ann = fixture.users.instantiate(record(json!({"id": "1"}))).unwrap();
        let changes = Rc::new(RefCell::new(Vec::new()));
        let sink = changes.clone();
        ann.on_change(move |_, event| sink.borrow_mut().push(event.clone()));

        ann.set("name", "Ann").unwrap();
        ann.set_many(record(json!({"name": "Ann", "email": "a@b"}))).unwrap();

        assert_eq!(
            *changes.borrow(),
            vec![
                ModelEvent::Change {
                    field: Some("name".to_string())
                },
                ModelEvent::Change { field: None },
            ]
        );
        assert_eq!(ann.uid(), "user$1");
    }
}
