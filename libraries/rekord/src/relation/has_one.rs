//! # Has one
//! The owner keeps the related model's key in its `local` fields. While a model is related the relation listens to its `saved` and `removed` events:
//! if a save moves it to a key the foreign key no longer matches, or it is removed by someone else, the relation clears itself.

use std::rc::Rc;

use serde_json::Value;

use crate::Record;
use crate::data_model::{EventKind, ListenerKey, ModelEvent, Outcome, key_part, props_match};
use crate::database::Database;
use crate::error::{RekordError, Result};
use crate::model::{Model, ModelInput};
use crate::options::{HasOneOptions, StoreMode};

#[derive(Clone, Debug, Default)]
pub(crate) struct HasOneState {
    pub(crate) related: Option<Model>,
    pub(crate) loaded: bool,
    /// The related model changed since the owner was last saved.
    pub(crate) dirty: bool,
    /// Set from the owner's pre-save until the related model's `saved` event, which it keeps from self-correcting.
    pub(crate) saving: bool,
    pub(crate) listeners: Vec<ListenerKey>,
    /// What `relation-update` last announced.
    pub(crate) property: Option<Model>,
}

#[derive(Debug)]
pub(crate) struct HasOne {
    name: String,
    options: HasOneOptions,
}

impl HasOne {
    pub(crate) fn new(name: String, options: HasOneOptions) -> Self {
        Self { name, options }
    }

    pub(crate) fn options(&self) -> &HasOneOptions {
        &self.options
    }

    fn related_database(&self, owner: &Model) -> Result<Database> {
        owner
            .store()?
            .database(&self.options.model)
            .ok_or_else(|| RekordError::UnknownDatabase(self.options.model.clone()))
    }

    fn local_fields(&self, related: &Database) -> Vec<String> {
        match &self.options.local {
            Some(local) => local.clone(),
            None => related
                .key_fields()
                .iter()
                .map(|field| format!("{}_{field}", related.name()))
                .collect(),
        }
    }

    fn state<R>(&self, owner: &Model, f: impl FnOnce(&HasOneState) -> R) -> Option<R> {
        owner
            .read(|m, _| m.relations.get(&self.name).map(f))
            .ok()
            .flatten()
    }

    fn update_state<R>(&self, owner: &Model, f: impl FnOnce(&mut HasOneState) -> R) -> Option<R> {
        owner
            .write(|m, _| m.relations.get_mut(&self.name).map(f))
            .ok()
            .flatten()
    }

    pub(crate) fn get(&self, owner: &Model) -> Option<Model> {
        self.state(owner, |state| state.related.clone()).flatten()
    }

    /// Sets up the relation state once per owner. `initial` falls back to the owner's foreign key.
    pub(crate) fn load(
        self: &Rc<Self>,
        owner: &Model,
        initial: Option<ModelInput>,
        remote: bool,
    ) -> Result<()> {
        let initial = initial.filter(|input| !input.is_null());
        if self.state(owner, |_| ()).is_some() {
            return match initial {
                Some(input) => self.set(owner, Some(input), remote),
                None => Ok(()),
            };
        }

        let related_db = self.related_database(owner)?;
        owner.write(|m, _| {
            m.relations
                .insert(self.name.clone(), HasOneState::default())
        })?;

        let initial = initial.or_else(|| {
            let local = self.local_fields(&related_db);
            let values = owner.get_many(&local);
            let mut parts: Vec<Value> = local
                .iter()
                .map(|field| values.get(field).cloned().unwrap_or(Value::Null))
                .collect();
            if !parts.iter().all(|value| key_part(value).is_some()) {
                return None;
            }
            Some(ModelInput::Value(match parts.len() {
                1 => parts.remove(0),
                _ => Value::Array(parts),
            }))
        });

        match initial {
            Some(initial) => {
                log::debug!("{} of {} starts from {initial:?}", self.name, owner.uid());
                let relation = self.clone();
                let owner = owner.clone();
                related_db.grab_model(initial, move |related| {
                    relation.handle_model(&owner, related)
                });
            }
            None => {
                self.update_state(owner, |state| state.loaded = true);
            }
        }
        Ok(())
    }

    /// Applies the result of the initial lookup, unless the relation was set in the meantime.
    fn handle_model(self: &Rc<Self>, owner: &Model, related: Option<Model>) {
        if self.state(owner, |state| state.loaded) != Some(false) {
            return;
        }

        let updated = match &related {
            Some(related) => {
                self.set_model(owner, related);
                self.update_foreign_key(owner, related, false)
            }
            None => self.clear_foreign_key(owner, false),
        };
        if let Err(error) = updated {
            log::warn!("could not update the foreign key of {}: {error}", owner.uid());
        }

        self.update_state(owner, |state| state.loaded = true);
        self.set_property(owner);
    }

    /// Null unrelates; anything else is resolved against the related database and related if it isn't already.
    pub(crate) fn set(
        self: &Rc<Self>,
        owner: &Model,
        input: Option<ModelInput>,
        remote: bool,
    ) -> Result<()> {
        let input = input.filter(|input| !input.is_null());
        if self.state(owner, |_| ()).is_none() {
            return self.load(owner, input, remote);
        }

        match input {
            None => self.clear(owner, remote),
            Some(input) => self.replace(owner, input, remote),
        }
    }

    pub(crate) fn relate(self: &Rc<Self>, owner: &Model, input: ModelInput) -> Result<()> {
        self.load(owner, None, false)?;
        self.replace(owner, input, false)
    }

    fn replace(self: &Rc<Self>, owner: &Model, input: ModelInput, remote: bool) -> Result<()> {
        let Some(related) = self.related_database(owner)?.parse_model(input)? else {
            return Ok(());
        };
        if self.get(owner).as_ref() == Some(&related) {
            return Ok(());
        }

        self.clear_model(owner, false);
        self.set_model(owner, &related);
        self.update_foreign_key(owner, &related, !remote)?;
        self.set_property(owner);
        Ok(())
    }

    /// Without `input`, or when it names the current related model, clears the relation.
    pub(crate) fn unrelate(
        self: &Rc<Self>,
        owner: &Model,
        input: Option<ModelInput>,
    ) -> Result<()> {
        self.load(owner, None, false)?;
        let related = match input {
            Some(input) => self.related_database(owner)?.parse_model(input)?,
            None => None,
        };
        if related.is_none() || related == self.get(owner) {
            self.clear(owner, false)?;
        }
        Ok(())
    }

    fn clear(&self, owner: &Model, remote: bool) -> Result<()> {
        self.clear_model(owner, false);
        self.clear_foreign_key(owner, !remote)?;
        self.set_property(owner);
        Ok(())
    }

    pub(crate) fn is_related(self: &Rc<Self>, owner: &Model, input: ModelInput) -> Result<bool> {
        self.load(owner, None, false)?;
        let related = self.related_database(owner)?.parse_model(input)?;
        Ok(related == self.get(owner))
    }

    /// Writes the related model under the relation name when the mode for this encoding asks for it.
    pub(crate) fn encode(&self, owner: &Model, out: &mut Record, for_saving: bool) {
        let mode = if for_saving {
            self.options.save
        } else {
            self.options.store
        };
        if mode == StoreMode::None {
            return;
        }
        let Some(related) = self.state(owner, |state| state.related.clone()) else {
            return;
        };

        let value = match (mode, related) {
            (_, None) => Value::Null,
            (StoreMode::Key, Some(related)) => related
                .read(|m, db| db.key_handler.key_value(&m.values))
                .unwrap_or(Value::Null),
            (_, Some(related)) => Value::Object(related.to_json(for_saving)),
        };
        out.insert(self.name.clone(), value);
    }

    /// Saves the related model first when it was swapped in or has unsaved changes.
    pub(crate) fn pre_save(self: &Rc<Self>, owner: &Model) {
        let Some((Some(related), dirty)) =
            self.state(owner, |state| (state.related.clone(), state.dirty))
        else {
            return;
        };
        if !dirty && !related.has_changes(false) {
            return;
        }

        log::debug!("saving {} before {}", related.uid(), owner.uid());
        self.update_state(owner, |state| {
            state.saving = true;
            state.dirty = false;
        });
        let saving = match related.save() {
            Ok(saving) => saving,
            Err(error) => {
                log::warn!("could not save {} of {}: {error}", self.name, owner.uid());
                self.update_state(owner, |state| state.saving = false);
                return;
            }
        };

        // The related model's `saved` event ends the save in `on_saved`. A rejection or a removal means it never comes.
        let relation = self.clone();
        let watcher = owner.clone();
        saving.then(move |outcome| {
            if matches!(outcome, Outcome::Rejected(_)) || related.is_deleted() {
                relation.update_state(&watcher, |state| state.saving = false);
            }
        });
    }

    pub(crate) fn post_remove(&self, owner: &Model) {
        if self.options.cascade {
            log::debug!("removing {} of {}", self.name, owner.uid());
            self.clear_model(owner, false);
        }
    }

    fn set_model(self: &Rc<Self>, owner: &Model, related: &Model) {
        let relation = self.clone();
        let watcher = owner.clone();
        let on_saved = related.on(&[EventKind::Saved], move |related, _| {
            relation.on_saved(&watcher, related)
        });

        let relation = self.clone();
        let watcher = owner.clone();
        let on_removed = related.on(&[EventKind::Removed], move |_, _| {
            relation.on_removed(&watcher)
        });

        self.update_state(owner, |state| {
            state.related = Some(related.clone());
            state.listeners = vec![on_saved, on_removed];
            state.dirty = true;
            state.saving = false;
            state.loaded = true;
        });
    }

    /// Forgets the related model. It is removed as well when the relation cascades, unless `dont_remove` is set.
    fn clear_model(&self, owner: &Model, dont_remove: bool) {
        let cleared = self
            .update_state(owner, |state| {
                let related = state.related.take()?;
                state.dirty = true;
                state.loaded = true;
                Some((related, std::mem::take(&mut state.listeners)))
            })
            .flatten();

        let Some((related, listeners)) = cleared else {
            return;
        };
        for key in listeners {
            related.off(key);
        }
        if !dont_remove && self.options.cascade {
            related.remove();
        }
    }

    fn on_saved(&self, owner: &Model, related: &Model) {
        let saving = self.update_state(owner, |state| std::mem::take(&mut state.saving));
        if saving.unwrap_or(true) {
            return;
        }
        if !self.matches_foreign_key(owner, related) {
            log::debug!("{} moved away from {}", related.uid(), owner.uid());
            self.self_correct(owner);
        }
    }

    fn on_removed(&self, owner: &Model) {
        log::debug!("{} of {} was removed", self.name, owner.uid());
        self.self_correct(owner);
    }

    fn self_correct(&self, owner: &Model) {
        self.clear_model(owner, true);
        if let Err(error) = self.clear_foreign_key(owner, true) {
            log::warn!("could not clear the foreign key of {}: {error}", owner.uid());
        }
        self.set_property(owner);
    }

    fn matches_foreign_key(&self, owner: &Model, related: &Model) -> bool {
        let Ok(related_db) = related.database() else {
            return false;
        };
        let local = self.local_fields(&related_db);
        let foreign = related_db.key_fields();
        props_match(&owner.values(), &local, &related.values(), &foreign)
    }

    fn update_foreign_key(&self, owner: &Model, related: &Model, auto_save: bool) -> Result<()> {
        let related_db = related.database()?;
        let local = self.local_fields(&related_db);
        let foreign = related_db.key_fields();
        let related_values = related.get_many(&foreign);
        let values = local
            .iter()
            .zip(&foreign)
            .map(|(field, key)| {
                let value = related_values.get(key).cloned().unwrap_or(Value::Null);
                (field.clone(), value)
            })
            .collect();
        self.write_foreign_key(owner, local, values, auto_save)
    }

    fn clear_foreign_key(&self, owner: &Model, auto_save: bool) -> Result<()> {
        let local = self.local_fields(&self.related_database(owner)?);
        let values = local
            .iter()
            .map(|field| (field.clone(), Value::Null))
            .collect();
        self.write_foreign_key(owner, local, values, auto_save)
    }

    fn write_foreign_key(
        &self,
        owner: &Model,
        fields: Vec<String>,
        values: Record,
        auto_save: bool,
    ) -> Result<()> {
        let changed = owner.write(|m, _| {
            let mut changed = false;
            for (field, value) in values {
                if m.values.get(&field).unwrap_or(&Value::Null) != &value {
                    m.values.insert(field, value);
                    changed = true;
                }
            }
            changed
        })?;
        if !changed {
            return Ok(());
        }

        owner.trigger(ModelEvent::KeyUpdate {
            relation: self.name.clone(),
            fields,
        });
        if auto_save && self.options.auto && !owner.is_new() {
            log::debug!("saving {} after its {} changed", owner.uid(), self.name);
            owner.save()?;
        }
        Ok(())
    }

    fn set_property(&self, owner: &Model) {
        if !self.options.property {
            return;
        }
        let changed = self
            .update_state(owner, |state| {
                if state.property == state.related {
                    return false;
                }
                state.property = state.related.clone();
                true
            })
            .unwrap_or(false);

        if changed {
            owner.trigger(ModelEvent::RelationUpdate {
                relation: self.name.clone(),
            });
        }
    }
}
