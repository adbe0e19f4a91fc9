//! Relations between models. Only has-one exists: the owner holds the related model's key in its own foreign key fields.
//!
//! A relation definition ([`HasOne`]) is shared by every model of its database. Per-instance state lives on the owner as a [`HasOneState`].

mod has_one;

use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value;

pub(crate) use has_one::{HasOne, HasOneState};

use crate::Record;
use crate::error::Result;
use crate::model::{Model, ModelInput};

pub(crate) fn find(model: &Model, name: &str) -> Option<Rc<HasOne>> {
    model
        .read(|_, db| db.relations.get(name).cloned())
        .ok()
        .flatten()
}

fn all(model: &Model) -> Vec<Rc<HasOne>> {
    model
        .read(|_, db| db.relations.values().cloned().collect())
        .unwrap_or_default()
}

/// Assigns the plain fields of a freshly built model, then loads its relations.
/// A relation starts from its property in `props`, then from its configured default, then from the owner's foreign key.
pub(crate) fn init_relations(model: &Model, mut props: Record, remote: bool) -> Result<()> {
    let (relations, load_relations, defaults) = model.read(|_, db| {
        let defaults: HashMap<String, Value> = db
            .relations
            .keys()
            .filter_map(|name| Some((name.clone(), db.options.defaults.get(name)?.evaluate())))
            .collect();
        (db.relations.clone(), db.options.load_relations, defaults)
    })?;

    let mut initial = HashMap::new();
    for name in relations.keys() {
        if let Some(value) = props.remove(name).or_else(|| defaults.get(name).cloned()) {
            initial.insert(name.clone(), value);
        }
    }
    model.assign(props, remote)?;

    for (name, relation) in relations {
        let loaded = match initial.remove(&name) {
            Some(value) => relation.load(model, Some(ModelInput::Value(value)), remote),
            None if load_relations && !relation.options().lazy => {
                relation.load(model, None, remote)
            }
            None => Ok(()),
        };
        if let Err(error) = loaded {
            log::warn!("could not load {name} of {}: {error}", model.uid());
        }
    }
    Ok(())
}

pub(crate) fn pre_save(model: &Model) {
    for relation in all(model) {
        relation.pre_save(model);
    }
}

pub(crate) fn post_remove(model: &Model) {
    for relation in all(model) {
        relation.post_remove(model);
    }
}
