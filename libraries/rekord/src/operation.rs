//! # Operations
//! Every backend interaction of a model is an [`OperationKind`] in that model's queue. At most one runs at a time; the rest wait in FIFO order.
//! Follow-up steps (a remote save after a local one, dropping the cache after a remote removal) are pushed to the front of the queue, so they run before anything queued later.
//!
//! Each step finishes by calling `finish_operation`, from the backend's completion. That may happen before the backend call returns.

use std::rc::Rc;

use crate::Record;
use crate::backend::{BackendFailure, LocalStore, Rest, RestCompletion};
use crate::data_model::{Cascade, ModelEvent};
use crate::model::{Model, Status};
use crate::options::Cache;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    GetLocal,
    GetRemote,
    SaveLocal,
    SaveRemote,
    /// Writes the cache without touching the status.
    SaveNow,
    RemoveLocal,
    RemoveRemote,
    /// Drops the cached record without touching the status.
    RemoveNow,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Operation {
    pub(crate) kind: OperationKind,
    pub(crate) cascade: Cascade,
}

impl Model {
    /// Runs the operation right away if the model is idle, otherwise queues it.
    pub(crate) fn add_operation(&self, kind: OperationKind, cascade: Cascade) {
        let operation = Operation { kind, cascade };
        let start = self.write(|m, _| {
            if m.operation.is_some() {
                m.queue.push_back(operation);
                false
            } else {
                m.operation = Some(operation);
                true
            }
        });

        match start {
            Ok(true) => {
                self.trigger(ModelEvent::OperationsStarted);
                operation.execute(self);
            }
            Ok(false) => log::trace!("{kind:?} queued on {}", self.uid()),
            Err(error) => log::debug!("{kind:?} dropped: {error}"),
        }
    }

    /// Queues the operation to run right after the active one.
    pub(crate) fn insert_next(&self, kind: OperationKind, cascade: Cascade) {
        let _ = self.write(|m, _| m.queue.push_front(Operation { kind, cascade }));
    }

    pub(crate) fn finish_operation(&self) {
        let next = self.write(|m, _| {
            m.operation = m.queue.pop_front();
            m.operation
        });

        match next {
            Ok(Some(operation)) => operation.execute(self),
            Ok(None) => self.trigger(ModelEvent::OperationsFinished),
            Err(_) => {}
        }
    }
}

impl Operation {
    fn execute(self, model: &Model) {
        log::trace!("{:?} on {}", self.kind, model.uid());
        let cascade = self.cascade;
        match self.kind {
            OperationKind::GetLocal => get_local(model, cascade),
            OperationKind::GetRemote => get_remote(model, cascade),
            OperationKind::SaveLocal => save_local(model, cascade),
            OperationKind::SaveRemote => save_remote(model, cascade),
            OperationKind::SaveNow => save_now(model, cascade),
            OperationKind::RemoveLocal => remove_local(model, cascade),
            OperationKind::RemoveRemote => remove_remote(model, cascade),
            OperationKind::RemoveNow => remove_now(model, cascade),
        }
    }
}

/// Backends this step may use, given its cascade.
struct Tiers {
    rest: Option<Rc<dyn Rest>>,
    local: Option<Rc<dyn LocalStore>>,
    online: bool,
    status: Status,
    saved: Option<Record>,
}

fn tiers(model: &Model, cascade: Cascade) -> Option<Tiers> {
    let online = model.store().is_ok_and(|store| store.is_online());
    model
        .read(|m, db| Tiers {
            rest: db.rest.clone().filter(|_| cascade.can(Cascade::REMOTE)),
            local: db
                .local
                .clone()
                .filter(|_| db.has_local_cache() && cascade.can(Cascade::LOCAL)),
            online,
            status: m.status,
            saved: m.saved.clone(),
        })
        .ok()
}

fn get_local(model: &Model, cascade: Cascade) {
    let Some(tiers) = tiers(model, cascade) else {
        return;
    };
    let (Some(local), Some(key)) = (tiers.local, model.key()) else {
        after_get_local(model, cascade);
        return;
    };

    let owner = model.clone();
    local.get(
        &key,
        Box::new(move |result| {
            match result {
                Ok(record) => {
                    if let Some(record) = record {
                        let _ = owner.write(|m, db| {
                            let decoded = db.decode(&record.data);
                            for field in &db.fields {
                                if let Some(value) = decoded.get(field) {
                                    m.values.insert(field.clone(), value.clone());
                                }
                            }
                            m.local = Some(record.data);
                        });
                    }
                    owner.trigger(ModelEvent::LocalGet);
                }
                Err(failure) => {
                    log::warn!("reading {} from the cache failed: {failure}", owner.uid());
                    owner.trigger(ModelEvent::LocalGetFailure { failure });
                }
            }
            after_get_local(&owner, cascade);
        }),
    );
}

fn after_get_local(model: &Model, cascade: Cascade) {
    if cascade.can(Cascade::REMOTE) {
        model.insert_next(OperationKind::GetRemote, cascade);
    }
    model.finish_operation();
}

fn get_remote(model: &Model, cascade: Cascade) {
    let Some(tiers) = tiers(model, cascade) else {
        return;
    };
    if tiers.status.is_deleted() {
        model.trigger(ModelEvent::RemoteGet { data: None });
        return model.finish_operation();
    }
    let (Some(rest), Some(key)) = (tiers.rest, model.key()) else {
        return model.finish_operation();
    };
    if !tiers.online {
        model.trigger(ModelEvent::RemoteGetOffline);
        return model.finish_operation();
    }

    let owner = model.clone();
    rest.get(
        &key.clone(),
        Box::new(move |result| {
            match result {
                Ok(data) => {
                    if let Some(data) = &data {
                        let applied = owner.database().and_then(|database| {
                            database.put_remote_data(data.clone(), Some(key), Some(&owner), false)
                        });
                        if let Err(error) = applied {
                            log::error!("could not apply remote data to {}: {error}", owner.uid());
                        }
                    }
                    owner.trigger(ModelEvent::RemoteGet { data });
                }
                Err(failure) if failure.is_not_found() => {
                    log::debug!("{} no longer exists remotely", owner.uid());
                    owner.trigger(ModelEvent::RemoteGetFailure { failure });
                    if let Ok(database) = owner.database() {
                        database.destroy_model(&owner);
                    }
                }
                Err(failure) if failure.is_offline() => {
                    owner.trigger(ModelEvent::RemoteGetOffline);
                }
                Err(failure) => {
                    log::error!("fetching {} failed: {failure}", owner.uid());
                    owner.trigger(ModelEvent::RemoteGetFailure { failure });
                }
            }
            owner.finish_operation();
        }),
    );
}

fn save_local(model: &Model, cascade: Cascade) {
    let Some(tiers) = tiers(model, cascade) else {
        return;
    };
    if tiers.status.is_deleted() {
        log::debug!("{} was removed before it could be saved", model.uid());
        return model.finish_operation();
    }
    // Without a remote tier the cached copy is already the final one.
    let status = if cascade.can(Cascade::REMOTE) {
        Status::SavePending
    } else {
        Status::Synced
    };
    let _ = model.write(|m, _| m.status = status);

    let Some(local) = tiers.local else {
        return after_local_save(model, cascade);
    };
    let record = match model.local_record() {
        Ok(record) => record,
        Err(error) => {
            log::error!("can't cache {}: {error}", model.uid());
            return model.finish_operation();
        }
    };

    let data = record.data.clone();
    let owner = model.clone();
    local.put(
        &record,
        Box::new(move |result| {
            match result {
                Ok(()) => {
                    let _ = owner.write(|m, _| m.local = Some(data));
                    owner.trigger(ModelEvent::LocalSave);
                }
                Err(failure) => {
                    log::error!("caching {} failed: {failure}", owner.uid());
                    owner.trigger(ModelEvent::LocalSaveFailure { failure });
                }
            }
            after_local_save(&owner, cascade);
        }),
    );
}

fn after_local_save(model: &Model, cascade: Cascade) {
    if !model.is_deleted() {
        if cascade.can(Cascade::REMOTE) {
            model.insert_next(OperationKind::SaveRemote, cascade);
        } else {
            let _ = model.write(|m, _| m.status = Status::Synced);
            model.trigger(ModelEvent::Saved);
        }
    }
    model.finish_operation();
}

fn save_remote(model: &Model, cascade: Cascade) {
    let Some(tiers) = tiers(model, cascade) else {
        return;
    };
    if tiers.status.is_deleted() {
        return model.finish_operation();
    }
    let (Some(rest), Some(key)) = (tiers.rest, model.key()) else {
        return model.finish_operation();
    };
    if !tiers.online {
        model.trigger(ModelEvent::RemoteSaveOffline);
        model.listen_for_online(cascade);
        return model.finish_operation();
    }

    let encoded = model.to_json(true);
    let full_save = model
        .read(|_, db| db.options.full_save)
        .unwrap_or(false);
    let owner = model.clone();
    let sent = encoded.clone();
    let done: RestCompletion = Box::new(move |result| remote_saved(&owner, cascade, sent, result));

    match tiers.saved {
        None => rest.create(&key, &encoded, done),
        Some(saved) => {
            let changes: Record = if full_save {
                encoded
            } else {
                encoded
                    .into_iter()
                    .filter(|(field, value)| saved.get(field) != Some(value))
                    .collect()
            };
            if changes.is_empty() {
                done(Ok(None));
            } else {
                rest.update(&key, &changes, done);
            }
        }
    }
}

fn remote_saved(
    model: &Model,
    cascade: Cascade,
    sent: Record,
    result: Result<Option<Record>, BackendFailure>,
) {
    let data = match result {
        Ok(data) => data,
        Err(failure) => return remote_save_failed(model, cascade, failure),
    };

    // Fields the remote changed on its own win; everything else keeps what was edited meanwhile.
    let applied = model.write(|m, db| {
        if let Some(data) = &data {
            let decoded = db.decode(data);
            for field in &db.fields {
                if let (Some(value), Some(returned)) = (decoded.get(field), data.get(field))
                    && sent.get(field) != Some(returned)
                {
                    m.values.insert(field.clone(), value.clone());
                }
            }
        }

        let saved = m.saved.get_or_insert_with(Record::new);
        saved.extend(sent);
        if let Some(data) = &data {
            for field in &db.fields {
                if let Some(value) = data.get(field) {
                    saved.insert(field.clone(), value.clone());
                }
            }
        }

        if m.status == Status::RemovePending {
            return None;
        }
        m.status = Status::Synced;
        Some(db.options.cache)
    });

    match applied {
        Ok(Some(cache)) => {
            model.trigger(ModelEvent::RemoteSave { data });
            model.trigger(ModelEvent::Saved);
            if cascade.can(Cascade::LOCAL) {
                if cache == Cache::Pending {
                    model.insert_next(OperationKind::RemoveNow, cascade);
                } else {
                    model.insert_next(OperationKind::SaveNow, cascade);
                }
            }
        }
        Ok(None) => model.trigger(ModelEvent::RemoteSave { data }),
        Err(error) => log::debug!("remote save finished on a detached model: {error}"),
    }
    model.finish_operation();
}

fn remote_save_failed(model: &Model, cascade: Cascade, failure: BackendFailure) {
    if failure.is_offline() {
        model.trigger(ModelEvent::RemoteSaveOffline);
        model.listen_for_online(cascade);
    } else if failure.is_not_found() {
        log::debug!("{} no longer exists remotely", model.uid());
        model.trigger(ModelEvent::RemoteSaveFailure { failure });
        if let Ok(database) = model.database() {
            database.destroy_model(model);
        }
    } else if failure.is_conflict() {
        log::warn!("saving {} conflicted with the remote", model.uid());
        let current = failure.payload.as_object().cloned();
        model.trigger(ModelEvent::RemoteSaveFailure { failure });
        if let Some(current) = current
            && let Err(error) = model.remote(current, false)
        {
            log::error!("could not apply the conflicting data to {}: {error}", model.uid());
        }
    } else {
        log::error!("saving {} failed: {failure}", model.uid());
        model.trigger(ModelEvent::RemoteSaveFailure { failure });
    }
    model.finish_operation();
}

fn save_now(model: &Model, cascade: Cascade) {
    let Some(local) = tiers(model, cascade).and_then(|tiers| tiers.local) else {
        return model.finish_operation();
    };
    let record = match model.local_record() {
        Ok(record) => record,
        Err(error) => {
            log::error!("can't cache {}: {error}", model.uid());
            return model.finish_operation();
        }
    };

    let data = record.data.clone();
    let owner = model.clone();
    local.put(
        &record,
        Box::new(move |result| {
            match result {
                Ok(()) => {
                    let _ = owner.write(|m, _| m.local = Some(data));
                }
                Err(failure) => {
                    log::warn!("refreshing the cache of {} failed: {failure}", owner.uid())
                }
            }
            owner.finish_operation();
        }),
    );
}

fn remove_now(model: &Model, cascade: Cascade) {
    let local = tiers(model, cascade).and_then(|tiers| tiers.local);
    let (Some(local), Some(key)) = (local, model.key()) else {
        let _ = model.write(|m, _| m.local = None);
        return model.finish_operation();
    };

    let owner = model.clone();
    local.remove(
        &key,
        Box::new(move |result| {
            match result {
                Ok(()) => {
                    let _ = owner.write(|m, _| m.local = None);
                }
                Err(failure) => {
                    log::warn!("dropping the cache of {} failed: {failure}", owner.uid())
                }
            }
            owner.finish_operation();
        }),
    );
}

fn remove_local(model: &Model, cascade: Cascade) {
    let Some(tiers) = tiers(model, cascade) else {
        return;
    };
    let _ = model.write(|m, _| m.status = Status::RemovePending);

    // A record the remote knows about stays cached as pending until the remote removal succeeds.
    let remote = tiers.saved.is_some() && tiers.rest.is_some();
    let (Some(local), Some(key)) = (tiers.local, model.key()) else {
        return after_local_remove(model, cascade, remote);
    };

    let owner = model.clone();
    let pending = if remote {
        match model.local_record() {
            Ok(record) => Some(record),
            Err(error) => {
                log::error!("can't cache the removal of {}: {error}", model.uid());
                None
            }
        }
    } else {
        None
    };
    let cached = pending.as_ref().map(|record| record.data.clone());
    let done = Box::new(move |result: Result<(), BackendFailure>| {
        match result {
            Ok(()) => {
                let _ = owner.write(|m, _| m.local = cached);
                owner.trigger(ModelEvent::LocalRemove);
            }
            Err(failure) => {
                log::error!("removing {} from the cache failed: {failure}", owner.uid());
                owner.trigger(ModelEvent::LocalRemoveFailure { failure });
            }
        }
        after_local_remove(&owner, cascade, remote);
    });

    match pending {
        Some(record) => local.put(&record, done),
        None => local.remove(&key, done),
    }
}

fn after_local_remove(model: &Model, cascade: Cascade, remote: bool) {
    if remote {
        model.insert_next(OperationKind::RemoveRemote, cascade);
    } else {
        finish_removal(model);
        if cascade.can(Cascade::REMOTE) {
            model.trigger(ModelEvent::RemoteRemove);
        }
    }
    model.finish_operation();
}

fn finish_removal(model: &Model) {
    let _ = model.write(|m, _| {
        m.status = Status::Removed;
        m.saved = None;
    });
    if let (Some(key), Ok(database)) = (model.key(), model.database()) {
        database.remove_reference(&key, model.id);
    }
}

fn remove_remote(model: &Model, cascade: Cascade) {
    let Some(tiers) = tiers(model, cascade) else {
        return;
    };
    let (Some(rest), Some(key)) = (tiers.rest, model.key()) else {
        finish_removal(model);
        return model.finish_operation();
    };
    if !tiers.online {
        model.trigger(ModelEvent::RemoteRemoveOffline);
        model.listen_for_online(cascade);
        return model.finish_operation();
    }

    let owner = model.clone();
    rest.remove(
        &key,
        Box::new(move |result| {
            match result {
                Ok(_) => removed_remotely(&owner, cascade),
                Err(failure) if failure.is_not_found() => removed_remotely(&owner, cascade),
                Err(failure) if failure.is_offline() => {
                    owner.trigger(ModelEvent::RemoteRemoveOffline);
                    owner.listen_for_online(cascade);
                }
                Err(failure) => {
                    log::error!("removing {} failed: {failure}", owner.uid());
                    owner.trigger(ModelEvent::RemoteRemoveFailure { failure });
                }
            }
            owner.finish_operation();
        }),
    );
}

fn removed_remotely(model: &Model, cascade: Cascade) {
    finish_removal(model);
    model.insert_next(OperationKind::RemoveNow, cascade);
    model.trigger(ModelEvent::RemoteRemove);
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use serde_json::json;

    use super::*;
    use crate::Outcome;
    use crate::data_model::Key;
    use crate::backend::{LocalCall, MemoryLocal, RestCall};
    use crate::options::DatabaseOptions;
    use crate::store::Store;
    use crate::test_support::{Fixture, init_logging, record, user_options};

    #[test]
    fn test_remove_saved_model_clears_both_tiers() {
        let fixture = Fixture::new();
        let (ann, saved) = fixture
            .users
            .create(record(json!({"id": "1", "name": "Ann"})))
            .unwrap();
        block_on(saved);

        let outcome = block_on(ann.remove());

        assert_eq!(outcome, Outcome::Settled(None));
        assert_eq!(ann.status(), Some(Status::Removed));
        assert!(!ann.is_saved());
        assert!(!ann.is_saved_locally());
        assert!(fixture.user_rest.is_empty());
        assert!(fixture.user_local.is_empty());
        assert!(fixture.users.get(&json!("1")).is_none());
        assert!(fixture.users.parse_model(Key::from("1")).unwrap().is_none());
    }

    #[test]
    fn test_offline_remove_stays_pending_in_cache() {
        let fixture = Fixture::new();
        let (ann, saved) = fixture
            .users
            .create(record(json!({"id": "1", "name": "Ann"})))
            .unwrap();
        block_on(saved);

        fixture.store.set_online(false);
        let outcome = block_on(ann.remove());

        assert_eq!(outcome, Outcome::Offline);
        assert_eq!(ann.status(), Some(Status::RemovePending));
        assert_eq!(
            fixture.user_local.record("1").map(|cached| cached.status),
            Some(Status::RemovePending)
        );

        fixture.store.set_online(true);

        assert_eq!(ann.status(), Some(Status::Removed));
        assert!(fixture.user_rest.is_empty());
        assert!(fixture.user_local.is_empty());
    }

    #[test]
    fn test_remotely_missing_model_is_destroyed_on_save() {
        let fixture = Fixture::new();
        let (ann, saved) = fixture
            .users
            .create(record(json!({"id": "1", "name": "Ann"})))
            .unwrap();
        block_on(saved);

        ann.set("name", "Anne").unwrap();
        fixture.user_rest.fail_next(BackendFailure::new(410, json!(null)));
        let outcome = block_on(ann.save().unwrap());

        assert!(matches!(outcome, Outcome::Rejected(failure) if failure.is_not_found()));
        assert_eq!(ann.status(), Some(Status::Removed));
        assert!(fixture.users.is_empty());
        assert!(fixture.user_local.is_empty());
    }

    #[test]
    fn test_conflict_applies_the_remote_version() {
        let fixture = Fixture::new();
        let (ann, saved) = fixture
            .users
            .create(record(json!({"id": "1", "name": "Ann", "email": "ann@example.com"})))
            .unwrap();
        block_on(saved);

        ann.set("email", "anne@example.com").unwrap();
        fixture.user_rest.fail_next(BackendFailure::new(
            409,
            json!({"id": "1", "name": "Annie", "email": "ann@example.com"}),
        ));
        let outcome = block_on(ann.save().unwrap());

        assert!(matches!(outcome, Outcome::Rejected(failure) if failure.is_conflict()));
        assert_eq!(ann.get("name"), Some(json!("Annie")));
        assert_eq!(ann.get("email"), Some(json!("anne@example.com")));
    }

    #[test]
    fn test_pending_cache_is_dropped_after_remote_save() {
        init_logging();
        let store = Store::default();
        let local = MemoryLocal::new();
        let rest = crate::backend::MemoryRest::new();
        let users = store
            .define(DatabaseOptions {
                cache: Cache::Pending,
                ..user_options()
            })
            .rest(rest.clone())
            .local(local.clone())
            .build()
            .unwrap();

        let (ann, saved) = users.create(record(json!({"id": "1", "name": "Ann"}))).unwrap();
        block_on(saved);

        assert!(ann.is_synced());
        assert_eq!(rest.len(), 1);
        assert!(local.is_empty());
        assert_eq!(
            local.calls(),
            vec![LocalCall::Put("1".into()), LocalCall::Remove("1".into())]
        );
    }

    #[test]
    fn test_local_only_database_settles_on_local_save() {
        init_logging();
        let store = Store::default();
        let local = MemoryLocal::new();
        let users = store.define(user_options()).local(local.clone()).build().unwrap();

        let (ann, saved) = users.create(record(json!({"id": "1", "name": "Ann"}))).unwrap();

        assert_eq!(block_on(saved), Outcome::Settled(None));
        assert!(ann.is_synced());
        assert!(!ann.is_saved());
        assert_eq!(local.record("1").map(|cached| cached.status), Some(Status::Synced));
    }

    #[test]
    fn test_refresh_reads_cache_then_remote() {
        let fixture = Fixture::new();
        let (ann, saved) = fixture
            .users
            .create(record(json!({"id": "1", "name": "Ann"})))
            .unwrap();
        block_on(saved);

        block_on(ann.refresh_with(Cascade::LOCAL));
        assert_eq!(fixture.user_local.calls().last(), Some(&LocalCall::Get("1".into())));
        assert!(fixture.user_rest.calls().iter().all(|call| !matches!(call, RestCall::Get(_))));

        block_on(ann.refresh());
        assert_eq!(fixture.user_rest.calls().last(), Some(&RestCall::Get("1".into())));
    }
}
