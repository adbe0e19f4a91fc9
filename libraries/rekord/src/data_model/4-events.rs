//! # Events
//! Everything that happens to a model is announced as a [`ModelEvent`]. Listeners subscribe to one or more [`EventKind`]s, which are the payload-free names of those events.
//! Relations and deferred results are built on the same events, so a listener sees exactly what the rest of the crate sees.

use std::str::FromStr;

use crate::Record;
use crate::backend::BackendFailure;
use crate::data_model::{Key, Outcome};
use crate::model::Model;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Saved,
    PreSave,
    PostSave,
    PreRemove,
    PostRemove,
    PartialUpdate,
    FullUpdate,
    Updated,
    Detach,
    Change,
    KeyUpdate,
    RelationUpdate,
    Removed,
    RemoteUpdate,
    LocalSave,
    LocalSaveFailure,
    RemoteSave,
    RemoteSaveFailure,
    RemoteSaveOffline,
    LocalRemove,
    LocalRemoveFailure,
    RemoteRemove,
    RemoteRemoveFailure,
    RemoteRemoveOffline,
    LocalGet,
    LocalGetFailure,
    RemoteGet,
    RemoteGetFailure,
    RemoteGetOffline,
    OperationsStarted,
    OperationsFinished,
    KeyChange,
    Valid,
    Invalid,
}

impl EventKind {
    pub const ALL: [EventKind; 35] = [
        EventKind::Created,
        EventKind::Saved,
        EventKind::PreSave,
        EventKind::PostSave,
        EventKind::PreRemove,
        EventKind::PostRemove,
        EventKind::PartialUpdate,
        EventKind::FullUpdate,
        EventKind::Updated,
        EventKind::Detach,
        EventKind::Change,
        EventKind::KeyUpdate,
        EventKind::RelationUpdate,
        EventKind::Removed,
        EventKind::RemoteUpdate,
        EventKind::LocalSave,
        EventKind::LocalSaveFailure,
        EventKind::RemoteSave,
        EventKind::RemoteSaveFailure,
        EventKind::RemoteSaveOffline,
        EventKind::LocalRemove,
        EventKind::LocalRemoveFailure,
        EventKind::RemoteRemove,
        EventKind::RemoteRemoveFailure,
        EventKind::RemoteRemoveOffline,
        EventKind::LocalGet,
        EventKind::LocalGetFailure,
        EventKind::RemoteGet,
        EventKind::RemoteGetFailure,
        EventKind::RemoteGetOffline,
        EventKind::OperationsStarted,
        EventKind::OperationsFinished,
        EventKind::KeyChange,
        EventKind::Valid,
        EventKind::Invalid,
    ];

    pub const CREATE_AND_SAVE: &'static [EventKind] = &[EventKind::Created, EventKind::Saved];
    pub const UPDATE_AND_SAVE: &'static [EventKind] = &[EventKind::Updated, EventKind::Saved];
    pub const LOCAL_SAVES: &'static [EventKind] =
        &[EventKind::LocalSave, EventKind::LocalSaveFailure];
    pub const REMOTE_SAVES: &'static [EventKind] = &[
        EventKind::RemoteSave,
        EventKind::RemoteSaveFailure,
        EventKind::RemoteSaveOffline,
    ];
    pub const LOCAL_REMOVES: &'static [EventKind] =
        &[EventKind::LocalRemove, EventKind::LocalRemoveFailure];
    pub const REMOTE_REMOVES: &'static [EventKind] = &[
        EventKind::RemoteRemove,
        EventKind::RemoteRemoveFailure,
        EventKind::RemoteRemoveOffline,
    ];
    pub const LOCAL_GETS: &'static [EventKind] = &[EventKind::LocalGet, EventKind::LocalGetFailure];
    pub const REMOTE_GETS: &'static [EventKind] = &[
        EventKind::RemoteGet,
        EventKind::RemoteGetFailure,
        EventKind::RemoteGetOffline,
    ];
    pub const REMOTE_AND_REMOVE: &'static [EventKind] =
        &[EventKind::RemoteRemove, EventKind::Removed];
    pub const SAVED_REMOTE_UPDATE: &'static [EventKind] =
        &[EventKind::Saved, EventKind::RemoteUpdate];
    /// Everything that changes what a model looks like.
    pub const CHANGES: &'static [EventKind] = &[
        EventKind::Saved,
        EventKind::RemoteUpdate,
        EventKind::KeyUpdate,
        EventKind::RelationUpdate,
        EventKind::Removed,
        EventKind::KeyChange,
        EventKind::Change,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Saved => "saved",
            EventKind::PreSave => "pre-save",
            EventKind::PostSave => "post-save",
            EventKind::PreRemove => "pre-remove",
            EventKind::PostRemove => "post-remove",
            EventKind::PartialUpdate => "partial-update",
            EventKind::FullUpdate => "full-update",
            EventKind::Updated => "updated",
            EventKind::Detach => "detach",
            EventKind::Change => "change",
            EventKind::KeyUpdate => "key-update",
            EventKind::RelationUpdate => "relation-update",
            EventKind::Removed => "removed",
            EventKind::RemoteUpdate => "remote-update",
            EventKind::LocalSave => "local-save",
            EventKind::LocalSaveFailure => "local-save-failure",
            EventKind::RemoteSave => "remote-save",
            EventKind::RemoteSaveFailure => "remote-save-failure",
            EventKind::RemoteSaveOffline => "remote-save-offline",
            EventKind::LocalRemove => "local-remove",
            EventKind::LocalRemoveFailure => "local-remove-failure",
            EventKind::RemoteRemove => "remote-remove",
            EventKind::RemoteRemoveFailure => "remote-remove-failure",
            EventKind::RemoteRemoveOffline => "remote-remove-offline",
            EventKind::LocalGet => "local-get",
            EventKind::LocalGetFailure => "local-get-failure",
            EventKind::RemoteGet => "remote-get",
            EventKind::RemoteGetFailure => "remote-get-failure",
            EventKind::RemoteGetOffline => "remote-get-offline",
            EventKind::OperationsStarted => "operations-started",
            EventKind::OperationsFinished => "operations-finished",
            EventKind::KeyChange => "key-change",
            EventKind::Valid => "valid",
            EventKind::Invalid => "invalid",
        }
    }

    /// Parses a space separated list of event names, e.g. `"created saved"`.
    pub fn parse_list(names: &str) -> Result<Vec<EventKind>, UnknownEvent> {
        names.split_whitespace().map(EventKind::from_str).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event name {0:?}")]
pub struct UnknownEvent(pub String);

impl FromStr for EventKind {
    type Err = UnknownEvent;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| UnknownEvent(name.to_string()))
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ModelEvent {
    Created,
    Saved,
    PreSave,
    PostSave,
    PreRemove,
    PostRemove,
    /// Remote data arrived but some fields kept their unsaved local values.
    PartialUpdate {
        encoded: Record,
        updated: Record,
        conflicts: Record,
    },
    FullUpdate {
        encoded: Record,
        updated: Record,
    },
    Updated,
    Detach,
    /// `field` is None when several fields were set at once.
    Change {
        field: Option<String>,
    },
    KeyUpdate {
        relation: String,
        fields: Vec<String>,
    },
    RelationUpdate {
        relation: String,
    },
    Removed,
    RemoteUpdate {
        encoded: Record,
    },
    LocalSave,
    LocalSaveFailure {
        failure: BackendFailure,
    },
    RemoteSave {
        data: Option<Record>,
    },
    RemoteSaveFailure {
        failure: BackendFailure,
    },
    RemoteSaveOffline,
    LocalRemove,
    LocalRemoveFailure {
        failure: BackendFailure,
    },
    RemoteRemove,
    RemoteRemoveFailure {
        failure: BackendFailure,
    },
    RemoteRemoveOffline,
    LocalGet,
    LocalGetFailure {
        failure: BackendFailure,
    },
    RemoteGet {
        data: Option<Record>,
    },
    RemoteGetFailure {
        failure: BackendFailure,
    },
    RemoteGetOffline,
    OperationsStarted,
    OperationsFinished,
    KeyChange {
        old: Option<Key>,
        new: Key,
    },
    Valid,
    Invalid,
}

impl ModelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ModelEvent::Created => EventKind::Created,
            ModelEvent::Saved => EventKind::Saved,
            ModelEvent::PreSave => EventKind::PreSave,
            ModelEvent::PostSave => EventKind::PostSave,
            ModelEvent::PreRemove => EventKind::PreRemove,
            ModelEvent::PostRemove => EventKind::PostRemove,
            ModelEvent::PartialUpdate { .. } => EventKind::PartialUpdate,
            ModelEvent::FullUpdate { .. } => EventKind::FullUpdate,
            ModelEvent::Updated => EventKind::Updated,
            ModelEvent::Detach => EventKind::Detach,
            ModelEvent::Change { .. } => EventKind::Change,
            ModelEvent::KeyUpdate { .. } => EventKind::KeyUpdate,
            ModelEvent::RelationUpdate { .. } => EventKind::RelationUpdate,
            ModelEvent::Removed => EventKind::Removed,
            ModelEvent::RemoteUpdate { .. } => EventKind::RemoteUpdate,
            ModelEvent::LocalSave => EventKind::LocalSave,
            ModelEvent::LocalSaveFailure { .. } => EventKind::LocalSaveFailure,
            ModelEvent::RemoteSave { .. } => EventKind::RemoteSave,
            ModelEvent::RemoteSaveFailure { .. } => EventKind::RemoteSaveFailure,
            ModelEvent::RemoteSaveOffline => EventKind::RemoteSaveOffline,
            ModelEvent::LocalRemove => EventKind::LocalRemove,
            ModelEvent::LocalRemoveFailure { .. } => EventKind::LocalRemoveFailure,
            ModelEvent::RemoteRemove => EventKind::RemoteRemove,
            ModelEvent::RemoteRemoveFailure { .. } => EventKind::RemoteRemoveFailure,
            ModelEvent::RemoteRemoveOffline => EventKind::RemoteRemoveOffline,
            ModelEvent::LocalGet => EventKind::LocalGet,
            ModelEvent::LocalGetFailure { .. } => EventKind::LocalGetFailure,
            ModelEvent::RemoteGet { .. } => EventKind::RemoteGet,
            ModelEvent::RemoteGetFailure { .. } => EventKind::RemoteGetFailure,
            ModelEvent::RemoteGetOffline => EventKind::RemoteGetOffline,
            ModelEvent::OperationsStarted => EventKind::OperationsStarted,
            ModelEvent::OperationsFinished => EventKind::OperationsFinished,
            ModelEvent::KeyChange { .. } => EventKind::KeyChange,
            ModelEvent::Valid => EventKind::Valid,
            ModelEvent::Invalid => EventKind::Invalid,
        }
    }

    /// How this event settles a deferred result waiting on it.
    pub(crate) fn outcome(&self) -> Outcome {
        match self {
            ModelEvent::RemoteSave { data } | ModelEvent::RemoteGet { data } => {
                Outcome::Settled(data.clone())
            }
            ModelEvent::LocalSaveFailure { failure }
            | ModelEvent::RemoteSaveFailure { failure }
            | ModelEvent::LocalRemoveFailure { failure }
            | ModelEvent::RemoteRemoveFailure { failure }
            | ModelEvent::LocalGetFailure { failure }
            | ModelEvent::RemoteGetFailure { failure } => Outcome::Rejected(failure.clone()),
            ModelEvent::RemoteSaveOffline
            | ModelEvent::RemoteRemoveOffline
            | ModelEvent::RemoteGetOffline => Outcome::Offline,
            _ => Outcome::Settled(None),
        }
    }
}

pub type ModelCallback = dyn Fn(&Model, &ModelEvent);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DatabaseEventKind {
    ModelAdded,
    ModelRemoved,
    ModelUpdated,
    LocalLoad,
    RemoteLoad,
}

#[derive(Clone)]
pub enum DatabaseEvent {
    ModelAdded(Model),
    ModelRemoved(Model),
    ModelUpdated(Model),
    LocalLoad,
    RemoteLoad,
}

impl DatabaseEvent {
    pub fn kind(&self) -> DatabaseEventKind {
        match self {
            DatabaseEvent::ModelAdded(_) => DatabaseEventKind::ModelAdded,
            DatabaseEvent::ModelRemoved(_) => DatabaseEventKind::ModelRemoved,
            DatabaseEvent::ModelUpdated(_) => DatabaseEventKind::ModelUpdated,
            DatabaseEvent::LocalLoad => DatabaseEventKind::LocalLoad,
            DatabaseEvent::RemoteLoad => DatabaseEventKind::RemoteLoad,
        }
    }
}

pub type DatabaseCallback = dyn Fn(&DatabaseEvent);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreEventKind {
    Online,
    Offline,
    Defined,
    Loaded,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StoreEvent {
    Online,
    Offline,
    Defined { name: String },
    Loaded,
}

impl StoreEvent {
    pub fn kind(&self) -> StoreEventKind {
        match self {
            StoreEvent::Online => StoreEventKind::Online,
            StoreEvent::Offline => StoreEventKind::Offline,
            StoreEvent::Defined { .. } => StoreEventKind::Defined,
            StoreEvent::Loaded => StoreEventKind::Loaded,
        }
    }
}

pub type StoreCallback = dyn Fn(&StoreEvent);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>(), Ok(kind));
        }
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(
            EventKind::parse_list("created saved"),
            Ok(EventKind::CREATE_AND_SAVE.to_vec())
        );
        assert!(EventKind::parse_list("saved exploded").is_err());
    }
}
