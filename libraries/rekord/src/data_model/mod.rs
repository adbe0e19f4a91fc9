#[path = "1-key.rs"]
mod key;

#[path = "2-cascade.rs"]
mod cascade;

#[path = "3-listeners.rs"]
mod listeners;

#[path = "4-events.rs"]
mod events;

#[path = "5-deferred.rs"]
mod deferred;

pub use cascade::*;
pub use deferred::*;
pub use events::*;
pub use key::*;
pub(crate) use listeners::*;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ListenerKey(pub(crate) slotmap::DefaultKey);
