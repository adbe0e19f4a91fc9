//! # Listeners
//! Models, databases and the store each keep a registry of callbacks keyed by [`ListenerKey`].
//! Callbacks are never invoked while the registry is borrowed: [`Listeners::collect`] hands back the due callbacks and the caller invokes them once the store borrow has been released. Callbacks routinely call back into the store, so this is what keeps re-entrant borrows from panicking.

use std::rc::Rc;

use crate::data_model::ListenerKey;

pub(crate) struct Listener<Kind, Callback: ?Sized> {
    kinds: Vec<Kind>,
    once: bool,
    callback: Rc<Callback>,
}

pub(crate) struct Listeners<Kind, Callback: ?Sized> {
    entries: slotmap::SlotMap<slotmap::DefaultKey, Listener<Kind, Callback>>,
}

impl<Kind, Callback: ?Sized> Default for Listeners<Kind, Callback> {
    fn default() -> Self {
        Self {
            entries: Default::default(),
        }
    }
}

impl<Kind: Copy + PartialEq, Callback: ?Sized> Listeners<Kind, Callback> {
    /// A `once` listener is dropped the first time any of its kinds fires.
    pub fn insert(&mut self, kinds: &[Kind], once: bool, callback: Rc<Callback>) -> ListenerKey {
        let key = self.entries.insert(Listener {
            kinds: kinds.to_vec(),
            once,
            callback,
        });
        ListenerKey(key)
    }

    pub fn remove(&mut self, key: ListenerKey) -> bool {
        self.entries.remove(key.0).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns the callbacks listening for `kind` and drops the one-shot ones.
    pub fn collect(&mut self, kind: Kind) -> Vec<Rc<Callback>> {
        let mut due = Vec::new();
        let mut spent = Vec::new();

        for (key, listener) in self.entries.iter() {
            if listener.kinds.contains(&kind) {
                due.push(listener.callback.clone());
                if listener.once {
                    spent.push(key);
                }
            }
        }

        for key in spent {
            self.entries.remove(key);
        }

        due
    }
}
