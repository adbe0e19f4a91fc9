//! In-memory backends.
//!
//! By default they answer every call immediately. A `manual` backend holds each completion until [`MemoryRest::release_next`] (or the local equivalent) is called, which is how an in-flight request is observed.
//! Failures queued with `fail_next` are handed to the next call, in order, instead of touching the stored records.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::Record;
use crate::backend::{
    BackendFailure, LocalAllCompletion, LocalCompletion, LocalGetCompletion, LocalRecord,
    LocalStore, Rest, RestAllCompletion, RestCompletion,
};
use crate::data_model::Key;

type Job = Box<dyn FnOnce()>;

struct Backend<Records, Call> {
    records: Records,
    manual: bool,
    held: VecDeque<Job>,
    failures: VecDeque<BackendFailure>,
    calls: Vec<Call>,
}

impl<Records: Default, Call> Backend<Records, Call> {
    fn new(manual: bool) -> Self {
        Self {
            records: Records::default(),
            manual,
            held: VecDeque::new(),
            failures: VecDeque::new(),
            calls: Vec::new(),
        }
    }
}

fn dispatch<Records: 'static, Call: 'static, T: 'static>(
    backend: &Rc<RefCell<Backend<Records, Call>>>,
    call: Call,
    respond: impl FnOnce(&mut Records) -> Result<T, BackendFailure> + 'static,
    done: Box<dyn FnOnce(Result<T, BackendFailure>)>,
) {
    let (failure, manual) = {
        let mut backend = backend.borrow_mut();
        backend.calls.push(call);
        (backend.failures.pop_front(), backend.manual)
    };

    let weak = Rc::downgrade(backend);
    let job: Job = Box::new(move || {
        let result = match (failure, weak.upgrade()) {
            (Some(failure), _) => Err(failure),
            (None, Some(backend)) => respond(&mut backend.borrow_mut().records),
            (None, None) => Err(BackendFailure::offline()),
        };
        done(result);
    });

    if manual {
        backend.borrow_mut().held.push_back(job);
    } else {
        job();
    }
}

fn release_next<Records, Call>(backend: &Rc<RefCell<Backend<Records, Call>>>) -> bool {
    let job = backend.borrow_mut().held.pop_front();
    match job {
        Some(job) => {
            job();
            true
        }
        None => false,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RestCall {
    All,
    Get(Key),
    Create(Key),
    Update(Key),
    Remove(Key),
}

#[derive(Clone)]
pub struct MemoryRest {
    backend: Rc<RefCell<Backend<IndexMap<Key, Record>, RestCall>>>,
}

impl Default for MemoryRest {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRest {
    pub fn new() -> Self {
        Self {
            backend: Rc::new(RefCell::new(Backend::new(false))),
        }
    }

    pub fn manual() -> Self {
        Self {
            backend: Rc::new(RefCell::new(Backend::new(true))),
        }
    }

    pub fn seed(&self, key: impl Into<Key>, record: Record) {
        self.backend
            .borrow_mut()
            .records
            .insert(key.into(), record);
    }

    pub fn record(&self, key: impl Into<Key>) -> Option<Record> {
        self.backend.borrow().records.get(&key.into()).cloned()
    }

    pub fn len(&self) -> usize {
        self.backend.borrow().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fail_next(&self, failure: BackendFailure) {
        self.backend.borrow_mut().failures.push_back(failure);
    }

    pub fn calls(&self) -> Vec<RestCall> {
        self.backend.borrow().calls.clone()
    }

    /// Number of completions waiting in a manual backend.
    pub fn held(&self) -> usize {
        self.backend.borrow().held.len()
    }

    pub fn release_next(&self) -> bool {
        release_next(&self.backend)
    }

    /// Releases completions until none are held, including ones queued by the released completions themselves.
    pub fn release_all(&self) {
        while self.release_next() {}
    }
}

impl Rest for MemoryRest {
    fn all(&self, done: RestAllCompletion) {
        dispatch(
            &self.backend,
            RestCall::All,
            |records| Ok(records.values().cloned().collect()),
            done,
        );
    }

    fn get(&self, key: &Key, done: RestCompletion) {
        let lookup = key.clone();
        dispatch(
            &self.backend,
            RestCall::Get(key.clone()),
            move |records| {
                records
                    .get(&lookup)
                    .cloned()
                    .map(Some)
                    .ok_or_else(BackendFailure::not_found)
            },
            done,
        );
    }

    fn create(&self, key: &Key, encoded: &Record, done: RestCompletion) {
        let (key, encoded) = (key.clone(), encoded.clone());
        dispatch(
            &self.backend,
            RestCall::Create(key.clone()),
            move |records| {
                records.insert(key, encoded.clone());
                Ok(Some(encoded))
            },
            done,
        );
    }

    fn update(&self, key: &Key, changes: &Record, done: RestCompletion) {
        let (key, changes) = (key.clone(), changes.clone());
        dispatch(
            &self.backend,
            RestCall::Update(key.clone()),
            move |records| {
                let record = records
                    .get_mut(&key)
                    .ok_or_else(BackendFailure::not_found)?;
                record.extend(changes);
                Ok(Some(record.clone()))
            },
            done,
        );
    }

    fn remove(&self, key: &Key, done: RestCompletion) {
        let lookup = key.clone();
        dispatch(
            &self.backend,
            RestCall::Remove(key.clone()),
            move |records| match records.shift_remove(&lookup) {
                Some(_) => Ok(None),
                None => Err(BackendFailure::not_found()),
            },
            done,
        );
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocalCall {
    All,
    Get(Key),
    Put(Key),
    Remove(Key),
}

#[derive(Clone)]
pub struct MemoryLocal {
    backend: Rc<RefCell<Backend<IndexMap<Key, LocalRecord>, LocalCall>>>,
}

impl Default for MemoryLocal {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLocal {
    pub fn new() -> Self {
        Self {
            backend: Rc::new(RefCell::new(Backend::new(false))),
        }
    }

    pub fn manual() -> Self {
        Self {
            backend: Rc::new(RefCell::new(Backend::new(true))),
        }
    }

    pub fn seed(&self, record: LocalRecord) {
        self.backend
            .borrow_mut()
            .records
            .insert(record.key.clone(), record);
    }

    pub fn record(&self, key: impl Into<Key>) -> Option<LocalRecord> {
        self.backend.borrow().records.get(&key.into()).cloned()
    }

    pub fn len(&self) -> usize {
        self.backend.borrow().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fail_next(&self, failure: BackendFailure) {
        self.backend.borrow_mut().failures.push_back(failure);
    }

    pub fn calls(&self) -> Vec<LocalCall> {
        self.backend.borrow().calls.clone()
    }

    pub fn held(&self) -> usize {
        self.backend.borrow().held.len()
    }

    pub fn release_next(&self) -> bool {
        release_next(&self.backend)
    }

    pub fn release_all(&self) {
        while self.release_next() {}
    }
}

impl LocalStore for MemoryLocal {
    fn all(&self, done: LocalAllCompletion) {
        dispatch(
            &self.backend,
            LocalCall::All,
            |records| Ok(records.values().cloned().collect()),
            done,
        );
    }

    fn get(&self, key: &Key, done: LocalGetCompletion) {
        let lookup = key.clone();
        dispatch(
            &self.backend,
            LocalCall::Get(key.clone()),
            move |records| Ok(records.get(&lookup).cloned()),
            done,
        );
    }

    fn put(&self, record: &LocalRecord, done: LocalCompletion) {
        let record = record.clone();
        dispatch(
            &self.backend,
            LocalCall::Put(record.key.clone()),
            move |records| {
                records.insert(record.key.clone(), record);
                Ok(())
            },
            done,
        );
    }

    fn remove(&self, key: &Key, done: LocalCompletion) {
        let lookup = key.clone();
        dispatch(
            &self.backend,
            LocalCall::Remove(key.clone()),
            move |records| {
                records.shift_remove(&lookup);
                Ok(())
            },
            done,
        );
    }
}
