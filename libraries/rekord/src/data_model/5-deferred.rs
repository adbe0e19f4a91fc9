//! # Deferred
//! Saves, removes and refreshes complete whenever their backends call back, which may be right away or much later.
//! A [`Deferred`] is the handle to that result. It settles exactly once; later attempts to settle it are ignored.
//! It can be polled with [`Deferred::outcome`], observed with [`Deferred::then`], or awaited, since it implements [`Future`].

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::Record;
use crate::backend::BackendFailure;

#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// The participating backend accepted the operation, possibly answering with data.
    Settled(Option<Record>),
    /// The participating backend refused the operation.
    Rejected(BackendFailure),
    /// The remote could not be reached. The operation resumes once the store is online again.
    Offline,
}

impl Outcome {
    pub fn is_settled(&self) -> bool {
        matches!(self, Outcome::Settled(_))
    }
}

#[derive(Default)]
struct DeferredInner {
    outcome: Option<Outcome>,
    wakers: Vec<Waker>,
    callbacks: Vec<Box<dyn FnOnce(&Outcome)>>,
}

#[derive(Clone, Default)]
pub struct Deferred {
    inner: Rc<RefCell<DeferredInner>>,
}

impl std::fmt::Debug for Deferred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("outcome", &self.inner.borrow().outcome)
            .finish()
    }
}

impl Deferred {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settled(data: Option<Record>) -> Self {
        let deferred = Self::new();
        deferred.complete(Outcome::Settled(data));
        deferred
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.borrow().outcome.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.inner.borrow().outcome.is_some()
    }

    /// Runs `callback` once the outcome is known, immediately if it already is.
    pub fn then(&self, callback: impl FnOnce(&Outcome) + 'static) {
        let outcome = self.outcome();
        match outcome {
            Some(outcome) => callback(&outcome),
            None => self.inner.borrow_mut().callbacks.push(Box::new(callback)),
        }
    }

    /// Returns false if the deferred had already settled.
    pub(crate) fn complete(&self, outcome: Outcome) -> bool {
        let (callbacks, wakers) = {
            let mut inner = self.inner.borrow_mut();
            if inner.outcome.is_some() {
                return false;
            }
            inner.outcome = Some(outcome.clone());
            (
                std::mem::take(&mut inner.callbacks),
                std::mem::take(&mut inner.wakers),
            )
        };

        for callback in callbacks {
            callback(&outcome);
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }
}

impl Future for Deferred {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.inner.borrow_mut();
        match &inner.outcome {
            Some(outcome) => Poll::Ready(outcome.clone()),
            None => {
                inner.wakers.push(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn test_first_outcome_wins() {
        let deferred = Deferred::new();
        assert!(!deferred.is_complete());

        assert!(deferred.complete(Outcome::Offline));
        assert!(!deferred.complete(Outcome::Settled(None)));
        assert_eq!(deferred.outcome(), Some(Outcome::Offline));
    }

    #[test]
    fn test_then_runs_before_and_after_completion() {
        let deferred = Deferred::new();
        let calls = Rc::new(Cell::new(0));

        let early = calls.clone();
        deferred.then(move |outcome| {
            assert!(outcome.is_settled());
            early.set(early.get() + 1);
        });
        assert_eq!(calls.get(), 0);

        deferred.complete(Outcome::Settled(None));
        assert_eq!(calls.get(), 1);

        let late = calls.clone();
        deferred.then(move |_| late.set(late.get() + 1));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_await_completed_deferred() {
        let deferred = Deferred::settled(None);
        let outcome = futures::executor::block_on(deferred);
        assert_eq!(outcome, Outcome::Settled(None));
    }
}
