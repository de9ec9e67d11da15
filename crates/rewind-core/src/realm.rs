//! Value-producers whose published values are owned by the observation.
//!
//! A realm publishes values to an observer; the observer returns a
//! [`Resource`] per value. The single rule everything else builds on:
//! releasing an observation releases every resource its observer returned,
//! and the realm publishes nothing after that release resolves.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use indexmap::IndexMap;

use crate::error::Error;
use crate::resource::Resource;

/// Per-value callback of an observation. Returns the resource that owns
/// whatever the observer set up for that value.
pub type Observer<T> = Rc<dyn Fn(T) -> Resource>;

/// A cloneable handle to a value-producer.
pub struct Realm<T: 'static> {
    subscribe: Rc<dyn Fn(Observer<T>) -> Resource>,
}

impl<T: 'static> Clone for Realm<T> {
    fn clone(&self) -> Self {
        Realm {
            subscribe: Rc::clone(&self.subscribe),
        }
    }
}

/// Bookkeeping for one observation of a realm built with [`Realm::new`]:
/// the currently-live per-value resources, and a flag that stops
/// publications once release has begun.
struct ObservationState {
    closed: Cell<bool>,
    next_id: Cell<u64>,
    live: RefCell<IndexMap<u64, Resource>>,
}

impl<T: Clone + 'static> Realm<T> {
    /// A realm from a subscribe function, wrapped with the bookkeeping
    /// that makes the ownership contract hold: released observation ⇒
    /// released children, and no publications after release.
    pub fn new(subscribe: impl Fn(Observer<T>) -> Resource + 'static) -> Realm<T> {
        let subscribe = Rc::new(subscribe);
        Realm::raw(move |observer: Observer<T>| {
            let state = Rc::new(ObservationState {
                closed: Cell::new(false),
                next_id: Cell::new(0),
                live: RefCell::new(IndexMap::new()),
            });
            let wrapped: Observer<T> = Rc::new({
                let state = Rc::clone(&state);
                move |value: T| {
                    if state.closed.get() {
                        return Resource::noop();
                    }
                    let child = observer(value);
                    let id = state.next_id.get();
                    state.next_id.set(id + 1);
                    let entry = Resource::new({
                        let state = Rc::clone(&state);
                        move || async move {
                            state.live.borrow_mut().shift_remove(&id);
                            child.release().await
                        }
                    });
                    state.live.borrow_mut().insert(id, entry.clone());
                    entry
                }
            });
            let subscription = subscribe(wrapped);
            Resource::new(move || async move {
                state.closed.set(true);
                let mut errors = Vec::new();
                // The subscription goes first so nothing new is published
                // while the children drain.
                if let Err(err) = subscription.release().await {
                    errors.push(err);
                }
                let children: Vec<Resource> = state.live.borrow().values().cloned().collect();
                let results =
                    futures::future::join_all(children.iter().map(|c| c.release())).await;
                errors.extend(results.into_iter().filter_map(|r| r.err()));
                match Error::collect(errors) {
                    None => Ok(()),
                    Some(err) => Err(err),
                }
            })
        })
    }

    /// A realm from a subscribe function that maintains its own ownership
    /// protocol (containers, the portal hub).
    pub(crate) fn raw(subscribe: impl Fn(Observer<T>) -> Resource + 'static) -> Realm<T> {
        Realm {
            subscribe: Rc::new(subscribe),
        }
    }

    pub(crate) fn instantiate_observer(&self, observer: Observer<T>) -> Resource {
        (self.subscribe)(observer)
    }

    /// Observes the realm. The returned resource owns the observation and
    /// every value published into it.
    pub fn instantiate(&self, observer: impl Fn(T) -> Resource + 'static) -> Resource {
        self.instantiate_observer(Rc::new(observer))
    }

    /// Publishes `value` once per observation.
    pub fn pure(value: T) -> Realm<T> {
        Realm::new(move |observer| observer(value.clone()))
    }

    /// Never publishes.
    pub fn never() -> Realm<T> {
        Realm::raw(|_observer| Resource::noop())
    }

    /// Defers realm construction to observation time; each observation
    /// evaluates the thunk afresh.
    pub fn lazy(make: impl Fn() -> Realm<T> + 'static) -> Realm<T> {
        Realm::raw(move |observer| make().instantiate_observer(observer))
    }

    pub fn map<U: Clone + 'static>(&self, f: impl Fn(T) -> U + 'static) -> Realm<U> {
        let parent = self.clone();
        let f = Rc::new(f);
        Realm::new(move |observer: Observer<U>| {
            let f = Rc::clone(&f);
            parent.instantiate_observer(Rc::new(move |value| observer(f(value))))
        })
    }

    /// Publishes only values for which `keep` holds; skipped values get a
    /// noop resource.
    pub fn filter(&self, keep: impl Fn(&T) -> bool + 'static) -> Realm<T> {
        let parent = self.clone();
        let keep = Rc::new(keep);
        Realm::new(move |observer: Observer<T>| {
            let keep = Rc::clone(&keep);
            parent.instantiate_observer(Rc::new(move |value: T| {
                if keep(&value) {
                    observer(value)
                } else {
                    Resource::noop()
                }
            }))
        })
    }

    /// Publishes from both sides into one observation.
    pub fn merge(&self, other: &Realm<T>) -> Realm<T> {
        let left = self.clone();
        let right = other.clone();
        Realm::new(move |observer: Observer<T>| {
            let l = left.instantiate_observer(Rc::clone(&observer));
            let r = right.instantiate_observer(observer);
            Resource::parallel([l, r])
        })
    }

    /// For each outer value, observes `f(value)`; the inner observation is
    /// owned by the outer value, so replacing or releasing the outer value
    /// tears down everything the inner realm published.
    pub fn flat_map<U: Clone + 'static>(&self, f: impl Fn(T) -> Realm<U> + 'static) -> Realm<U> {
        let parent = self.clone();
        let f = Rc::new(f);
        Realm::new(move |observer: Observer<U>| {
            let f = Rc::clone(&f);
            parent.instantiate_observer(Rc::new(move |value: T| {
                f(value).instantiate_observer(Rc::clone(&observer))
            }))
        })
    }
}
