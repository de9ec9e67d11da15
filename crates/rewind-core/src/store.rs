//! Memoizing fan-out over one observation of a source realm.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::links::LinkMap;
use crate::realm::{Observer, Realm};
use crate::resource::{ReleaseFuture, Resource, release_all, release_detached};

struct StoreInner<T> {
    values: IndexMap<u64, T>,
    observers: IndexMap<u64, Observer<T>>,
    links: LinkMap,
    next_value_id: u64,
    next_observer_id: u64,
    source: Option<Resource>,
    released: bool,
}

/// A realm that observes its source exactly once and fans every live and
/// future value out to any number of observers. Each (value, observer)
/// pair owns one link resource; a value's withdrawal releases its links,
/// an observer's departure releases its links, and releasing the store
/// releases the source observation and every link.
#[derive(Clone)]
pub struct Store<T: Clone + 'static> {
    inner: Rc<RefCell<StoreInner<T>>>,
    handle: Resource,
}

impl<T: Clone + 'static> Store<T> {
    /// Builds the store, observing `source` immediately.
    pub fn new(source: &Realm<T>) -> Store<T> {
        let inner = Rc::new(RefCell::new(StoreInner {
            values: IndexMap::new(),
            observers: IndexMap::new(),
            links: LinkMap::new(),
            next_value_id: 0,
            next_observer_id: 0,
            source: None,
            released: false,
        }));

        let create: Observer<T> = Rc::new({
            let inner = Rc::clone(&inner);
            move |value: T| {
                let (id, observers) = {
                    let mut st = inner.borrow_mut();
                    if st.released {
                        return Resource::noop();
                    }
                    let id = st.next_value_id;
                    st.next_value_id += 1;
                    st.values.insert(id, value.clone());
                    let observers: Vec<(u64, Observer<T>)> = st
                        .observers
                        .iter()
                        .map(|(oid, obs)| (*oid, Rc::clone(obs)))
                        .collect();
                    (id, observers)
                };
                // Fan out on a snapshot: an observer may touch the store.
                let children: Vec<(u64, Resource)> = observers
                    .into_iter()
                    .map(|(oid, obs)| (oid, obs(value.clone())))
                    .collect();
                {
                    let mut st = inner.borrow_mut();
                    for (oid, child) in children {
                        if let Some(old) = st.links.link(id, oid, child) {
                            log::warn!("store link replaced; releasing the old one");
                            release_detached(old);
                        }
                    }
                }
                let inner = Rc::clone(&inner);
                Resource::new(move || async move {
                    let removed = {
                        let mut st = inner.borrow_mut();
                        st.values.shift_remove(&id);
                        st.links.unlink_value(id)
                    };
                    release_all(removed).await
                })
            }
        });

        let source_res = source.instantiate_observer(create);
        inner.borrow_mut().source = Some(source_res);

        let handle = Resource::new({
            let inner = Rc::clone(&inner);
            move || async move {
                let mut all = {
                    let mut st = inner.borrow_mut();
                    st.released = true;
                    st.values.clear();
                    st.observers.clear();
                    st.links.unlink_all()
                };
                let source = inner.borrow_mut().source.take();
                if let Some(source) = source {
                    all.push(source);
                }
                release_all(all).await
            }
        });

        Store { inner, handle }
    }

    pub(crate) fn instantiate_observer(&self, observer: Observer<T>) -> Resource {
        let inner = Rc::clone(&self.inner);
        let (oid, values) = {
            let mut st = inner.borrow_mut();
            if st.released {
                return Resource::noop();
            }
            let oid = st.next_observer_id;
            st.next_observer_id += 1;
            st.observers.insert(oid, Rc::clone(&observer));
            let values: Vec<(u64, T)> = st.values.iter().map(|(vid, v)| (*vid, v.clone())).collect();
            (oid, values)
        };
        let children: Vec<(u64, Resource)> = values
            .into_iter()
            .map(|(vid, v)| (vid, observer(v)))
            .collect();
        {
            let mut st = inner.borrow_mut();
            for (vid, child) in children {
                if let Some(old) = st.links.link(vid, oid, child) {
                    log::warn!("store link replaced; releasing the old one");
                    release_detached(old);
                }
            }
        }
        Resource::new(move || async move {
            let removed = {
                let mut st = inner.borrow_mut();
                st.observers.shift_remove(&oid);
                st.links.unlink_observer(oid)
            };
            release_all(removed).await
        })
    }

    /// The store seen as a realm: observing it replays the live set and
    /// then follows the source.
    pub fn realm(&self) -> Realm<T> {
        let store = self.clone();
        Realm::raw(move |observer| store.instantiate_observer(observer))
    }

    /// Observes the store directly.
    pub fn instantiate(&self, observer: impl Fn(T) -> Resource + 'static) -> Resource {
        self.instantiate_observer(Rc::new(observer))
    }

    /// Snapshot of the live values, in arrival order.
    pub fn peek(&self) -> Vec<T> {
        self.inner.borrow().values.values().cloned().collect()
    }

    /// The store's own lifetime handle (the store-as-resource face).
    pub fn resource(&self) -> Resource {
        self.handle.clone()
    }

    /// Releases the source observation and every link. Idempotent.
    pub fn release(&self) -> ReleaseFuture {
        self.handle.release()
    }
}
