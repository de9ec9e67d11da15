//! Single-value mutable realm with structural deduplication.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::error::Error;
use crate::realm::{Observer, Realm};
use crate::resource::{ReleaseFuture, Resource, release_detached};

struct Instance<T> {
    observer: Observer<T>,
    current: Resource,
    retiring: IndexMap<u64, Resource>,
}

struct CellInner<T> {
    value: T,
    instances: IndexMap<u64, Instance<T>>,
    next_instance_id: u64,
    next_retire_id: u64,
    releasing: bool,
}

/// A realm holding one mutable value of a structural (by-value equality)
/// type. Every observer instance sees the current value on observation
/// and every distinct new value afterwards; on replacement the new value
/// is delivered before the old value's release starts.
#[derive(Clone)]
pub struct Cell<T: Clone + PartialEq + 'static> {
    inner: Rc<RefCell<CellInner<T>>>,
    handle: Resource,
}

impl<T: Clone + PartialEq + 'static> Cell<T> {
    pub fn new(initial: T) -> Cell<T> {
        let inner = Rc::new(RefCell::new(CellInner {
            value: initial,
            instances: IndexMap::new(),
            next_instance_id: 0,
            next_retire_id: 0,
            releasing: false,
        }));
        let handle = Resource::new({
            let inner = Rc::clone(&inner);
            move || async move {
                let instances = {
                    let mut st = inner.borrow_mut();
                    st.releasing = true;
                    std::mem::take(&mut st.instances)
                };
                let mut errors = Vec::new();
                for (_, instance) in instances {
                    let results = futures::future::join_all(
                        instance.retiring.values().map(|r| r.release()),
                    )
                    .await;
                    errors.extend(results.into_iter().filter_map(|r| r.err()));
                    if let Err(err) = instance.current.release().await {
                        errors.push(err);
                    }
                }
                match Error::collect(errors) {
                    None => Ok(()),
                    Some(err) => Err(err),
                }
            }
        });
        Cell { inner, handle }
    }

    pub fn peek(&self) -> T {
        self.inner.borrow().value.clone()
    }

    /// Replaces the value. A no-op while the cell is releasing or when the
    /// new value equals the current one. Otherwise every instance's
    /// observer is called with the new value, then the previous
    /// sub-resource's release is started without being awaited.
    pub fn set(&self, value: T) {
        {
            let st = self.inner.borrow();
            if st.releasing || st.value == value {
                return;
            }
        }
        self.inner.borrow_mut().value = value.clone();
        let instances: Vec<(u64, Observer<T>)> = self
            .inner
            .borrow()
            .instances
            .iter()
            .map(|(id, inst)| (*id, Rc::clone(&inst.observer)))
            .collect();
        for (id, observer) in instances {
            let next = observer(value.clone());
            let mut retire = None;
            {
                let mut st = self.inner.borrow_mut();
                let rid = st.next_retire_id;
                st.next_retire_id += 1;
                match st.instances.get_mut(&id) {
                    Some(instance) => {
                        let prev = std::mem::replace(&mut instance.current, next);
                        instance.retiring.insert(rid, prev.clone());
                        retire = Some((rid, prev));
                    }
                    // The instance wound down while the observer ran.
                    None => release_detached(next),
                }
            }
            if let Some((rid, prev)) = retire {
                let inner = Rc::clone(&self.inner);
                tokio::task::spawn_local(async move {
                    if let Err(err) = prev.release().await {
                        log::warn!("cell retire failed: {err}");
                    }
                    if let Some(instance) = inner.borrow_mut().instances.get_mut(&id) {
                        instance.retiring.shift_remove(&rid);
                    }
                });
            }
        }
    }

    pub fn modify(&self, f: impl FnOnce(&T) -> T) {
        let next = f(&self.peek());
        self.set(next);
    }

    pub(crate) fn instantiate_observer(&self, observer: Observer<T>) -> Resource {
        let (id, value) = {
            let mut st = self.inner.borrow_mut();
            if st.releasing {
                return Resource::noop();
            }
            let id = st.next_instance_id;
            st.next_instance_id += 1;
            (id, st.value.clone())
        };
        let current = observer(value);
        {
            let mut st = self.inner.borrow_mut();
            if st.releasing {
                drop(st);
                release_detached(current);
                return Resource::noop();
            }
            st.instances.insert(
                id,
                Instance {
                    observer,
                    current,
                    retiring: IndexMap::new(),
                },
            );
        }
        let inner = Rc::clone(&self.inner);
        Resource::new(move || async move {
            let instance = inner.borrow_mut().instances.shift_remove(&id);
            let Some(instance) = instance else {
                return Ok(());
            };
            // In-flight retires settle before the live sub-resource goes.
            let results =
                futures::future::join_all(instance.retiring.values().map(|r| r.release())).await;
            let mut errors: Vec<Error> = results.into_iter().filter_map(|r| r.err()).collect();
            if let Err(err) = instance.current.release().await {
                errors.push(err);
            }
            match Error::collect(errors) {
                None => Ok(()),
                Some(err) => Err(err),
            }
        })
    }

    pub fn realm(&self) -> Realm<T> {
        let cell = self.clone();
        Realm::raw(move |observer| cell.instantiate_observer(observer))
    }

    pub fn resource(&self) -> Resource {
        self.handle.clone()
    }

    /// Drains every instance: pending retires settle, current
    /// sub-resources release, further `set`s are no-ops. Idempotent.
    pub fn release(&self) -> ReleaseFuture {
        self.handle.release()
    }
}
