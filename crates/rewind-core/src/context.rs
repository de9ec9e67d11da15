//! Dynamic-scoped key/value bindings threaded through blueprint bodies.

use std::any::{Any, type_name};
use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::blueprint::{current_ctx, use_realm};
use crate::realm::Realm;
use crate::resource::Resource;

/// The bindings visible to one blueprint observation. Forked snapshots are
/// independent maps over shared values.
#[derive(Clone)]
pub struct UserContext {
    map: Rc<RefCell<HashMap<u64, Rc<dyn Any>>>>,
}

impl UserContext {
    pub fn new() -> UserContext {
        UserContext {
            map: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    pub(crate) fn fork(&self) -> UserContext {
        UserContext {
            map: Rc::new(RefCell::new(self.map.borrow().clone())),
        }
    }

    fn insert(&self, key: u64, value: Rc<dyn Any>) -> Option<Rc<dyn Any>> {
        self.map.borrow_mut().insert(key, value)
    }

    fn restore(&self, key: u64, previous: Option<Rc<dyn Any>>) {
        match previous {
            Some(value) => {
                self.map.borrow_mut().insert(key, value);
            }
            None => {
                self.map.borrow_mut().remove(&key);
            }
        }
    }

    fn get(&self, key: u64) -> Option<Rc<dyn Any>> {
        self.map.borrow().get(&key).cloned()
    }
}

impl Default for UserContext {
    fn default() -> Self {
        UserContext::new()
    }
}

/// Snapshot of the running body's bindings, for forking a child blueprint
/// with [`crate::blueprint::to_realm_with`]. Panics outside a body.
pub fn user_context() -> UserContext {
    current_ctx().fork()
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Typed handle to one context binding. Two keys of the same value type
/// are distinct bindings.
pub struct ContextKey<T> {
    id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ContextKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ContextKey<T> {}

pub fn create_context<T: Clone + 'static>() -> ContextKey<T> {
    ContextKey {
        id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
        _marker: PhantomData,
    }
}

impl<T: Clone + 'static> ContextKey<T> {
    /// Binds `value` for the rest of the body. A blueprint-scope
    /// operation: the binding is installed through a suspension point so
    /// releasing its downstream restores the previous binding.
    pub fn provide(&self, value: T) {
        let id = self.id;
        let realm: Realm<()> = Realm::new(move |observer| {
            let ctx = current_ctx();
            let previous = ctx.insert(id, Rc::new(value.clone()) as Rc<dyn Any>);
            let seen = observer(());
            let restore = Resource::from_fn(move || ctx.restore(id, previous));
            Resource::sequential([seen, restore])
        });
        use_realm(&realm);
    }

    /// Reads the current binding without suspending. Panics when no
    /// enclosing scope provided one.
    pub fn consume(&self) -> T {
        match current_ctx().get(self.id) {
            Some(value) => value
                .downcast_ref::<T>()
                .expect("context value type mismatch")
                .clone(),
            None => panic!(
                "context value of type {} consumed but never provided",
                type_name::<T>()
            ),
        }
    }
}
