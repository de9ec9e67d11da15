//! A store whose values are placed and withdrawn through a setter.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::realm::{Observer, Realm};
use crate::resource::Resource;
use crate::store::Store;

struct Hub<T> {
    observers: IndexMap<u64, Observer<T>>,
    next_id: u64,
}

/// The value-placing half of a portal. `set(v)` is inert until observed:
/// the observation places `v` in the store, releasing it withdraws `v`.
#[derive(Clone)]
pub struct PortalSetter<T: Clone + 'static> {
    hub: Rc<RefCell<Hub<T>>>,
}

impl<T: Clone + 'static> PortalSetter<T> {
    pub fn set(&self, value: T) -> Realm<()> {
        let hub = Rc::clone(&self.hub);
        Realm::new(move |observer| {
            let observers: Vec<Observer<T>> =
                hub.borrow().observers.values().cloned().collect();
            let placed: Vec<Resource> = observers.iter().map(|o| o(value.clone())).collect();
            let seen = observer(());
            // Unit downstream first, then the value is withdrawn.
            let mut chain = vec![seen];
            chain.extend(placed);
            Resource::sequential(chain)
        })
    }
}

/// A store fed by an externally-callable setter. Values coexist; each
/// lives exactly as long as the observation of the realm its `set` call
/// returned.
pub fn portal<T: Clone + 'static>() -> (Store<T>, PortalSetter<T>) {
    let hub = Rc::new(RefCell::new(Hub {
        observers: IndexMap::new(),
        next_id: 0,
    }));
    let hub_realm = Realm::raw({
        let hub = Rc::clone(&hub);
        move |observer| {
            let mut h = hub.borrow_mut();
            let id = h.next_id;
            h.next_id += 1;
            h.observers.insert(id, observer);
            let hub = Rc::clone(&hub);
            Resource::from_fn(move || {
                hub.borrow_mut().observers.shift_remove(&id);
            })
        }
    });
    let store = Store::new(&hub_realm);
    (store, PortalSetter { hub })
}
