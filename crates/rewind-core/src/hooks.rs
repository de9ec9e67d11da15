//! Thin realm constructors and their blueprint-side `use_*` wrappers.

use std::future::Future;
use std::pin::pin;
use std::rc::Rc;
use std::time::Duration;

use futures::future::{self, Either};

use crate::blueprint::use_realm;
use crate::cell::Cell;
use crate::effect::{EffectScope, effect};
use crate::error::{Error, Result};
use crate::portal::{PortalSetter, portal};
use crate::realm::Realm;
use crate::resource::Resource;
use crate::store::Store;

/// Publishes `()` once `ms` milliseconds elapsed; releasing the
/// observation cancels the timer.
pub fn timeout(ms: u64) -> Realm<()> {
    effect(move |scope: EffectScope| async move {
        let abort = scope.abort_signal();
        let sleep = pin!(tokio::time::sleep(Duration::from_millis(ms)));
        let aborted = pin!(abort.aborted());
        match future::select(sleep, aborted).await {
            Either::Left(_) => Ok(()),
            Either::Right(_) => Err(Error::Aborted),
        }
    })
}

/// Publishes `()` exactly when `pred` holds at observation time.
pub fn guard(pred: impl Fn() -> bool + 'static) -> Realm<()> {
    Realm::new(move |observer| {
        if pred() {
            observer(())
        } else {
            Resource::noop()
        }
    })
}

/// Publishes the items in order; the observation releases them in reverse
/// insertion order.
pub fn iterable<T: Clone + 'static>(items: impl IntoIterator<Item = T>) -> Realm<T> {
    let items: Rc<Vec<T>> = Rc::new(items.into_iter().collect());
    Realm::new(move |observer| {
        let placed: Vec<Resource> = items.iter().map(|v| observer(v.clone())).collect();
        Resource::sequential(placed.into_iter().rev())
    })
}

/// Wraps a realm so each observation owns a private memoizing store of it,
/// published once and released with the observation.
pub fn to_store<T: Clone + 'static>(realm: &Realm<T>) -> Realm<Store<T>> {
    let realm = realm.clone();
    effect(move |scope: EffectScope| {
        let store = Store::new(&realm);
        scope.add_resource(store.resource());
        future::ready(Ok(store))
    })
}

/// Suspends on a one-shot effect; see [`effect`].
pub fn use_effect<T, F, Fut>(maker: F) -> T
where
    T: Clone + 'static,
    F: Fn(EffectScope) -> Fut + 'static,
    Fut: Future<Output = Result<T>> + 'static,
{
    use_realm(&effect(maker))
}

/// Suspends the body for `ms` milliseconds of wall time.
pub fn use_timeout(ms: u64) {
    use_realm(&timeout(ms));
}

/// Continues only when `pred` held at this resumption; otherwise the body
/// stays suspended here.
pub fn use_guard(pred: impl Fn() -> bool + 'static) {
    use_realm(&guard(pred));
}

/// Forks the rest of the body over each item.
pub fn use_iterable<T: Clone + 'static>(items: impl IntoIterator<Item = T>) -> T {
    use_realm(&iterable(items))
}

/// Suspends forever.
pub fn use_never<T: Clone + 'static>() -> T {
    use_realm(&Realm::<T>::never())
}

/// A cell created once for this body, released with its use-point.
pub fn use_cell<T: Clone + PartialEq + 'static>(initial: T) -> Cell<T> {
    use_realm(&effect(move |scope: EffectScope| {
        let cell = Cell::new(initial.clone());
        scope.add_resource(cell.resource());
        future::ready(Ok(cell))
    }))
}

/// A memoizing store of `realm`, created once for this body.
pub fn use_store<T: Clone + 'static>(realm: &Realm<T>) -> Store<T> {
    use_realm(&to_store(realm))
}

/// A portal created once for this body; the store is released with its
/// use-point.
pub fn use_portal<T: Clone + 'static>() -> (Store<T>, PortalSetter<T>) {
    use_realm(&effect(move |scope: EffectScope| {
        let (store, setter) = portal();
        scope.add_resource(store.resource());
        future::ready(Ok((store, setter)))
    }))
}
