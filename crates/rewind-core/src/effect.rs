//! One-shot effect realms.
//!
//! An effect realm runs its maker immediately on observation and publishes
//! at most one value. A maker whose future is immediately ready publishes
//! in the same synchronous pass; a pending maker is spawned and its value
//! published on arrival. Releasing the observation sends the abort signal
//! and waits for the maker to wind down; there is no hard timeout, so
//! long-running makers must select against [`AbortSignal::aborted`].

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

use futures::FutureExt;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::realm::{Observer, Realm};
use crate::resource::{Collector, Resource};

thread_local! {
    static ERROR_HOOK: RefCell<Option<Rc<dyn Fn(&Error)>>> = const { RefCell::new(None) };
}

/// Replaces the policy for maker failures. The default logs and swallows
/// the error so an in-flight failure cannot poison the realm graph.
/// [`Error::Aborted`] never reaches the hook.
pub fn set_effect_error_hook(hook: impl Fn(&Error) + 'static) {
    ERROR_HOOK.with(|h| *h.borrow_mut() = Some(Rc::new(hook)));
}

fn report_effect_error(err: &Error) {
    if matches!(err, Error::Aborted) {
        return;
    }
    let hook = ERROR_HOOK.with(|h| h.borrow().clone());
    match hook {
        Some(hook) => hook(err),
        None => log::error!("effect maker failed: {err}"),
    }
}

/// Cooperative cancellation handle passed to effect makers.
#[derive(Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the owning observation starts releasing.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        // A closed channel means the observation is gone; treat as aborted.
        let _ = rx.wait_for(|aborted| *aborted).await;
    }
}

/// Handed to the maker: resources it acquires and the abort signal.
#[derive(Clone)]
pub struct EffectScope {
    bag: Collector,
    abort: AbortSignal,
}

impl EffectScope {
    /// Registers a resource owned by the computation; released after the
    /// published value's observation.
    pub fn add_resource(&self, r: Resource) {
        self.bag.add(r);
    }

    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }
}

/// A realm that runs `maker` once per observation and publishes its value.
pub fn effect<T, F, Fut>(maker: F) -> Realm<T>
where
    T: Clone + 'static,
    F: Fn(EffectScope) -> Fut + 'static,
    Fut: Future<Output = Result<T>> + 'static,
{
    let maker = Rc::new(maker);
    Realm::new(move |observer: Observer<T>| {
        let maker = Rc::clone(&maker);
        let (abort_tx, abort_rx) = watch::channel(false);
        let bag = Collector::new();
        let scope = EffectScope {
            bag: bag.clone(),
            abort: AbortSignal { rx: abort_rx },
        };

        let mut fut = Box::pin(maker(scope));
        // Polling the reborrow keeps the future for the pending branch.
        match fut.as_mut().now_or_never() {
            Some(Ok(value)) => {
                let seen = observer(value);
                Resource::sequential([seen, bag.resource()])
            }
            Some(Err(err)) => {
                report_effect_error(&err);
                bag.resource()
            }
            None => {
                let slot: Rc<RefCell<Option<Resource>>> = Rc::new(RefCell::new(None));
                let task = tokio::task::spawn_local({
                    let slot = Rc::clone(&slot);
                    async move {
                        match fut.await {
                            Ok(value) => *slot.borrow_mut() = Some(observer(value)),
                            Err(err) => report_effect_error(&err),
                        }
                    }
                });
                Resource::new(move || async move {
                    let _ = abort_tx.send(true);
                    let _ = task.await;
                    let mut chain = Vec::new();
                    // A value that arrived before the release joins the chain
                    // ahead of the computation's own resources.
                    if let Some(seen) = slot.borrow_mut().take() {
                        chain.push(seen);
                    }
                    chain.push(bag.resource());
                    Resource::sequential(chain).release().await
                })
            }
        }
    })
}
