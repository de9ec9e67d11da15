//! Scoped release handles and their composition.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

use futures::FutureExt;
use futures::future::{LocalBoxFuture, Shared};

use crate::error::{Error, Result};

/// The future returned by [`Resource::release`]. Shareable: every caller
/// awaits the same underlying run of the release action.
pub type ReleaseFuture = Shared<LocalBoxFuture<'static, Result<()>>>;

type Action = Box<dyn FnOnce() -> LocalBoxFuture<'static, Result<()>>>;

struct Inner {
    action: RefCell<Option<Action>>,
    done: RefCell<Option<ReleaseFuture>>,
}

/// A scoped release handle.
///
/// Cloning shares the handle. The release action runs at most once; every
/// `release()` call after the first returns the same shared future, so
/// concurrent release paths converge on one completion instead of racing.
#[derive(Clone)]
pub struct Resource {
    inner: Rc<Inner>,
}

impl Resource {
    /// A resource whose release runs `action` and awaits the returned
    /// future.
    pub fn new<F, Fut>(action: F) -> Resource
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        Resource {
            inner: Rc::new(Inner {
                action: RefCell::new(Some(Box::new(move || action().boxed_local()))),
                done: RefCell::new(None),
            }),
        }
    }

    /// A resource whose release runs a synchronous action.
    pub fn from_fn(f: impl FnOnce() + 'static) -> Resource {
        Resource::new(move || {
            f();
            futures::future::ready(Ok(()))
        })
    }

    /// A resource that releases immediately with success.
    pub fn noop() -> Resource {
        Resource {
            inner: Rc::new(Inner {
                action: RefCell::new(None),
                done: RefCell::new(None),
            }),
        }
    }

    /// Starts the release (first call) or returns the in-flight/settled
    /// release future (later calls). The synchronous prefix of the action
    /// runs inline on the first call.
    pub fn release(&self) -> ReleaseFuture {
        if let Some(existing) = self.inner.done.borrow().as_ref() {
            return existing.clone();
        }
        let fut = match self.inner.action.borrow_mut().take() {
            Some(action) => action(),
            None => futures::future::ready(Ok(())).boxed_local(),
        };
        let shared = fut.shared();
        *self.inner.done.borrow_mut() = Some(shared.clone());
        shared
    }

    /// True once `release()` has been called.
    pub fn is_released(&self) -> bool {
        self.inner.done.borrow().is_some()
    }

    /// Releases each item in iteration order, awaiting one completion
    /// before starting the next. Stops at the first failing release and
    /// surfaces its error.
    pub fn sequential(items: impl IntoIterator<Item = Resource>) -> Resource {
        let items: Vec<Resource> = items.into_iter().collect();
        Resource::new(move || async move {
            for item in items {
                item.release().await?;
            }
            Ok(())
        })
    }

    /// Starts every release together and waits for all of them to settle.
    /// Errors are collected; one failure surfaces as itself, several as an
    /// aggregate.
    pub fn parallel(items: impl IntoIterator<Item = Resource>) -> Resource {
        let items: Vec<Resource> = items.into_iter().collect();
        Resource::new(move || release_all(items))
    }
}

/// Releases everything together, settles everything, aggregates failures.
pub(crate) async fn release_all(resources: Vec<Resource>) -> Result<()> {
    let results = futures::future::join_all(resources.iter().map(|r| r.release())).await;
    let errors: Vec<Error> = results.into_iter().filter_map(|r| r.err()).collect();
    match Error::collect(errors) {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

/// Fire-and-forget release for resources nothing owns anymore (stragglers,
/// replaced links). Failures are logged, not surfaced.
pub(crate) fn release_detached(resource: Resource) {
    let fut = resource.release();
    tokio::task::spawn_local(async move {
        if let Err(err) = fut.await {
            log::warn!("detached release failed: {err}");
        }
    });
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("released", &self.is_released())
            .finish()
    }
}

struct CollectorInner {
    items: Vec<Resource>,
    released: bool,
}

/// A growable composite resource.
///
/// Releasing it releases the collected resources newest-first, so a chain
/// of acquisitions tears down in reverse order. A resource added after the
/// collector released is released immediately on the local task queue.
#[derive(Clone)]
pub struct Collector {
    inner: Rc<RefCell<CollectorInner>>,
    handle: Resource,
}

impl Collector {
    pub fn new() -> Collector {
        let inner = Rc::new(RefCell::new(CollectorInner {
            items: Vec::new(),
            released: false,
        }));
        let handle = Resource::new({
            let inner = Rc::clone(&inner);
            move || async move {
                inner.borrow_mut().released = true;
                loop {
                    let next = inner.borrow_mut().items.pop();
                    match next {
                        Some(r) => r.release().await?,
                        None => break,
                    }
                }
                Ok(())
            }
        });
        Collector { inner, handle }
    }

    pub fn add(&self, r: Resource) {
        {
            let mut inner = self.inner.borrow_mut();
            if !inner.released {
                inner.items.push(r);
                return;
            }
        }
        log::warn!("resource added to a released collector; releasing it immediately");
        release_detached(r);
    }

    /// The collector's own handle. Every call returns the same resource.
    pub fn resource(&self) -> Resource {
        self.handle.clone()
    }
}

impl Default for Collector {
    fn default() -> Self {
        Collector::new()
    }
}
