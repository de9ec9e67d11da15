//! The replay trampoline: straight-line bodies with suspension points.
//!
//! A body is a plain `Fn() -> T` that calls [`use_realm`] to extract values
//! from realms. The body has no native way to suspend, so suspension is
//! replay: the first unsatisfied `use_realm` registers an observation and
//! unwinds the body with a private sentinel; each value the realm later
//! publishes re-enters a fresh run of the body that fast-forwards through
//! the recorded history before continuing live past the suspension point.
//!
//! Lifetimes thread through a chain of [`Collector`]s: everything the body
//! does after a `use_realm` lands in the collector created for the value
//! that `use_realm` returned, so replacing or releasing that value tears
//! down its whole downstream in reverse order.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Once;

use crate::context::UserContext;
use crate::realm::{Observer, Realm};
use crate::resource::Collector;

/// Sentinel panic payload for suspension. Must never cross a user
/// boundary: the driver catches it and the hook below keeps it out of the
/// panic output.
struct ChainSuspend;

type Entry = Rc<dyn Any>;
type Reenter = Rc<dyn Fn(Vec<Entry>, UserContext, Collector)>;

struct Frame {
    history: Vec<Entry>,
    cursor: usize,
    rcur: Collector,
    ctx: UserContext,
    reenter: Reenter,
}

thread_local! {
    static FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

fn with_frame<R>(f: impl FnOnce(&mut Frame) -> R) -> R {
    FRAMES.with(|frames| {
        let mut frames = frames.borrow_mut();
        let frame = frames
            .last_mut()
            .expect("blueprint operation used outside a blueprint body");
        f(frame)
    })
}

/// Context map of the innermost running body. Panics outside a body.
pub(crate) fn current_ctx() -> UserContext {
    with_frame(|frame| frame.ctx.clone())
}

static SUSPEND_HOOK: Once = Once::new();

fn install_suspend_hook() {
    SUSPEND_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if info.payload().is::<ChainSuspend>() {
                return;
            }
            previous(info);
        }));
    });
}

/// Compiles a body into a realm. Each observation runs the body; each
/// publication of a realm passed to [`use_realm`] resumes it.
pub fn to_realm<T: Clone + 'static>(body: impl Fn() -> T + 'static) -> Realm<T> {
    to_realm_with(body, UserContext::new())
}

/// [`to_realm`] with an initial context map, the forking primitive for
/// child blueprints: pass [`crate::context::user_context`]'s snapshot to
/// inherit the parent's bindings.
pub fn to_realm_with<T: Clone + 'static>(
    body: impl Fn() -> T + 'static,
    ctx: UserContext,
) -> Realm<T> {
    let body: Rc<dyn Fn() -> T> = Rc::new(body);
    Realm::new(move |observer: Observer<T>| {
        install_suspend_hook();
        let root = Collector::new();
        drive(
            Rc::clone(&body),
            observer,
            Vec::new(),
            ctx.fork(),
            root.clone(),
        );
        root.resource()
    })
}

/// One run of the body: fast-forwards through `history`, continues live,
/// and publishes the final value into `root`'s chain. Returns once the
/// body completed or suspended.
fn drive<T: Clone + 'static>(
    body: Rc<dyn Fn() -> T>,
    outer: Observer<T>,
    history: Vec<Entry>,
    ctx: UserContext,
    root: Collector,
) {
    let reenter: Reenter = Rc::new({
        let body = Rc::clone(&body);
        let outer = Rc::clone(&outer);
        move |history, ctx, root| drive(Rc::clone(&body), Rc::clone(&outer), history, ctx, root)
    });
    FRAMES.with(|frames| {
        frames.borrow_mut().push(Frame {
            history,
            cursor: 0,
            rcur: root,
            ctx,
            reenter,
        })
    });
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| body()));
    // Pop before publishing so observers see the enclosing frame, not ours.
    let frame = FRAMES
        .with(|frames| frames.borrow_mut().pop())
        .expect("blueprint frame stack corrupted");
    match outcome {
        Ok(value) => {
            let published = outer(value);
            frame.rcur.add(published);
        }
        Err(payload) => {
            if !payload.is::<ChainSuspend>() {
                panic::resume_unwind(payload);
            }
        }
    }
}

/// Extracts a value from `realm`, suspending the body until one exists.
///
/// During replay the recorded value is returned without touching the
/// realm. At the live edge the realm is observed: a value published in the
/// same synchronous pass continues the body inline; every later value
/// re-enters a fresh run with extended history. Each value owns a
/// collector holding the body's downstream work, released when the realm
/// withdraws the value or the observation winds down.
///
/// Panics when called outside a blueprint body.
pub fn use_realm<T: Clone + 'static>(realm: &Realm<T>) -> T {
    let replayed = with_frame(|frame| {
        if frame.cursor < frame.history.len() {
            let entry = Rc::clone(&frame.history[frame.cursor]);
            frame.cursor += 1;
            Some(entry)
        } else {
            None
        }
    });
    if let Some(entry) = replayed {
        return entry
            .downcast_ref::<T>()
            .expect("use result type changed between replays")
            .clone();
    }

    let (base_history, ctx_snapshot, attach, reenter) = with_frame(|frame| {
        (
            frame.history.clone(),
            frame.ctx.fork(),
            frame.rcur.clone(),
            Rc::clone(&frame.reenter),
        )
    });

    let in_sync = Rc::new(Cell::new(true));
    let consumed_first = Rc::new(Cell::new(false));
    let inline: Rc<RefCell<Option<T>>> = Rc::new(RefCell::new(None));

    let observation = realm.instantiate({
        let in_sync = Rc::clone(&in_sync);
        let consumed_first = Rc::clone(&consumed_first);
        let inline = Rc::clone(&inline);
        move |value: T| {
            let sub = Collector::new();
            if in_sync.get() && !consumed_first.get() {
                // First synchronous publication: the body will continue in
                // this pass, depositing its downstream into `sub`.
                consumed_first.set(true);
                *inline.borrow_mut() = Some(value.clone());
                with_frame(|frame| {
                    frame.history.push(Rc::new(value.clone()) as Entry);
                    frame.cursor += 1;
                    frame.rcur = sub.clone();
                });
            } else {
                let mut history = base_history.clone();
                history.push(Rc::new(value) as Entry);
                reenter(history, ctx_snapshot.fork(), sub.clone());
            }
            sub.resource()
        }
    });
    in_sync.set(false);
    attach.add(observation);

    let got = inline.borrow_mut().take();
    match got {
        Some(value) => value,
        None => panic::panic_any(ChainSuspend),
    }
}
